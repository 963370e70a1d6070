//! Error taxonomy for lifecycle operations.
//!
//! The split that matters operationally is [`LeaseError::Connection`] versus
//! [`LeaseError::Agent`]: a connection error means the root agent may or may
//! not have executed the privileged command (outcome unknown, reconcile via a
//! later `status` check), while an agent error means the privileged side
//! definitively rejected or failed the request.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaseError {
    /// Malformed name or parameters. Rejected before any side effect.
    #[error("invalid {what}: {value}")]
    Validation { what: &'static str, value: String },

    /// A resource pool has no free entry.
    #[error("{pool} pool exhausted")]
    PoolExhausted { pool: &'static str },

    /// The operator never configured this pool (e.g. no IPv6 block delegated
    /// to this host, or no numeric-id range).
    #[error("{pool} pool is not configured")]
    PoolNotConfigured { pool: &'static str },

    /// No record exists for the named VM.
    #[error("no record for VM '{0}'")]
    NotFound(String),

    /// The record exists but is in the wrong lifecycle state for this
    /// operation (e.g. `resume` on an active or destroyed VM).
    #[error("VM '{name}' is {actual}, expected {expected}")]
    WrongState {
        name: String,
        expected: &'static str,
        actual: String,
    },

    /// The root agent socket is unreachable, or the call timed out.
    /// The privileged action may or may not have executed.
    #[error("root agent unreachable: {0}")]
    Connection(String),

    /// The root agent explicitly rejected or failed the action.
    #[error("root agent: {0}")]
    Agent(String),

    /// The hypervisor has no domain where the record says one should exist.
    /// Surfaced by `resume` instead of silently re-creating the domain.
    #[error("domain for VM '{0}' is absent from the hypervisor")]
    DomainAbsent(String),

    #[error("record store: {0}")]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LeaseError {
    /// True when the outcome of the underlying privileged action is unknown
    /// and must be reconciled by a subsequent status query.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, LeaseError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, LeaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_have_unknown_outcome() {
        assert!(LeaseError::Connection("timed out".into()).outcome_unknown());
        assert!(!LeaseError::Agent("rejected".into()).outcome_unknown());
    }

    #[test]
    fn wrong_state_message_names_both_states() {
        let e = LeaseError::WrongState {
            name: "alice-1".into(),
            expected: "suspended",
            actual: "active".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("suspended"));
        assert!(msg.contains("active"));
    }
}
