//! VM lifecycle management for vmleased.
//!
//! Provides the lifecycle orchestrator (create/start/stop/kill/destroy/
//! resume), the expiry-driven garbage collector, cloud-init seed rendering,
//! and the post-create credential-mint hook.

use serde::Serialize;

pub mod cloudinit;
pub mod gc;
pub mod lifecycle;
pub mod mint;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

use crate::db::VmStatus;

/// Live hypervisor state mapped onto the three-value record model, plus
/// `Unknown` for anything the mapping does not cover. Advisory for display
/// only — the record store's status is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveState {
    Active,
    Suspended,
    Destroyed,
    Unknown,
}

impl LiveState {
    pub fn as_str(self) -> &'static str {
        match self {
            LiveState::Active => "active",
            LiveState::Suspended => "suspended",
            LiveState::Destroyed => "destroyed",
            LiveState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for LiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<VmStatus> for LiveState {
    fn from(status: VmStatus) -> Self {
        match status {
            VmStatus::Active => LiveState::Active,
            VmStatus::Suspended => LiveState::Suspended,
            VmStatus::Destroyed => LiveState::Destroyed,
        }
    }
}

/// Map `virsh domstate` output onto the record model.
///
/// running → active; shut off / paused / pmsuspended → suspended; anything
/// else → unknown. "Domain not found" never reaches this function — the
/// caller maps that error to [`LiveState::Destroyed`].
pub fn map_domstate(output: &str) -> LiveState {
    match output.trim() {
        "running" => LiveState::Active,
        "shut off" | "paused" | "pmsuspended" => LiveState::Suspended,
        _ => LiveState::Unknown,
    }
}

/// Caller-supplied parameters for `create`. Sizing fields fall back to the
/// configured defaults when `None`.
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub owner: String,
    pub wallet_address: Option<String>,
    pub purpose: String,
    pub cpus: Option<u32>,
    pub memory_mb: Option<u32>,
    pub disk_gb: Option<u32>,
    pub lease_days: Option<i64>,
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use lifecycle::{CreateOutcome, DestroyReport, Orchestrator, VmListing};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domstate_mapping_covers_the_advisory_table() {
        assert_eq!(map_domstate("running"), LiveState::Active);
        assert_eq!(map_domstate("shut off"), LiveState::Suspended);
        assert_eq!(map_domstate("paused"), LiveState::Suspended);
        assert_eq!(map_domstate("pmsuspended"), LiveState::Suspended);
        assert_eq!(map_domstate("crashed"), LiveState::Unknown);
        assert_eq!(map_domstate(""), LiveState::Unknown);
        // virsh pads output with a trailing newline.
        assert_eq!(map_domstate("running\n"), LiveState::Active);
    }
}
