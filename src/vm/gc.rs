//! Expiry-driven garbage collection: the two-phase sweep behind `vmleased gc`.
//!
//! Phase one suspends active VMs whose lease has expired (graceful stop,
//! falling back to a forced power-off). Phase two destroys suspended VMs
//! whose grace period has elapsed. Both phases work from a snapshot of the
//! record store taken before either runs, so a VM suspended by this very
//! pass always gets its full grace period before destruction.
//!
//! The default invocation is a dry run that only reports candidates;
//! mutation requires an explicit opt-in.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::VmStatus;
use crate::error::Result;
use crate::vm::Orchestrator;

#[derive(Debug, Clone, Default)]
pub struct GcOptions {
    /// Actually suspend/destroy; without this the pass only reports.
    pub execute: bool,
    /// Run only the suspend phase.
    pub suspend_only: bool,
    /// Run only the destroy phase.
    pub destroy_only: bool,
    /// Override the configured grace period for this pass.
    pub grace_days: Option<i64>,
}

/// What a GC pass saw and did. Serialized as the CLI's JSON output.
#[derive(Debug, Default, Serialize)]
pub struct GcReport {
    pub dry_run: bool,
    pub suspend_candidates: Vec<String>,
    pub suspended: Vec<String>,
    pub suspend_failures: Vec<GcFailure>,
    pub destroy_candidates: Vec<String>,
    pub destroyed: Vec<String>,
    pub destroy_failures: Vec<GcFailure>,
}

#[derive(Debug, Serialize)]
pub struct GcFailure {
    pub name: String,
    pub error: String,
}

impl GcReport {
    pub fn clean(&self) -> bool {
        self.suspend_failures.is_empty() && self.destroy_failures.is_empty()
    }
}

/// Select candidates as of `now` from a record snapshot.
fn select(
    snapshot: &[crate::db::VmRecord],
    now: DateTime<Utc>,
    grace: ChronoDuration,
) -> (Vec<String>, Vec<String>) {
    let suspend: Vec<String> = snapshot
        .iter()
        .filter(|r| r.status == VmStatus::Active && r.expires_at < now)
        .map(|r| r.name.clone())
        .collect();
    let destroy: Vec<String> = snapshot
        .iter()
        .filter(|r| r.status == VmStatus::Suspended)
        .filter(|r| r.suspended_at.is_some_and(|t| t + grace < now))
        .map(|r| r.name.clone())
        .collect();
    (suspend, destroy)
}

/// One full GC pass. Per-VM failures are recorded in the report and the
/// sweep continues; the pass itself only fails on a record-store error.
pub async fn run(orch: &Orchestrator, opts: &GcOptions) -> Result<GcReport> {
    let now = Utc::now();
    let grace = ChronoDuration::days(opts.grace_days.unwrap_or(orch.config().grace_days));

    // One snapshot drives both phases.
    let snapshot = orch.db().list()?;
    let (suspend_candidates, destroy_candidates) = select(&snapshot, now, grace);

    let mut report = GcReport {
        dry_run: !opts.execute,
        ..GcReport::default()
    };

    if !opts.destroy_only {
        report.suspend_candidates = suspend_candidates;
        if opts.execute {
            for name in report.suspend_candidates.clone() {
                match suspend_one(orch, &name).await {
                    Ok(()) => {
                        info!(name = %name, "GC suspended expired VM");
                        report.suspended.push(name);
                    }
                    Err(e) => {
                        warn!(name = %name, error = %e, "GC suspend failed");
                        report.suspend_failures.push(GcFailure {
                            name,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    if !opts.suspend_only {
        report.destroy_candidates = destroy_candidates;
        if opts.execute {
            for name in report.destroy_candidates.clone() {
                match orch.destroy(&name).await {
                    Ok(dr) if dr.ok() => {
                        info!(name = %name, "GC destroyed VM past grace period");
                        report.destroyed.push(name);
                    }
                    Ok(dr) => {
                        let error = dr
                            .hard_error
                            .unwrap_or_else(|| "destroy reported failure".into());
                        warn!(name = %name, error = %error, "GC destroy failed");
                        report.destroy_failures.push(GcFailure { name, error });
                    }
                    Err(e) => {
                        warn!(name = %name, error = %e, "GC destroy failed");
                        report.destroy_failures.push(GcFailure {
                            name,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    Ok(report)
}

/// Graceful stop first; if the guest ignores it, force power-off.
async fn suspend_one(orch: &Orchestrator, name: &str) -> Result<()> {
    match orch.stop(name).await {
        Ok(()) => Ok(()),
        Err(e) if e.outcome_unknown() => Err(e),
        Err(e) => {
            warn!(name, error = %e, "graceful stop failed; forcing power-off");
            orch.kill(name).await
        }
    }
}
