//! Lifecycle orchestrator: the public operations on leased VMs.
//!
//! ## Architecture
//!
//! ```text
//! create/start/stop/kill/destroy/resume/status/list
//!     ├─► VmDatabase        record read-modify-write (same process, no privilege)
//!     ├─► PoolAllocator     IPv4 / IPv6 / vmid allocation
//!     └─► AgentTransport    framed RPC to vmleased-rootd, which alone
//!                           runs virsh / qemu-img
//! ```
//!
//! No transaction spans the record store and the hypervisor. A privileged
//! call that fails after the record is written leaves a detectable
//! inconsistency rather than attempting a rollback that could itself fail;
//! `status`/`list` surface the drift and the GC plus idempotent `destroy`
//! resolve it over time.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agent::server::is_valid_domain_name;
use crate::agent::{AgentRequest, AgentResponse, AgentTransport, DEFAULT_CALL_TIMEOUT};
use crate::config::Config;
use crate::db::{VmDatabase, VmRecord, VmStatus};
use crate::error::{LeaseError, Result};
use crate::pool::PoolAllocator;
use crate::vm::{CreateOpts, LiveState, cloudinit, map_domstate, mint};

/// Poll interval while waiting for a graceful shutdown to take effect.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Explicit context object for every lifecycle operation; constructed once
/// at process start and passed around, no process-wide mutable state.
pub struct Orchestrator {
    db: VmDatabase,
    pools: PoolAllocator,
    agent: Arc<dyn AgentTransport>,
    config: Config,
}

/// Successful `create` result, rendered as the CLI's JSON summary.
#[derive(Debug, Clone, Serialize)]
pub struct CreateOutcome {
    pub record: VmRecord,
    pub username: String,
    pub mint_tx: Option<String>,
}

/// Step-by-step account of a `destroy`. Soft step failures are recorded and
/// the sequence continues; only a failed domain removal makes the whole
/// operation fail.
#[derive(Debug, Default, Serialize)]
pub struct DestroyReport {
    pub steps: Vec<DestroyStep>,
    pub hard_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DestroyStep {
    pub step: &'static str,
    pub outcome: String,
}

impl DestroyReport {
    pub fn ok(&self) -> bool {
        self.hard_error.is_none()
    }

    fn push(&mut self, step: &'static str, outcome: impl Into<String>) {
        self.steps.push(DestroyStep {
            step,
            outcome: outcome.into(),
        });
    }
}

/// One row of `list` output: the stored record plus the opportunistically
/// observed live state (`None` when the agent was unreachable).
#[derive(Debug, Clone, Serialize)]
pub struct VmListing {
    #[serde(flatten)]
    pub record: VmRecord,
    pub live: Option<LiveState>,
}

// ---------------------------------------------------------------------------
// Hypervisor error classification
// ---------------------------------------------------------------------------

/// virsh phrases the same condition several ways across versions.
fn is_absent_error(error: &str) -> bool {
    let e = error.to_ascii_lowercase();
    e.contains("not found") || e.contains("no such domain") || e.contains("failed to get domain")
}

fn is_not_running_error(error: &str) -> bool {
    let e = error.to_ascii_lowercase();
    e.contains("not running") || e.contains("domain is not active") || is_absent_error(error)
}

fn is_already_running_error(error: &str) -> bool {
    let e = error.to_ascii_lowercase();
    e.contains("already active") || e.contains("already running")
}

impl Orchestrator {
    pub fn new(config: Config, agent: Arc<dyn AgentTransport>) -> Result<Self> {
        let db = VmDatabase::open(&config.db_path)?;
        let pools = PoolAllocator::new(
            db.clone(),
            config.ipv4.clone(),
            config.ipv6.clone(),
            config.vmid.clone(),
        );
        Ok(Self {
            db,
            pools,
            agent,
            config,
        })
    }

    pub fn db(&self) -> &VmDatabase {
        &self.db
    }

    pub fn pools(&self) -> &PoolAllocator {
        &self.pools
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn call(&self, action: &str, params: serde_json::Value) -> Result<AgentResponse> {
        self.agent
            .call(AgentRequest::new(action, params), DEFAULT_CALL_TIMEOUT)
            .await
    }

    fn must_get(&self, name: &str) -> Result<VmRecord> {
        self.db
            .get(name)?
            .ok_or_else(|| LeaseError::NotFound(name.to_string()))
    }

    fn release_alloc(&self, vmid: Option<i64>, ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) {
        if let Some(id) = vmid {
            if let Err(e) = self.pools.release_vmid(id) {
                warn!(vmid = id, error = %e, "failed to release vmid");
            }
        }
        if let Some(addr) = ipv4 {
            if let Err(e) = self.pools.release_ipv4(addr) {
                warn!(addr = %addr, error = %e, "failed to release IPv4");
            }
        }
        if let Some(addr) = ipv6 {
            if let Err(e) = self.pools.release_ipv6(addr) {
                warn!(addr = %addr, error = %e, "failed to release IPv6");
            }
        }
    }

    // -----------------------------------------------------------------------
    // create
    // -----------------------------------------------------------------------

    /// Provision a new VM: allocate resources, render the cloud-init seed,
    /// clone the overlay disk, write the record, then define and start the
    /// domain through the root agent.
    ///
    /// Failures before the record insert release every allocation (no
    /// leakage, no side effects). Failures after leave the record `active`
    /// and surface the error — the domain may or may not exist, which the
    /// next status query or GC pass reconciles.
    pub async fn create(&self, name: &str, opts: CreateOpts) -> Result<CreateOutcome> {
        if !is_valid_domain_name(name) {
            return Err(LeaseError::Validation {
                what: "name",
                value: name.to_string(),
            });
        }
        if opts.owner.is_empty() {
            return Err(LeaseError::Validation {
                what: "owner",
                value: "must not be empty".into(),
            });
        }
        if self.db.get(name)?.is_some() {
            return Err(LeaseError::Validation {
                what: "name",
                value: format!("'{name}' already exists"),
            });
        }

        let vmid = if self.pools.vmid_configured() {
            Some(self.pools.allocate_vmid()?)
        } else {
            None
        };
        let ipv4 = match self.pools.allocate_ipv4() {
            Ok(addr) => addr,
            Err(e) => {
                self.release_alloc(vmid, None, None);
                return Err(e);
            }
        };
        let ipv6 = if self.pools.ipv6_configured() {
            match self.pools.allocate_ipv6() {
                Ok(addr) => Some(addr),
                Err(e) if !self.config.ipv6_required => {
                    warn!(name, error = %e, "IPv6 allocation failed; proceeding IPv4-only");
                    None
                }
                Err(e) => {
                    self.release_alloc(vmid, Some(ipv4), None);
                    return Err(e);
                }
            }
        } else if self.config.ipv6_required {
            self.release_alloc(vmid, Some(ipv4), None);
            return Err(LeaseError::PoolNotConfigured { pool: "IPv6" });
        } else {
            None
        };

        let net = cloudinit::SeedNetwork {
            ipv4,
            ipv4_prefix_len: cloudinit::ipv4_prefix_len(&self.config),
            ipv4_gateway: self.config.ipv4.gateway,
            ipv6: ipv6.and_then(|addr| self.config.ipv6.as_ref().map(|p| (addr, p.gateway))),
        };
        let seed_dir = match cloudinit::render_seed(&self.config, name, &net) {
            Ok(dir) => dir,
            Err(e) => {
                self.release_alloc(vmid, Some(ipv4), ipv6);
                return Err(e.into());
            }
        };

        let disk_path = self.config.disk_path(name);
        let disk_gb = opts.disk_gb.unwrap_or(self.config.defaults.disk_gb);
        let clone = self
            .call(
                "disk-clone",
                json!({"dest": disk_path.to_string_lossy(), "size_gb": disk_gb}),
            )
            .await;
        match clone {
            Ok(resp) if resp.ok => {}
            Ok(resp) => {
                self.release_alloc(vmid, Some(ipv4), ipv6);
                return Err(LeaseError::Agent(resp.error_text().to_string()));
            }
            Err(e) => {
                self.release_alloc(vmid, Some(ipv4), ipv6);
                return Err(e);
            }
        }

        let xml_path = self.config.domain_xml_path(name);
        let write_xml = || -> anyhow::Result<()> {
            if let Some(parent) = xml_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let cpus = opts.cpus.unwrap_or(self.config.defaults.cpus);
            let memory_mb = opts.memory_mb.unwrap_or(self.config.defaults.memory_mb);
            let xml = build_domain_xml(
                name,
                cpus,
                memory_mb,
                &disk_path,
                &seed_dir,
                &self.config.network,
            );
            std::fs::write(&xml_path, xml)?;
            Ok(())
        };
        if let Err(e) = write_xml() {
            self.release_alloc(vmid, Some(ipv4), ipv6);
            return Err(LeaseError::Other(
                e.context(format!("writing domain XML for {name}")),
            ));
        }

        let now = Utc::now();
        let lease_days = opts.lease_days.unwrap_or(self.config.defaults.lease_days);
        let record = VmRecord {
            name: name.to_string(),
            vmid,
            ipv4,
            ipv6,
            owner: opts.owner.clone(),
            wallet_address: opts.wallet_address.clone(),
            purpose: opts.purpose.clone(),
            created_at: now,
            expires_at: now + ChronoDuration::days(lease_days),
            suspended_at: None,
            destroyed_at: None,
            status: VmStatus::Active,
        };
        if let Err(e) = self.db.insert(&record) {
            self.release_alloc(vmid, Some(ipv4), ipv6);
            return Err(e);
        }
        info!(name, ipv4 = %ipv4, vmid = ?vmid, "VM record written");

        // The record is committed. From here on, failures are surfaced but
        // never rolled back — detectable inconsistency over silent leakage.
        let define = self
            .call("virsh-define", json!({"xml_path": xml_path.to_string_lossy()}))
            .await?;
        if !define.ok {
            warn!(name, error = define.error_text(), "define failed; record stays active for reconciliation");
            return Err(LeaseError::Agent(define.error_text().to_string()));
        }
        let start = self.call("virsh-start", json!({"domain": name})).await?;
        if !start.ok && !is_already_running_error(start.error_text()) {
            warn!(name, error = start.error_text(), "start failed; record stays active for reconciliation");
            return Err(LeaseError::Agent(start.error_text().to_string()));
        }
        info!(name, "VM created and started");

        let mint_tx = match (&self.config.mint_command, &record.wallet_address) {
            (Some(command), Some(wallet)) => mint::mint_credential(command, wallet, name).await,
            _ => None,
        };

        Ok(CreateOutcome {
            record,
            username: cloudinit::GUEST_USERNAME.to_string(),
            mint_tx,
        })
    }

    // -----------------------------------------------------------------------
    // start / stop / kill
    // -----------------------------------------------------------------------

    /// Start the domain of an active record (e.g. after a host reboot, or a
    /// create whose start step failed).
    pub async fn start(&self, name: &str) -> Result<()> {
        let record = self.must_get(name)?;
        match record.status {
            VmStatus::Active => {}
            other => {
                return Err(LeaseError::WrongState {
                    name: name.to_string(),
                    expected: "active",
                    actual: other.to_string(),
                });
            }
        }
        let resp = self.call("virsh-start", json!({"domain": name})).await?;
        if resp.ok || is_already_running_error(resp.error_text()) {
            Ok(())
        } else if is_absent_error(resp.error_text()) {
            Err(LeaseError::DomainAbsent(name.to_string()))
        } else {
            Err(LeaseError::Agent(resp.error_text().to_string()))
        }
    }

    /// Reboot a running VM in place. No record change: the VM stays active.
    pub async fn reboot(&self, name: &str) -> Result<()> {
        let record = self.must_get(name)?;
        match record.status {
            VmStatus::Active => {}
            other => {
                return Err(LeaseError::WrongState {
                    name: name.to_string(),
                    expected: "active",
                    actual: other.to_string(),
                });
            }
        }
        let resp = self.call("virsh-reboot", json!({"domain": name})).await?;
        if resp.ok {
            Ok(())
        } else if is_absent_error(resp.error_text()) {
            Err(LeaseError::DomainAbsent(name.to_string()))
        } else {
            Err(LeaseError::Agent(resp.error_text().to_string()))
        }
    }

    /// Graceful shutdown. The record flips to `suspended` only once the
    /// domain is confirmed non-running; if the guest ignores the ACPI signal
    /// past the bounded wait, the operation fails and `kill` is the way out.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let record = self.must_get(name)?;
        match record.status {
            VmStatus::Active => {}
            VmStatus::Suspended => return Ok(()),
            VmStatus::Destroyed => {
                return Err(LeaseError::WrongState {
                    name: name.to_string(),
                    expected: "active",
                    actual: "destroyed".into(),
                });
            }
        }

        let resp = self.call("virsh-shutdown", json!({"domain": name})).await?;
        if !resp.ok && !is_not_running_error(resp.error_text()) {
            return Err(LeaseError::Agent(resp.error_text().to_string()));
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.stop_wait_secs);
        loop {
            if self.domain_confirmed_off(name).await? {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LeaseError::Agent(format!(
                    "'{name}' did not shut down within {}s; use kill to force power-off",
                    self.config.stop_wait_secs
                )));
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        self.mark_suspended(name)?;
        info!(name, "VM suspended");
        Ok(())
    }

    /// Immediate forced power-off, then mark suspended.
    pub async fn kill(&self, name: &str) -> Result<()> {
        let record = self.must_get(name)?;
        match record.status {
            VmStatus::Active => {}
            VmStatus::Suspended => return Ok(()),
            VmStatus::Destroyed => {
                return Err(LeaseError::WrongState {
                    name: name.to_string(),
                    expected: "active",
                    actual: "destroyed".into(),
                });
            }
        }
        let resp = self.call("virsh-destroy", json!({"domain": name})).await?;
        if !resp.ok && !is_not_running_error(resp.error_text()) {
            return Err(LeaseError::Agent(resp.error_text().to_string()));
        }
        self.mark_suspended(name)?;
        info!(name, "VM killed and suspended");
        Ok(())
    }

    async fn domain_confirmed_off(&self, name: &str) -> Result<bool> {
        let resp = self.call("virsh-domstate", json!({"domain": name})).await?;
        if resp.ok {
            Ok(map_domstate(resp.output.as_deref().unwrap_or("")) != LiveState::Active)
        } else if is_absent_error(resp.error_text()) {
            Ok(true)
        } else {
            // Can't tell; keep waiting rather than guessing.
            Ok(false)
        }
    }

    fn mark_suspended(&self, name: &str) -> Result<VmRecord> {
        self.db.update_with(name, |r| {
            if r.status == VmStatus::Active {
                r.status = VmStatus::Suspended;
                r.suspended_at = Some(Utc::now());
            }
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // resume
    // -----------------------------------------------------------------------

    /// Re-activate a suspended VM. Fails distinctly when the record is not
    /// suspended, and when the domain no longer exists on the hypervisor —
    /// resume never silently re-creates a domain.
    pub async fn resume(&self, name: &str, extend_days: Option<i64>) -> Result<VmRecord> {
        let record = self.must_get(name)?;
        match record.status {
            VmStatus::Suspended => {}
            other => {
                return Err(LeaseError::WrongState {
                    name: name.to_string(),
                    expected: "suspended",
                    actual: other.to_string(),
                });
            }
        }

        let resp = self.call("virsh-start", json!({"domain": name})).await?;
        if !resp.ok {
            if is_absent_error(resp.error_text()) {
                return Err(LeaseError::DomainAbsent(name.to_string()));
            }
            if !is_already_running_error(resp.error_text()) {
                return Err(LeaseError::Agent(resp.error_text().to_string()));
            }
        }

        let updated = self.db.update_with(name, |r| {
            r.status = VmStatus::Active;
            r.suspended_at = None;
            if let Some(days) = extend_days {
                // Lease renewal: the new expiry counts from now, not from
                // the old (already passed) expiry.
                r.expires_at = Utc::now() + ChronoDuration::days(days);
            }
            Ok(())
        })?;
        info!(name, expires_at = %updated.expires_at, "VM resumed");
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // destroy
    // -----------------------------------------------------------------------

    /// Tear down a VM: force-stop, undefine, remove the overlay disk and the
    /// cloud-init artifact, mark the record destroyed, release the pools.
    ///
    /// Every step tolerates the resource already being absent, so the whole
    /// sequence is idempotent — destroying a destroyed or never-created name
    /// succeeds. Soft step failures are logged and recorded in the report;
    /// only a failed domain removal sets `hard_error`. The record update and
    /// pool release always run so the database tracks best-effort reality.
    pub async fn destroy(&self, name: &str) -> Result<DestroyReport> {
        let mut report = DestroyReport::default();

        let Some(record) = self.db.get(name)? else {
            debug!(name, "destroy of unknown name; intent already satisfied");
            report.push("record", "never existed; nothing to do");
            return Ok(report);
        };
        if record.status == VmStatus::Destroyed {
            report.push("record", "already destroyed");
            return Ok(report);
        }

        // 1. Force-stop whatever is running. An active VM takes the implicit
        //    stop-then-destroy path through this same step.
        let stop = self.call("virsh-destroy", json!({"domain": name})).await?;
        if stop.ok {
            report.push("stop", "stopped");
        } else if is_not_running_error(stop.error_text()) {
            report.push("stop", "already stopped");
        } else {
            warn!(name, error = stop.error_text(), "force-stop failed; continuing");
            report.push("stop", format!("failed: {}", stop.error_text()));
        }

        // 2. Remove the domain definition and managed storage; retry once
        //    without storage removal before giving up.
        let undefine = self
            .call("virsh-undefine", json!({"domain": name, "remove_storage": true}))
            .await?;
        if undefine.ok {
            report.push("undefine", "removed with storage");
        } else if is_absent_error(undefine.error_text()) {
            report.push("undefine", "already absent");
        } else {
            let retry = self
                .call("virsh-undefine", json!({"domain": name, "remove_storage": false}))
                .await?;
            if retry.ok {
                report.push("undefine", "removed; managed storage left behind");
            } else if is_absent_error(retry.error_text()) {
                report.push("undefine", "already absent");
            } else {
                warn!(name, error = retry.error_text(), "undefine failed");
                report.hard_error = Some(retry.error_text().to_string());
                report.push("undefine", format!("failed: {}", retry.error_text()));
            }
        }

        // 3. Unmanaged overlay disk by convention.
        let disk = self.config.disk_path(name);
        let disk_rm = self
            .call("disk-remove", json!({"path": disk.to_string_lossy()}))
            .await?;
        if disk_rm.ok {
            report.push("disk", disk_rm.output.unwrap_or_else(|| "removed".into()));
        } else {
            warn!(name, error = disk_rm.error_text(), "overlay removal failed; continuing");
            report.push("disk", format!("failed: {}", disk_rm.error_text()));
        }

        // 4. Cloud-init delivery artifact, plus the local domain XML.
        let seed = self.config.seed_path(name);
        let seed_rm = self
            .call("cloudinit-remove", json!({"path": seed.to_string_lossy()}))
            .await?;
        if seed_rm.ok {
            report.push("cloud-init", seed_rm.output.unwrap_or_else(|| "removed".into()));
        } else {
            warn!(name, error = seed_rm.error_text(), "seed removal failed; continuing");
            report.push("cloud-init", format!("failed: {}", seed_rm.error_text()));
        }
        match std::fs::remove_file(self.config.domain_xml_path(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(name, error = %e, "domain XML removal failed"),
        }

        // 5. Record and pools — always attempted, whatever happened above.
        match self.db.update_with(name, |r| {
            r.status = VmStatus::Destroyed;
            r.destroyed_at = Some(Utc::now());
            Ok(())
        }) {
            Ok(_) => report.push("record", "destroyed"),
            // A concurrent destroy won the race; same intent, same outcome.
            Err(LeaseError::WrongState { .. }) => report.push("record", "already destroyed"),
            Err(e) => return Err(e),
        }
        self.release_alloc(record.vmid, Some(record.ipv4), record.ipv6);
        report.push("pools", "released");

        if let Some(err) = &report.hard_error {
            warn!(name, error = %err, "destroy finished with a hard error");
        } else {
            info!(name, "VM destroyed");
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // status / list
    // -----------------------------------------------------------------------

    /// Advisory live state for display. Falls back to the recorded status
    /// when the agent is unreachable; disagreement between the two is logged
    /// but never fatal.
    pub async fn status(&self, name: &str) -> Result<LiveState> {
        if !is_valid_domain_name(name) {
            return Ok(LiveState::Unknown);
        }
        let record = self.db.get(name)?;
        let live = match self.call("virsh-domstate", json!({"domain": name})).await {
            Ok(resp) if resp.ok => map_domstate(resp.output.as_deref().unwrap_or("")),
            Ok(resp) if is_absent_error(resp.error_text()) => LiveState::Destroyed,
            Ok(_) => LiveState::Unknown,
            Err(LeaseError::Connection(e)) => {
                debug!(name, error = %e, "agent unreachable; reporting recorded status");
                return Ok(record
                    .map(|r| LiveState::from(r.status))
                    .unwrap_or(LiveState::Unknown));
            }
            Err(e) => return Err(e),
        };
        if let Some(r) = &record {
            if live != LiveState::Unknown && LiveState::from(r.status) != live {
                warn!(
                    name,
                    recorded = %r.status,
                    live = %live,
                    "recorded and live state disagree; will reconcile"
                );
            }
        }
        Ok(live)
    }

    /// All records with their opportunistically observed live state.
    pub async fn list(&self) -> Result<Vec<VmListing>> {
        let mut out = Vec::new();
        for record in self.db.list()? {
            let live = if record.status == VmStatus::Destroyed {
                None
            } else {
                match self.call("virsh-domstate", json!({"domain": record.name})).await {
                    Ok(resp) if resp.ok => {
                        Some(map_domstate(resp.output.as_deref().unwrap_or("")))
                    }
                    Ok(resp) if is_absent_error(resp.error_text()) => Some(LiveState::Destroyed),
                    Ok(_) => Some(LiveState::Unknown),
                    Err(_) => None,
                }
            };
            if let Some(observed) = live {
                if observed != LiveState::Unknown && LiveState::from(record.status) != observed {
                    warn!(
                        name = %record.name,
                        recorded = %record.status,
                        live = %observed,
                        "recorded and live state disagree"
                    );
                }
            }
            out.push(VmListing { record, live });
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Domain XML
// ---------------------------------------------------------------------------

/// Minimal KVM domain definition: virtio overlay disk, the cloud-init seed
/// directory as a tagged filesystem share, one bridge NIC.
fn build_domain_xml(
    name: &str,
    cpus: u32,
    memory_mb: u32,
    disk_path: &Path,
    seed_dir: &Path,
    bridge: &str,
) -> String {
    format!(
        "<domain type='kvm'>\n\
         \x20 <name>{name}</name>\n\
         \x20 <vcpu>{cpus}</vcpu>\n\
         \x20 <memory unit='MiB'>{memory_mb}</memory>\n\
         \x20 <os>\n\
         \x20   <type arch='x86_64' machine='q35'>hvm</type>\n\
         \x20 </os>\n\
         \x20 <features><acpi/><apic/></features>\n\
         \x20 <devices>\n\
         \x20   <disk type='file' device='disk'>\n\
         \x20     <driver name='qemu' type='qcow2'/>\n\
         \x20     <source file='{disk}'/>\n\
         \x20     <target dev='vda' bus='virtio'/>\n\
         \x20   </disk>\n\
         \x20   <filesystem type='mount' accessmode='mapped'>\n\
         \x20     <source dir='{seed}'/>\n\
         \x20     <target dir='cidata'/>\n\
         \x20   </filesystem>\n\
         \x20   <interface type='bridge'>\n\
         \x20     <source bridge='{bridge}'/>\n\
         \x20     <model type='virtio'/>\n\
         \x20   </interface>\n\
         \x20   <console type='pty'/>\n\
         \x20   <rng model='virtio'><backend model='random'>/dev/urandom</backend></rng>\n\
         \x20 </devices>\n\
         </domain>\n",
        disk = disk_path.display(),
        seed = seed_dir.display(),
    )
}
