//! Operator configuration for vmleased.
//!
//! One TOML file describes the host: storage locations, the base template
//! image, the bridge network, the address/id pools, and GC policy. The file
//! is produced by the setup wizard at install time and is read-only as far
//! as this crate is concerned.
//!
//! Resolution order for the config path:
//! 1. `--config <path>` on the command line
//! 2. `VMLEASED_CONFIG` environment variable
//! 3. `/etc/vmleased/config.toml`

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmleased/config.toml";

/// IPv4 address pool: a contiguous range inside the bridge network.
#[derive(Debug, Clone, Deserialize)]
pub struct Ipv4Pool {
    /// Bridge network in CIDR form, informational (e.g. "203.0.113.0/24").
    pub network: String,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// Optional IPv6 range delegated to this host. Absent section disables
/// IPv6 allocation entirely.
#[derive(Debug, Clone, Deserialize)]
pub struct Ipv6Pool {
    pub start: Ipv6Addr,
    pub end: Ipv6Addr,
    pub gateway: Ipv6Addr,
}

/// Optional numeric VM identifier range. Absent section disables numeric-id
/// allocation — there is deliberately no default range.
#[derive(Debug, Clone, Deserialize)]
pub struct VmidPool {
    pub start: i64,
    pub end: i64,
}

/// Per-VM sizing defaults, overridable on `create`.
#[derive(Debug, Clone, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
    #[serde(default = "default_lease_days")]
    pub lease_days: i64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory_mb: default_memory_mb(),
            disk_gb: default_disk_gb(),
            lease_days: default_lease_days(),
        }
    }
}

fn default_cpus() -> u32 {
    1
}
fn default_memory_mb() -> u32 {
    2048
}
fn default_disk_gb() -> u32 {
    20
}
fn default_lease_days() -> i64 {
    30
}
fn default_grace_days() -> i64 {
    7
}
fn default_stop_wait_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// libvirt storage pool name.
    pub storage_pool: String,
    /// Directory holding per-VM overlay disks (`<name>.qcow2`).
    pub storage_path: PathBuf,
    /// State root; domain XML files are written under here and the root
    /// agent only accepts `virsh define` paths inside it.
    pub state_dir: PathBuf,
    /// Read-only base template image, produced by the offline template
    /// builder.
    pub template_path: PathBuf,
    /// Per-VM cloud-init seed directories live here.
    pub cloud_init_dir: PathBuf,
    /// Bridge interface the VM NIC attaches to.
    pub network: String,

    /// Unix socket of the privileged root agent.
    pub agent_socket: PathBuf,
    /// SQLite database holding VM records and pool state.
    pub db_path: PathBuf,

    pub ipv4: Ipv4Pool,
    pub ipv6: Option<Ipv6Pool>,
    pub vmid: Option<VmidPool>,

    /// When true, IPv6 exhaustion aborts `create`; when false (default)
    /// `create` proceeds IPv4-only.
    #[serde(default)]
    pub ipv6_required: bool,

    /// Days a suspended VM is retained before the GC destroys it.
    #[serde(default = "default_grace_days")]
    pub grace_days: i64,

    /// Bounded wait for a graceful shutdown to be confirmed, in seconds.
    #[serde(default = "default_stop_wait_secs")]
    pub stop_wait_secs: u64,

    /// Credential-mint hook run after create. `None` disables the hook.
    pub mint_command: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("validating config {}", path.display()))?;
        Ok(config)
    }

    /// Range sanity for the configured pools. The allocators treat values as
    /// unsigned, so a negative vmid range must be rejected here.
    fn validate(&self) -> Result<()> {
        if let Some(vmid) = &self.vmid {
            if vmid.start < 0 || vmid.end < vmid.start {
                anyhow::bail!(
                    "vmid range {}..{} invalid: start must be >= 0 and <= end",
                    vmid.start,
                    vmid.end
                );
            }
        }
        if u32::from(self.ipv4.end) < u32::from(self.ipv4.start) {
            anyhow::bail!(
                "ipv4 range {}..{} invalid: end precedes start",
                self.ipv4.start,
                self.ipv4.end
            );
        }
        Ok(())
    }

    /// Resolve the config path from an optional CLI override, then the
    /// environment, then the system default.
    pub fn resolve_path(cli_override: Option<&Path>) -> PathBuf {
        if let Some(p) = cli_override {
            return p.to_path_buf();
        }
        if let Ok(env) = std::env::var("VMLEASED_CONFIG") {
            return PathBuf::from(env);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Overlay disk path for a VM, by convention `<storage_path>/<name>.qcow2`.
    pub fn disk_path(&self, name: &str) -> PathBuf {
        self.storage_path.join(format!("{name}.qcow2"))
    }

    /// Cloud-init seed directory for a VM.
    pub fn seed_path(&self, name: &str) -> PathBuf {
        self.cloud_init_dir.join(name)
    }

    /// Domain XML path for a VM.
    pub fn domain_xml_path(&self, name: &str) -> PathBuf {
        self.state_dir.join("domains").join(format!("{name}.xml"))
    }
}
