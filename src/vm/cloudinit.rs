//! Cloud-init seed rendering for newly created VMs.
//!
//! Renders a NoCloud seed directory per VM under the configured
//! `cloud_init_dir`:
//!
//! ```text
//! <cloud_init_dir>/<name>/
//!     meta-data        instance-id + hostname
//!     user-data        #cloud-config guest account setup
//!     network-config   netplan v2 static addressing from the pools
//! ```
//!
//! The directory is the delivery artifact handed to the domain definition;
//! how the guest consumes it is the template image's concern. Removal on
//! destroy goes through the root agent's `cloudinit-remove` action so the
//! tolerate-absence semantics live in one place.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::Config;

/// Guest account provisioned by the seed. Owners get credentials for it via
/// the minted access token, not via this crate.
pub const GUEST_USERNAME: &str = "lease";

/// Static addressing handed to the guest.
#[derive(Debug, Clone)]
pub struct SeedNetwork {
    pub ipv4: Ipv4Addr,
    pub ipv4_prefix_len: u8,
    pub ipv4_gateway: Ipv4Addr,
    pub ipv6: Option<(Ipv6Addr, Ipv6Addr)>,
}

/// Render the seed directory for `name` and return its path. Overwrites any
/// leftover seed from a previous partial create.
pub fn render_seed(config: &Config, name: &str, net: &SeedNetwork) -> Result<PathBuf> {
    let seed_dir = config.seed_path(name);
    std::fs::create_dir_all(&seed_dir)
        .with_context(|| format!("creating seed dir {}", seed_dir.display()))?;

    let meta_data = format!("instance-id: vmleased-{name}\nlocal-hostname: {name}\n");

    let user_data = format!(
        "#cloud-config\n\
         hostname: {name}\n\
         users:\n\
         \x20 - name: {GUEST_USERNAME}\n\
         \x20   groups: [sudo]\n\
         \x20   shell: /bin/bash\n\
         \x20   sudo: ['ALL=(ALL) NOPASSWD:ALL']\n\
         ssh_pwauth: false\n\
         package_update: false\n"
    );

    let network_config = render_network_config(net);

    std::fs::write(seed_dir.join("meta-data"), meta_data)
        .with_context(|| format!("writing meta-data for {name}"))?;
    std::fs::write(seed_dir.join("user-data"), user_data)
        .with_context(|| format!("writing user-data for {name}"))?;
    std::fs::write(seed_dir.join("network-config"), network_config)
        .with_context(|| format!("writing network-config for {name}"))?;

    Ok(seed_dir)
}

fn render_network_config(net: &SeedNetwork) -> String {
    let mut addresses = format!("        - {}/{}\n", net.ipv4, net.ipv4_prefix_len);
    let mut gateways = format!("      gateway4: {}\n", net.ipv4_gateway);
    if let Some((addr, gw)) = net.ipv6 {
        addresses.push_str(&format!("        - {addr}/64\n"));
        gateways.push_str(&format!("      gateway6: {gw}\n"));
    }
    format!(
        "version: 2\n\
         ethernets:\n\
         \x20 eth0:\n\
         \x20   dhcp4: false\n\
         \x20   addresses:\n{addresses}{gateways}"
    )
}

/// Prefix length from the configured CIDR network string, defaulting to /24
/// when the suffix is missing or unparseable.
pub fn ipv4_prefix_len(config: &Config) -> u8 {
    config
        .ipv4
        .network
        .rsplit_once('/')
        .and_then(|(_, suffix)| suffix.parse().ok())
        .unwrap_or(24)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> Config {
        let raw = format!(
            r#"
storage_pool = "vmleased"
storage_path = "{base}/vms"
state_dir = "{base}/state"
template_path = "{base}/template.qcow2"
cloud_init_dir = "{base}/cloud-init"
network = "br0"
agent_socket = "{base}/agent.sock"
db_path = "{base}/vms.db"

[ipv4]
network = "203.0.113.0/24"
start = "203.0.113.10"
end = "203.0.113.20"
gateway = "203.0.113.1"
"#,
            base = dir.display()
        );
        toml::from_str(&raw).expect("test config parses")
    }

    fn test_net() -> SeedNetwork {
        SeedNetwork {
            ipv4: "203.0.113.10".parse().unwrap(),
            ipv4_prefix_len: 24,
            ipv4_gateway: "203.0.113.1".parse().unwrap(),
            ipv6: None,
        }
    }

    #[test]
    fn seed_directory_contains_all_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let seed = render_seed(&config, "alice-1", &test_net()).unwrap();
        assert!(seed.join("meta-data").is_file());
        assert!(seed.join("user-data").is_file());
        assert!(seed.join("network-config").is_file());
    }

    #[test]
    fn meta_data_names_the_instance() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let seed = render_seed(&config, "alice-1", &test_net()).unwrap();
        let meta = std::fs::read_to_string(seed.join("meta-data")).unwrap();
        assert!(meta.contains("instance-id: vmleased-alice-1"));
        assert!(meta.contains("local-hostname: alice-1"));
    }

    #[test]
    fn network_config_is_static_ipv4() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let seed = render_seed(&config, "alice-1", &test_net()).unwrap();
        let net = std::fs::read_to_string(seed.join("network-config")).unwrap();
        assert!(net.contains("dhcp4: false"));
        assert!(net.contains("- 203.0.113.10/24"));
        assert!(net.contains("gateway4: 203.0.113.1"));
        assert!(!net.contains("gateway6"));
    }

    #[test]
    fn ipv6_addressing_is_included_when_allocated() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut net = test_net();
        net.ipv6 = Some((
            "2001:db8::10".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
        ));
        let seed = render_seed(&config, "alice-1", &net).unwrap();
        let rendered = std::fs::read_to_string(seed.join("network-config")).unwrap();
        assert!(rendered.contains("- 2001:db8::10/64"));
        assert!(rendered.contains("gateway6: 2001:db8::1"));
    }

    #[test]
    fn prefix_len_parses_from_cidr() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        assert_eq!(ipv4_prefix_len(&config), 24);
        config.ipv4.network = "10.0.0.0/16".into();
        assert_eq!(ipv4_prefix_len(&config), 16);
        config.ipv4.network = "garbage".into();
        assert_eq!(ipv4_prefix_len(&config), 24);
    }
}
