//! Type definitions for dhcpmgr

use hostnet_common::{EntityId, HostnetError, HostnetResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Host bindings file name
pub const DHCP_HOST_FNAME: &str = "host";
/// Pid file name
pub const DHCP_PID_FNAME: &str = "pid";
/// Lease database file name
pub const DHCP_LEASES_FNAME: &str = "leases";
/// File holding the full network identifier owning the directory
pub const DHCP_NETWORK_ID_FNAME: &str = "network_id";

/// Lifecycle state of a network's DHCP service, derived from the pid file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhcpState {
    Unprovisioned,
    Running { pid: u32 },
}

impl DhcpState {
    pub fn is_running(&self) -> bool {
        matches!(self, DhcpState::Running { .. })
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            DhcpState::Running { pid } => Some(*pid),
            DhcpState::Unprovisioned => None,
        }
    }
}

/// A static `mac,ip` binding served by dnsmasq
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostBinding {
    pub mac: String,
    pub ip: Ipv4Addr,
}

impl HostBinding {
    /// Validates the MAC (six colon-separated hex octets) and normalises it
    /// to lower case.
    pub fn new(mac: &str, ip: Ipv4Addr) -> HostnetResult<Self> {
        let octets: Vec<&str> = mac.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(HostnetError::invalid_config(
                "mac",
                format!("'{}' is not a MAC address", mac),
            ));
        }
        Ok(Self {
            mac: mac.to_ascii_lowercase(),
            ip,
        })
    }

    /// The line written to the bindings file, without newline.
    pub fn line(&self) -> String {
        format!("{},{}", self.mac, self.ip)
    }
}

impl fmt::Display for HostBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line())
    }
}

impl FromStr for HostBinding {
    type Err = HostnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mac, ip) = s.trim().split_once(',').ok_or_else(|| {
            HostnetError::invalid_config("host_binding", format!("'{}' is not mac,ip", s))
        })?;
        let ip = ip.trim().parse::<Ipv4Addr>().map_err(|_| {
            HostnetError::invalid_config("host_binding", format!("'{}' is not an IPv4 address", ip))
        })?;
        Self::new(mac.trim(), ip)
    }
}

/// Files of one network's DHCP state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPaths {
    pub dir: PathBuf,
    pub host: PathBuf,
    pub pid: PathBuf,
    pub leases: PathBuf,
    pub network_id: PathBuf,
}

impl DhcpPaths {
    /// `<state_root>/<network prefix>/...`
    pub fn new(state_root: &Path, network: &EntityId) -> Self {
        let dir = state_root.join(network.prefix());
        Self {
            host: dir.join(DHCP_HOST_FNAME),
            pid: dir.join(DHCP_PID_FNAME),
            leases: dir.join(DHCP_LEASES_FNAME),
            network_id: dir.join(DHCP_NETWORK_ID_FNAME),
            dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_binding_parse() {
        let b: HostBinding = "FA:16:3E:00:00:01,10.0.0.5".parse().unwrap();
        assert_eq!(b.mac, "fa:16:3e:00:00:01");
        assert_eq!(b.line(), "fa:16:3e:00:00:01,10.0.0.5");

        assert!("fa:16:3e:00:00,10.0.0.5".parse::<HostBinding>().is_err());
        assert!("fa:16:3e:00:00:zz,10.0.0.5".parse::<HostBinding>().is_err());
        assert!("fa:16:3e:00:00:01".parse::<HostBinding>().is_err());
        assert!("fa:16:3e:00:00:01,10.0.0".parse::<HostBinding>().is_err());
    }

    #[test]
    fn test_paths_use_network_prefix() {
        let net = EntityId::new("net000000001x").unwrap();
        let paths = DhcpPaths::new(Path::new("/var/lib/dnsmasq/dhcp"), &net);
        assert_eq!(paths.dir, PathBuf::from("/var/lib/dnsmasq/dhcp/net0000000"));
        assert_eq!(paths.host, PathBuf::from("/var/lib/dnsmasq/dhcp/net0000000/host"));
        assert_eq!(paths.pid, PathBuf::from("/var/lib/dnsmasq/dhcp/net0000000/pid"));
    }

    #[test]
    fn test_state() {
        assert!(!DhcpState::Unprovisioned.is_running());
        assert_eq!(DhcpState::Running { pid: 7 }.pid(), Some(7));
    }
}
