//! Command builders for dnsmasq and process signals

use hostnet_common::shell::{argv, netns_exec, DNSMASQ_CMD, KILL_CMD};
use hostnet_common::AddressBlock;
use std::fmt;

use crate::types::DhcpPaths;

/// Signals sent to a managed dnsmasq
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Re-read the bindings file
    Hup,
    /// Stop immediately
    Kill,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Hup => "HUP",
            Signal::Kill => "KILL",
        })
    }
}

/// Builds the dnsmasq invocation for one network, run inside `namespace`.
pub fn build_dnsmasq_cmd(
    interface: &str,
    paths: &DhcpPaths,
    block: &AddressBlock,
    lease_time: &str,
    namespace: &str,
) -> Vec<String> {
    let cmd = argv([
        DNSMASQ_CMD.to_string(),
        "--no-hosts".to_string(),
        "--no-resolv".to_string(),
        "--strict-order".to_string(),
        "--bind-interfaces".to_string(),
        format!("--interface={}", interface),
        "--except-interface=lo".to_string(),
        format!("--dhcp-hostsfile={}", paths.host.display()),
        format!("--pid-file={}", paths.pid.display()),
        format!("--dhcp-range=tag0,{},static,{}", block.network(), lease_time),
        format!("--dhcp-option=3,{}", block.gateway()),
        "--dhcp-no-override".to_string(),
        format!("--dhcp-leasefile={}", paths.leases.display()),
    ]);
    netns_exec(Some(namespace), cmd)
}

/// `kill -s <signal> <pid>`
pub fn build_signal_cmd(pid: u32, signal: Signal) -> Vec<String> {
    argv([
        KILL_CMD.to_string(),
        "-s".to_string(),
        signal.to_string(),
        pid.to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostnet_common::shell::render_command;
    use hostnet_common::EntityId;
    use std::path::Path;

    #[test]
    fn test_build_dnsmasq_cmd() {
        let net = EntityId::new("net000000001x").unwrap();
        let paths = DhcpPaths::new(Path::new("/var/lib/dnsmasq/dhcp"), &net);
        let block: AddressBlock = "10.0.0.0/24".parse().unwrap();
        let cmd = render_command(&build_dnsmasq_cmd(
            &net.dhcp_interface(),
            &paths,
            &block,
            "infinite",
            &net.dhcp_namespace(),
        ));

        assert!(cmd.starts_with("/sbin/ip netns exec qdhcp-net0000000 /usr/sbin/dnsmasq"));
        assert!(cmd.contains("--interface=dhcpnet0000000"));
        assert!(cmd.contains("--dhcp-hostsfile=/var/lib/dnsmasq/dhcp/net0000000/host"));
        assert!(cmd.contains("--pid-file=/var/lib/dnsmasq/dhcp/net0000000/pid"));
        assert!(cmd.contains("--dhcp-range=tag0,10.0.0.0,static,infinite"));
        assert!(cmd.contains("--dhcp-option=3,10.0.0.254"));
        assert!(cmd.contains("--dhcp-leasefile=/var/lib/dnsmasq/dhcp/net0000000/leases"));
        assert!(cmd.contains("--except-interface=lo"));
    }

    #[test]
    fn test_build_signal_cmd() {
        assert_eq!(render_command(&build_signal_cmd(42, Signal::Hup)), "/bin/kill -s HUP 42");
        assert_eq!(render_command(&build_signal_cmd(42, Signal::Kill)), "/bin/kill -s KILL 42");
    }
}
