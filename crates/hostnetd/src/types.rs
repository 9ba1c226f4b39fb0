//! Verb inputs for the orchestrator

use dhcpmgr::HostBinding;
use hostnet_common::{AddressBlock, HostnetError, HostnetResult};
use std::net::Ipv4Addr;

/// Largest usable 802.1Q VLAN id
pub const MAX_VLAN_ID: u16 = 4094;

/// Rejects VLAN ids outside 1..=4094.
pub fn validate_vlan(field: &str, vlan: u16) -> HostnetResult<u16> {
    if vlan == 0 || vlan > MAX_VLAN_ID {
        return Err(HostnetError::invalid_config(
            field,
            format!("VLAN {} is outside 1..={}", vlan, MAX_VLAN_ID),
        ));
    }
    Ok(vlan)
}

/// Checks `a.b.c.d/n` with n <= 32. Host routes are allowed, unlike
/// [`AddressBlock`].
pub fn validate_cidr(cidr: &str) -> HostnetResult<()> {
    let invalid = || HostnetError::invalid_config("cidr", format!("'{}' is not a.b.c.d/n", cidr));
    let (addr, len) = cidr.split_once('/').ok_or_else(invalid)?;
    addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    match len.parse::<u8>() {
        Ok(n) if n <= 32 => Ok(()),
        _ => Err(invalid()),
    }
}

/// DHCP provisioning for one network
#[derive(Debug, Clone)]
pub struct DhcpProvision {
    pub network: String,
    pub block: AddressBlock,
    pub vlan: u16,
    /// Binding registered once the service runs
    pub host: Option<HostBinding>,
    /// Overrides the derived `qdhcp-<p>` namespace
    pub namespace: Option<String>,
    /// Allows starting the service when it is not running yet
    pub first: bool,
}

/// L3 routing domain joining a workload network to an upstream network
#[derive(Debug, Clone)]
pub struct L3Provision {
    pub router: String,
    pub network: String,
    pub workload: AddressBlock,
    pub workload_vlan: u16,
    pub upstream: AddressBlock,
    pub upstream_vlan: u16,
}
