//! IPv4 address block arithmetic.
//!
//! Pure functions, no I/O. All arithmetic is done on the host-order `u32`
//! value of the address (network byte order decoded with
//! [`u32::from`]/[`Ipv4Addr::from`]).
//!
//! The gateway of a block is its last usable address
//! (`network + usable_hosts`) and the DHCP server listens on the first
//! (`network + 1`). Prefixes 31 and 32 have no usable hosts under this
//! scheme and are rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{HostnetError, HostnetResult};

/// Longest prefix that still leaves room for a gateway and a DHCP address.
pub const MAX_USABLE_PREFIX: u8 = 30;

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

fn check_prefix(prefix_len: u8) -> HostnetResult<()> {
    if prefix_len > 32 {
        return Err(HostnetError::invalid_config(
            "prefix_len",
            format!("{} is not a valid IPv4 prefix length", prefix_len),
        ));
    }
    Ok(())
}

/// Returns the network address of `ip/prefix_len`.
pub fn network_of(ip: Ipv4Addr, prefix_len: u8) -> HostnetResult<Ipv4Addr> {
    check_prefix(prefix_len)?;
    Ok(Ipv4Addr::from(u32::from(ip) & mask(prefix_len)))
}

/// Returns the broadcast address of `ip/prefix_len`.
pub fn broadcast_of(ip: Ipv4Addr, prefix_len: u8) -> HostnetResult<Ipv4Addr> {
    check_prefix(prefix_len)?;
    Ok(Ipv4Addr::from(u32::from(ip) | !mask(prefix_len)))
}

/// Returns the address the DHCP server listens on: the network address + 1.
pub fn dhcp_listen_addr(network: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(network).wrapping_add(1))
}

/// Returns `2^(32 - prefix_len) - 2`.
///
/// Prefix 31 and 32 would yield zero or a negative count and are a
/// configuration error.
pub fn usable_hosts(prefix_len: u8) -> HostnetResult<u32> {
    check_prefix(prefix_len)?;
    if prefix_len > MAX_USABLE_PREFIX {
        return Err(HostnetError::invalid_config(
            "prefix_len",
            format!(
                "/{} leaves no usable host addresses (maximum is /{})",
                prefix_len, MAX_USABLE_PREFIX
            ),
        ));
    }
    let size = 1u64 << (32 - u32::from(prefix_len));
    Ok((size - 2) as u32)
}

/// Returns `network + usable_hosts`, the last usable address of the block.
pub fn gateway(network: Ipv4Addr, usable_hosts: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(network).wrapping_add(usable_hosts))
}

/// An IPv4 address block with every derived address precomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressBlock {
    ip: Ipv4Addr,
    prefix_len: u8,
    network: Ipv4Addr,
    broadcast: Ipv4Addr,
    dhcp_listen: Ipv4Addr,
    usable_hosts: u32,
    gateway: Ipv4Addr,
}

impl AddressBlock {
    /// Computes the block for `ip/prefix_len`.
    pub fn new(ip: Ipv4Addr, prefix_len: u8) -> HostnetResult<Self> {
        let network = network_of(ip, prefix_len)?;
        let usable = usable_hosts(prefix_len)?;
        Ok(Self {
            ip,
            prefix_len,
            network,
            broadcast: broadcast_of(ip, prefix_len)?,
            dhcp_listen: dhcp_listen_addr(network),
            usable_hosts: usable,
            gateway: gateway(network, usable),
        })
    }

    /// The address the block was computed from.
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.broadcast
    }

    pub fn dhcp_listen_addr(&self) -> Ipv4Addr {
        self.dhcp_listen
    }

    pub fn usable_hosts(&self) -> u32 {
        self.usable_hosts
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// `network/prefix`, e.g. `10.0.0.0/24`.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.network, self.prefix_len)
    }

    /// `addr/prefix` for assigning `addr` on an interface in this block.
    pub fn with_prefix(&self, addr: Ipv4Addr) -> String {
        format!("{}/{}", addr, self.prefix_len)
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

impl FromStr for AddressBlock {
    type Err = HostnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s.split_once('/').ok_or_else(|| {
            HostnetError::invalid_config("address_block", format!("'{}' is not in a.b.c.d/n form", s))
        })?;
        let ip = addr.parse::<Ipv4Addr>().map_err(|_| {
            HostnetError::invalid_config("address_block", format!("'{}' is not an IPv4 address", addr))
        })?;
        let prefix_len = len.parse::<u8>().map_err(|_| {
            HostnetError::invalid_config("address_block", format!("'{}' is not a prefix length", len))
        })?;
        Self::new(ip, prefix_len)
    }
}
