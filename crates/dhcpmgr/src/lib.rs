//! dhcpmgr - DHCP service lifecycle for the hostnet agent
//!
//! Runs one dnsmasq per network inside the network's DHCP namespace. Each
//! network owns a state directory under the configured state root holding
//! the static bindings file, the pid file, the lease database and the id of
//! the owning network.

pub mod commands;
mod dhcp_mgr;
pub mod hosts_file;
mod types;

pub use dhcp_mgr::{DhcpMgr, DEFAULT_PID_TIMEOUT, DNSMASQ_PROCESS};
pub use types::*;
