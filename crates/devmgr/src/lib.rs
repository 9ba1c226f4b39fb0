//! devmgr - device primitives for the hostnet agent
//!
//! Thin managers over the host's networking tools. Each one builds argv
//! vectors in [`commands`] and runs them through an injected
//! [`CommandRunner`](hostnet_common::CommandRunner):
//!
//! - [`IpMgr`]: namespaces, links, veth pairs, addresses and routes
//! - [`BridgeMgr`]: per-port Linux bridges
//! - [`OvsMgr`]: Open vSwitch ports, flows and mirrors
//! - [`IpsetMgr`]: `hash:net` address sets

mod bridge_mgr;
pub mod commands;
mod flows;
mod ip_mgr;
mod ipset_mgr;
mod ovs_mgr;
mod types;

pub use bridge_mgr::{BridgeMgr, BRIDGE_FS};
pub use flows::{FlowAction, FlowSpec};
pub use ip_mgr::{addr_listed, parse_netns_list, parse_onlink_routes, IpMgr};
pub use ipset_mgr::IpsetMgr;
pub use ovs_mgr::{OvsMgr, DEFAULT_OVS_VSCTL_TIMEOUT};
pub use types::*;
