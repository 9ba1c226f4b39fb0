//! hostnetd - host network provisioning agent
//!
//! Wires the device, DHCP and firewall managers into lifecycle verbs for
//! workload ports, network DHCP services, L3 routing domains, routes,
//! traffic mirroring and security groups.

pub mod logging;
mod orchestrator;
pub mod teardown;
mod types;

pub use orchestrator::Orchestrator;
pub use teardown::TeardownPlan;
pub use types::{validate_cidr, validate_vlan, DhcpProvision, L3Provision, MAX_VLAN_ID};
