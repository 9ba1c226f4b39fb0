//! fwmgr - firewall reconciliation for the hostnet agent
//!
//! - [`IptablesMgr`]: applies a [`TableDelta`] to one iptables table by
//!   diffing the `iptables-save -c` dump and restoring only that table
//! - [`SgDriver`]: per-port security-group chains and address sets on top
//!
//! The dump rewrite itself is the pure [`modify_table`].

mod chains;
pub mod commands;
mod iptables_mgr;
mod reconcile;
mod sg_driver;
mod types;

pub use chains::{ChainWrapper, MAX_CHAIN_LEN_NOWRAP, MAX_CHAIN_LEN_WRAP};
pub use iptables_mgr::IptablesMgr;
pub use reconcile::{
    build_restore_input, find_insertion_point, find_table, modify_table, restore_error_context,
    RESTORE_ERROR_CONTEXT_LINES,
};
pub use sg_driver::{SgDriver, FORWARD_CHAIN, SG_CHAIN};
pub use types::*;
