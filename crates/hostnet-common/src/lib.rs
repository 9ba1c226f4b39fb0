//! Common infrastructure for the hostnet provisioning agent.
//!
//! Every hostnet crate builds on this one:
//!
//! - [`shell`]: external command execution behind the [`CommandRunner`] trait
//! - [`error`]: the [`HostnetError`] taxonomy shared by all managers
//! - [`config`]: TOML agent configuration
//! - [`naming`]: entity identifiers and derived device/chain names
//! - [`ipcalc`]: IPv4 address block arithmetic
//!
//! # Example
//!
//! ```ignore
//! use hostnet_common::{
//!     shell::{argv, CommandRunner, IP_CMD},
//!     EntityId, HostnetResult,
//! };
//!
//! async fn bridge_up(runner: &dyn CommandRunner, port: &EntityId) -> HostnetResult<()> {
//!     let cmd = argv([IP_CMD, "link", "set", "dev", &port.bridge_name(), "up"]);
//!     runner.exec_or_throw(&cmd).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ipcalc;
pub mod naming;
pub mod shell;

// Re-export commonly used items at crate root
pub use config::AgentConfig;
pub use error::{HostnetError, HostnetResult};
pub use ipcalc::AddressBlock;
pub use naming::{EntityId, EntityKind, IdentityRegistry};
pub use shell::{CommandRunner, ExecResult, ShellRunner};
