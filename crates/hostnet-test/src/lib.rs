//! Integration test infrastructure for hostnet managers
//!
//! Provides:
//! - A recording [`CommandRunner`](hostnet_common::CommandRunner) that never
//!   touches the host and simulates `iptables-save`/`iptables-restore`
//! - Firewall dump fixtures and entity identifiers used across tests
//! - Command execution verification helpers

pub mod fixtures;
mod runner;
mod verification;

pub use fixtures::*;
pub use runner::{RecordedCommand, RecordingRunner};
pub use verification::*;
