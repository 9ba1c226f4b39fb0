//! Error types for hostnet operations.
//!
//! Every public operation in the workspace returns [`HostnetResult`]. Nothing
//! in the provisioning core panics on a failed command or file operation; the
//! caller decides whether to abort a multi-step sequence.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for hostnet operations.
pub type HostnetResult<T> = Result<T, HostnetError>;

/// Errors that can occur while provisioning host networking.
#[derive(Debug, Error)]
pub enum HostnetError {
    /// Failed to spawn an external command.
    #[error("Failed to execute command '{command}': {source}")]
    ShellExec {
        /// The rendered command line.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// External command returned a non-zero exit code.
    #[error("Command failed: '{command}' (exit code {exit_code}): {}", output_summary(.stdout, .stderr))]
    ShellCommandFailed {
        /// The rendered command line.
        command: String,
        /// The exit code (-1 when killed by a signal).
        exit_code: i32,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
    },

    /// External command did not finish within its deadline.
    #[error("Command timed out after {timeout:?}: '{command}'")]
    CommandTimeout {
        /// The rendered command line.
        command: String,
        /// The deadline that expired.
        timeout: Duration,
    },

    /// Invalid configuration or input; raised before any external I/O.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field or input that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// A managed server process could not be started.
    #[error("Failed to spawn {process}: {message}")]
    ProcessSpawn {
        /// Process name (e.g. "dnsmasq").
        process: String,
        /// Error message.
        message: String,
    },

    /// File operation failed.
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Operation not valid in the entity's current state.
    #[error("Invalid state for {entity}: {message}")]
    InvalidState {
        /// The entity (network, port, ...) concerned.
        entity: String,
        /// Error message.
        message: String,
    },

    /// The requested table is absent from the firewall dump.
    #[error("Table '{table}' not found in iptables dump")]
    TableNotFound {
        /// The table name.
        table: String,
    },

    /// One or more teardown steps failed; every step was still attempted.
    #[error("Teardown of {entity} incomplete: {}", .failures.join("; "))]
    Teardown {
        /// The entity being torn down.
        entity: String,
        /// One message per failed step.
        failures: Vec<String>,
    },
}

fn output_summary(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{}\n{}", stdout, stderr)
    }
}

impl HostnetError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an IO error bound to a path.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a process spawn error.
    pub fn process_spawn(process: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProcessSpawn {
            process: process.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidState {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Returns true for configuration errors. These are raised before any
    /// external I/O and must never be retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, HostnetError::InvalidConfig { .. })
    }

    /// Returns true if the error came from an external tool invocation.
    pub fn is_external_tool_error(&self) -> bool {
        matches!(
            self,
            HostnetError::ShellExec { .. }
                | HostnetError::ShellCommandFailed { .. }
                | HostnetError::CommandTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display() {
        let err = HostnetError::invalid_config("prefix_len", "31 leaves no usable hosts");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for prefix_len: 31 leaves no usable hosts"
        );
        assert!(err.is_configuration_error());
        assert!(!err.is_external_tool_error());
    }

    #[test]
    fn test_shell_command_failed() {
        let err = HostnetError::ShellCommandFailed {
            command: "/sbin/ip link set dev qbr-abc up".to_string(),
            exit_code: 1,
            stdout: String::new(),
            stderr: "Cannot find device".to_string(),
        };
        assert!(err.to_string().contains("ip link set dev"));
        assert!(err.to_string().contains("exit code 1"));
        assert!(err.to_string().contains("Cannot find device"));
        assert!(err.is_external_tool_error());
    }

    #[test]
    fn test_timeout_is_external() {
        let err = HostnetError::CommandTimeout {
            command: "/usr/bin/ovs-vsctl show".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert!(err.is_external_tool_error());
        assert!(err.to_string().contains("10s"));
    }

    #[test]
    fn test_teardown_joins_failures() {
        let err = HostnetError::Teardown {
            entity: "port abcdefghij".to_string(),
            failures: vec!["delete bridge: boom".to_string(), "delete veth: gone".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Teardown of port abcdefghij incomplete: delete bridge: boom; delete veth: gone"
        );
    }

    #[test]
    fn test_io_display() {
        let err = HostnetError::io(
            "/var/lib/dnsmasq/dhcp/net/host",
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.to_string().contains("/var/lib/dnsmasq/dhcp/net/host"));
    }
}
