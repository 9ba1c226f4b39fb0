//! Configuration file support for hostnetd
//!
//! Loads and validates agent configuration from TOML files.
//! Default location: /etc/hostnet/hostnetd.toml

use crate::error::{HostnetError, HostnetResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostnet/hostnetd.toml";

/// Maximum length of the firewall wrap name (iptables binary-name limit).
pub const MAX_WRAP_NAME_LEN: usize = 16;

/// Switch bridges used for attachment and mirroring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Integration bridge that workload ports attach to
    #[serde(default = "default_integration_bridge")]
    pub integration_bridge: String,

    /// Bridge carrying mirrored traffic and user login flows
    #[serde(default = "default_mirror_bridge")]
    pub mirror_bridge: String,

    /// VLAN mirrored traffic is sent out on
    #[serde(default = "default_mirror_vlan")]
    pub mirror_vlan: u16,

    /// Name of the mirror record on the mirror bridge
    #[serde(default = "default_mirror_name")]
    pub mirror_name: String,
}

/// DHCP server state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhcpConfig {
    /// Root of the per-network state directories
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,

    /// Lease time passed in the dhcp-range option
    #[serde(default = "default_lease_time")]
    pub lease_time: String,

    /// How long a started dnsmasq has to write its pid file, in seconds
    #[serde(default = "default_pid_timeout_secs")]
    pub pid_timeout_secs: u64,
}

/// Firewall reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Prefix for wrapped chains
    #[serde(default = "default_wrap_name")]
    pub wrap_name: String,

    /// Table security-group chains live in
    #[serde(default = "default_table")]
    pub table: String,

    /// Namespace whose iptables and ipsets are managed; the root namespace
    /// when absent
    #[serde(default)]
    pub namespace: Option<String>,
}

/// External command execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Deadline for every external command, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// `--timeout` passed to ovs-vsctl, in seconds
    #[serde(default = "default_ovs_vsctl_timeout_secs")]
    pub ovs_vsctl_timeout_secs: u64,
}

/// Identifier claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directory of per-prefix claim files; claims are kept in memory only
    /// when absent
    #[serde(default = "default_claims_dir")]
    pub claims_dir: Option<PathBuf>,
}

/// Logging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for dated log files; no file sink when absent
    #[serde(default = "default_log_directory")]
    pub directory: Option<PathBuf>,
}

/// Complete hostnetd configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub bridges: BridgeConfig,

    #[serde(default)]
    pub dhcp: DhcpConfig,

    #[serde(default)]
    pub firewall: FirewallConfig,

    #[serde(default)]
    pub commands: CommandConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default functions
fn default_integration_bridge() -> String {
    "br0".to_string()
}

fn default_mirror_bridge() -> String {
    "br1".to_string()
}

fn default_mirror_vlan() -> u16 {
    4093
}

fn default_mirror_name() -> String {
    "mymirror".to_string()
}

fn default_state_root() -> PathBuf {
    PathBuf::from("/var/lib/dnsmasq/dhcp")
}

fn default_lease_time() -> String {
    "infinite".to_string()
}

fn default_pid_timeout_secs() -> u64 {
    5
}

fn default_wrap_name() -> String {
    "hostnetd".to_string()
}

fn default_table() -> String {
    "filter".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_ovs_vsctl_timeout_secs() -> u64 {
    10
}

fn default_claims_dir() -> Option<PathBuf> {
    Some(PathBuf::from("/var/lib/hostnet/claims"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_directory() -> Option<PathBuf> {
    Some(PathBuf::from("/var/log/network"))
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            integration_bridge: default_integration_bridge(),
            mirror_bridge: default_mirror_bridge(),
            mirror_vlan: default_mirror_vlan(),
            mirror_name: default_mirror_name(),
        }
    }
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            state_root: default_state_root(),
            lease_time: default_lease_time(),
            pid_timeout_secs: default_pid_timeout_secs(),
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            wrap_name: default_wrap_name(),
            table: default_table(),
            namespace: None,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            ovs_vsctl_timeout_secs: default_ovs_vsctl_timeout_secs(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            claims_dir: default_claims_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: default_log_directory(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> HostnetResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| match e {
                HostnetError::InvalidConfig { message, .. } => {
                    HostnetError::invalid_config(path.display().to_string(), message)
                }
                other => other,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(HostnetError::io(path, e)),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> HostnetResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| {
            HostnetError::invalid_config("config", format!("failed to parse: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> HostnetResult<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).map_err(|e| {
            HostnetError::invalid_config("config", format!("failed to serialize: {}", e))
        })?;
        fs::write(path, content).map_err(|e| HostnetError::io(path, e))
    }

    /// Get the per-command deadline as Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.commands.timeout_secs)
    }

    /// Get the ovs-vsctl timeout as Duration
    pub fn ovs_vsctl_timeout(&self) -> Duration {
        Duration::from_secs(self.commands.ovs_vsctl_timeout_secs)
    }

    /// How long to wait for a dnsmasq pid file
    pub fn dhcp_pid_timeout(&self) -> Duration {
        Duration::from_secs(self.dhcp.pid_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> HostnetResult<()> {
        if self.bridges.integration_bridge.is_empty() {
            return Err(HostnetError::invalid_config(
                "bridges.integration_bridge",
                "must not be empty",
            ));
        }

        if self.bridges.mirror_bridge.is_empty() {
            return Err(HostnetError::invalid_config(
                "bridges.mirror_bridge",
                "must not be empty",
            ));
        }

        if !(1..=4094).contains(&self.bridges.mirror_vlan) {
            return Err(HostnetError::invalid_config(
                "bridges.mirror_vlan",
                format!("{} is outside 1-4094", self.bridges.mirror_vlan),
            ));
        }

        if self.bridges.mirror_name.is_empty() {
            return Err(HostnetError::invalid_config(
                "bridges.mirror_name",
                "must not be empty",
            ));
        }

        let wrap_len = self.firewall.wrap_name.len();
        if wrap_len == 0 || wrap_len > MAX_WRAP_NAME_LEN {
            return Err(HostnetError::invalid_config(
                "firewall.wrap_name",
                format!("length must be 1-{}, got {}", MAX_WRAP_NAME_LEN, wrap_len),
            ));
        }

        if !matches!(self.firewall.table.as_str(), "filter" | "nat") {
            return Err(HostnetError::invalid_config(
                "firewall.table",
                format!("'{}' is not one of filter, nat", self.firewall.table),
            ));
        }

        if self.firewall.namespace.as_deref() == Some("") {
            return Err(HostnetError::invalid_config(
                "firewall.namespace",
                "must not be empty when set",
            ));
        }

        if self.commands.timeout_secs == 0 {
            return Err(HostnetError::invalid_config(
                "commands.timeout_secs",
                "must be > 0",
            ));
        }

        if self.commands.ovs_vsctl_timeout_secs == 0 {
            return Err(HostnetError::invalid_config(
                "commands.ovs_vsctl_timeout_secs",
                "must be > 0",
            ));
        }

        if self.dhcp.lease_time.is_empty() {
            return Err(HostnetError::invalid_config("dhcp.lease_time", "must not be empty"));
        }

        if self.dhcp.pid_timeout_secs == 0 {
            return Err(HostnetError::invalid_config(
                "dhcp.pid_timeout_secs",
                "must be > 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.bridges.integration_bridge, "br0");
        assert_eq!(config.bridges.mirror_bridge, "br1");
        assert_eq!(config.bridges.mirror_vlan, 4093);
        assert_eq!(config.dhcp.state_root, PathBuf::from("/var/lib/dnsmasq/dhcp"));
        assert_eq!(config.dhcp.lease_time, "infinite");
        assert_eq!(config.firewall.table, "filter");
        assert_eq!(
            config.logging.directory,
            Some(PathBuf::from("/var/log/network"))
        );
        assert_eq!(
            config.registry.claims_dir,
            Some(PathBuf::from("/var/lib/hostnet/claims"))
        );
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_wrap_name_too_long() {
        let mut config = AgentConfig::default();
        config.firewall.wrap_name = "a-very-long-binary-name".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration_error());
        assert!(err.to_string().contains("firewall.wrap_name"));
    }

    #[test]
    fn test_validate_mirror_vlan_range() {
        let mut config = AgentConfig::default();
        config.bridges.mirror_vlan = 0;
        assert!(config.validate().is_err());
        config.bridges.mirror_vlan = 4095;
        assert!(config.validate().is_err());
        config.bridges.mirror_vlan = 4094;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_table() {
        let mut config = AgentConfig::default();
        config.firewall.table = "mangle".to_string();
        assert!(config.validate().is_err());
        config.firewall.table = "nat".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = AgentConfig::default();
        config.commands.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations() {
        let config = AgentConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.ovs_vsctl_timeout(), Duration::from_secs(10));
        assert_eq!(config.dhcp_pid_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_firewall_namespace() {
        let config = AgentConfig::from_toml("[firewall]\nnamespace = \"l3_ns-router0000\"").unwrap();
        assert_eq!(config.firewall.namespace.as_deref(), Some("l3_ns-router0000"));
        assert_eq!(AgentConfig::default().firewall.namespace, None);

        let err = AgentConfig::from_toml("[firewall]\nnamespace = \"\"").unwrap_err();
        assert!(err.to_string().contains("firewall.namespace"));
    }

    #[test]
    fn test_toml_partial_uses_defaults() {
        let toml_str = r#"
[bridges]
integration_bridge = "br-int"

[firewall]
wrap_name = "neutron-agent"
"#;
        let config = AgentConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.bridges.integration_bridge, "br-int");
        assert_eq!(config.firewall.wrap_name, "neutron-agent");
        // Unspecified values should use defaults
        assert_eq!(config.bridges.mirror_bridge, "br1");
        assert_eq!(config.commands.timeout_secs, 30);
    }

    #[test]
    fn test_toml_parse_error() {
        let err = AgentConfig::from_toml("[bridges\nfoo").unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = AgentConfig::load_or_default("/nonexistent/hostnetd.toml").unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[commands]\ntimeout_secs = 5").unwrap();
        let config = AgentConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_invalid_file_names_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[firewall]\ntable = \"raw\"").unwrap();
        let err = AgentConfig::load_or_default(file.path()).unwrap_err();
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostnetd.toml");
        let mut config = AgentConfig::default();
        config.bridges.mirror_vlan = 100;
        config.save(&path).unwrap();
        assert_eq!(AgentConfig::load_or_default(&path).unwrap(), config);
    }
}
