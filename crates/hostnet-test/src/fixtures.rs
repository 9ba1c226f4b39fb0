//! Test fixtures for common hostnet patterns
//!
//! Provides firewall dumps, entity identifiers and agent configurations
//! reused across manager tests

/// Builder for `iptables-save -c` style dumps
#[derive(Debug, Clone, Default)]
pub struct DumpBuilder {
    lines: Vec<String>,
    open_table: bool,
}

impl DumpBuilder {
    /// Create an empty dump
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a table section, committing the previous one
    pub fn table(mut self, name: &str) -> Self {
        if self.open_table {
            self.lines.push("COMMIT".to_string());
        }
        self.lines.push(format!("*{}", name));
        self.open_table = true;
        self
    }

    /// Declare a chain with a policy (`-` for user chains)
    pub fn chain(mut self, name: &str, policy: &str) -> Self {
        self.lines.push(format!(":{} {} [0:0]", name, policy));
        self
    }

    /// Append a rule with zeroed counters
    pub fn rule(mut self, chain: &str, expr: &str) -> Self {
        self.lines.push(format!("[0:0] -A {} {}", chain, expr));
        self
    }

    /// Append a raw line (comments, counters, ...)
    pub fn raw(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    /// Render the dump, committing the last table
    pub fn build(mut self) -> String {
        if self.open_table {
            self.lines.push("COMMIT".to_string());
        }
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

/// Common firewall dump fixtures
pub mod dump_fixtures {
    use super::*;

    /// A host with empty nat and filter tables
    pub fn empty_host() -> String {
        DumpBuilder::new()
            .raw("# Generated by iptables-save v1.8.7 on Mon Oct 19 10:00:00 2026")
            .table("nat")
            .chain("PREROUTING", "ACCEPT")
            .chain("INPUT", "ACCEPT")
            .chain("OUTPUT", "ACCEPT")
            .chain("POSTROUTING", "ACCEPT")
            .table("filter")
            .chain("INPUT", "ACCEPT")
            .chain("FORWARD", "ACCEPT")
            .chain("OUTPUT", "ACCEPT")
            .build()
    }

    /// A host with a few unrelated rules in both tables
    pub fn busy_host() -> String {
        DumpBuilder::new()
            .table("nat")
            .chain("PREROUTING", "ACCEPT")
            .chain("INPUT", "ACCEPT")
            .chain("OUTPUT", "ACCEPT")
            .chain("POSTROUTING", "ACCEPT")
            .rule("POSTROUTING", "-s 192.168.122.0/24 ! -d 192.168.122.0/24 -j MASQUERADE")
            .table("filter")
            .chain("INPUT", "ACCEPT")
            .chain("FORWARD", "ACCEPT")
            .chain("OUTPUT", "ACCEPT")
            .chain("LIBVIRT_INP", "-")
            .rule("INPUT", "-j LIBVIRT_INP")
            .rule("LIBVIRT_INP", "-i virbr0 -p udp -m udp --dport 53 -j ACCEPT")
            .build()
    }

    /// A dump with only a nat table
    pub fn nat_only() -> String {
        DumpBuilder::new()
            .table("nat")
            .chain("PREROUTING", "ACCEPT")
            .chain("POSTROUTING", "ACCEPT")
            .build()
    }

    /// Lines of the `*<table>` section, header and COMMIT excluded
    pub fn table_lines(dump: &str, table: &str) -> Vec<String> {
        let header = format!("*{}", table);
        dump.lines()
            .skip_while(|l| *l != header)
            .skip(1)
            .take_while(|l| *l != "COMMIT")
            .map(str::to_string)
            .collect()
    }
}

/// Entity identifiers used by the end-to-end scenarios
pub mod id_fixtures {
    /// Port whose prefix is `abcdefghij`
    pub const PORT_ID: &str = "abcdefghij0001";

    /// A second port sharing nothing with [`PORT_ID`]
    pub const OTHER_PORT_ID: &str = "zyxwvutsrq0002";

    /// Network whose prefix is `net0000000`
    pub const NETWORK_ID: &str = "net000000001x";

    /// Routing domain whose prefix is `router0000`
    pub const ROUTER_ID: &str = "router00000042";

    /// VLAN used by the attach scenario
    pub const VLAN: u16 = 50;

    /// MAC used for host bindings
    pub const MAC: &str = "fa:16:3e:00:00:01";
}

/// Agent configurations that keep all host state under a test directory
pub mod config_fixtures {
    use hostnet_common::AgentConfig;
    use std::path::Path;

    /// Defaults with DHCP state and identifier claims under `root`, and no
    /// log file.
    pub fn agent_config(root: &Path) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.dhcp.state_root = root.join("dhcp");
        config.registry.claims_dir = Some(root.join("claims"));
        config.logging.directory = None;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    #[test]
    fn test_dump_builder() {
        let dump = DumpBuilder::new()
            .table("filter")
            .chain("INPUT", "ACCEPT")
            .rule("INPUT", "-j DROP")
            .build();
        assert_eq!(dump, "*filter\n:INPUT ACCEPT [0:0]\n[0:0] -A INPUT -j DROP\nCOMMIT\n");
    }

    #[test]
    fn test_table_lines() {
        let dump = dump_fixtures::busy_host();
        let filter = dump_fixtures::table_lines(&dump, "filter");
        assert_eq!(filter.first().map(String::as_str), Some(":INPUT ACCEPT [0:0]"));
        assert!(filter.iter().all(|l| !l.contains("MASQUERADE")));

        let nat = dump_fixtures::table_lines(&dump, "nat");
        assert_eq!(nat.len(), 5);
    }

    #[test]
    fn test_empty_host_has_both_tables() {
        let dump = dump_fixtures::empty_host();
        assert!(dump.contains("*nat\n"));
        assert!(dump.contains("*filter\n"));
        assert_eq!(dump.matches("COMMIT").count(), 2);
    }

    #[test]
    fn test_agent_config_stays_under_root() {
        let config = config_fixtures::agent_config(Path::new("/tmp/case"));
        assert_eq!(config.dhcp.state_root, Path::new("/tmp/case/dhcp"));
        assert_eq!(config.registry.claims_dir.as_deref(), Some(Path::new("/tmp/case/claims")));
        assert!(config.logging.directory.is_none());
        assert!(config.validate().is_ok());
    }
}
