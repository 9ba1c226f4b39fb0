//! Type definitions for fwmgr

use hostnet_common::HostnetError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// iptables tables managed by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }

    /// Built-in chains that get a wrapped counterpart.
    pub fn builtin_chains(&self) -> &'static [&'static str] {
        match self {
            Table::Filter => &["INPUT", "OUTPUT", "FORWARD"],
            Table::Nat => &["PREROUTING", "OUTPUT", "POSTROUTING"],
        }
    }

    /// The `*<table>` header line of a dump.
    pub fn header(&self) -> String {
        format!("*{}", self.as_str())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = HostnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filter" => Ok(Table::Filter),
            "nat" => Ok(Table::Nat),
            other => Err(HostnetError::invalid_config(
                "table",
                format!("unsupported table '{}'", other),
            )),
        }
    }
}

/// A rule in its final form: chain name and expression already wrapped and
/// expanded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub chain: String,
    pub expr: String,
}

impl Rule {
    pub fn new(chain: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            expr: expr.into(),
        }
    }

    /// `-A <chain> <expr>`
    pub fn render(&self) -> String {
        format!("-A {} {}", self.chain, self.expr.trim())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Desired changes to one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDelta {
    pub add_chains: Vec<String>,
    pub remove_chains: Vec<String>,
    pub add_rules: Vec<Rule>,
    pub remove_rules: Vec<Rule>,
}

impl TableDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chain(mut self, chain: impl Into<String>) -> Self {
        self.add_chains.push(chain.into());
        self
    }

    pub fn remove_chain(mut self, chain: impl Into<String>) -> Self {
        self.remove_chains.push(chain.into());
        self
    }

    pub fn add_rule(mut self, rule: Rule) -> Self {
        self.add_rules.push(rule);
        self
    }

    pub fn remove_rule(mut self, rule: Rule) -> Self {
        self.remove_rules.push(rule);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.add_chains.is_empty()
            && self.remove_chains.is_empty()
            && self.add_rules.is_empty()
            && self.remove_rules.is_empty()
    }
}

/// Something the delta wanted to add that was already there
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    ChainExists(String),
    RuleExists(String),
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::ChainExists(chain) => write!(f, "chain {} already exists", chain),
            Conflict::RuleExists(rule) => write!(f, "rule '{}' already exists", rule),
        }
    }
}

/// Outcome of one table modification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub added_chains: Vec<String>,
    pub added_rules: Vec<String>,
    pub conflicts: Vec<Conflict>,
    pub removed_lines: usize,
}

impl ApplyReport {
    /// True when nothing was added or removed.
    pub fn is_noop(&self) -> bool {
        self.added_chains.is_empty() && self.added_rules.is_empty() && self.removed_lines == 0
    }
}

/// Traffic direction relative to the workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Towards the workload
    Ingress,
    /// From the workload
    Egress,
}

impl Direction {
    /// Egress first, matching the order chains are wired in.
    pub const ALL: [Direction; 2] = [Direction::Egress, Direction::Ingress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    /// physdev option matching the port device for this direction.
    pub fn physdev_flag(&self) -> &'static str {
        match self {
            Direction::Ingress => "--physdev-out",
            Direction::Egress => "--physdev-in",
        }
    }

    /// Address-set match direction.
    pub fn set_match(&self) -> &'static str {
        match self {
            Direction::Ingress => "src",
            Direction::Egress => "dst",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = HostnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingress" => Ok(Direction::Ingress),
            "egress" => Ok(Direction::Egress),
            other => Err(HostnetError::invalid_config(
                "direction",
                format!("'{}' is neither ingress nor egress", other),
            )),
        }
    }
}

/// Rule target for address-set rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Accept,
    Drop,
    Reject,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
            Verdict::Reject => "REJECT",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = HostnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACCEPT" => Ok(Verdict::Accept),
            "DROP" => Ok(Verdict::Drop),
            "REJECT" => Ok(Verdict::Reject),
            _ => Err(HostnetError::invalid_config(
                "verdict",
                format!("'{}' is not ACCEPT, DROP or REJECT", s),
            )),
        }
    }
}
