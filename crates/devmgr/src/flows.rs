//! OpenFlow flow descriptors.
//!
//! A [`FlowSpec`] serialises to the comma-separated flow expression accepted
//! by `ovs-ofctl`, always in the same order: timeouts, priority, protocol,
//! match fields sorted by key, actions.

use hostnet_common::{HostnetError, HostnetResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// What an `ovs-ofctl` invocation does with a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowAction {
    Add,
    Delete,
}

impl FlowAction {
    /// The `ovs-ofctl` subcommand for this action.
    pub fn ofctl_command(&self) -> &'static str {
        match self {
            FlowAction::Add => "add-flow",
            FlowAction::Delete => "del-flows",
        }
    }

    /// Deletes match strictly so only the exact flow goes away.
    pub fn is_strict(&self) -> bool {
        matches!(self, FlowAction::Delete)
    }
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowAction::Add => "add",
            FlowAction::Delete => "del",
        };
        f.write_str(s)
    }
}

/// Typed OpenFlow flow descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    #[serde(default)]
    pub hard_timeout: Option<u32>,
    #[serde(default)]
    pub idle_timeout: Option<u32>,
    #[serde(default)]
    pub priority: Option<u16>,
    /// Bare protocol keyword such as `ip`, `arp` or `tcp`.
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub matches: BTreeMap<String, String>,
    #[serde(default)]
    pub actions: Option<String>,
}

impl FlowSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: u16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_match(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.matches.insert(key.into(), value.into());
        self
    }

    pub fn actions(mut self, actions: impl Into<String>) -> Self {
        self.actions = Some(actions.into());
        self
    }

    pub fn timeouts(mut self, hard: u32, idle: u32) -> Self {
        self.hard_timeout = Some(hard);
        self.idle_timeout = Some(idle);
        self
    }

    /// Parses `key=value` tokens; a token without `=` is the protocol.
    ///
    /// `hard_timeout`, `idle_timeout`, `priority` and `actions` fill their
    /// typed fields, everything else becomes a match field.
    pub fn from_tokens<I, S>(tokens: I) -> HostnetResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut spec = Self::new();
        for token in tokens {
            let token = token.as_ref().trim();
            if token.is_empty() {
                continue;
            }
            let Some((key, value)) = token.split_once('=') else {
                spec.protocol = Some(token.to_string());
                continue;
            };
            match key {
                "hard_timeout" => spec.hard_timeout = Some(parse_num(key, value)?),
                "idle_timeout" => spec.idle_timeout = Some(parse_num(key, value)?),
                "priority" => {
                    spec.priority = Some(value.parse().map_err(|_| {
                        HostnetError::invalid_config("flow.priority", format!("'{}' is not a priority", value))
                    })?)
                }
                "actions" => spec.actions = Some(value.to_string()),
                "proto" | "protocol" => spec.protocol = Some(value.to_string()),
                _ => {
                    spec.matches.insert(key.to_string(), value.to_string());
                }
            }
        }
        Ok(spec)
    }

    /// Renders the flow expression for `action`.
    ///
    /// Add emits both timeouts (default 0). Delete drops priority and actions.
    /// Add without actions is a configuration error.
    pub fn render(&self, action: FlowAction) -> HostnetResult<String> {
        let mut parts = Vec::new();

        if action == FlowAction::Add {
            parts.push(format!("hard_timeout={}", self.hard_timeout.unwrap_or(0)));
            parts.push(format!("idle_timeout={}", self.idle_timeout.unwrap_or(0)));
        }

        if action != FlowAction::Delete {
            if let Some(priority) = self.priority {
                parts.push(format!("priority={}", priority));
            }
        }

        if let Some(protocol) = &self.protocol {
            parts.push(protocol.clone());
        }

        for (key, value) in &self.matches {
            parts.push(format!("{}={}", key, value));
        }

        if action != FlowAction::Delete {
            let actions = self.actions.as_deref().ok_or_else(|| {
                HostnetError::invalid_config(
                    "flow.actions",
                    format!("must specify one or more actions on flow {}", action),
                )
            })?;
            parts.push(format!("actions={}", actions));
        }

        Ok(parts.join(","))
    }
}

fn parse_num(key: &str, value: &str) -> HostnetResult<u32> {
    value.parse().map_err(|_| {
        HostnetError::invalid_config(format!("flow.{}", key), format!("'{}' is not a number", value))
    })
}
