//! Chain name wrapping and `$name` expansion.
//!
//! iptables accepts chain names of up to 28 characters. Wrapped chains carry
//! the `<wrap-name>-` prefix, so with the longest wrap name (16) the wrapped
//! part may use at most 11.

use hostnet_common::config::MAX_WRAP_NAME_LEN;
use hostnet_common::{HostnetError, HostnetResult};

use crate::types::Rule;

/// Longest chain name accepted by iptables
pub const MAX_CHAIN_LEN_NOWRAP: usize = 28;
/// Longest chain name that can be wrapped
pub const MAX_CHAIN_LEN_WRAP: usize = 11;

/// Renders chain names under one wrap prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainWrapper {
    wrap_name: String,
}

impl ChainWrapper {
    pub fn new(wrap_name: impl Into<String>) -> HostnetResult<Self> {
        let wrap_name = wrap_name.into();
        if wrap_name.is_empty() || wrap_name.len() > MAX_WRAP_NAME_LEN {
            return Err(HostnetError::invalid_config(
                "firewall.wrap_name",
                format!(
                    "'{}' must be 1..={} characters",
                    wrap_name, MAX_WRAP_NAME_LEN
                ),
            ));
        }
        Ok(Self { wrap_name })
    }

    pub fn wrap_name(&self) -> &str {
        &self.wrap_name
    }

    /// `<wrap-name>-<name>`
    pub fn wrap(&self, name: &str) -> HostnetResult<String> {
        if name.is_empty() || name.len() > MAX_CHAIN_LEN_WRAP {
            return Err(HostnetError::invalid_config(
                "chain",
                format!(
                    "wrapped chain name '{}' must be 1..={} characters",
                    name, MAX_CHAIN_LEN_WRAP
                ),
            ));
        }
        Ok(format!("{}-{}", self.wrap_name, name))
    }

    /// Validates an unwrapped chain name.
    pub fn plain(&self, name: &str) -> HostnetResult<String> {
        if name.is_empty() || name.len() > MAX_CHAIN_LEN_NOWRAP {
            return Err(HostnetError::invalid_config(
                "chain",
                format!(
                    "chain name '{}' must be 1..={} characters",
                    name, MAX_CHAIN_LEN_NOWRAP
                ),
            ));
        }
        Ok(name.to_string())
    }

    /// The chain name, wrapped or not.
    pub fn chain(&self, name: &str, wrap: bool) -> HostnetResult<String> {
        if wrap {
            self.wrap(name)
        } else {
            self.plain(name)
        }
    }

    /// Replaces every `$name` token with the wrapped chain name.
    pub fn expand(&self, expr: &str) -> HostnetResult<String> {
        if !expr.contains('$') {
            return Ok(expr.trim().to_string());
        }
        let tokens = expr
            .split_whitespace()
            .map(|token| match token.strip_prefix('$') {
                Some(name) => self.wrap(name),
                None => Ok(token.to_string()),
            })
            .collect::<HostnetResult<Vec<_>>>()?;
        Ok(tokens.join(" "))
    }

    /// Builds a rule, wrapping the chain when asked and expanding `$name`
    /// references.
    pub fn rule(&self, chain: &str, expr: &str, wrap: bool) -> HostnetResult<Rule> {
        Ok(Rule::new(self.chain(chain, wrap)?, self.expand(expr)?))
    }
}
