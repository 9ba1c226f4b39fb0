//! Type definitions for devmgr

use serde::{Deserialize, Serialize};
use std::fmt;

/// Administrative state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
}

impl LinkState {
    pub fn is_up(&self) -> bool {
        matches!(self, LinkState::Up)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_up() { "up" } else { "down" })
    }
}

/// Mirror configuration of a bridge as reported by `get bridge <br> mirrors`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorStatus {
    /// `[]`
    Disabled,
    /// Mirror record UUIDs attached to the bridge
    Enabled(Vec<String>),
}

impl MirrorStatus {
    /// Parses the OVSDB set notation, e.g. `[]` or `[6d1c..., 0a2f...]`.
    pub fn parse(output: &str) -> Self {
        let inner = output.trim().trim_start_matches('[').trim_end_matches(']');
        let uuids: Vec<String> = inner
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if uuids.is_empty() {
            MirrorStatus::Disabled
        } else {
            MirrorStatus::Enabled(uuids)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_state_display() {
        assert_eq!(LinkState::Up.to_string(), "up");
        assert_eq!(LinkState::Down.to_string(), "down");
    }

    #[test]
    fn test_mirror_status_parse() {
        assert_eq!(MirrorStatus::parse("[]"), MirrorStatus::Disabled);
        assert_eq!(MirrorStatus::parse("  []\n"), MirrorStatus::Disabled);

        let status = MirrorStatus::parse("[6d1c2d6e-1b8f-4c1e-9d0a-3f3b1f0e2a11]");
        assert_eq!(
            status,
            MirrorStatus::Enabled(vec!["6d1c2d6e-1b8f-4c1e-9d0a-3f3b1f0e2a11".to_string()])
        );

        match MirrorStatus::parse("[a, b]") {
            MirrorStatus::Enabled(uuids) => assert_eq!(uuids, vec!["a", "b"]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
