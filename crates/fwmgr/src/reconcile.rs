//! Pure text transformation of an `iptables-save -c` dump.
//!
//! Nothing here runs a command; [`IptablesMgr`](crate::IptablesMgr) wraps
//! these functions with save and restore.

use hostnet_common::{HostnetError, HostnetResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;
use tracing::debug;

use crate::types::{ApplyReport, Conflict, Table, TableDelta};

/// Lines of input shown on each side of a line rejected by iptables-restore
pub const RESTORE_ERROR_CONTEXT_LINES: usize = 5;

/// Counters prefixed to new rule lines
const ZERO_COUNTERS: &str = "[0:0]";

static RESTORE_FAILED_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"line (\d+) failed").expect("Invalid regex pattern"));

/// Range of lines strictly between `*<table>` and the next `COMMIT`.
pub fn find_table(lines: &[String], table: Table) -> HostnetResult<Range<usize>> {
    let header = table.header();
    let start = lines
        .iter()
        .position(|l| l.trim() == header)
        .ok_or_else(|| HostnetError::TableNotFound {
            table: table.as_str().to_string(),
        })?
        + 1;
    let end = lines[start..]
        .iter()
        .position(|l| l.trim() == "COMMIT")
        .map(|i| start + i)
        .ok_or_else(|| {
            HostnetError::invalid_state(
                format!("table {}", table),
                "dump has no COMMIT after the table header",
            )
        })?;
    Ok(start..end)
}

fn is_declaration(line: &str) -> bool {
    line.trim_start().starts_with(':')
}

/// Index just past the `:` declarations that open the region, or 0 when the
/// first line after the table header is not a declaration. A `:` line further
/// down is not a declaration block and does not move the insertion point.
pub fn find_insertion_point(region: &[String]) -> usize {
    region.iter().take_while(|l| is_declaration(l)).count()
}

fn declares(line: &str, chain: &str) -> bool {
    line.trim()
        .strip_prefix(':')
        .and_then(|rest| rest.split_whitespace().next())
        .is_some_and(|name| name == chain)
}

/// Applies `delta` to a table region and returns the new region.
///
/// Chains and rules already present are recorded as conflicts and skipped.
/// New rules are inserted as one block after the declarations, ahead of
/// the existing rules, in delta order. Removal drops every line containing a
/// removed chain name or rule text.
pub fn modify_table(region: &[String], delta: &TableDelta, report: &mut ApplyReport) -> Vec<String> {
    let mut lines = region.to_vec();

    let mut new_chains: Vec<String> = Vec::new();
    for chain in &delta.add_chains {
        let chain = chain.trim();
        let exists = lines.iter().rev().any(|l| declares(l, chain))
            || new_chains.iter().any(|c| c == chain);
        if exists {
            debug!("Chain {} already exists, skipping", chain);
            report.conflicts.push(Conflict::ChainExists(chain.to_string()));
            continue;
        }
        new_chains.push(chain.to_string());
    }
    if !new_chains.is_empty() {
        let at = find_insertion_point(&lines);
        let decls = new_chains.iter().map(|c| format!(":{} - [0:0]", c));
        lines.splice(at..at, decls);
        report.added_chains.extend(new_chains);
    }

    let mut new_rules: Vec<String> = Vec::new();
    for rule in &delta.add_rules {
        let text = rule.render();
        let exists = lines.iter().any(|l| l.trim().contains(&text))
            || new_rules.iter().any(|r| *r == text);
        if exists {
            debug!("Rule '{}' already exists, skipping", text);
            report.conflicts.push(Conflict::RuleExists(text));
            continue;
        }
        new_rules.push(text);
    }
    if !new_rules.is_empty() {
        let at = find_insertion_point(&lines);
        let block = new_rules.iter().map(|r| format!("{} {}", ZERO_COUNTERS, r));
        lines.splice(at..at, block);
        report.added_rules.extend(new_rules);
    }

    let removals: Vec<String> = delta
        .remove_chains
        .iter()
        .map(|c| c.trim().to_string())
        .chain(delta.remove_rules.iter().map(|r| r.render()))
        .filter(|needle| !needle.is_empty())
        .collect();
    if !removals.is_empty() {
        let before = lines.len();
        lines.retain(|l| {
            let line = l.trim();
            !removals.iter().any(|needle| line.contains(needle.as_str()))
        });
        report.removed_lines += before - lines.len();
    }

    lines
}

/// Applies `delta` to the `table` section of a full dump and returns the
/// restore input for that table alone: header, region and `COMMIT`.
pub fn build_restore_input(
    dump: &str,
    table: Table,
    delta: &TableDelta,
    report: &mut ApplyReport,
) -> HostnetResult<String> {
    let lines: Vec<String> = dump.lines().map(str::to_string).collect();
    let range = find_table(&lines, table)?;
    let region = modify_table(&lines[range], delta, report);

    let mut input = table.header();
    input.push('\n');
    for line in &region {
        input.push_str(line);
        input.push('\n');
    }
    input.push_str("COMMIT\n");
    Ok(input)
}

/// Lines of `input` around the line named in an iptables-restore error.
pub fn restore_error_context(stderr: &str, input: &str) -> Option<String> {
    let caps = RESTORE_FAILED_LINE_RE.captures(stderr)?;
    let line_no: usize = caps.get(1)?.as_str().parse().ok()?;
    let lines: Vec<&str> = input.lines().collect();
    if line_no == 0 || line_no > lines.len() {
        return None;
    }
    let idx = line_no - 1;
    let start = idx.saturating_sub(RESTORE_ERROR_CONTEXT_LINES);
    let end = (idx + RESTORE_ERROR_CONTEXT_LINES + 1).min(lines.len());
    let context = (start..end)
        .map(|i| {
            let marker = if i == idx { ">" } else { " " };
            format!("{} {:>4}: {}", marker, i + 1, lines[i])
        })
        .collect::<Vec<_>>()
        .join("\n");
    Some(context)
}
