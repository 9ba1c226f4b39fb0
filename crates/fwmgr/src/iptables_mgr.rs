//! IptablesMgr - save, modify, restore
//!
//! Every [`apply`](IptablesMgr::apply) is one transaction on one table:
//!
//! 1. `iptables-save -c` the live state
//! 2. rewrite the table's region with [`modify_table`](crate::modify_table)
//! 3. feed that table alone to `iptables-restore -c`
//!
//! Restore is the only commit point. Applies on the same (namespace, table)
//! are serialised from save to restore; other processes running
//! iptables-restore are not.

use dashmap::DashMap;
use hostnet_common::shell::render_command;
use hostnet_common::{CommandRunner, HostnetError, HostnetResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::chains::{ChainWrapper, MAX_CHAIN_LEN_NOWRAP};
use crate::commands::{build_iptables_restore_cmd, build_iptables_save_cmd};
use crate::reconcile::{build_restore_input, find_table, restore_error_context};
use crate::types::{ApplyReport, Table, TableDelta};

type LockKey = (Option<String>, Table);

/// Applies table deltas in one namespace
#[derive(Clone)]
pub struct IptablesMgr {
    runner: Arc<dyn CommandRunner>,
    namespace: Option<String>,
    chains: ChainWrapper,
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl IptablesMgr {
    pub fn new(runner: Arc<dyn CommandRunner>, wrap_name: &str) -> HostnetResult<Self> {
        Ok(Self {
            runner,
            namespace: None,
            chains: ChainWrapper::new(wrap_name)?,
            locks: Arc::new(DashMap::new()),
        })
    }

    /// A manager for `namespace` sharing this one's table locks.
    pub fn in_namespace(&self, namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..self.clone()
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Chain naming under this manager's wrap name.
    pub fn chains(&self) -> &ChainWrapper {
        &self.chains
    }

    fn lock_for(&self, table: Table) -> Arc<Mutex<()>> {
        self.locks
            .entry((self.namespace.clone(), table))
            .or_default()
            .clone()
    }

    /// The live `iptables-save -c` dump.
    pub async fn save(&self) -> HostnetResult<String> {
        self.runner
            .exec_or_throw(&build_iptables_save_cmd(self.ns()))
            .await
    }

    fn ns(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn validate(delta: &TableDelta) -> HostnetResult<()> {
        let names = delta
            .add_chains
            .iter()
            .chain(delta.add_rules.iter().map(|r| &r.chain));
        for name in names {
            let name = name.trim();
            if name.is_empty() || name.len() > MAX_CHAIN_LEN_NOWRAP {
                return Err(HostnetError::invalid_config(
                    "chain",
                    format!(
                        "chain name '{}' must be 1..={} characters",
                        name, MAX_CHAIN_LEN_NOWRAP
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Applies `delta` to `table`.
    ///
    /// Chains or rules that already exist are skipped and listed as conflicts
    /// in the report. A restore failure discards the delta; the error carries
    /// the restore input around the rejected line.
    #[instrument(skip(self, delta), fields(namespace = self.namespace.as_deref().unwrap_or("")))]
    pub async fn apply(&self, table: Table, delta: &TableDelta) -> HostnetResult<ApplyReport> {
        Self::validate(delta)?;
        if delta.is_empty() {
            debug!("Empty delta for {}, nothing to apply", table);
            return Ok(ApplyReport::default());
        }

        let lock = self.lock_for(table);
        let _guard = lock.lock().await;

        let dump = self.save().await?;
        let mut report = ApplyReport::default();
        let input = build_restore_input(&dump, table, delta, &mut report)?;
        for conflict in &report.conflicts {
            debug!("Skipped in {}: {}", table, conflict);
        }

        let cmd = build_iptables_restore_cmd(self.ns());
        let result = self.runner.run_with_input(&cmd, &input).await?;
        if !result.success() {
            let mut stderr = result.stderr;
            if let Some(context) = restore_error_context(&stderr, &input) {
                warn!("iptables-restore rejected {} table:\n{}", table, context);
                stderr.push('\n');
                stderr.push_str(&context);
            }
            return Err(HostnetError::ShellCommandFailed {
                command: render_command(&cmd),
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr,
            });
        }

        info!(
            "Applied {} delta: {} chains, {} rules added, {} lines removed, {} conflicts",
            table,
            report.added_chains.len(),
            report.added_rules.len(),
            report.removed_lines,
            report.conflicts.len()
        );
        Ok(report)
    }

    /// Rule lines of `chain` in `table`, counters included.
    pub async fn chain_rules(&self, table: Table, chain: &str) -> HostnetResult<Vec<String>> {
        let dump = self.save().await?;
        let lines: Vec<String> = dump.lines().map(str::to_string).collect();
        let range = find_table(&lines, table)?;
        let needle = format!("-A {} ", chain);
        Ok(lines[range]
            .iter()
            .filter(|l| l.starts_with('[') && l.contains(&needle))
            .cloned()
            .collect())
    }

    /// Creates `<wrap>-<builtin>` for each built-in chain of filter and nat,
    /// each entered by a jump from its built-in.
    pub async fn wrap_builtin_chains(&self) -> HostnetResult<Vec<ApplyReport>> {
        let mut reports = Vec::new();
        for table in [Table::Filter, Table::Nat] {
            let mut delta = TableDelta::new();
            for builtin in table.builtin_chains() {
                delta = delta
                    .add_chain(self.chains.wrap(builtin)?)
                    .add_rule(self.chains.rule(builtin, &format!("-j ${}", builtin), false)?);
            }
            reports.push(self.apply(table, &delta).await?);
        }
        Ok(reports)
    }
}
