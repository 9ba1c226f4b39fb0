//! Recording command runner.
//!
//! Stands in for [`ShellRunner`](hostnet_common::ShellRunner) in tests. Every
//! command is recorded with its stdin and answered from scripted responses.
//! `iptables-save`/`iptables-restore` are simulated against an in-memory dump
//! per namespace, so the reconciliation engine can be exercised end to end.

use async_trait::async_trait;
use hostnet_common::shell::{
    render_command, CommandRunner, ExecResult, DNSMASQ_CMD, IPTABLES_RESTORE_CMD,
    IPTABLES_SAVE_CMD, IP_CMD,
};
use hostnet_common::{HostnetError, HostnetResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;

use crate::verification::CommandVerifier;

/// One command seen by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub argv: Vec<String>,
    pub input: Option<String>,
}

impl RecordedCommand {
    /// The rendered command line.
    pub fn line(&self) -> String {
        render_command(&self.argv)
    }
}

enum Scripted {
    Exit(ExecResult),
    SpawnError,
}

#[derive(Default)]
struct RunnerState {
    commands: Vec<RecordedCommand>,
    failures: Vec<(String, Scripted)>,
    responses: Vec<(String, String)>,
    // Keyed by namespace, "" for the root namespace.
    dumps: HashMap<String, String>,
    dnsmasq_pid: Option<u32>,
}

/// A [`CommandRunner`] that records commands instead of running them.
#[derive(Default)]
pub struct RecordingRunner {
    state: Mutex<RunnerState>,
}

fn ns_key(namespace: Option<&str>) -> String {
    namespace.unwrap_or_default().to_string()
}

/// Splits `ip netns exec <ns> cmd...` into the namespace and the inner command.
fn split_netns(argv: &[String]) -> (Option<&str>, &[String]) {
    if argv.len() > 4 && argv[0] == IP_CMD && argv[1] == "netns" && argv[2] == "exec" {
        (Some(argv[3].as_str()), &argv[4..])
    } else {
        (None, argv)
    }
}

/// Replaces the `*<table>` ... `COMMIT` section of `dump` with `section`,
/// appending it when the table is absent.
fn replace_section(dump: &str, section: &str) -> String {
    let section_lines: Vec<&str> = section.lines().collect();
    let header = match section_lines.first() {
        Some(h) if h.starts_with('*') => *h,
        _ => return dump.to_string(),
    };

    let lines: Vec<&str> = dump.lines().collect();
    let Some(start) = lines.iter().position(|l| *l == header) else {
        let mut out = dump.trim_end().to_string();
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(section.trim_end());
        out.push('\n');
        return out;
    };
    let end = lines[start..]
        .iter()
        .position(|l| *l == "COMMIT")
        .map(|i| start + i)
        .unwrap_or(lines.len() - 1);

    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + section_lines.len());
    out.extend_from_slice(&lines[..start]);
    out.extend(section_lines);
    out.extend_from_slice(&lines[end + 1..]);
    let mut text = out.join("\n");
    text.push('\n');
    text
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the root-namespace firewall dump.
    pub fn with_iptables_dump(self, dump: impl Into<String>) -> Self {
        self.set_iptables_dump(None, dump);
        self
    }

    /// Seeds the firewall dump of a namespace.
    pub fn set_iptables_dump(&self, namespace: Option<&str>, dump: impl Into<String>) {
        self.state.lock().dumps.insert(ns_key(namespace), dump.into());
    }

    /// Current simulated firewall dump of a namespace.
    pub fn iptables_dump(&self, namespace: Option<&str>) -> String {
        self.state
            .lock()
            .dumps
            .get(&ns_key(namespace))
            .cloned()
            .unwrap_or_default()
    }

    /// Commands whose rendered line contains `pattern` exit with `exit_code`.
    pub fn fail_on(&self, pattern: impl Into<String>, exit_code: i32, stderr: impl Into<String>) {
        self.state.lock().failures.push((
            pattern.into(),
            Scripted::Exit(ExecResult::failed(exit_code, stderr)),
        ));
    }

    /// Commands whose rendered line contains `pattern` fail to spawn.
    pub fn spawn_error_on(&self, pattern: impl Into<String>) {
        self.state
            .lock()
            .failures
            .push((pattern.into(), Scripted::SpawnError));
    }

    /// Commands whose rendered line contains `pattern` print `stdout`.
    pub fn respond(&self, pattern: impl Into<String>, stdout: impl Into<String>) {
        self.state
            .lock()
            .responses
            .push((pattern.into(), stdout.into()));
    }

    /// Makes dnsmasq invocations write `pid` into their `--pid-file`.
    pub fn simulate_dnsmasq(self, pid: u32) -> Self {
        self.state.lock().dnsmasq_pid = Some(pid);
        self
    }

    /// Every command recorded so far.
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.lock().commands.clone()
    }

    /// Rendered command lines recorded so far.
    pub fn command_lines(&self) -> Vec<String> {
        self.state
            .lock()
            .commands
            .iter()
            .map(RecordedCommand::line)
            .collect()
    }

    /// Forgets recorded commands. Scripts and dumps are kept.
    pub fn clear(&self) {
        self.state.lock().commands.clear();
    }

    /// A verifier over the command lines recorded so far.
    pub fn verifier(&self) -> CommandVerifier {
        CommandVerifier::new(self.command_lines())
    }

    fn handle(&self, argv: &[String], input: Option<&str>) -> HostnetResult<ExecResult> {
        let mut state = self.state.lock();
        state.commands.push(RecordedCommand {
            argv: argv.to_vec(),
            input: input.map(str::to_string),
        });

        let line = render_command(argv);
        tracing::debug!(command = %line, "recorded");

        if let Some((_, scripted)) = state.failures.iter().find(|(p, _)| line.contains(p.as_str())) {
            return match scripted {
                Scripted::Exit(result) => Ok(result.clone()),
                Scripted::SpawnError => Err(HostnetError::ShellExec {
                    command: line,
                    source: io::Error::new(io::ErrorKind::NotFound, "scripted spawn failure"),
                }),
            };
        }

        let (namespace, inner) = split_netns(argv);
        match inner.first().map(String::as_str) {
            Some(IPTABLES_SAVE_CMD) => {
                let dump = state.dumps.get(&ns_key(namespace)).cloned().unwrap_or_default();
                return Ok(ExecResult::ok(dump));
            }
            Some(IPTABLES_RESTORE_CMD) => {
                let key = ns_key(namespace);
                let current = state.dumps.get(&key).cloned().unwrap_or_default();
                let updated = replace_section(&current, input.unwrap_or_default());
                state.dumps.insert(key, updated);
                return Ok(ExecResult::ok(""));
            }
            Some(DNSMASQ_CMD) => {
                if let Some(pid) = state.dnsmasq_pid {
                    if let Some(path) = inner.iter().find_map(|a| a.strip_prefix("--pid-file=")) {
                        std::fs::write(path, format!("{}\n", pid))
                            .map_err(|e| HostnetError::io(path, e))?;
                    }
                }
            }
            _ => {}
        }

        if let Some((_, stdout)) = state.responses.iter().find(|(p, _)| line.contains(p.as_str())) {
            return Ok(ExecResult::ok(stdout.clone()));
        }

        Ok(ExecResult::ok(""))
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, argv: &[String]) -> HostnetResult<ExecResult> {
        self.handle(argv, None)
    }

    async fn run_with_input(&self, argv: &[String], input: &str) -> HostnetResult<ExecResult> {
        self.handle(argv, Some(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostnet_common::shell::argv;

    #[tokio::test]
    async fn test_records_commands() {
        let runner = RecordingRunner::new();
        runner
            .run(&argv([IP_CMD, "link", "set", "dev", "qbr-abc", "up"]))
            .await
            .unwrap();
        assert_eq!(runner.command_lines(), vec!["/sbin/ip link set dev qbr-abc up"]);
        assert_eq!(runner.commands()[0].input, None);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let runner = RecordingRunner::new();
        runner.fail_on("addbr", 1, "device exists");
        let result = runner
            .run(&argv(["/sbin/brctl", "addbr", "qbr-abc"]))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(runner
            .exec_or_throw(&argv(["/sbin/brctl", "addbr", "qbr-abc"]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let runner = RecordingRunner::new();
        runner.spawn_error_on("ovs-vsctl");
        let err = runner
            .run(&argv(["/usr/bin/ovs-vsctl", "show"]))
            .await
            .unwrap_err();
        assert!(err.is_external_tool_error());
    }

    #[tokio::test]
    async fn test_iptables_save_restore_in_namespace() {
        let runner = RecordingRunner::new();
        runner.set_iptables_dump(
            Some("ns1"),
            "*nat\n:PREROUTING ACCEPT [0:0]\nCOMMIT\n*filter\n:INPUT ACCEPT [0:0]\nCOMMIT\n",
        );
        let save = argv([IP_CMD, "netns", "exec", "ns1", IPTABLES_SAVE_CMD, "-c"]);
        let dump = runner.exec_or_throw(&save).await.unwrap();
        assert!(dump.contains("*filter"));

        let restore = argv([IP_CMD, "netns", "exec", "ns1", IPTABLES_RESTORE_CMD, "-c"]);
        runner
            .exec_with_input_or_throw(&restore, "*filter\n:INPUT ACCEPT [0:0]\n:x - [0:0]\nCOMMIT\n")
            .await
            .unwrap();

        let after = runner.iptables_dump(Some("ns1"));
        assert_eq!(
            after,
            "*nat\n:PREROUTING ACCEPT [0:0]\nCOMMIT\n*filter\n:INPUT ACCEPT [0:0]\n:x - [0:0]\nCOMMIT\n"
        );
        // Root namespace untouched.
        assert_eq!(runner.iptables_dump(None), "");
    }

    #[tokio::test]
    async fn test_dnsmasq_writes_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let runner = RecordingRunner::new().simulate_dnsmasq(4242);
        runner
            .run(&argv([
                DNSMASQ_CMD.to_string(),
                format!("--pid-file={}", pid_file.display()),
            ]))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(pid_file).unwrap().trim(), "4242");
    }

    #[test]
    fn test_replace_section_appends_missing_table() {
        let out = replace_section("*nat\nCOMMIT\n", "*filter\nCOMMIT\n");
        assert_eq!(out, "*nat\nCOMMIT\n*filter\nCOMMIT\n");
    }
}
