//! External command execution for hostnet.
//!
//! Commands are run directly from an argv vector (no intermediate shell), so
//! identifiers never need escaping to be executed safely. [`shellquote`] is
//! still used to render a copy-pasteable command line for logs and errors.
//!
//! Every manager in the workspace talks to the host through the
//! [`CommandRunner`] trait. Production code uses [`ShellRunner`]; tests inject
//! a recording runner that never touches the host.
//!
//! # Example
//!
//! ```ignore
//! use hostnet_common::shell::{CommandRunner, ShellRunner, IP_CMD, argv};
//!
//! let runner = ShellRunner::new(Some(Duration::from_secs(30)));
//! runner.exec_or_throw(&argv([IP_CMD, "link", "set", "qbr-abc", "up"])).await?;
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{HostnetError, HostnetResult};

/// Path to the `ip` command for namespace/link/address/route configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `brctl` command for Linux bridge control.
pub const BRCTL_CMD: &str = "/sbin/brctl";

/// Path to the `ovs-vsctl` command for Open vSwitch database changes.
pub const OVS_VSCTL_CMD: &str = "/usr/bin/ovs-vsctl";

/// Path to the `ovs-ofctl` command for OpenFlow flow management.
pub const OVS_OFCTL_CMD: &str = "/usr/bin/ovs-ofctl";

/// Path to the `iptables-save` command.
pub const IPTABLES_SAVE_CMD: &str = "/sbin/iptables-save";

/// Path to the `iptables-restore` command.
pub const IPTABLES_RESTORE_CMD: &str = "/sbin/iptables-restore";

/// Path to the `ipset` command for address sets.
pub const IPSET_CMD: &str = "/sbin/ipset";

/// Path to the `dnsmasq` DHCP server.
pub const DNSMASQ_CMD: &str = "/usr/sbin/dnsmasq";

/// Path to the `kill` command used to signal managed processes.
pub const KILL_CMD: &str = "/bin/kill";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Characters that never need quoting in a rendered command line.
static SHELL_SAFE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_./:=,@+%-]+$").expect("Invalid regex pattern"));

/// Quotes a string for safe use in a shell command line.
///
/// Wraps the string in double quotes and escapes `$`, `` ` ``, `"`, `\` and
/// newline.
///
/// ```
/// use hostnet_common::shell::shellquote;
///
/// assert_eq!(shellquote("simple"), "\"simple\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Renders an argv vector as a shell command line for logs and errors.
///
/// Arguments made only of safe characters are left bare; anything else is
/// quoted with [`shellquote`].
pub fn render_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if SHELL_SAFE_RE.is_match(arg) {
                arg.clone()
            } else {
                shellquote(arg)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds an owned argv vector from string slices.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

/// Prefixes a command with `ip netns exec <namespace>` when a namespace is given.
pub fn netns_exec(namespace: Option<&str>, cmd: Vec<String>) -> Vec<String> {
    match namespace {
        Some(ns) => {
            let mut full = argv([IP_CMD, "netns", "exec", ns]);
            full.extend(cmd);
            full
        }
        None => cmd,
    }
}

/// Result of a command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// The exit code of the command (0 = success, -1 = killed by signal).
    pub exit_code: i32,
    /// Captured stdout, trailing whitespace trimmed.
    pub stdout: String,
    /// Captured stderr, trailing whitespace trimmed.
    pub stderr: String,
}

impl ExecResult {
    /// A successful result carrying the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Converts a non-zero exit into [`HostnetError::ShellCommandFailed`].
    pub fn into_result(self, argv: &[String]) -> HostnetResult<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(HostnetError::ShellCommandFailed {
                command: render_command(argv),
                exit_code: self.exit_code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// Executes external commands on behalf of the managers.
///
/// A non-zero exit status is returned as data, not as an error; callers
/// that need it to be fatal use [`CommandRunner::exec_or_throw`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `argv` and captures its output.
    async fn run(&self, argv: &[String]) -> HostnetResult<ExecResult>;

    /// Runs `argv` with `input` piped to its stdin.
    async fn run_with_input(&self, argv: &[String], input: &str) -> HostnetResult<ExecResult>;

    /// Runs `argv` and fails on non-zero exit, returning stdout on success.
    async fn exec_or_throw(&self, argv: &[String]) -> HostnetResult<String> {
        self.run(argv).await?.into_result(argv)
    }

    /// Runs `argv` with piped input and fails on non-zero exit.
    async fn exec_with_input_or_throw(&self, argv: &[String], input: &str) -> HostnetResult<String> {
        self.run_with_input(argv, input).await?.into_result(argv)
    }
}

/// Runs commands on the host with `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    timeout: Option<Duration>,
}

impl ShellRunner {
    /// Creates a runner. `timeout` bounds each command; the child is killed
    /// when it expires.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    async fn execute(&self, argv: &[String], input: Option<&str>) -> HostnetResult<ExecResult> {
        let command_line = render_command(argv);
        let (program, args) = argv.split_first().ok_or_else(|| {
            HostnetError::invalid_config("argv", "cannot execute an empty command")
        })?;

        tracing::debug!(command = %command_line, "Executing command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let spawn_err = |e| HostnetError::ShellExec {
            command: command_line.clone(),
            source: e,
        };

        let mut child = cmd.spawn().map_err(spawn_err)?;

        // Stdin is fed while the output is collected, so a child that stops
        // reading cannot block past the deadline.
        let stdin = child.stdin.take();
        let feed = async move {
            if let (Some(mut stdin), Some(data)) = (stdin, input) {
                stdin.write_all(data.as_bytes()).await?;
                // Dropping stdin closes the pipe so the child sees EOF.
            }
            Ok::<(), std::io::Error>(())
        };
        let collect = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            match fed {
                // A child that exits without reading all input reports
                // through its exit status.
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => output,
            }
        };

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, collect)
                .await
                .map_err(|_| HostnetError::CommandTimeout {
                    command: command_line.clone(),
                    timeout: limit,
                })?,
            None => collect.await,
        }
        .map_err(spawn_err)?;

        let exit_code = output.status.code().unwrap_or(-1);
        let result = ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        };

        if result.success() {
            tracing::trace!(command = %command_line, "Command succeeded");
        } else {
            tracing::warn!(
                command = %command_line,
                exit_code = exit_code,
                stdout = %result.stdout,
                stderr = %result.stderr,
                "Command failed"
            );
        }

        Ok(result)
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, argv: &[String]) -> HostnetResult<ExecResult> {
        self.execute(argv, None).await
    }

    async fn run_with_input(&self, argv: &[String], input: &str) -> HostnetResult<ExecResult> {
        self.execute(argv, Some(input)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_special_chars() {
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");
        assert_eq!(shellquote("`whoami`"), "\"\\`whoami\\`\"");
        assert_eq!(shellquote("say \"hello\""), "\"say \\\"hello\\\"\"");
        assert_eq!(shellquote("path\\to"), "\"path\\\\to\"");
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_render_command_quotes_only_when_needed() {
        let cmd = argv([IP_CMD, "addr", "add", "10.0.0.1/24", "dev", "dhcpnet0000000"]);
        assert_eq!(
            render_command(&cmd),
            "/sbin/ip addr add 10.0.0.1/24 dev dhcpnet0000000"
        );

        let cmd = argv(["/sbin/iptables", "-m", "comment", "--comment", "two words"]);
        assert_eq!(
            render_command(&cmd),
            "/sbin/iptables -m comment --comment \"two words\""
        );
    }

    #[test]
    fn test_netns_exec() {
        let cmd = netns_exec(Some("qdhcp-net0000000"), argv([IP_CMD, "link", "show"]));
        assert_eq!(
            cmd,
            argv([IP_CMD, "netns", "exec", "qdhcp-net0000000", IP_CMD, "link", "show"])
        );

        let cmd = netns_exec(None, argv([IP_CMD, "link", "show"]));
        assert_eq!(cmd, argv([IP_CMD, "link", "show"]));
    }

    #[test]
    fn test_exec_result_combined() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "stdout".to_string(),
            stderr: "stderr".to_string(),
        };
        assert_eq!(result.combined_output(), "stdout\nstderr");
        assert_eq!(ExecResult::failed(2, "oops").combined_output(), "oops");
    }

    #[test]
    fn test_into_result_failure() {
        let cmd = argv([IP_CMD, "link", "del", "qvb-abc"]);
        match ExecResult::failed(1, "Cannot find device").into_result(&cmd) {
            Err(HostnetError::ShellCommandFailed {
                exit_code, stderr, ..
            }) => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "Cannot find device");
            }
            other => panic!("Expected ShellCommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_echo() {
        let runner = ShellRunner::new(Some(Duration::from_secs(5)));
        let result = runner.run(&argv(["/bin/echo", "hello"])).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_run_with_input() {
        let runner = ShellRunner::new(Some(Duration::from_secs(5)));
        let result = runner
            .run_with_input(&argv(["/bin/cat"]), "*filter\nCOMMIT\n")
            .await
            .unwrap();
        assert_eq!(result.stdout, "*filter\nCOMMIT");
    }

    #[tokio::test]
    async fn test_exec_or_throw_failure() {
        let runner = ShellRunner::default();
        let result = runner.exec_or_throw(&argv(["/bin/sh", "-c", "exit 3"])).await;
        match result {
            Err(HostnetError::ShellCommandFailed { exit_code, .. }) => assert_eq!(exit_code, 3),
            other => panic!("Expected ShellCommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let runner = ShellRunner::new(Some(Duration::from_millis(100)));
        let result = runner.run(&argv(["/bin/sleep", "5"])).await;
        assert!(matches!(result, Err(HostnetError::CommandTimeout { .. })));
    }

    #[tokio::test]
    async fn test_timeout_covers_stalled_stdin() {
        // Far more input than a pipe buffers, fed to a child that never reads.
        let input = "x".repeat(4 * 1024 * 1024);
        let runner = ShellRunner::new(Some(Duration::from_millis(200)));
        let started = std::time::Instant::now();
        let result = runner
            .run_with_input(&argv(["/bin/sleep", "5"]), &input)
            .await;
        assert!(matches!(result, Err(HostnetError::CommandTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_early_exit_without_reading_stdin() {
        let input = "x".repeat(1024 * 1024);
        let runner = ShellRunner::new(Some(Duration::from_secs(5)));
        let result = runner
            .run_with_input(&argv(["/bin/sh", "-c", "exit 4"]), &input)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 4);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = ShellRunner::default();
        let result = runner.run(&argv(["/nonexistent/hostnet-tool"])).await;
        assert!(matches!(result, Err(HostnetError::ShellExec { .. })));
    }

    #[tokio::test]
    async fn test_empty_argv_is_config_error() {
        let runner = ShellRunner::default();
        let result = runner.run(&[]).await;
        assert!(matches!(result, Err(HostnetError::InvalidConfig { .. })));
    }
}
