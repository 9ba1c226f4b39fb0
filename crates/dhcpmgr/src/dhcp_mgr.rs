//! DhcpMgr - per-network dnsmasq lifecycle
//!
//! State machine per network, derived from the state directory on disk:
//!
//! ```text
//! Unprovisioned --spawn--> Running --terminate--> Unprovisioned
//!                           |  ^
//!                           +--+ add_host / remove_host (SIGHUP)
//! ```
//!
//! A network is Running while its pid file holds a decimal pid. Mutations of
//! one network's state directory are serialised by an in-process lock.

use dashmap::DashMap;
use devmgr::IpMgr;
use hostnet_common::{AddressBlock, CommandRunner, EntityId, HostnetError, HostnetResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::commands::{build_dnsmasq_cmd, build_signal_cmd, Signal};
use crate::hosts_file;
use crate::types::{DhcpPaths, DhcpState, HostBinding};

/// Process name used in spawn errors
pub const DNSMASQ_PROCESS: &str = "dnsmasq";

/// How long to wait for dnsmasq to write its pid file
pub const DEFAULT_PID_TIMEOUT: Duration = Duration::from_secs(5);

const PID_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// DhcpMgr manages one dnsmasq per network
pub struct DhcpMgr {
    runner: Arc<dyn CommandRunner>,
    ip: IpMgr,
    state_root: PathBuf,
    lease_time: String,
    pid_timeout: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DhcpMgr {
    pub fn new(runner: Arc<dyn CommandRunner>, state_root: impl Into<PathBuf>, lease_time: impl Into<String>) -> Self {
        Self {
            ip: IpMgr::new(runner.clone()),
            runner,
            state_root: state_root.into(),
            lease_time: lease_time.into(),
            pid_timeout: DEFAULT_PID_TIMEOUT,
            locks: DashMap::new(),
        }
    }

    pub fn with_pid_timeout(mut self, timeout: Duration) -> Self {
        self.pid_timeout = timeout;
        self
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    /// State directory layout for `network`.
    pub fn paths(&self, network: &EntityId) -> DhcpPaths {
        DhcpPaths::new(&self.state_root, network)
    }

    fn lock_for(&self, network: &EntityId) -> Arc<Mutex<()>> {
        self.locks
            .entry(network.prefix().to_string())
            .or_default()
            .clone()
    }

    /// Current state, read from the pid file.
    pub async fn state(&self, network: &EntityId) -> HostnetResult<DhcpState> {
        let paths = self.paths(network);
        let content = match fs::read_to_string(&paths.pid).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DhcpState::Unprovisioned),
            Err(e) => return Err(HostnetError::io(&paths.pid, e)),
        };
        match content.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(DhcpState::Running { pid }),
            _ => {
                warn!("Ignoring invalid pid file {}", paths.pid.display());
                Ok(DhcpState::Unprovisioned)
            }
        }
    }

    pub async fn is_running(&self, network: &EntityId) -> HostnetResult<bool> {
        Ok(self.state(network).await?.is_running())
    }

    pub async fn pid(&self, network: &EntityId) -> HostnetResult<Option<u32>> {
        Ok(self.state(network).await?.pid())
    }

    /// Current host bindings.
    pub async fn hosts(&self, network: &EntityId) -> HostnetResult<Vec<HostBinding>> {
        hosts_file::read_bindings(&self.paths(network).host).await
    }

    /// Rejects a state directory claimed by another network with the same
    /// prefix.
    async fn check_owner(&self, network: &EntityId, paths: &DhcpPaths) -> HostnetResult<()> {
        match fs::read_to_string(&paths.network_id).await {
            Ok(owner) if owner.trim() == network.as_str() => Ok(()),
            Ok(owner) => Err(HostnetError::invalid_config(
                "network_id",
                format!(
                    "DHCP state {} belongs to network '{}', not '{}'",
                    paths.dir.display(),
                    owner.trim(),
                    network
                ),
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HostnetError::io(&paths.network_id, e)),
        }
    }

    async fn signal(&self, pid: u32, signal: Signal) -> HostnetResult<()> {
        self.runner
            .exec_or_throw(&build_signal_cmd(pid, signal))
            .await?;
        debug!("Sent SIG{} to {}", signal, pid);
        Ok(())
    }

    async fn require_running(&self, network: &EntityId, paths: &DhcpPaths) -> HostnetResult<u32> {
        self.check_owner(network, paths).await?;
        match self.state(network).await? {
            DhcpState::Running { pid } => Ok(pid),
            DhcpState::Unprovisioned => Err(HostnetError::invalid_state(
                format!("network {}", network),
                "DHCP service is not running",
            )),
        }
    }

    /// Starts dnsmasq for `network` inside `namespace`.
    ///
    /// On an already running network only the given hosts are registered and
    /// a reload is signalled; the process is not restarted.
    #[instrument(skip(self, block, hosts), fields(network = %network))]
    pub async fn spawn(
        &self,
        network: &EntityId,
        block: &AddressBlock,
        hosts: &[HostBinding],
        namespace: &str,
    ) -> HostnetResult<u32> {
        let lock = self.lock_for(network);
        let _guard = lock.lock().await;
        let paths = self.paths(network);

        self.check_owner(network, &paths).await?;

        if let DhcpState::Running { pid } = self.state(network).await? {
            for host in hosts {
                hosts_file::append_binding(&paths.host, host).await?;
            }
            if !hosts.is_empty() {
                self.signal(pid, Signal::Hup).await?;
            }
            info!("DHCP for {} already running as {}, registered {} hosts", network, pid, hosts.len());
            return Ok(pid);
        }

        fs::create_dir_all(&paths.dir)
            .await
            .map_err(|e| HostnetError::io(&paths.dir, e))?;
        fs::write(&paths.network_id, format!("{}\n", network))
            .await
            .map_err(|e| HostnetError::io(&paths.network_id, e))?;
        hosts_file::write_bindings(&paths.host, hosts).await?;

        let interface = network.dhcp_interface();
        if !self.ip.link_exists(&interface, Some(namespace)).await? {
            return Err(HostnetError::process_spawn(
                DNSMASQ_PROCESS,
                format!("interface {} is not ready in namespace {}", interface, namespace),
            ));
        }

        let cmd = build_dnsmasq_cmd(&interface, &paths, block, &self.lease_time, namespace);
        let result = self.runner.run(&cmd).await.map_err(|e| {
            HostnetError::process_spawn(DNSMASQ_PROCESS, e.to_string())
        })?;
        if !result.success() {
            return Err(HostnetError::process_spawn(
                DNSMASQ_PROCESS,
                format!("exit code {}: {}", result.exit_code, result.combined_output()),
            ));
        }

        let pid = self.wait_for_pid(network, &paths).await?;
        info!("DHCP for {} running as {} on {}", network, pid, interface);
        Ok(pid)
    }

    async fn wait_for_pid(&self, network: &EntityId, paths: &DhcpPaths) -> HostnetResult<u32> {
        let deadline = tokio::time::Instant::now() + self.pid_timeout;
        loop {
            if let DhcpState::Running { pid } = self.state(network).await? {
                return Ok(pid);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HostnetError::process_spawn(
                    DNSMASQ_PROCESS,
                    format!("no pid written to {} within {:?}", paths.pid.display(), self.pid_timeout),
                ));
            }
            tokio::time::sleep(PID_POLL_INTERVAL).await;
        }
    }

    /// Appends a binding and signals a reload. Running networks only.
    #[instrument(skip(self), fields(network = %network))]
    pub async fn add_host(&self, network: &EntityId, host: &HostBinding) -> HostnetResult<()> {
        let lock = self.lock_for(network);
        let _guard = lock.lock().await;
        let paths = self.paths(network);

        let pid = self.require_running(network, &paths).await?;
        hosts_file::append_binding(&paths.host, host).await?;
        self.signal(pid, Signal::Hup).await?;
        info!("Added DHCP host {} to {}", host, network);
        Ok(())
    }

    /// Removes every binding for `mac` and signals a reload. Returns whether
    /// anything was removed. Running networks only.
    #[instrument(skip(self), fields(network = %network))]
    pub async fn remove_host(&self, network: &EntityId, mac: &str) -> HostnetResult<bool> {
        let lock = self.lock_for(network);
        let _guard = lock.lock().await;
        let paths = self.paths(network);

        let pid = self.require_running(network, &paths).await?;
        let removed = hosts_file::remove_binding(&paths.host, mac).await?;
        self.signal(pid, Signal::Hup).await?;
        info!("Removed {} DHCP binding(s) for {} from {}", removed, mac, network);
        Ok(removed > 0)
    }

    /// Kills dnsmasq and removes the state directory.
    ///
    /// A missing pid file means the service already stopped. The directory is
    /// removed even when the kill fails; the kill error is returned afterwards.
    #[instrument(skip(self), fields(network = %network))]
    pub async fn terminate(&self, network: &EntityId) -> HostnetResult<()> {
        let lock = self.lock_for(network);
        let guard = lock.lock().await;
        let paths = self.paths(network);

        self.check_owner(network, &paths).await?;

        let kill_result = match self.state(network).await? {
            DhcpState::Running { pid } => self.signal(pid, Signal::Kill).await,
            DhcpState::Unprovisioned => {
                debug!("DHCP for {} has no pid, nothing to kill", network);
                Ok(())
            }
        };
        if let Err(e) = &kill_result {
            warn!("Failed to kill DHCP for {}: {}", network, e);
        }

        match fs::remove_dir_all(&paths.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(HostnetError::io(&paths.dir, e)),
        }

        drop(guard);
        self.locks.remove(network.prefix());
        info!("Terminated DHCP for {}", network);
        kill_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostnet_test::{id_fixtures, RecordingRunner};
    use pretty_assertions::assert_eq;

    struct Fixture {
        _root: tempfile::TempDir,
        runner: Arc<RecordingRunner>,
        mgr: DhcpMgr,
        net: EntityId,
        block: AddressBlock,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new().simulate_dnsmasq(4242));
        let mgr = DhcpMgr::new(runner.clone(), root.path(), "infinite")
            .with_pid_timeout(Duration::from_millis(200));
        Fixture {
            _root: root,
            runner,
            mgr,
            net: EntityId::new(id_fixtures::NETWORK_ID).unwrap(),
            block: "10.0.0.0/24".parse().unwrap(),
        }
    }

    fn mac_binding(last: u8, ip: &str) -> HostBinding {
        HostBinding::new(&format!("fa:16:3e:00:00:{:02x}", last), ip.parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_spawn_from_unprovisioned() {
        let f = fixture();
        let ns = f.net.dhcp_namespace();
        assert_eq!(f.mgr.state(&f.net).await.unwrap(), DhcpState::Unprovisioned);

        let pid = f.mgr.spawn(&f.net, &f.block, &[], &ns).await.unwrap();
        assert_eq!(pid, 4242);
        assert!(f.mgr.is_running(&f.net).await.unwrap());

        let paths = f.mgr.paths(&f.net);
        assert_eq!(std::fs::read_to_string(&paths.host).unwrap(), "");
        assert_eq!(
            std::fs::read_to_string(&paths.network_id).unwrap().trim(),
            id_fixtures::NETWORK_ID
        );

        let verifier = f.runner.verifier();
        verifier
            .assert_ordered("netns exec qdhcp-net0000000 /sbin/ip link show dhcpnet0000000", "dnsmasq")
            .unwrap();
        verifier.assert_command_executed("--dhcp-option=3,10.0.0.254").unwrap();
    }

    #[tokio::test]
    async fn test_spawn_when_running_only_adds_hosts() {
        let f = fixture();
        let ns = f.net.dhcp_namespace();
        f.mgr.spawn(&f.net, &f.block, &[], &ns).await.unwrap();
        f.runner.clear();

        let host = mac_binding(1, "10.0.0.5");
        let pid = f.mgr.spawn(&f.net, &f.block, &[host.clone()], &ns).await.unwrap();
        assert_eq!(pid, 4242);
        assert_eq!(f.mgr.hosts(&f.net).await.unwrap(), vec![host]);

        let verifier = f.runner.verifier();
        verifier.assert_command_not_executed("dnsmasq").unwrap();
        verifier.assert_command_executed("/bin/kill -s HUP 4242").unwrap();
    }

    #[tokio::test]
    async fn test_spawn_interface_not_ready() {
        let f = fixture();
        f.runner.fail_on("link show dhcpnet0000000", 1, "Device does not exist");
        let err = f
            .mgr
            .spawn(&f.net, &f.block, &[], &f.net.dhcp_namespace())
            .await
            .unwrap_err();
        assert!(matches!(err, HostnetError::ProcessSpawn { .. }));
        f.runner.verifier().assert_command_not_executed("dnsmasq").unwrap();
    }

    #[tokio::test]
    async fn test_spawn_dnsmasq_failure() {
        let f = fixture();
        f.runner.fail_on("/usr/sbin/dnsmasq", 2, "dnsmasq: failed to bind");
        let err = f
            .mgr
            .spawn(&f.net, &f.block, &[], &f.net.dhcp_namespace())
            .await
            .unwrap_err();
        assert!(matches!(err, HostnetError::ProcessSpawn { .. }));
        assert!(err.to_string().contains("failed to bind"));
    }

    #[tokio::test]
    async fn test_spawn_without_pid_file_times_out() {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let mgr = DhcpMgr::new(runner, root.path(), "infinite")
            .with_pid_timeout(Duration::from_millis(100));
        let net = EntityId::new(id_fixtures::NETWORK_ID).unwrap();
        let err = mgr
            .spawn(&net, &"10.0.0.0/24".parse().unwrap(), &[], "qdhcp-net0000000")
            .await
            .unwrap_err();
        assert!(matches!(err, HostnetError::ProcessSpawn { .. }));
    }

    #[tokio::test]
    async fn test_add_then_remove_host_restores_bindings() {
        let f = fixture();
        let existing = mac_binding(1, "10.0.0.5");
        f.mgr
            .spawn(&f.net, &f.block, &[existing.clone()], &f.net.dhcp_namespace())
            .await
            .unwrap();
        let host_file = f.mgr.paths(&f.net).host;
        let before = std::fs::read_to_string(&host_file).unwrap();

        let added = mac_binding(2, "10.0.0.6");
        f.mgr.add_host(&f.net, &added).await.unwrap();
        assert_eq!(f.mgr.hosts(&f.net).await.unwrap(), vec![existing, added.clone()]);

        assert!(f.mgr.remove_host(&f.net, &added.mac).await.unwrap());
        assert_eq!(std::fs::read_to_string(&host_file).unwrap(), before);
        f.runner.verifier().assert_matching_count("kill -s HUP 4242", 2).unwrap();
    }

    #[tokio::test]
    async fn test_add_host_requires_running() {
        let f = fixture();
        let err = f
            .mgr
            .add_host(&f.net, &mac_binding(1, "10.0.0.5"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostnetError::InvalidState { .. }));
        assert!(f.runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_terminate() {
        let f = fixture();
        f.mgr
            .spawn(&f.net, &f.block, &[], &f.net.dhcp_namespace())
            .await
            .unwrap();
        f.mgr.terminate(&f.net).await.unwrap();

        assert!(!f.mgr.paths(&f.net).dir.exists());
        assert!(!f.mgr.is_running(&f.net).await.unwrap());
        f.runner.verifier().assert_command_executed("/bin/kill -s KILL 4242").unwrap();
    }

    #[tokio::test]
    async fn test_terminate_without_pid_is_ok() {
        let f = fixture();
        f.mgr.terminate(&f.net).await.unwrap();
        f.runner.verifier().assert_command_not_executed("kill").unwrap();
    }

    #[tokio::test]
    async fn test_terminate_removes_state_even_if_kill_fails() {
        let f = fixture();
        f.mgr
            .spawn(&f.net, &f.block, &[], &f.net.dhcp_namespace())
            .await
            .unwrap();
        f.runner.fail_on("kill -s KILL", 1, "No such process");
        assert!(f.mgr.terminate(&f.net).await.is_err());
        assert!(!f.mgr.paths(&f.net).dir.exists());
    }

    #[tokio::test]
    async fn test_prefix_collision_detected() {
        let f = fixture();
        f.mgr
            .spawn(&f.net, &f.block, &[], &f.net.dhcp_namespace())
            .await
            .unwrap();

        let other = EntityId::new("net0000000999").unwrap();
        let err = f
            .mgr
            .add_host(&other, &mac_binding(1, "10.0.0.5"))
            .await
            .unwrap_err();
        assert!(err.is_configuration_error());
    }
}
