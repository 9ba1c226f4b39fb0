//! BridgeMgr - per-port Linux bridges via `brctl`, device and membership
//! queries via sysfs

use hostnet_common::{CommandRunner, HostnetError, HostnetResult};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::commands::*;

/// Default sysfs directory listing network devices
pub const BRIDGE_FS: &str = "/sys/class/net";

/// Wraps `brctl` and reads bridge state from sysfs
#[derive(Clone)]
pub struct BridgeMgr {
    runner: Arc<dyn CommandRunner>,
    sysfs_root: PathBuf,
}

impl BridgeMgr {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            sysfs_root: PathBuf::from(BRIDGE_FS),
        }
    }

    /// Reads sysfs from another root (tests).
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub async fn create_bridge(&self, bridge: &str) -> HostnetResult<()> {
        self.runner.exec_or_throw(&build_brctl_addbr_cmd(bridge)).await?;
        info!("Created bridge {}", bridge);
        Ok(())
    }

    /// The bridge must be down.
    pub async fn remove_bridge(&self, bridge: &str) -> HostnetResult<()> {
        self.runner.exec_or_throw(&build_brctl_delbr_cmd(bridge)).await?;
        info!("Removed bridge {}", bridge);
        Ok(())
    }

    /// The port must exist.
    pub async fn add_port(&self, bridge: &str, port: &str) -> HostnetResult<()> {
        self.runner.exec_or_throw(&build_brctl_addif_cmd(bridge, port)).await?;
        Ok(())
    }

    /// True when `interface` is enslaved to `bridge`.
    pub async fn interface_on_bridge(&self, bridge: &str, interface: &str) -> HostnetResult<bool> {
        self.path_exists(self.sysfs_root.join(bridge).join("brif").join(interface))
            .await
    }

    async fn path_exists(&self, path: PathBuf) -> HostnetResult<bool> {
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(HostnetError::io(path, e)),
        }
    }

    /// True when a network device named `dev` exists in the root namespace.
    pub async fn device_exists(&self, dev: &str) -> HostnetResult<bool> {
        self.path_exists(self.sysfs_root.join(dev)).await
    }

    /// True when `bridge` exists and is a Linux bridge.
    pub async fn bridge_exists(&self, bridge: &str) -> HostnetResult<bool> {
        self.path_exists(self.sysfs_root.join(bridge).join("bridge")).await
    }
}
