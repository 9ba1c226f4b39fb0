//! OvsMgr - Open vSwitch ports, flows and mirrors

use hostnet_common::{CommandRunner, HostnetResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::commands::*;
use crate::flows::{FlowAction, FlowSpec};
use crate::types::MirrorStatus;

/// Default `--timeout` for ovs-vsctl
pub const DEFAULT_OVS_VSCTL_TIMEOUT: Duration = Duration::from_secs(10);

/// Wraps `ovs-vsctl` and `ovs-ofctl`
#[derive(Clone)]
pub struct OvsMgr {
    runner: Arc<dyn CommandRunner>,
    vsctl_timeout: Duration,
}

impl OvsMgr {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            vsctl_timeout: DEFAULT_OVS_VSCTL_TIMEOUT,
        }
    }

    pub fn with_vsctl_timeout(mut self, timeout: Duration) -> Self {
        self.vsctl_timeout = timeout;
        self
    }

    async fn exec(&self, cmd: Vec<String>) -> HostnetResult<String> {
        self.runner.exec_or_throw(&cmd).await
    }

    // ---- ports ----

    /// Adds an existing device as a port, optionally as an access port.
    pub async fn add_port(&self, bridge: &str, port: &str, vlan: Option<u16>) -> HostnetResult<()> {
        self.exec(build_add_port_cmd(self.vsctl_timeout, bridge, port, vlan))
            .await?;
        info!("Added port {} to {}", port, bridge);
        Ok(())
    }

    /// Creates an internal port, optionally as an access port.
    pub async fn add_internal_port(&self, bridge: &str, port: &str, vlan: Option<u16>) -> HostnetResult<()> {
        self.exec(build_add_internal_port_cmd(self.vsctl_timeout, bridge, port, vlan))
            .await?;
        info!("Added internal port {} to {}", port, bridge);
        Ok(())
    }

    /// Missing ports are not an error.
    pub async fn delete_port(&self, bridge: &str, port: &str) -> HostnetResult<()> {
        self.exec(build_del_port_cmd(self.vsctl_timeout, bridge, port)).await?;
        info!("Deleted port {} from {}", port, bridge);
        Ok(())
    }

    pub async fn set_port_tag(&self, port: &str, vlan: u16) -> HostnetResult<()> {
        self.exec(build_set_port_tag_cmd(self.vsctl_timeout, port, vlan)).await?;
        debug!("Tagged {} with VLAN {}", port, vlan);
        Ok(())
    }

    /// The bridge holding `port`, if any.
    pub async fn bridge_for_port(&self, port: &str) -> HostnetResult<Option<String>> {
        let result = self
            .runner
            .run(&build_port_to_bridge_cmd(self.vsctl_timeout, port))
            .await?;
        if !result.success() || result.stdout.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(result.stdout.trim().to_string()))
    }

    pub async fn port_exists(&self, port: &str) -> HostnetResult<bool> {
        Ok(self.bridge_for_port(port).await?.is_some())
    }

    // ---- flows ----

    /// Runs one flow action on `bridge`.
    pub async fn do_flow(&self, bridge: &str, action: FlowAction, flow: &FlowSpec) -> HostnetResult<()> {
        let expr = flow.render(action)?;
        self.exec(build_ofctl_cmd(action.ofctl_command(), action.is_strict(), bridge, Some(&expr)))
            .await?;
        debug!("{} flow on {}: {}", action, bridge, expr);
        Ok(())
    }

    pub async fn add_flow(&self, bridge: &str, flow: &FlowSpec) -> HostnetResult<()> {
        self.do_flow(bridge, FlowAction::Add, flow).await
    }

    pub async fn delete_flow(&self, bridge: &str, flow: &FlowSpec) -> HostnetResult<()> {
        self.do_flow(bridge, FlowAction::Delete, flow).await
    }

    // ---- mirrors ----

    /// Mirrors all traffic on `bridge` to `vlan`.
    pub async fn create_mirror(&self, bridge: &str, name: &str, vlan: u16) -> HostnetResult<()> {
        self.exec(build_create_mirror_cmd(self.vsctl_timeout, bridge, name, vlan))
            .await?;
        info!("Mirror {} on {} to VLAN {}", name, bridge, vlan);
        Ok(())
    }

    pub async fn remove_mirrors(&self, bridge: &str) -> HostnetResult<()> {
        self.exec(build_clear_mirrors_cmd(self.vsctl_timeout, bridge)).await?;
        info!("Cleared mirrors on {}", bridge);
        Ok(())
    }

    pub async fn mirror_status(&self, bridge: &str) -> HostnetResult<MirrorStatus> {
        let out = self.exec(build_get_mirrors_cmd(self.vsctl_timeout, bridge)).await?;
        Ok(MirrorStatus::parse(&out))
    }
}
