//! IpMgr - namespaces, links, veth pairs, addresses and routes via `ip`

use hostnet_common::{CommandRunner, HostnetResult};
use std::sync::Arc;
use tracing::{debug, info};

use crate::commands::*;
use crate::types::LinkState;

/// Wraps the `ip` tool
#[derive(Clone)]
pub struct IpMgr {
    runner: Arc<dyn CommandRunner>,
}

/// Extracts namespace names from `ip netns list` output (`name (id: N)`).
pub fn parse_netns_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// True when `ip -o -4 addr show` output lists `cidr`.
///
/// Lines look like `7: dhcpabc    inet 10.0.0.1/24 brd 10.0.0.255 scope global dhcpabc`.
pub fn addr_listed(output: &str, cidr: &str) -> bool {
    output.lines().any(|line| {
        let mut tokens = line.split_whitespace();
        tokens.any(|t| t == "inet") && tokens.next() == Some(cidr)
    })
}

/// Keeps on-link route lines that carry no `src` attribute.
pub fn parse_onlink_routes(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains("src"))
        .map(str::to_string)
        .collect()
}

impl IpMgr {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn exec(&self, cmd: Vec<String>) -> HostnetResult<String> {
        self.runner.exec_or_throw(&cmd).await
    }

    // ---- namespaces ----

    pub async fn add_netns(&self, ns: &str) -> HostnetResult<()> {
        self.exec(build_netns_add_cmd(ns)).await?;
        info!("Added namespace {}", ns);
        Ok(())
    }

    pub async fn delete_netns(&self, ns: &str) -> HostnetResult<()> {
        self.exec(build_netns_delete_cmd(ns)).await?;
        info!("Deleted namespace {}", ns);
        Ok(())
    }

    pub async fn list_netns(&self) -> HostnetResult<Vec<String>> {
        let out = self.exec(build_netns_list_cmd()).await?;
        Ok(parse_netns_list(&out))
    }

    pub async fn netns_exists(&self, ns: &str) -> HostnetResult<bool> {
        Ok(self.list_netns().await?.iter().any(|n| n == ns))
    }

    // ---- links ----

    pub async fn set_link_state(&self, dev: &str, state: LinkState, ns: Option<&str>) -> HostnetResult<()> {
        self.exec(build_link_set_state_cmd(dev, state.is_up(), ns)).await?;
        debug!("Set {} {}", dev, state);
        Ok(())
    }

    /// Moves `dev` into namespace `ns`.
    pub async fn set_link_netns(&self, dev: &str, ns: &str) -> HostnetResult<()> {
        self.exec(build_link_set_netns_cmd(dev, ns)).await?;
        debug!("Moved {} into {}", dev, ns);
        Ok(())
    }

    pub async fn delete_link(&self, dev: &str, ns: Option<&str>) -> HostnetResult<()> {
        self.exec(build_link_delete_cmd(dev, ns)).await?;
        Ok(())
    }

    /// True when `ip link show <dev>` succeeds.
    pub async fn link_exists(&self, dev: &str, ns: Option<&str>) -> HostnetResult<bool> {
        let result = self.runner.run(&build_link_show_cmd(dev, ns)).await?;
        Ok(result.success())
    }

    /// Creates a veth pair, optionally placing the peer in another namespace.
    pub async fn add_veth(&self, name: &str, peer: &str, peer_ns: Option<&str>) -> HostnetResult<()> {
        self.exec(build_veth_add_cmd(name, peer, peer_ns)).await?;
        info!("Added veth pair {} <-> {}", name, peer);
        Ok(())
    }

    /// Deletes a veth pair; either end removes both.
    pub async fn delete_veth(&self, name: &str) -> HostnetResult<()> {
        self.delete_link(name, None).await
    }

    // ---- addresses ----

    pub async fn add_addr(&self, cidr: &str, dev: &str, ns: Option<&str>) -> HostnetResult<()> {
        self.exec(build_addr_add_cmd(cidr, dev, ns)).await?;
        debug!("Assigned {} to {}", cidr, dev);
        Ok(())
    }

    /// True when `dev` already carries `cidr`.
    pub async fn has_addr(&self, cidr: &str, dev: &str, ns: Option<&str>) -> HostnetResult<bool> {
        let out = self.exec(build_addr_show_cmd(dev, ns)).await?;
        Ok(addr_listed(&out, cidr))
    }

    // ---- routes ----

    pub async fn replace_onlink_route(&self, cidr: &str, dev: &str, ns: Option<&str>) -> HostnetResult<()> {
        self.exec(build_route_replace_onlink_cmd(cidr, dev, ns)).await?;
        info!("Route {} via {} installed", cidr, dev);
        Ok(())
    }

    pub async fn delete_onlink_route(&self, cidr: &str, dev: &str, ns: Option<&str>) -> HostnetResult<()> {
        self.exec(build_route_del_onlink_cmd(cidr, dev, ns)).await?;
        info!("Route {} via {} removed", cidr, dev);
        Ok(())
    }

    pub async fn list_onlink_routes(&self, dev: &str, ns: Option<&str>) -> HostnetResult<Vec<String>> {
        let out = self.exec(build_route_list_onlink_cmd(dev, ns)).await?;
        Ok(parse_onlink_routes(&out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostnet_test::RecordingRunner;

    fn mgr() -> (Arc<RecordingRunner>, IpMgr) {
        let runner = Arc::new(RecordingRunner::new());
        (runner.clone(), IpMgr::new(runner))
    }

    #[test]
    fn test_parse_netns_list() {
        let output = "qdhcp-net0000000 (id: 1)\nl3_ns-router0000\n";
        assert_eq!(parse_netns_list(output), vec!["qdhcp-net0000000", "l3_ns-router0000"]);
    }

    #[test]
    fn test_addr_listed() {
        let output = "7: l3-vmabc    inet 10.0.0.254/24 scope global l3-vmabc\\       valid_lft forever preferred_lft forever\n";
        assert!(addr_listed(output, "10.0.0.254/24"));
        assert!(!addr_listed(output, "10.0.0.254/16"));
        assert!(!addr_listed("", "10.0.0.254/24"));
    }

    #[test]
    fn test_parse_onlink_routes() {
        let output = "5.5.5.0/24 scope link\n10.0.0.0/24 proto kernel scope link src 10.0.0.254\n\n";
        assert_eq!(parse_onlink_routes(output), vec!["5.5.5.0/24 scope link"]);
    }

    #[tokio::test]
    async fn test_add_veth_and_link_up() {
        let (runner, ip) = mgr();
        ip.add_veth("qvb-abc", "qvo-abc", None).await.unwrap();
        ip.set_link_state("qvb-abc", LinkState::Up, None).await.unwrap();

        let verifier = runner.verifier();
        verifier
            .assert_command_executed("link add qvb-abc type veth peer name qvo-abc")
            .unwrap();
        verifier.assert_command_executed("link set qvb-abc up").unwrap();
    }

    #[tokio::test]
    async fn test_netns_exists() {
        let (runner, ip) = mgr();
        runner.respond("netns list", "qdhcp-abc (id: 0)\nother\n");
        assert!(ip.netns_exists("qdhcp-abc").await.unwrap());
        assert!(!ip.netns_exists("qdhcp").await.unwrap());
    }

    #[tokio::test]
    async fn test_link_exists_uses_exit_status() {
        let (runner, ip) = mgr();
        runner.fail_on("link show missing", 1, "Device \"missing\" does not exist.");
        assert!(!ip.link_exists("missing", Some("ns")).await.unwrap());
        assert!(ip.link_exists("dhcpabc", Some("ns")).await.unwrap());
    }

    #[tokio::test]
    async fn test_route_in_namespace() {
        let (runner, ip) = mgr();
        ip.replace_onlink_route("5.5.5.0/24", "l3-vmabc", Some("l3_ns-abc"))
            .await
            .unwrap();
        runner
            .verifier()
            .assert_command_executed(
                "netns exec l3_ns-abc /sbin/ip route replace 5.5.5.0/24 dev l3-vmabc scope link",
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_failure_propagates() {
        let (runner, ip) = mgr();
        runner.fail_on("netns add", 1, "File exists");
        let err = ip.add_netns("qdhcp-abc").await.unwrap_err();
        assert!(err.is_external_tool_error());
    }
}
