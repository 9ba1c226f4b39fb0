//! Orchestrator - network entity lifecycle verbs
//!
//! Each verb is a fixed sequence of device, DHCP and firewall steps.
//! Provisioning verbs skip what already exists, stop at the first failing
//! step and undo only what that call created, newest first, before returning
//! the original error. Teardown verbs run every step and report all failures
//! together.
//!
//! Identifiers pass through an [`IdentityRegistry`] before any name is
//! derived, so two entities sharing a name prefix are rejected up front. With
//! a claims directory configured the claims outlive the process.

use devmgr::{BridgeMgr, FlowSpec, IpMgr, IpsetMgr, LinkState, MirrorStatus, OvsMgr};
use dhcpmgr::{DhcpMgr, HostBinding};
use fwmgr::{ApplyReport, Direction, IptablesMgr, SgDriver, Table, Verdict};
use hostnet_common::{
    AgentConfig, CommandRunner, EntityId, EntityKind, HostnetError, HostnetResult,
    IdentityRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use crate::teardown::{Artifact, Rollback, TeardownPlan};
use crate::types::{validate_cidr, validate_vlan, DhcpProvision, L3Provision};

/// Drives every verb against one host
pub struct Orchestrator {
    config: AgentConfig,
    registry: IdentityRegistry,
    ip: IpMgr,
    bridges: BridgeMgr,
    ovs: OvsMgr,
    dhcp: DhcpMgr,
    iptables: IptablesMgr,
    sg: SgDriver,
}

impl Orchestrator {
    /// Builds the managers from a validated configuration.
    pub fn new(config: AgentConfig, runner: Arc<dyn CommandRunner>) -> HostnetResult<Self> {
        config.validate()?;
        let table: Table = config.firewall.table.parse()?;
        let mut iptables = IptablesMgr::new(runner.clone(), &config.firewall.wrap_name)?;
        let mut ipset = IpsetMgr::new(runner.clone());
        if let Some(ns) = &config.firewall.namespace {
            iptables = iptables.in_namespace(ns.clone());
            ipset = ipset.in_namespace(ns.clone());
        }
        let sg = SgDriver::new(iptables.clone(), ipset, table);
        let registry = match &config.registry.claims_dir {
            Some(dir) => IdentityRegistry::persistent(dir.clone()),
            None => IdentityRegistry::new(),
        };

        Ok(Self {
            ip: IpMgr::new(runner.clone()),
            bridges: BridgeMgr::new(runner.clone()),
            ovs: OvsMgr::new(runner.clone()).with_vsctl_timeout(config.ovs_vsctl_timeout()),
            dhcp: DhcpMgr::new(
                runner,
                config.dhcp.state_root.clone(),
                config.dhcp.lease_time.clone(),
            )
            .with_pid_timeout(config.dhcp_pid_timeout()),
            registry,
            iptables,
            sg,
            config,
        })
    }

    /// Reads bridge and device state from another sysfs root (tests).
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.bridges = self.bridges.with_sysfs_root(root);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn dhcp(&self) -> &DhcpMgr {
        &self.dhcp
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    fn integration_bridge(&self) -> &str {
        &self.config.bridges.integration_bridge
    }

    fn mirror_bridge(&self) -> &str {
        &self.config.bridges.mirror_bridge
    }

    fn port(&self, raw: &str) -> HostnetResult<EntityId> {
        self.registry.accept(EntityKind::Port, raw)
    }

    fn network(&self, raw: &str) -> HostnetResult<EntityId> {
        self.registry.accept(EntityKind::Network, raw)
    }

    fn router(&self, raw: &str) -> HostnetResult<EntityId> {
        self.registry.accept(EntityKind::RoutingDomain, raw)
    }

    // ---- rollback ----

    /// Undoes what one failed provisioning call created, newest first.
    async fn roll_back(&self, rollback: Rollback) -> HostnetResult<()> {
        if rollback.is_empty() {
            debug!("Nothing to roll back");
            return Ok(());
        }
        let (entity, undo) = rollback.into_undo_order();
        let mut plan = TeardownPlan::new(entity);
        for artifact in undo {
            let result = match &artifact {
                Artifact::Namespace(ns) => self.ip.delete_netns(ns).await,
                Artifact::LinuxBridge(bridge) => self.remove_linux_bridge(bridge).await,
                Artifact::Veth(dev) => self.ip.delete_veth(dev).await,
                Artifact::SwitchPort(port) => {
                    self.ovs.delete_port(self.integration_bridge(), port).await
                }
                Artifact::PortChains(port) => self.remove_port_chains(port).await,
                Artifact::AddressSet(port) => self.sg.destroy_address_set(port).await,
                Artifact::DhcpService(net) => self.dhcp.terminate(net).await,
            };
            plan.record(&artifact.describe(), result);
        }
        plan.finish()
    }

    async fn remove_linux_bridge(&self, bridge: &str) -> HostnetResult<()> {
        self.ip.set_link_state(bridge, LinkState::Down, None).await?;
        self.bridges.remove_bridge(bridge).await
    }

    async fn remove_port_chains(&self, port: &EntityId) -> HostnetResult<()> {
        self.sg.remove_port_chains(port).await?;
        self.sg.remove_forward_jumps(port).await?;
        Ok(())
    }

    /// Creates namespace `ns` unless it exists. True when created here.
    async fn ensure_netns(&self, ns: &str, rollback: &mut Rollback) -> HostnetResult<bool> {
        if self.ip.netns_exists(ns).await? {
            debug!("Namespace {} already exists", ns);
            return Ok(false);
        }
        self.ip.add_netns(ns).await?;
        rollback.push(Artifact::Namespace(ns.to_string()));
        Ok(true)
    }

    /// Puts `port` on the integration bridge unless some bridge already
    /// holds it, in which case only the tag is brought in line. True when
    /// created here.
    async fn ensure_switch_port(
        &self,
        port: &str,
        vlan: Option<u16>,
        internal: bool,
        rollback: &mut Rollback,
    ) -> HostnetResult<bool> {
        if self.ovs.port_exists(port).await? {
            debug!("Switch port {} already exists", port);
            if let Some(vlan) = vlan {
                self.ovs.set_port_tag(port, vlan).await?;
            }
            return Ok(false);
        }
        if internal {
            self.ovs
                .add_internal_port(self.integration_bridge(), port, vlan)
                .await?;
        } else {
            self.ovs.add_port(self.integration_bridge(), port, vlan).await?;
        }
        rollback.push(Artifact::SwitchPort(port.to_string()));
        Ok(true)
    }

    /// Moves `dev` into `ns` unless it is already there.
    async fn ensure_in_netns(&self, dev: &str, ns: &str, fresh: bool) -> HostnetResult<()> {
        if fresh || !self.ip.link_exists(dev, Some(ns)).await? {
            self.ip.set_link_netns(dev, ns).await?;
        }
        Ok(())
    }

    async fn ensure_addr(&self, cidr: &str, dev: &str, ns: Option<&str>) -> HostnetResult<()> {
        if self.ip.has_addr(cidr, dev, ns).await? {
            debug!("{} already carries {}", dev, cidr);
            return Ok(());
        }
        self.ip.add_addr(cidr, dev, ns).await
    }

    // ---- VM ports ----

    /// Connects a workload port to the integration bridge on `vlan`.
    ///
    /// With security groups the port goes through its own Linux bridge and a
    /// veth pair so iptables can see its traffic. Running it again on an
    /// attached port changes nothing.
    #[instrument(skip(self))]
    pub async fn attach_port(&self, port_id: &str, vlan: u16, use_security_group: bool) -> HostnetResult<()> {
        validate_vlan("vlan", vlan)?;
        let port = self.port(port_id)?;

        let mut rollback = Rollback::new(format!("port {}", port));
        let result = if use_security_group {
            self.attach_port_with_sg(&port, vlan, &mut rollback).await
        } else {
            self.attach_port_plain(&port, vlan, &mut rollback).await
        };

        if let Err(e) = result {
            error!("Attach of port {} failed, rolling back: {}", port, e);
            if let Err(cleanup) = self.roll_back(rollback).await {
                error!("Rollback of port {} incomplete: {}", port, cleanup);
            }
            return Err(e);
        }
        info!("Attached port {} on VLAN {}", port, vlan);
        Ok(())
    }

    async fn attach_port_with_sg(&self, port: &EntityId, vlan: u16, rollback: &mut Rollback) -> HostnetResult<()> {
        let bridge = port.bridge_name();
        let bridge_port = port.bridge_port_name();
        let ovs_port = port.ovs_port_name();

        if !self.bridges.bridge_exists(&bridge).await? {
            self.bridges.create_bridge(&bridge).await?;
            rollback.push(Artifact::LinuxBridge(bridge.clone()));
        }
        if !self.bridges.device_exists(&bridge_port).await? {
            self.ip.add_veth(&bridge_port, &ovs_port, None).await?;
            rollback.push(Artifact::Veth(bridge_port.clone()));
        }
        if !self.bridges.interface_on_bridge(&bridge, &bridge_port).await? {
            self.bridges.add_port(&bridge, &bridge_port).await?;
        }
        self.ensure_switch_port(&ovs_port, None, false, rollback).await?;
        self.ovs.set_port_tag(&ovs_port, vlan).await?;
        for dev in [&bridge, &bridge_port, &ovs_port] {
            self.ip.set_link_state(dev, LinkState::Up, None).await?;
        }

        let report = self.sg.add_port_chain(port).await?;
        let chains_created = report
            .added_chains
            .contains(&self.sg.port_chain(port, Direction::Ingress)?);
        if chains_created {
            rollback.push(Artifact::PortChains(port.clone()));
        }
        self.sg.create_address_set(port).await?;
        if chains_created {
            rollback.push(Artifact::AddressSet(port.clone()));
        }
        Ok(())
    }

    async fn attach_port_plain(&self, port: &EntityId, vlan: u16, rollback: &mut Rollback) -> HostnetResult<()> {
        let tap = port.vm_port_name();
        self.ensure_switch_port(&tap, Some(vlan), false, rollback).await?;
        self.ip.set_link_state(&tap, LinkState::Up, None).await?;
        Ok(())
    }

    /// Removes everything [`attach_port`](Self::attach_port) creates. Every
    /// step runs even when earlier ones fail.
    #[instrument(skip(self))]
    pub async fn detach_port(&self, port_id: &str, use_security_group: bool) -> HostnetResult<()> {
        let port = self.port(port_id)?;
        self.detach_port_steps(&port, use_security_group).await?;
        self.registry.release(EntityKind::Port, &port)?;
        info!("Detached port {}", port);
        Ok(())
    }

    async fn detach_port_steps(&self, port: &EntityId, use_security_group: bool) -> HostnetResult<()> {
        let mut plan = TeardownPlan::new(format!("port {}", port));

        if use_security_group {
            let bridge = port.bridge_name();
            let ovs_port = port.ovs_port_name();
            plan.record(
                "link down bridge",
                self.ip.set_link_state(&bridge, LinkState::Down, None).await,
            );
            plan.record("delete bridge", self.bridges.remove_bridge(&bridge).await);
            plan.record("delete veth", self.ip.delete_veth(&port.bridge_port_name()).await);
            plan.record(
                "delete switch port",
                self.ovs.delete_port(self.integration_bridge(), &ovs_port).await,
            );
            plan.record("remove port chains", self.sg.remove_port_chains(port).await);
            plan.record("remove forward jumps", self.sg.remove_forward_jumps(port).await);
            plan.record("destroy address set", self.sg.destroy_address_set(port).await);
        } else {
            plan.record(
                "delete switch port",
                self.ovs
                    .delete_port(self.integration_bridge(), &port.vm_port_name())
                    .await,
            );
        }

        plan.finish()
    }

    // ---- DHCP ----

    /// Starts or updates the DHCP service of a network and returns its pid.
    ///
    /// A running service only gets the host binding and a reload. Starting
    /// one requires `first`.
    #[instrument(skip(self, req), fields(network = %req.network, first = req.first))]
    pub async fn provision_dhcp(&self, req: &DhcpProvision) -> HostnetResult<u32> {
        validate_vlan("vlan", req.vlan)?;
        let net = self.network(&req.network)?;
        let namespace = req.namespace.clone().unwrap_or_else(|| net.dhcp_namespace());
        let hosts: Vec<HostBinding> = req.host.iter().cloned().collect();

        if self.dhcp.is_running(&net).await? {
            return self.dhcp.spawn(&net, &req.block, &hosts, &namespace).await;
        }
        if !req.first {
            return Err(HostnetError::invalid_state(
                format!("network {}", net),
                "DHCP service is not running and this is not the first provisioning",
            ));
        }

        let mut rollback = Rollback::new(format!("network {}", net));
        match self.provision_dhcp_steps(&net, req, &namespace, &mut rollback).await {
            Ok(pid) => {
                info!("DHCP for {} running as {} in {}", net, pid, namespace);
                Ok(pid)
            }
            Err(e) => {
                error!("DHCP provisioning of {} failed, rolling back: {}", net, e);
                if let Err(cleanup) = self.roll_back(rollback).await {
                    error!("Rollback of DHCP for {} incomplete: {}", net, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn provision_dhcp_steps(
        &self,
        net: &EntityId,
        req: &DhcpProvision,
        namespace: &str,
        rollback: &mut Rollback,
    ) -> HostnetResult<u32> {
        let interface = net.dhcp_interface();
        let listen = req.block.with_prefix(req.block.dhcp_listen_addr());

        let ns_created = self.ensure_netns(namespace, rollback).await?;
        let port_created = self
            .ensure_switch_port(&interface, Some(req.vlan), true, rollback)
            .await?;
        self.ensure_in_netns(&interface, namespace, ns_created || port_created)
            .await?;
        self.ip
            .set_link_state(&interface, LinkState::Up, Some(namespace))
            .await?;
        self.ensure_addr(&listen, &interface, Some(namespace)).await?;
        let pid = self.dhcp.spawn(net, &req.block, &[], namespace).await?;
        rollback.push(Artifact::DhcpService(net.clone()));
        if let Some(host) = &req.host {
            self.dhcp.add_host(net, host).await?;
        }
        Ok(pid)
    }

    /// Registers one more binding with a running DHCP service.
    #[instrument(skip(self))]
    pub async fn add_dhcp_host(&self, network_id: &str, host: &HostBinding) -> HostnetResult<()> {
        let net = self.network(network_id)?;
        self.dhcp.add_host(&net, host).await
    }

    /// Drops a binding from a running DHCP service.
    #[instrument(skip(self))]
    pub async fn remove_dhcp_host(&self, network_id: &str, mac: &str) -> HostnetResult<bool> {
        let net = self.network(network_id)?;
        self.dhcp.remove_host(&net, mac).await
    }

    /// Removes the DHCP port, namespace, process and state of a network.
    #[instrument(skip(self))]
    pub async fn teardown_dhcp(&self, network_id: &str, namespace: Option<&str>) -> HostnetResult<()> {
        let net = self.network(network_id)?;
        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| net.dhcp_namespace());
        self.teardown_dhcp_steps(&net, &namespace).await?;
        self.registry.release(EntityKind::Network, &net)?;
        info!("DHCP for {} torn down", net);
        Ok(())
    }

    async fn teardown_dhcp_steps(&self, net: &EntityId, namespace: &str) -> HostnetResult<()> {
        let mut plan = TeardownPlan::new(format!("network {}", net));
        plan.record(
            "delete DHCP port",
            self.ovs
                .delete_port(self.integration_bridge(), &net.dhcp_interface())
                .await,
        );
        plan.record("delete namespace", self.ip.delete_netns(namespace).await);
        plan.record("terminate DHCP service", self.dhcp.terminate(net).await);
        plan.finish()
    }

    // ---- L3 routing domains ----

    /// Creates the routing domain namespace with one leg on the workload
    /// network and one on the upstream network, each holding its gateway.
    #[instrument(skip(self, req), fields(router = %req.router, network = %req.network))]
    pub async fn provision_l3(&self, req: &L3Provision) -> HostnetResult<()> {
        validate_vlan("workload_vlan", req.workload_vlan)?;
        validate_vlan("upstream_vlan", req.upstream_vlan)?;
        let router = self.router(&req.router)?;
        let net = self.network(&req.network)?;

        let mut rollback = Rollback::new(format!("routing domain {}", router));
        if let Err(e) = self.provision_l3_steps(&router, &net, req, &mut rollback).await {
            error!("L3 provisioning of {} failed, rolling back: {}", router, e);
            if let Err(cleanup) = self.roll_back(rollback).await {
                error!("Rollback of L3 {} incomplete: {}", router, cleanup);
            }
            return Err(e);
        }
        info!("Routing domain {} provisioned for network {}", router, net);
        Ok(())
    }

    async fn provision_l3_steps(
        &self,
        router: &EntityId,
        net: &EntityId,
        req: &L3Provision,
        rollback: &mut Rollback,
    ) -> HostnetResult<()> {
        let namespace = router.l3_namespace();
        let ns = Some(namespace.as_str());
        let legs = [
            (net.l3_vm_port_name(), req.workload_vlan, &req.workload),
            (router.l3_upstream_port_name(), req.upstream_vlan, &req.upstream),
        ];

        let ns_created = self.ensure_netns(&namespace, rollback).await?;
        let mut created = Vec::with_capacity(legs.len());
        for (port, vlan, _) in &legs {
            created.push(self.ensure_switch_port(port, Some(*vlan), true, rollback).await?);
        }
        for ((port, _, _), port_created) in legs.iter().zip(created) {
            self.ensure_in_netns(port, &namespace, ns_created || port_created)
                .await?;
        }
        for (port, _, _) in &legs {
            self.ip.set_link_state(port, LinkState::Up, ns).await?;
        }
        for (port, _, block) in &legs {
            self.ensure_addr(&block.with_prefix(block.gateway()), port, ns)
                .await?;
        }
        Ok(())
    }

    /// Removes both legs and the namespace of a routing domain.
    #[instrument(skip(self))]
    pub async fn teardown_l3(&self, router_id: &str, network_id: &str, namespace: Option<&str>) -> HostnetResult<()> {
        let router = self.router(router_id)?;
        let net = self.network(network_id)?;
        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| router.l3_namespace());
        self.teardown_l3_steps(&router, &net, &namespace).await?;
        self.registry.release(EntityKind::RoutingDomain, &router)?;
        info!("Routing domain {} torn down", router);
        Ok(())
    }

    async fn teardown_l3_steps(&self, router: &EntityId, net: &EntityId, namespace: &str) -> HostnetResult<()> {
        let mut plan = TeardownPlan::new(format!("routing domain {}", router));
        plan.record(
            "delete workload port",
            self.ovs
                .delete_port(self.integration_bridge(), &net.l3_vm_port_name())
                .await,
        );
        plan.record(
            "delete upstream port",
            self.ovs
                .delete_port(self.integration_bridge(), &router.l3_upstream_port_name())
                .await,
        );
        plan.record("delete namespace", self.ip.delete_netns(namespace).await);
        plan.finish()
    }

    // ---- routes ----

    fn route_namespace(&self, router_id: &str, namespace: Option<&str>) -> HostnetResult<String> {
        let router = self.router(router_id)?;
        Ok(namespace
            .map(str::to_string)
            .unwrap_or_else(|| router.l3_namespace()))
    }

    /// `ip route replace <cidr> dev <dev> scope link` in the routing domain.
    #[instrument(skip(self))]
    pub async fn add_route(&self, router_id: &str, cidr: &str, dev: &str, namespace: Option<&str>) -> HostnetResult<()> {
        validate_cidr(cidr)?;
        let ns = self.route_namespace(router_id, namespace)?;
        self.ip.replace_onlink_route(cidr, dev, Some(&ns)).await
    }

    #[instrument(skip(self))]
    pub async fn delete_route(&self, router_id: &str, cidr: &str, dev: &str, namespace: Option<&str>) -> HostnetResult<()> {
        validate_cidr(cidr)?;
        let ns = self.route_namespace(router_id, namespace)?;
        self.ip.delete_onlink_route(cidr, dev, Some(&ns)).await
    }

    /// On-link routes through `dev`, without kernel-generated `src` routes.
    pub async fn list_routes(&self, router_id: &str, dev: &str, namespace: Option<&str>) -> HostnetResult<Vec<String>> {
        let ns = self.route_namespace(router_id, namespace)?;
        self.ip.list_onlink_routes(dev, Some(&ns)).await
    }

    // ---- mirroring and login flows ----

    /// Mirrors all traffic of the mirror bridge to `vlan`, or the configured
    /// mirror VLAN.
    #[instrument(skip(self))]
    pub async fn enable_mirror(&self, vlan: Option<u16>) -> HostnetResult<()> {
        let vlan = validate_vlan("mirror_vlan", vlan.unwrap_or(self.config.bridges.mirror_vlan))?;
        self.ovs
            .create_mirror(self.mirror_bridge(), &self.config.bridges.mirror_name, vlan)
            .await
    }

    #[instrument(skip(self))]
    pub async fn disable_mirror(&self) -> HostnetResult<()> {
        self.ovs.remove_mirrors(self.mirror_bridge()).await
    }

    pub async fn mirror_status(&self) -> HostnetResult<MirrorStatus> {
        self.ovs.mirror_status(self.mirror_bridge()).await
    }

    /// Installs a user login flow on the mirror bridge.
    #[instrument(skip(self))]
    pub async fn user_login(&self, flow: &FlowSpec) -> HostnetResult<()> {
        self.ovs.add_flow(self.mirror_bridge(), flow).await
    }

    /// Strictly deletes a user login flow from the mirror bridge.
    #[instrument(skip(self))]
    pub async fn user_logout(&self, flow: &FlowSpec) -> HostnetResult<()> {
        self.ovs.delete_flow(self.mirror_bridge(), flow).await
    }

    // ---- security groups ----

    /// Wraps the built-in chains and creates the dispatch chain.
    #[instrument(skip(self))]
    pub async fn init_firewall(&self) -> HostnetResult<()> {
        self.iptables.wrap_builtin_chains().await?;
        self.sg.ensure_dispatch_chain().await?;
        info!("Firewall initialised with wrap name {}", self.config.firewall.wrap_name);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn add_sg_rule(&self, port_id: &str, direction: Direction, expr: &str) -> HostnetResult<ApplyReport> {
        let port = self.port(port_id)?;
        self.sg.add_port_rule(&port, direction, expr).await
    }

    #[instrument(skip(self))]
    pub async fn remove_sg_rule(&self, port_id: &str, direction: Direction, expr: &str) -> HostnetResult<ApplyReport> {
        let port = self.port(port_id)?;
        self.sg.remove_port_rule(&port, direction, expr).await
    }

    /// Matches the port's address set in its chain for `direction`, then
    /// fills the set with `members` when given.
    #[instrument(skip(self))]
    pub async fn init_ipset_rule(
        &self,
        port_id: &str,
        verdict: Verdict,
        direction: Direction,
        members: &[String],
    ) -> HostnetResult<ApplyReport> {
        let port = self.port(port_id)?;
        let report = self.sg.init_ipset_rule(&port, verdict, direction).await?;
        if !members.is_empty() {
            self.sg.add_ipset_members(&port, members).await?;
        }
        Ok(report)
    }

    #[instrument(skip(self))]
    pub async fn add_ipset_members(&self, port_id: &str, members: &[String]) -> HostnetResult<()> {
        let port = self.port(port_id)?;
        self.sg.add_ipset_members(&port, members).await
    }

    #[instrument(skip(self))]
    pub async fn remove_ipset_members(&self, port_id: &str, members: &[String]) -> HostnetResult<()> {
        let port = self.port(port_id)?;
        self.sg.remove_ipset_members(&port, members).await
    }

    /// Empties the port's address set; its match rules stay in place.
    #[instrument(skip(self))]
    pub async fn flush_ipset_members(&self, port_id: &str) -> HostnetResult<()> {
        let port = self.port(port_id)?;
        self.sg.flush_address_set(&port).await
    }

    /// Rule lines of the port's chain for `direction`, counters included.
    pub async fn list_sg_rules(&self, port_id: &str, direction: Direction) -> HostnetResult<Vec<String>> {
        let port = self.port(port_id)?;
        let chain = self.sg.port_chain(&port, direction)?;
        self.iptables.chain_rules(self.sg.table(), &chain).await
    }
}
