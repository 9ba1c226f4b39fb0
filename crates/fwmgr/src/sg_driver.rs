//! SgDriver - per-port security-group chains
//!
//! Chain layout in the configured table, all names wrapped:
//!
//! ```text
//! FORWARD -> FORWARD(wrapped) -> sg-chain -> i<p>  (--physdev-out tap<p>)
//!                                         -> o<p>  (--physdev-in  tap<p>)
//! ```
//!
//! Each port chain may match against the port's address set `NIPv4<p>`.

use devmgr::IpsetMgr;
use hostnet_common::{EntityId, HostnetResult};
use tracing::{info, instrument};

use crate::iptables_mgr::IptablesMgr;
use crate::types::{ApplyReport, Direction, Rule, Table, TableDelta, Verdict};

/// Shared dispatch chain, before wrapping
pub const SG_CHAIN: &str = "sg-chain";
/// Built-in chain the dispatch chain hangs off
pub const FORWARD_CHAIN: &str = "FORWARD";

/// Drives the security-group chains of ports
pub struct SgDriver {
    iptables: IptablesMgr,
    ipset: IpsetMgr,
    table: Table,
}

impl SgDriver {
    pub fn new(iptables: IptablesMgr, ipset: IpsetMgr, table: Table) -> Self {
        Self {
            iptables,
            ipset,
            table,
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Unwrapped chain of `port` for `direction`.
    fn port_chain_base(port: &EntityId, direction: Direction) -> String {
        match direction {
            Direction::Ingress => port.ingress_chain(),
            Direction::Egress => port.egress_chain(),
        }
    }

    /// Wrapped chain of `port` for `direction`.
    pub fn port_chain(&self, port: &EntityId, direction: Direction) -> HostnetResult<String> {
        self.iptables
            .chains()
            .wrap(&Self::port_chain_base(port, direction))
    }

    /// `-m physdev --physdev-{out|in} tap<p> --physdev-is-bridged`
    pub fn device_match(port: &EntityId, direction: Direction) -> String {
        format!(
            "-m physdev {} {} --physdev-is-bridged",
            direction.physdev_flag(),
            port.vm_port_name()
        )
    }

    fn wrapped_rule(&self, chain: &str, expr: &str) -> HostnetResult<Rule> {
        self.iptables.chains().rule(chain, expr, true)
    }

    /// Dispatch chain scaffolding: wrapped forward chain, `sg-chain` and the
    /// built-in FORWARD hook.
    fn dispatch_delta(&self) -> HostnetResult<TableDelta> {
        let chains = self.iptables.chains();
        Ok(TableDelta::new()
            .add_chain(chains.wrap(FORWARD_CHAIN)?)
            .add_chain(chains.wrap(SG_CHAIN)?)
            .add_rule(chains.rule(FORWARD_CHAIN, &format!("-j ${}", FORWARD_CHAIN), false)?))
    }

    /// Creates the shared dispatch chain. Safe to call repeatedly.
    pub async fn ensure_dispatch_chain(&self) -> HostnetResult<ApplyReport> {
        let delta = self.dispatch_delta()?;
        self.iptables.apply(self.table, &delta).await
    }

    /// The wrapped-FORWARD to dispatch-chain jumps of `port`.
    fn forward_jumps(&self, port: &EntityId) -> HostnetResult<Vec<Rule>> {
        Direction::ALL
            .iter()
            .map(|d| {
                self.wrapped_rule(
                    FORWARD_CHAIN,
                    &format!("{} -j ${}", Self::device_match(port, *d), SG_CHAIN),
                )
            })
            .collect()
    }

    /// Declares the port's chains and wires them in, in one apply.
    #[instrument(skip(self), fields(port = %port))]
    pub async fn add_port_chain(&self, port: &EntityId) -> HostnetResult<ApplyReport> {
        let mut delta = self.dispatch_delta()?;
        for direction in Direction::ALL {
            delta = delta.add_chain(self.port_chain(port, direction)?);
        }
        for rule in self.forward_jumps(port)? {
            delta = delta.add_rule(rule);
        }
        for direction in Direction::ALL {
            let expr = format!(
                "{} -j ${}",
                Self::device_match(port, direction),
                Self::port_chain_base(port, direction)
            );
            delta = delta.add_rule(self.wrapped_rule(SG_CHAIN, &expr)?);
        }

        let report = self.iptables.apply(self.table, &delta).await?;
        info!("Security-group chains installed for port {}", port);
        Ok(report)
    }

    /// Removes both port chains; every line naming them goes, jumps included.
    pub async fn remove_port_chains(&self, port: &EntityId) -> HostnetResult<ApplyReport> {
        let mut delta = TableDelta::new();
        for direction in Direction::ALL {
            delta = delta.remove_chain(self.port_chain(port, direction)?);
        }
        self.iptables.apply(self.table, &delta).await
    }

    /// Removes the port's jumps from the wrapped forward chain.
    pub async fn remove_forward_jumps(&self, port: &EntityId) -> HostnetResult<ApplyReport> {
        let mut delta = TableDelta::new();
        for rule in self.forward_jumps(port)? {
            delta = delta.remove_rule(rule);
        }
        self.iptables.apply(self.table, &delta).await
    }

    /// Creates the port's address set. Idempotent.
    pub async fn create_address_set(&self, port: &EntityId) -> HostnetResult<()> {
        self.ipset.create(&port.ipset_name()).await
    }

    /// Destroys the port's address set.
    pub async fn destroy_address_set(&self, port: &EntityId) -> HostnetResult<()> {
        self.ipset.destroy(&port.ipset_name()).await
    }

    /// Empties the port's address set, leaving the set and its rules.
    pub async fn flush_address_set(&self, port: &EntityId) -> HostnetResult<()> {
        self.ipset.flush(&port.ipset_name()).await?;
        info!("Address set of port {} flushed", port);
        Ok(())
    }

    /// Creates the port's address set and matches it in the port chain for
    /// `direction` with `verdict`.
    #[instrument(skip(self), fields(port = %port))]
    pub async fn init_ipset_rule(
        &self,
        port: &EntityId,
        verdict: Verdict,
        direction: Direction,
    ) -> HostnetResult<ApplyReport> {
        let set = port.ipset_name();
        let expr = format!("-m set --match-set {} {} -j {}", set, direction.set_match(), verdict);
        let rule = self.wrapped_rule(&Self::port_chain_base(port, direction), &expr)?;

        self.ipset.create(&set).await?;
        self.iptables
            .apply(self.table, &TableDelta::new().add_rule(rule))
            .await
    }

    pub async fn add_ipset_members(&self, port: &EntityId, members: &[String]) -> HostnetResult<()> {
        self.ipset.add_members(&port.ipset_name(), members).await
    }

    pub async fn remove_ipset_members(&self, port: &EntityId, members: &[String]) -> HostnetResult<()> {
        self.ipset.remove_members(&port.ipset_name(), members).await
    }

    /// Adds an arbitrary rule to the port chain for `direction`.
    pub async fn add_port_rule(
        &self,
        port: &EntityId,
        direction: Direction,
        expr: &str,
    ) -> HostnetResult<ApplyReport> {
        let rule = self.wrapped_rule(&Self::port_chain_base(port, direction), expr)?;
        self.iptables
            .apply(self.table, &TableDelta::new().add_rule(rule))
            .await
    }

    pub async fn remove_port_rule(
        &self,
        port: &EntityId,
        direction: Direction,
        expr: &str,
    ) -> HostnetResult<ApplyReport> {
        let rule = self.wrapped_rule(&Self::port_chain_base(port, direction), expr)?;
        self.iptables
            .apply(self.table, &TableDelta::new().remove_rule(rule))
            .await
    }
}
