//! Best-effort cleanup bookkeeping.
//!
//! A teardown runs every step in order whether or not earlier ones failed.
//! [`TeardownPlan`] records each step's outcome and folds the failures into
//! one [`HostnetError::Teardown`].
//!
//! A failed provisioning undoes only what it created itself. [`Rollback`]
//! collects those artifacts as they appear and hands them back newest first.

use hostnet_common::{EntityId, HostnetError, HostnetResult};
use tracing::{debug, warn};

/// Outcome tracker for one entity's teardown
#[derive(Debug)]
pub struct TeardownPlan {
    entity: String,
    completed: Vec<String>,
    failures: Vec<String>,
}

impl TeardownPlan {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            completed: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Records the result of the step named `step`.
    pub fn record<T>(&mut self, step: &str, result: HostnetResult<T>) {
        match result {
            Ok(_) => {
                debug!("{}: {} done", self.entity, step);
                self.completed.push(step.to_string());
            }
            Err(e) => {
                warn!("{}: {} failed: {}", self.entity, step, e);
                self.failures.push(format!("{}: {}", step, e));
            }
        }
    }

    /// Steps that succeeded, in order.
    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    /// `Ok` when every step succeeded, otherwise one error naming them all.
    pub fn finish(self) -> HostnetResult<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(HostnetError::Teardown {
                entity: self.entity,
                failures: self.failures,
            })
        }
    }
}

/// Something a provisioning call created and a rollback must remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Namespace(String),
    LinuxBridge(String),
    /// Veth pair, named by the end left in the root namespace
    Veth(String),
    SwitchPort(String),
    /// Both chains of the port plus their forward jumps
    PortChains(EntityId),
    AddressSet(EntityId),
    DhcpService(EntityId),
}

impl Artifact {
    /// Step name used in teardown reports.
    pub fn describe(&self) -> String {
        match self {
            Artifact::Namespace(ns) => format!("delete namespace {}", ns),
            Artifact::LinuxBridge(br) => format!("delete bridge {}", br),
            Artifact::Veth(dev) => format!("delete veth {}", dev),
            Artifact::SwitchPort(port) => format!("delete switch port {}", port),
            Artifact::PortChains(port) => format!("remove chains of port {}", port),
            Artifact::AddressSet(port) => format!("destroy address set of port {}", port),
            Artifact::DhcpService(net) => format!("terminate DHCP service of {}", net),
        }
    }
}

/// Artifacts created by one provisioning call, in creation order
#[derive(Debug)]
pub struct Rollback {
    entity: String,
    created: Vec<Artifact>,
}

impl Rollback {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            created: Vec::new(),
        }
    }

    pub fn push(&mut self, artifact: Artifact) {
        debug!("{}: created {:?}", self.entity, artifact);
        self.created.push(artifact);
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }

    /// Consumes the record, newest artifact first.
    pub fn into_undo_order(self) -> (String, Vec<Artifact>) {
        let mut created = self.created;
        created.reverse();
        (self.entity, created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_steps_ok() {
        let mut plan = TeardownPlan::new("port abc");
        plan.record("delete bridge", Ok(()));
        plan.record("delete veth", Ok("ignored"));
        assert_eq!(plan.completed(), ["delete bridge", "delete veth"]);
        assert!(plan.finish().is_ok());
    }

    #[test]
    fn test_failures_aggregated() {
        let mut plan = TeardownPlan::new("port abc");
        plan.record::<()>(
            "delete bridge",
            Err(HostnetError::invalid_state("qbr-abc", "busy")),
        );
        plan.record("delete veth", Ok(()));
        plan.record::<()>("destroy set", Err(HostnetError::invalid_config("set", "gone")));

        assert_eq!(plan.failures().len(), 2);
        match plan.finish().unwrap_err() {
            HostnetError::Teardown { entity, failures } => {
                assert_eq!(entity, "port abc");
                assert!(failures[0].starts_with("delete bridge:"));
                assert!(failures[1].starts_with("destroy set:"));
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn test_rollback_undoes_newest_first() {
        let mut rollback = Rollback::new("port abc");
        assert!(rollback.is_empty());
        rollback.push(Artifact::LinuxBridge("qbr-abc".to_string()));
        rollback.push(Artifact::Veth("qvb-abc".to_string()));
        rollback.push(Artifact::SwitchPort("qvo-abc".to_string()));

        let (entity, undo) = rollback.into_undo_order();
        assert_eq!(entity, "port abc");
        assert_eq!(
            undo,
            vec![
                Artifact::SwitchPort("qvo-abc".to_string()),
                Artifact::Veth("qvb-abc".to_string()),
                Artifact::LinuxBridge("qbr-abc".to_string()),
            ]
        );
        assert_eq!(undo[0].describe(), "delete switch port qvo-abc");
    }
}
