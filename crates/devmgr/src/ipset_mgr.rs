//! IpsetMgr - `hash:net` address sets

use hostnet_common::{CommandRunner, HostnetError, HostnetResult};
use std::sync::Arc;
use tracing::{debug, info};

use crate::commands::*;

/// Wraps `ipset`, optionally inside a namespace
#[derive(Clone)]
pub struct IpsetMgr {
    runner: Arc<dyn CommandRunner>,
    namespace: Option<String>,
}

impl IpsetMgr {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            namespace: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    fn ns(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Idempotent.
    pub async fn create(&self, name: &str) -> HostnetResult<()> {
        self.runner
            .exec_or_throw(&build_ipset_create_cmd(name, self.ns()))
            .await?;
        info!("Created ipset {}", name);
        Ok(())
    }

    pub async fn destroy(&self, name: &str) -> HostnetResult<()> {
        self.runner
            .exec_or_throw(&build_ipset_destroy_cmd(name, self.ns()))
            .await?;
        info!("Destroyed ipset {}", name);
        Ok(())
    }

    /// Idempotent.
    pub async fn add_member(&self, name: &str, member: &str) -> HostnetResult<()> {
        self.runner
            .exec_or_throw(&build_ipset_add_cmd(name, member, self.ns()))
            .await?;
        debug!("Added {} to ipset {}", member, name);
        Ok(())
    }

    pub async fn remove_member(&self, name: &str, member: &str) -> HostnetResult<()> {
        self.runner
            .exec_or_throw(&build_ipset_del_cmd(name, member, self.ns()))
            .await?;
        debug!("Removed {} from ipset {}", member, name);
        Ok(())
    }

    pub async fn flush(&self, name: &str) -> HostnetResult<()> {
        self.runner
            .exec_or_throw(&build_ipset_flush_cmd(name, self.ns()))
            .await?;
        Ok(())
    }

    /// Adds every member, stopping at the first failure. An empty list is a
    /// configuration error.
    pub async fn add_members(&self, name: &str, members: &[String]) -> HostnetResult<()> {
        if members.is_empty() {
            return Err(HostnetError::invalid_config(
                "ipset.members",
                format!("no members given for {}", name),
            ));
        }
        for member in members {
            self.add_member(name, member).await?;
        }
        Ok(())
    }

    pub async fn remove_members(&self, name: &str, members: &[String]) -> HostnetResult<()> {
        for member in members {
            self.remove_member(name, member).await?;
        }
        Ok(())
    }
}
