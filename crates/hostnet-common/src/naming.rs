//! Entity identifiers and the device/namespace/chain names derived from them.
//!
//! Only the first [`ID_PREFIX_LEN`] characters of an identifier take part in
//! name derivation, so every name for one entity is built from
//! [`EntityId::prefix`]. Two identifiers that share a prefix would map to the
//! same devices; [`IdentityRegistry`] rejects the second one when it is first
//! seen. Nothing below the registry can detect such a collision.
//!
//! A persistent registry keeps one claim file per prefix,
//! `<dir>/<kind>/<prefix>`, holding the full owning identifier, so claims
//! survive the process and are shared between concurrent agents.

use dashmap::DashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{HostnetError, HostnetResult};

/// Number of identifier characters used in derived names.
pub const ID_PREFIX_LEN: usize = 10;

/// VM tap device.
pub const VM_PORT_PREFIX: &str = "tap";
/// Per-port Linux bridge.
pub const BRIDGE_NAME_PREFIX: &str = "qbr-";
/// Bridge-side end of the per-port veth pair.
pub const VM_BRIDGE_PORT_PREFIX: &str = "qvb-";
/// Switch-side end of the per-port veth pair.
pub const VM_OVS_PORT_PREFIX: &str = "qvo-";
/// DHCP namespace.
pub const NS_DHCP_PREFIX: &str = "qdhcp-";
/// DHCP listen interface.
pub const NS_DHCP_INTERFACE_PREFIX: &str = "dhcp";
/// L3 routing-domain namespace.
pub const L3_NAMESPACE_PREFIX: &str = "l3_ns-";
/// Workload-facing port of a routing domain.
pub const L3_VM_PORT_PREFIX: &str = "l3-vm";
/// Upstream-facing port of a routing domain.
pub const L3_STU_PORT_PREFIX: &str = "l3-st";
/// Per-port address set.
pub const IP_SET_PREFIX: &str = "NIPv4";
/// Per-port ingress chain.
pub const INGRESS_CHAIN_PREFIX: &str = "i";
/// Per-port egress chain.
pub const EGRESS_CHAIN_PREFIX: &str = "o";

/// The kind of entity an identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Port,
    Network,
    RoutingDomain,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Port => "port",
            EntityKind::Network => "network",
            EntityKind::RoutingDomain => "routing domain",
        }
    }

    /// Claim directory of this kind under a persistent registry root.
    pub fn claims_subdir(&self) -> &'static str {
        match self {
            EntityKind::Port => "port",
            EntityKind::Network => "network",
            EntityKind::RoutingDomain => "router",
        }
    }
}

/// An opaque entity identifier (port, network or routing-domain id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId(String);

impl EntityId {
    /// Validates and wraps an identifier.
    ///
    /// Identifiers end up in interface names and command lines, so only ASCII
    /// alphanumerics, `-` and `_` are accepted.
    pub fn new(id: impl Into<String>) -> HostnetResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(HostnetError::invalid_config("entity_id", "identifier is empty"));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(HostnetError::invalid_config(
                "entity_id",
                format!("identifier '{}' contains invalid character {:?}", id, bad),
            ));
        }
        Ok(Self(id))
    }

    /// The full identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The significant prefix used for every derived name.
    pub fn prefix(&self) -> &str {
        // Identifiers are ASCII, so byte slicing is char slicing.
        &self.0[..self.0.len().min(ID_PREFIX_LEN)]
    }

    fn derive(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.prefix())
    }

    /// `tap<p>`
    pub fn vm_port_name(&self) -> String {
        self.derive(VM_PORT_PREFIX)
    }

    /// `qbr-<p>`
    pub fn bridge_name(&self) -> String {
        self.derive(BRIDGE_NAME_PREFIX)
    }

    /// `qvb-<p>`
    pub fn bridge_port_name(&self) -> String {
        self.derive(VM_BRIDGE_PORT_PREFIX)
    }

    /// `qvo-<p>`
    pub fn ovs_port_name(&self) -> String {
        self.derive(VM_OVS_PORT_PREFIX)
    }

    /// `qdhcp-<p>`
    pub fn dhcp_namespace(&self) -> String {
        self.derive(NS_DHCP_PREFIX)
    }

    /// `dhcp<p>`
    pub fn dhcp_interface(&self) -> String {
        self.derive(NS_DHCP_INTERFACE_PREFIX)
    }

    /// `l3_ns-<p>`
    pub fn l3_namespace(&self) -> String {
        self.derive(L3_NAMESPACE_PREFIX)
    }

    /// `l3-vm<p>`
    pub fn l3_vm_port_name(&self) -> String {
        self.derive(L3_VM_PORT_PREFIX)
    }

    /// `l3-st<p>`
    pub fn l3_upstream_port_name(&self) -> String {
        self.derive(L3_STU_PORT_PREFIX)
    }

    /// `NIPv4<p>`
    pub fn ipset_name(&self) -> String {
        self.derive(IP_SET_PREFIX)
    }

    /// `i<p>`, before wrapping.
    pub fn ingress_chain(&self) -> String {
        self.derive(INGRESS_CHAIN_PREFIX)
    }

    /// `o<p>`, before wrapping.
    pub fn egress_chain(&self) -> String {
        self.derive(EGRESS_CHAIN_PREFIX)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tracks which full identifier owns each derived-name prefix.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    // Claims held through this registry.
    claims: DashMap<(EntityKind, String), String>,
    claims_dir: Option<PathBuf>,
}

/// Creates the claim file at `path` for `id`, or reads the owner already
/// recorded there.
fn claim_file(path: &Path, id: &EntityId) -> HostnetResult<String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| HostnetError::io(parent, e))?;
    }
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            writeln!(file, "{}", id)
                .and_then(|_| file.sync_all())
                .map_err(|e| HostnetError::io(path, e))?;
            debug!("Claimed {}", path.display());
            Ok(id.as_str().to_string())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => fs::read_to_string(path)
            .map(|owner| owner.trim().to_string())
            .map_err(|e| HostnetError::io(path, e)),
        Err(e) => Err(HostnetError::io(path, e)),
    }
}

impl IdentityRegistry {
    /// A registry that lives only as long as this value.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry backed by claim files under `dir`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            claims: DashMap::new(),
            claims_dir: Some(dir.into()),
        }
    }

    pub fn claims_dir(&self) -> Option<&Path> {
        self.claims_dir.as_deref()
    }

    fn claim_path(&self, kind: EntityKind, id: &EntityId) -> Option<PathBuf> {
        self.claims_dir
            .as_ref()
            .map(|dir| dir.join(kind.claims_subdir()).join(id.prefix()))
    }

    /// Validates `raw` and claims its prefix for `kind`.
    ///
    /// Claiming the same identifier again is fine; a different identifier with
    /// the same prefix is a configuration error.
    pub fn accept(&self, kind: EntityKind, raw: &str) -> HostnetResult<EntityId> {
        let id = EntityId::new(raw)?;
        let key = (kind, id.prefix().to_string());
        let owner = match self.claim_path(kind, &id) {
            Some(path) => claim_file(&path, &id)?,
            None => self
                .claims
                .entry(key.clone())
                .or_insert_with(|| id.as_str().to_string())
                .value()
                .clone(),
        };
        if owner != id.as_str() {
            return Err(HostnetError::invalid_config(
                "entity_id",
                format!(
                    "{} '{}' collides with '{}' on name prefix '{}'",
                    kind.as_str(),
                    id,
                    owner,
                    id.prefix()
                ),
            ));
        }
        self.claims.insert(key, owner);
        Ok(id)
    }

    /// Drops the claim held by `id`, if it owns one.
    pub fn release(&self, kind: EntityKind, id: &EntityId) -> HostnetResult<()> {
        self.claims
            .remove_if(&(kind, id.prefix().to_string()), |_, owner| owner == id.as_str());

        let Some(path) = self.claim_path(kind, id) else {
            return Ok(());
        };
        match fs::read_to_string(&path) {
            Ok(owner) if owner.trim() == id.as_str() => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(HostnetError::io(path, e)),
            },
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HostnetError::io(path, e)),
        }
    }

    /// Number of prefixes claimed through this registry.
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
