//! Side Effects
//!
//! Calls to external collaborators, recorded as data so they can be staged
//! inside a topology transaction and delivered after it commits. Every call
//! is idempotent on the collaborator side: adding an existing target or
//! deleting a missing one succeeds.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::topology::{ClusterId, EntryKind, InstanceAddr};

/// Labels attached to a service-directory registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLabels {
    /// Owning business.
    pub business_id: u64,
    /// Cluster primary domain.
    pub domain: String,
    /// Instance role name.
    pub role: String,
    /// Instance address.
    pub addr: InstanceAddr,
}

/// Inventory / service-directory call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCall {
    /// Create the module / topology node for a cluster.
    CreateModule {
        cluster_id: ClusterId,
        business_id: u64,
        domain: String,
    },
    /// Move hosts under the cluster's module.
    TransferHosts { domain: String, hosts: Vec<String> },
    /// Register service instances.
    RegisterServiceInstances { instances: Vec<ServiceLabels> },
    /// Delete service instances.
    DeleteServiceInstances { domain: String, addrs: Vec<InstanceAddr> },
    /// Move hosts to the recycle pool.
    RecycleHosts { hosts: Vec<String> },
    /// Delete the module of a removed cluster.
    DeleteModule { cluster_id: ClusterId, domain: String },
}

/// Access-endpoint call, keyed by (name, port, members).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointCall {
    /// Create the entry if needed and add targets.
    AddTargets {
        kind: EntryKind,
        name: String,
        port: u16,
        targets: Vec<InstanceAddr>,
    },
    /// Remove targets from an entry.
    RemoveTargets {
        kind: EntryKind,
        name: String,
        port: u16,
        targets: Vec<InstanceAddr>,
    },
    /// Delete an entry entirely.
    DeleteEntry { kind: EntryKind, name: String, port: u16 },
}

impl EndpointCall {
    /// Endpoint technology this call goes to.
    pub fn kind(&self) -> EntryKind {
        match self {
            EndpointCall::AddTargets { kind, .. }
            | EndpointCall::RemoveTargets { kind, .. }
            | EndpointCall::DeleteEntry { kind, .. } => *kind,
        }
    }
}

/// Credential store call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialCall {
    /// Forget privileged passwords of retired instances.
    DeletePasswords {
        cloud_zone: u32,
        instances: Vec<InstanceAddr>,
        usernames: Vec<String>,
    },
}

/// Any staged side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SideEffect {
    /// Inventory mirror update.
    Inventory(InventoryCall),
    /// Access endpoint update.
    Endpoint(EndpointCall),
    /// Credential cleanup.
    Credential(CredentialCall),
}

impl SideEffect {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            SideEffect::Inventory(InventoryCall::CreateModule { .. }) => "inventory.create_module",
            SideEffect::Inventory(InventoryCall::TransferHosts { .. }) => "inventory.transfer_hosts",
            SideEffect::Inventory(InventoryCall::RegisterServiceInstances { .. }) => "inventory.register_instances",
            SideEffect::Inventory(InventoryCall::DeleteServiceInstances { .. }) => "inventory.delete_instances",
            SideEffect::Inventory(InventoryCall::RecycleHosts { .. }) => "inventory.recycle_hosts",
            SideEffect::Inventory(InventoryCall::DeleteModule { .. }) => "inventory.delete_module",
            SideEffect::Endpoint(EndpointCall::AddTargets { .. }) => "endpoint.add_targets",
            SideEffect::Endpoint(EndpointCall::RemoveTargets { .. }) => "endpoint.remove_targets",
            SideEffect::Endpoint(EndpointCall::DeleteEntry { .. }) => "endpoint.delete_entry",
            SideEffect::Credential(CredentialCall::DeletePasswords { .. }) => "credential.delete_passwords",
        }
    }
}

impl fmt::Display for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
