//! Mutation Requests
//!
//! Caller-supplied descriptions of instances to place. Instances are
//! identified by address; the engine reuses an existing record at that
//! address or creates one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::precheck::{PrecheckError, PrecheckResult};
use crate::topology::{
    Cluster, ClusterShape, EntryKind, HostSpec, InnerRole, InstanceAddr, StorageId, StorageRole, TopologyGraph,
};

/// A proxy, or the replacement target of a switch or rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Host the instance runs on.
    pub host: HostSpec,
    /// Listening port.
    pub port: u16,
}

impl InstanceSpec {
    /// Instance in zone 0 on `ip:port`.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            host: HostSpec::new(ip),
            port,
        }
    }

    /// Instance address.
    pub fn addr(&self) -> InstanceAddr {
        InstanceAddr::new(self.host.ip.clone(), self.port)
    }
}

/// A storage instance to place in a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpec {
    /// Host the instance runs on.
    pub host: HostSpec,
    /// Listening port.
    pub port: u16,
    /// Role inside the cluster.
    pub role: StorageRole,
    /// Replication direction role.
    pub inner_role: InnerRole,
    /// Shard label.
    #[serde(default)]
    pub shard: Option<String>,
    /// Master this instance replicates from.
    #[serde(default)]
    pub replica_of: Option<InstanceAddr>,
}

impl StorageSpec {
    /// Writable master.
    pub fn master(ip: impl Into<String>, port: u16) -> Self {
        Self {
            host: HostSpec::new(ip),
            port,
            role: StorageRole::Master,
            inner_role: InnerRole::Master,
            shard: None,
            replica_of: None,
        }
    }

    /// Replica of `master`.
    pub fn slave(ip: impl Into<String>, port: u16, master: &InstanceAddr) -> Self {
        Self {
            host: HostSpec::new(ip),
            port,
            role: StorageRole::Slave,
            inner_role: InnerRole::Slave,
            shard: None,
            replica_of: Some(master.clone()),
        }
    }

    /// Single instance without replication.
    pub fn standalone(ip: impl Into<String>, port: u16) -> Self {
        Self {
            role: StorageRole::Standalone,
            ..Self::master(ip, port)
        }
    }

    /// Set the shard label.
    pub fn with_shard(mut self, shard: impl Into<String>) -> Self {
        self.shard = Some(shard.into());
        self
    }

    /// Instance address.
    pub fn addr(&self) -> InstanceAddr {
        InstanceAddr::new(self.host.ip.clone(), self.port)
    }
}

/// One ejector and the receiver that should replace its current ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedoTarget {
    /// Master being rebuilt.
    pub ejector: StorageId,
    /// New receiver.
    pub receiver: InstanceSpec,
}

/// Everything needed to create a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    /// Owning business.
    pub business_id: u64,
    /// Cluster name, unique per business and type.
    pub name: String,
    /// Primary domain.
    pub domain: String,
    /// Topology shape.
    pub shape: ClusterShape,
    /// Proxy tier; empty for shapes without one.
    #[serde(default)]
    pub proxies: Vec<InstanceSpec>,
    /// Storage tier.
    pub storages: Vec<StorageSpec>,
    /// Endpoint technology of the primary entry.
    #[serde(default = "default_entry_kind")]
    pub entry_kind: EntryKind,
}

fn default_entry_kind() -> EntryKind {
    EntryKind::Dns
}

impl CreateClusterRequest {
    /// Request with a DNS primary entry.
    pub fn new(
        business_id: u64,
        name: impl Into<String>,
        domain: impl Into<String>,
        shape: ClusterShape,
        proxies: Vec<InstanceSpec>,
        storages: Vec<StorageSpec>,
    ) -> Self {
        Self {
            business_id,
            name: name.into(),
            domain: domain.into(),
            shape,
            proxies,
            storages,
            entry_kind: EntryKind::Dns,
        }
    }
}

/// Check that every `replica_of` names a master, either among `storages`
/// or among the members of `cluster`, and that no master ends up feeding
/// more than one receiver.
pub(crate) fn check_replica_sources(
    graph: &TopologyGraph,
    cluster: Option<&Cluster>,
    storages: &[StorageSpec],
) -> PrecheckResult<()> {
    let requested_masters: BTreeMap<InstanceAddr, &StorageSpec> = storages
        .iter()
        .filter(|s| s.inner_role.is_master_like())
        .map(|s| (s.addr(), s))
        .collect();
    let mut claimed: BTreeMap<InstanceAddr, InstanceAddr> = BTreeMap::new();

    for spec in storages {
        let Some(source) = &spec.replica_of else {
            continue;
        };
        let invalid = || PrecheckError::InvalidReplicaSource {
            replica: spec.addr(),
            source_addr: source.clone(),
        };

        if !requested_masters.contains_key(source) {
            let member = cluster.and_then(|c| {
                graph
                    .storage_by_addr(source)
                    .filter(|s| c.storages.contains(&s.id))
            });
            match member {
                Some(existing) if existing.inner_role.is_master_like() => {
                    if let Some(receiver) = graph.receivers_of(existing.id).first() {
                        return Err(PrecheckError::ReceiverAlreadyRunning {
                            ejector: source.clone(),
                            receiver: receiver.addr.clone(),
                        });
                    }
                }
                _ => return Err(invalid()),
            }
        }

        if let Some(first) = claimed.insert(source.clone(), spec.addr()) {
            return Err(PrecheckError::ReceiverAlreadyRunning {
                ejector: source.clone(),
                receiver: first,
            });
        }
    }
    Ok(())
}

/// At least one master must be placed.
pub(crate) fn check_has_master(storages: &[StorageSpec]) -> PrecheckResult<()> {
    if !storages.iter().any(|s| s.inner_role.is_master_like()) {
        return Err(PrecheckError::EmptyRequest { what: "master storages" });
    }
    Ok(())
}
