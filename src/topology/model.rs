//! Topology Records
//!
//! Records are plain data. Membership sets are kept on both sides of every
//! many-to-many binding (cluster ↔ instance, proxy ↔ entry) and the graph
//! checks that both sides agree at every commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use super::shape::ClusterShape;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Allocate a fresh identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Cluster identifier.
    ClusterId
);
define_id!(
    /// Storage instance identifier.
    StorageId
);
define_id!(
    /// Proxy instance identifier.
    ProxyId
);
define_id!(
    /// Replication edge identifier.
    EdgeId
);
define_id!(
    /// Access entry identifier.
    EntryId
);

/// Network address of an instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceAddr {
    /// Host IP.
    pub ip: String,
    /// Listening port.
    pub port: u16,
}

impl InstanceAddr {
    /// Create an address.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl fmt::Display for InstanceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

// =============================================================================
// MACHINES
// =============================================================================

/// Role class of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineRole {
    /// Runs storage instances.
    Storage,
    /// Runs proxy instances.
    Proxy,
    /// Runs config/metadata nodes.
    Config,
}

impl MachineRole {
    /// Role name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineRole::Storage => "storage",
            MachineRole::Proxy => "proxy",
            MachineRole::Config => "config",
        }
    }
}

/// Capacity specification of a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// CPU cores.
    pub cpu: u32,
    /// Memory in GiB.
    pub mem_gb: u32,
    /// Data disk in GiB.
    pub disk_gb: u32,
}

/// Whether a host is owned by a topology or waiting for reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostPool {
    /// Owns at least one instance.
    InUse,
    /// Owns nothing; eligible for reclamation.
    Idle,
}

/// A physical or virtual host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Host IP, unique within the store.
    pub ip: String,
    /// Network / cloud zone.
    pub cloud_zone: u32,
    /// Role class.
    pub role: MachineRole,
    /// Capacity.
    pub spec: MachineSpec,
    /// Pool state.
    pub pool: HostPool,
    /// When the host was first registered.
    pub created_at: DateTime<Utc>,
}

/// Host description supplied by the caller of a creating operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    /// Host IP.
    pub ip: String,
    /// Network / cloud zone.
    pub cloud_zone: u32,
    /// Capacity.
    #[serde(default)]
    pub spec: MachineSpec,
}

impl HostSpec {
    /// Host spec in zone 0 with an empty capacity record.
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            cloud_zone: 0,
            spec: MachineSpec::default(),
        }
    }
}

// =============================================================================
// INSTANCES
// =============================================================================

/// Role of a storage instance within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageRole {
    /// Shard primary / writable master.
    Master,
    /// Replica of a master.
    Slave,
    /// Intermediate relay replica.
    Repeater,
    /// Metadata / config node.
    ConfigNode,
    /// Single instance without replication.
    Standalone,
}

impl StorageRole {
    /// Role name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageRole::Master => "master",
            StorageRole::Slave => "slave",
            StorageRole::Repeater => "repeater",
            StorageRole::ConfigNode => "config_node",
            StorageRole::Standalone => "standalone",
        }
    }
}

/// Replication direction role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InnerRole {
    /// Accepts writes and may eject to receivers.
    Master,
    /// Receives from an ejector.
    Slave,
}

impl InnerRole {
    /// Whether new replication edges may originate here.
    pub fn is_master_like(&self) -> bool {
        matches!(self, InnerRole::Master)
    }

    /// Role name.
    pub fn as_str(&self) -> &'static str {
        match self {
            InnerRole::Master => "master",
            InnerRole::Slave => "slave",
        }
    }
}

/// Runtime status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Serving.
    Running,
    /// Not reachable or retired.
    Unavailable,
    /// Reserved by an in-flight operation.
    Locked,
}

/// A storage instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInstance {
    /// Identifier.
    pub id: StorageId,
    /// Address.
    pub addr: InstanceAddr,
    /// Role inside the cluster.
    pub role: StorageRole,
    /// Replication direction role.
    pub inner_role: InnerRole,
    /// Runtime status.
    pub status: InstanceStatus,
    /// Shard label (segment or slot range), if any.
    pub shard: Option<String>,
    /// Clusters this instance belongs to. Empty until first assignment;
    /// two entries only transiently during handoff.
    pub clusters: BTreeSet<ClusterId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A proxy instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyInstance {
    /// Identifier.
    pub id: ProxyId,
    /// Address.
    pub addr: InstanceAddr,
    /// Runtime status.
    pub status: InstanceStatus,
    /// Storage instances this proxy routes to.
    pub backends: BTreeSet<StorageId>,
    /// Access entries this proxy is bound to.
    pub entries: BTreeSet<EntryId>,
    /// Owning cluster.
    pub cluster: Option<ClusterId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Directed streaming-replication link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEdge {
    /// Identifier.
    pub id: EdgeId,
    /// Sending side.
    pub ejector: StorageId,
    /// Receiving side.
    pub receiver: StorageId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Window during which an ejector may feed more than one receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildWindow {
    /// Ejector being rebuilt.
    pub ejector: StorageId,
    /// Receivers being replaced; they lose their edge when the window
    /// is finished.
    pub old_receivers: BTreeSet<StorageId>,
    /// Receivers being brought up; they lose their edge when the window
    /// is aborted.
    pub new_receivers: BTreeSet<StorageId>,
    /// When the window was opened.
    pub opened_at: DateTime<Utc>,
}

// =============================================================================
// ACCESS ENTRIES
// =============================================================================

/// Endpoint technology behind an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// DNS record set.
    Dns,
    /// Load-balancer VIP target group.
    LoadBalancer,
    /// Service-mesh / service-registry name.
    ServiceMesh,
}

impl EntryKind {
    /// Kind name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Dns => "dns",
            EntryKind::LoadBalancer => "load_balancer",
            EntryKind::ServiceMesh => "service_mesh",
        }
    }
}

/// Purpose of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryRole {
    /// Write / main entry.
    Primary,
    /// Read-only entry.
    Replica,
    /// Per-node entry for topology-aware clients.
    Topology,
}

/// Instance bound behind an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryMember {
    /// A storage instance.
    Storage(StorageId),
    /// A proxy instance.
    Proxy(ProxyId),
}

/// How an entry resolves. The two modes are exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryBinding {
    /// Resolves directly to these instances.
    Members(BTreeSet<EntryMember>),
    /// Resolves to another entry.
    ForwardTo(EntryId),
}

impl EntryBinding {
    /// Members if bound directly.
    pub fn members(&self) -> Option<&BTreeSet<EntryMember>> {
        match self {
            EntryBinding::Members(m) => Some(m),
            EntryBinding::ForwardTo(_) => None,
        }
    }
}

/// Externally resolvable name bound to cluster instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    /// Identifier.
    pub id: EntryId,
    /// Owning cluster.
    pub cluster: ClusterId,
    /// Endpoint technology.
    pub kind: EntryKind,
    /// Domain, VIP or registry name.
    pub name: String,
    /// Port clients connect to.
    pub port: u16,
    /// Purpose.
    pub role: EntryRole,
    /// Resolution mode.
    pub binding: EntryBinding,
}

// =============================================================================
// CLUSTERS
// =============================================================================

/// Externally visible serving phase (derived).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterPhase {
    /// Reachable through at least one primary entry.
    Online,
    /// No primary entry resolves to a member.
    Offline,
}

/// Externally visible health (derived).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    /// Every member running.
    Normal,
    /// At least one member not running.
    Abnormal,
}

/// `(business, name, type)` uniqueness key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterKey {
    /// Owning business.
    pub business_id: u64,
    /// Cluster name.
    pub name: String,
    /// Shape type name.
    pub cluster_type: String,
}

/// A cluster aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Identifier.
    pub id: ClusterId,
    /// Owning business.
    pub business_id: u64,
    /// Cluster name.
    pub name: String,
    /// Topology shape.
    pub shape: ClusterShape,
    /// Primary domain; never changes after creation.
    pub immutable_domain: String,
    /// Member proxies.
    pub proxies: BTreeSet<ProxyId>,
    /// Member storages.
    pub storages: BTreeSet<StorageId>,
    /// Owned access entries.
    pub entries: BTreeSet<EntryId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last committed mutation.
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// Uniqueness key.
    pub fn key(&self) -> ClusterKey {
        ClusterKey {
            business_id: self.business_id,
            name: self.name.clone(),
            cluster_type: self.shape.type_name().to_string(),
        }
    }
}

/// Derived health summary of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSummary {
    /// Identifier.
    pub id: ClusterId,
    /// Primary domain.
    pub domain: String,
    /// Shape type name.
    pub cluster_type: String,
    /// Derived phase.
    pub phase: ClusterPhase,
    /// Derived status.
    pub status: ClusterStatus,
    /// Number of proxies.
    pub proxy_count: usize,
    /// Number of storages.
    pub storage_count: usize,
    /// Number of replication edges between members.
    pub edge_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_addr_display() {
        assert_eq!(InstanceAddr::new("10.0.0.1", 30000).to_string(), "10.0.0.1:30000");
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ClusterId::new(), ClusterId::new());
    }

    #[test]
    fn test_id_serializes_as_plain_uuid() {
        let id = StorageId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
    }

    #[test]
    fn test_inner_role_master_like() {
        assert!(InnerRole::Master.is_master_like());
        assert!(!InnerRole::Slave.is_master_like());
    }

    #[test]
    fn test_binding_members() {
        let forward = EntryBinding::ForwardTo(EntryId::new());
        assert!(forward.members().is_none());
        let direct = EntryBinding::Members(BTreeSet::new());
        assert!(direct.members().unwrap().is_empty());
    }
}
