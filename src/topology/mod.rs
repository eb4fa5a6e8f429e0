//! Topology Store
//!
//! Durable relational representation of clusters, machines, instances,
//! replication edges and access entries.
//!
//! - Records are created only inside a mutation-engine operation
//! - Every operation is one store transaction
//! - Invariants are checked before every commit
//! - Cluster phase and status are derived, never stored

mod errors;
mod graph;
mod model;
mod shape;
mod store;

pub use errors::{TopologyError, TopologyResult};
pub use graph::TopologyGraph;
pub use model::{
    AccessEntry, Cluster, ClusterId, ClusterKey, ClusterPhase, ClusterStatus, ClusterSummary,
    EdgeId, EntryBinding, EntryId, EntryKind, EntryMember, EntryRole, HostPool, HostSpec,
    InnerRole, InstanceAddr, InstanceStatus, Machine, MachineRole, MachineSpec, ProxyId,
    ProxyInstance, RebuildWindow, ReplicationEdge, StorageId, StorageInstance, StorageRole,
};
pub use shape::{ClusterShape, KvEngine};
pub use store::{Committed, TopologyStore, Transaction};
