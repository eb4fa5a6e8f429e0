//! Topology Mutation Engine
//!
//! Every operation runs as one store transaction: prechecks against the
//! working copy, graph edits, staged side effects. A rejected precheck
//! leaves the graph untouched. Side effects are delivered after commit and
//! survive in the outbox when a collaborator is down.

mod cluster;
mod engine;
mod errors;
mod membership;
mod placement;
mod replication;
mod report;
mod request;
mod switch;
#[cfg(test)]
mod testkit;

pub use engine::TopologyEngine;
pub use errors::{MutationError, MutationResult};
pub use report::OperationReport;
pub use request::{CreateClusterRequest, InstanceSpec, RedoTarget, StorageSpec};
