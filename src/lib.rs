//! topoplane - topology control plane for database clusters
//!
//! Keeps the authoritative graph of clusters, instances, replication edges
//! and access entries; applies topology mutations atomically behind
//! prechecks; and drives long-running data migrations as resumable,
//! polled state machines.

pub mod access;
pub mod cli;
pub mod collaborators;
pub mod config;
pub mod durable;
pub mod errors;
pub mod migration;
pub mod mutation;
pub mod observability;
pub mod outbox;
pub mod precheck;
pub mod topology;
