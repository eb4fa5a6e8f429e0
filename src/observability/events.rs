//! Observable control-plane events
//!
//! Events are explicit and typed; the string form is what lands in the log.

use std::fmt;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Process
    /// Configuration loaded
    ConfigLoaded,
    /// Topology store opened
    StoreOpened,
    /// Snapshot failed its checksum or invariants (FATAL)
    StoreCorrupted,

    // Topology mutations
    /// Cluster created
    ClusterCreated,
    /// Cluster taken out of service
    ClusterDisabled,
    /// Cluster put back into service
    ClusterEnabled,
    /// Whole cluster decommissioned
    ClusterDecommissioned,
    /// Proxies attached
    ProxiesAdded,
    /// Proxies detached
    ProxiesDeleted,
    /// Proxies decommissioned
    ProxiesDecommissioned,
    /// Storages attached
    StoragesAdded,
    /// Storages detached
    StoragesDeleted,
    /// Storages decommissioned
    StoragesDecommissioned,
    /// Instance replaced by another
    InstanceSwitched,
    /// Replication rebuild window opened
    RebuildOpened,
    /// Replication rebuild window closed
    RebuildClosed,
    /// Replication edge established
    ReplicationSynced,
    /// Master roles swapped
    MasterSwapped,
    /// Load balancer placed in front of a cluster
    LoadBalancerAttached,
    /// Load balancer removed
    LoadBalancerDetached,
    /// Host returned to the idle pool
    HostReleased,

    // Failures
    /// Operation rejected before any mutation
    PrecheckRejected,
    /// Transaction aborted on an invariant violation
    InvariantAborted,

    // Outbox
    /// Side effect delivered
    SideEffectDelivered,
    /// Side effect failed, kept for retry
    SideEffectDeferred,
    /// Side effect parked after too many attempts
    SideEffectDeadLettered,

    // Migration
    /// Job accepted
    MigrationStarted,
    /// Job moved to another state
    MigrationAdvanced,
    /// Remote submission failed, retried on the next advance
    MigrationDispatchDeferred,
    /// Data-check cycle submitted
    MigrationDataCheckStarted,
    /// Stop requested on every task
    MigrationDisconnectRequested,
    /// Job finished
    MigrationDone,
    /// Job failed
    MigrationFailed,
    /// No task progress for too long
    MigrationStalled,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::StoreOpened => "STORE_OPENED",
            Event::StoreCorrupted => "STORE_CORRUPTED",

            Event::ClusterCreated => "CLUSTER_CREATED",
            Event::ClusterDisabled => "CLUSTER_DISABLED",
            Event::ClusterEnabled => "CLUSTER_ENABLED",
            Event::ClusterDecommissioned => "CLUSTER_DECOMMISSIONED",
            Event::ProxiesAdded => "PROXIES_ADDED",
            Event::ProxiesDeleted => "PROXIES_DELETED",
            Event::ProxiesDecommissioned => "PROXIES_DECOMMISSIONED",
            Event::StoragesAdded => "STORAGES_ADDED",
            Event::StoragesDeleted => "STORAGES_DELETED",
            Event::StoragesDecommissioned => "STORAGES_DECOMMISSIONED",
            Event::InstanceSwitched => "INSTANCE_SWITCHED",
            Event::RebuildOpened => "REBUILD_OPENED",
            Event::RebuildClosed => "REBUILD_CLOSED",
            Event::ReplicationSynced => "REPLICATION_SYNCED",
            Event::MasterSwapped => "MASTER_SWAPPED",
            Event::LoadBalancerAttached => "LOAD_BALANCER_ATTACHED",
            Event::LoadBalancerDetached => "LOAD_BALANCER_DETACHED",
            Event::HostReleased => "HOST_RELEASED",

            Event::PrecheckRejected => "PRECHECK_REJECTED",
            Event::InvariantAborted => "INVARIANT_ABORTED",

            Event::SideEffectDelivered => "SIDE_EFFECT_DELIVERED",
            Event::SideEffectDeferred => "SIDE_EFFECT_DEFERRED",
            Event::SideEffectDeadLettered => "SIDE_EFFECT_DEAD_LETTERED",

            Event::MigrationStarted => "MIGRATION_STARTED",
            Event::MigrationAdvanced => "MIGRATION_ADVANCED",
            Event::MigrationDispatchDeferred => "MIGRATION_DISPATCH_DEFERRED",
            Event::MigrationDataCheckStarted => "MIGRATION_DATA_CHECK_STARTED",
            Event::MigrationDisconnectRequested => "MIGRATION_DISCONNECT_REQUESTED",
            Event::MigrationDone => "MIGRATION_DONE",
            Event::MigrationFailed => "MIGRATION_FAILED",
            Event::MigrationStalled => "MIGRATION_STALLED",
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::StoreCorrupted)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_upper_snake() {
        let events = [
            Event::ConfigLoaded,
            Event::ClusterCreated,
            Event::PrecheckRejected,
            Event::SideEffectDeferred,
            Event::MigrationDataCheckStarted,
            Event::MigrationStalled,
        ];
        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_fatal_events() {
        assert!(Event::StoreCorrupted.is_fatal());
        assert!(!Event::MigrationFailed.is_fatal());
    }
}
