//! Inventory / service-directory collaborator

use super::errors::CollaboratorResult;
use crate::outbox::ServiceLabels;
use crate::topology::{ClusterId, InstanceAddr};

/// Inventory (CMDB) and service-directory client.
///
/// Called after the topology transaction commits. Implementations must be
/// idempotent: repeating a call that already took effect succeeds.
pub trait InventoryClient: Send + Sync {
    /// Create the module / topology node for a cluster.
    fn create_module(&self, cluster_id: ClusterId, business_id: u64, domain: &str) -> CollaboratorResult<()>;

    /// Transfer hosts under the module of `domain`.
    fn transfer_hosts(&self, domain: &str, hosts: &[String]) -> CollaboratorResult<()>;

    /// Register service instances with their labels.
    fn register_service_instances(&self, instances: &[ServiceLabels]) -> CollaboratorResult<()>;

    /// Delete service instances of `domain`.
    fn delete_service_instances(&self, domain: &str, addrs: &[InstanceAddr]) -> CollaboratorResult<()>;

    /// Transfer hosts to the recycle pool.
    fn recycle_hosts(&self, hosts: &[String]) -> CollaboratorResult<()>;

    /// Delete the module of a removed cluster.
    fn delete_module(&self, cluster_id: ClusterId, domain: &str) -> CollaboratorResult<()>;
}
