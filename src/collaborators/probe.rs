//! Health probe collaborator, used by migration precheck

use serde::{Deserialize, Serialize};

use super::errors::CollaboratorResult;
use crate::topology::InstanceAddr;

/// What a probe learned about an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProbe {
    /// Answered an authenticated ping.
    pub reachable: bool,
    /// Estimated data size on disk / in memory, in bytes.
    pub data_size_bytes: u64,
}

/// Health probe client.
pub trait HealthProbe: Send + Sync {
    /// Authenticate and ping an instance, and estimate its data size.
    fn probe_instance(&self, addr: &InstanceAddr, password: &str) -> CollaboratorResult<InstanceProbe>;

    /// Free bytes on the data disk of a host.
    fn host_free_disk_bytes(&self, ip: &str) -> CollaboratorResult<u64>;

    /// Whether a name (domain or VIP) answers on `port`.
    fn probe_endpoint(&self, name: &str, port: u16) -> CollaboratorResult<bool>;
}
