//! Replication rules: role direction, duplicate standbys, rebuild windows.

use super::errors::{PrecheckError, PrecheckResult};
use crate::topology::{InstanceAddr, InstanceStatus, StorageId, StorageInstance, TopologyGraph};

/// New edges may only originate from a master-like instance.
pub fn check_inner_role_master(storage: &StorageInstance) -> PrecheckResult<()> {
    if !storage.inner_role.is_master_like() {
        return Err(PrecheckError::NotMaster {
            addr: storage.addr.clone(),
            inner_role: storage.inner_role.as_str(),
        });
    }
    Ok(())
}

/// None of the designated receivers may already be a running receiver of
/// the ejector.
pub fn check_no_running_receiver(
    graph: &TopologyGraph,
    ejector: &StorageInstance,
    receivers: &[InstanceAddr],
) -> PrecheckResult<()> {
    for receiver in graph.receivers_of(ejector.id) {
        if receiver.status == InstanceStatus::Running && receivers.contains(&receiver.addr) {
            return Err(PrecheckError::ReceiverAlreadyRunning {
                ejector: ejector.addr.clone(),
                receiver: receiver.addr.clone(),
            });
        }
    }
    Ok(())
}

/// No edge may already exist between the two instances.
pub fn check_no_edge(graph: &TopologyGraph, ejector: &StorageInstance, receiver: &StorageInstance) -> PrecheckResult<()> {
    if graph.edge_between(ejector.id, receiver.id).is_some() {
        return Err(PrecheckError::EdgeExists {
            ejector: ejector.addr.clone(),
            receiver: receiver.addr.clone(),
        });
    }
    Ok(())
}

/// No rebuild window may be open on the ejector.
pub fn check_no_rebuild_window(graph: &TopologyGraph, ejector: &StorageInstance) -> PrecheckResult<()> {
    if graph.rebuild_window(ejector.id).is_some() {
        return Err(PrecheckError::RebuildInProgress {
            ejector: ejector.addr.clone(),
        });
    }
    Ok(())
}

/// A rebuild window must be open on the ejector.
pub fn check_rebuild_window_open(graph: &TopologyGraph, ejector: StorageId) -> PrecheckResult<()> {
    if graph.rebuild_window(ejector).is_none() {
        let addr = graph
            .storage(ejector)
            .map(|s| s.addr.clone())
            .unwrap_or_else(|_| InstanceAddr::new(ejector.to_string(), 0));
        return Err(PrecheckError::NoRebuildWindow { ejector: addr });
    }
    Ok(())
}
