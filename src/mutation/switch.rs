//! Instance replacement: move every binding from an old instance to a new
//! one in a single transaction.

use super::engine::{Applied, TopologyEngine};
use super::errors::MutationResult;
use super::placement::{
    place_proxy, place_storage, proxy_labels, replace_backend, stage_inventory, stage_registration, storage_labels,
};
use super::report::OperationReport;
use super::request::{InstanceSpec, StorageSpec};
use crate::access::AccessEntryRegistrar;
use crate::observability::Event;
use crate::outbox::InventoryCall;
use crate::precheck::{self, PrecheckError};
use crate::topology::{
    ClusterId, EntryMember, InstanceStatus, ProxyId, ReplicationEdge, StorageId, Transaction,
};

impl TopologyEngine {
    /// Replace a storage instance. The new instance inherits role, inner
    /// role, shard, replication edges, entry bindings, proxy routes and
    /// rebuild windows; the old one leaves the cluster as unavailable.
    pub fn switch_storage(
        &self,
        cluster: ClusterId,
        old: StorageId,
        new: &InstanceSpec,
    ) -> MutationResult<OperationReport> {
        self.run("SWITCH_STORAGE", Event::InstanceSwitched, &new.addr().to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            precheck::check_storages_member(tx.graph(), &record, &[old])?;
            let previous = tx.graph().storage(old)?.clone();
            let addr = new.addr();
            if addr == previous.addr {
                return Err(PrecheckError::DuplicateAddress { addr }.into());
            }
            precheck::check_storages_unassigned(tx.graph(), &[addr])?;

            let spec = StorageSpec {
                host: new.host.clone(),
                port: new.port,
                role: previous.role,
                inner_role: previous.inner_role,
                shard: previous.shard.clone(),
                replica_of: None,
            };
            let replacement = place_storage(tx, cluster, &spec)?;
            move_edges(tx, old, replacement);
            move_windows(tx, old, replacement);
            AccessEntryRegistrar::replace_member(tx, EntryMember::Storage(old), EntryMember::Storage(replacement))?;
            replace_backend(tx, old, replacement);

            let graph = tx.graph_mut();
            graph.detach_storage(cluster, old)?;
            graph.storage_mut(old)?.status = InstanceStatus::Unavailable;
            graph.storage_mut(replacement)?.status = InstanceStatus::Running;

            let labels = storage_labels(tx.graph(), &record, &[replacement])?;
            stage_registration(tx, &record, labels);
            stage_inventory(tx, cluster, InventoryCall::DeleteServiceInstances {
                domain: record.immutable_domain.clone(),
                addrs: vec![previous.addr],
            });
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }

    /// Replace a proxy. The new proxy takes over the old one's backends and
    /// entry bindings; the old one is detached as unavailable.
    pub fn switch_proxy(&self, cluster: ClusterId, old: ProxyId, new: &InstanceSpec) -> MutationResult<OperationReport> {
        self.run("SWITCH_PROXY", Event::InstanceSwitched, &new.addr().to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            let port = precheck::check_shape_accepts_proxies(&record)?;
            precheck::check_proxies_member(tx.graph(), &record, &[old])?;
            let previous = tx.graph().proxy(old)?.clone();
            let addrs = [new.addr()];
            if addrs[0] == previous.addr {
                return Err(PrecheckError::DuplicateAddress { addr: previous.addr }.into());
            }
            precheck::check_proxy_port_uniform(port, &addrs)?;
            precheck::check_proxies_unassigned(tx.graph(), &addrs)?;
            precheck::check_proxies_empty_backends(tx.graph(), &addrs)?;

            let replacement = place_proxy(tx, cluster, new)?;
            tx.graph_mut().proxy_mut(replacement)?.backends = previous.backends.clone();
            AccessEntryRegistrar::replace_member(tx, EntryMember::Proxy(old), EntryMember::Proxy(replacement))?;

            let graph = tx.graph_mut();
            graph.detach_proxy(cluster, old)?;
            graph.proxy_mut(old)?.status = InstanceStatus::Unavailable;
            graph.proxy_mut(replacement)?.status = InstanceStatus::Running;

            let labels = proxy_labels(tx.graph(), &record, &[replacement])?;
            stage_registration(tx, &record, labels);
            stage_inventory(tx, cluster, InventoryCall::DeleteServiceInstances {
                domain: record.immutable_domain.clone(),
                addrs: vec![previous.addr],
            });
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }
}

/// Re-point every edge touching `old` at `new`.
fn move_edges(tx: &mut Transaction, old: StorageId, new: StorageId) {
    let graph = tx.graph_mut();
    let edges: Vec<ReplicationEdge> = graph.remove_edges_touching(old);
    for edge in edges {
        let ejector = if edge.ejector == old { new } else { edge.ejector };
        let receiver = if edge.receiver == old { new } else { edge.receiver };
        if ejector != receiver && graph.edge_between(ejector, receiver).is_none() {
            graph.add_edge(ejector, receiver);
        }
    }
}

/// Re-key rebuild windows from `old` to `new`.
fn move_windows(tx: &mut Transaction, old: StorageId, new: StorageId) {
    let graph = tx.graph_mut();
    if let Some(mut window) = graph.close_rebuild_window(old) {
        window.ejector = new;
        graph.open_rebuild_window(window);
    }
    for window in graph.rebuild_windows.values_mut() {
        if window.old_receivers.remove(&old) {
            window.old_receivers.insert(new);
        }
        if window.new_receivers.remove(&old) {
            window.new_receivers.insert(new);
        }
    }
}
