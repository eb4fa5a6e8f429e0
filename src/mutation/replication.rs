//! Replication Changes
//!
//! Rebuilding a master's receiver happens in a window: the new edge is
//! added while the old one still exists, and the window is later finished
//! (old edges dropped) or aborted (new edges dropped). Sync and master swap
//! cover the tendis-style master replacement.

use chrono::Utc;
use std::collections::BTreeSet;

use super::engine::{Applied, TopologyEngine};
use super::errors::MutationResult;
use super::placement::{place_storage, replace_backend, stage_registration, storage_labels, Retirement};
use super::report::OperationReport;
use super::request::{RedoTarget, StorageSpec};
use crate::access::AccessEntryRegistrar;
use crate::observability::Event;
use crate::precheck::{self, PrecheckError};
use crate::topology::{
    Cluster, ClusterId, EntryMember, InnerRole, InstanceAddr, InstanceStatus, RebuildWindow, StorageId,
    StorageInstance, StorageRole, TopologyGraph, Transaction,
};

impl TopologyEngine {
    /// Open a rebuild window on each ejector and attach its new receiver.
    pub fn redo_slaves(&self, cluster: ClusterId, targets: &[RedoTarget]) -> MutationResult<OperationReport> {
        let target = targets
            .iter()
            .map(|t| t.receiver.addr().to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.run("REDO_SLAVES", Event::RebuildOpened, &target, |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            precheck::check_not_empty(targets, "rebuild targets")?;
            let ejectors: Vec<StorageId> = targets.iter().map(|t| t.ejector).collect();
            check_distinct_ejectors(tx.graph(), &ejectors)?;
            precheck::check_storages_member(tx.graph(), &record, &ejectors)?;

            let receivers: Vec<InstanceAddr> = targets.iter().map(|t| t.receiver.addr()).collect();
            precheck::check_addrs_distinct(receivers.iter())?;
            for t in targets {
                let ejector = tx.graph().storage(t.ejector)?;
                precheck::check_inner_role_master(ejector)?;
                precheck::check_no_rebuild_window(tx.graph(), ejector)?;
                let addr = t.receiver.addr();
                precheck::check_no_running_receiver(tx.graph(), ejector, std::slice::from_ref(&addr))?;
                if addr == ejector.addr {
                    return Err(PrecheckError::DuplicateAddress { addr }.into());
                }
            }
            check_receivers_free(tx.graph(), &record, &receivers)?;

            let mut placed = Vec::with_capacity(targets.len());
            for t in targets {
                let ejector = tx.graph().storage(t.ejector)?.clone();
                let spec = StorageSpec {
                    host: t.receiver.host.clone(),
                    port: t.receiver.port,
                    role: StorageRole::Slave,
                    inner_role: InnerRole::Slave,
                    shard: ejector.shard.clone(),
                    replica_of: Some(ejector.addr.clone()),
                };
                let receiver = place_storage(tx, cluster, &spec)?;
                let old_receivers: BTreeSet<StorageId> = tx
                    .graph()
                    .edges_from(ejector.id)
                    .iter()
                    .map(|e| e.receiver)
                    .filter(|r| *r != receiver)
                    .collect();

                let graph = tx.graph_mut();
                graph.open_rebuild_window(RebuildWindow {
                    ejector: ejector.id,
                    old_receivers,
                    new_receivers: BTreeSet::from([receiver]),
                    opened_at: Utc::now(),
                });
                if graph.edge_between(ejector.id, receiver).is_none() {
                    graph.add_edge(ejector.id, receiver);
                }
                placed.push(receiver);
            }

            let labels = storage_labels(tx.graph(), &record, &placed)?;
            stage_registration(tx, &record, labels);
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }

    /// Close the rebuild window on `ejector`, keeping the new receivers and
    /// dropping the edges to the old ones.
    pub fn finish_redo(&self, cluster: ClusterId, ejector: StorageId) -> MutationResult<OperationReport> {
        self.run("FINISH_REDO", Event::RebuildClosed, &ejector.to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            precheck::check_storages_member(tx.graph(), &record, &[ejector])?;
            precheck::check_rebuild_window_open(tx.graph(), ejector)?;

            let graph = tx.graph_mut();
            let Some(window) = graph.close_rebuild_window(ejector) else {
                return Ok(Applied::cluster(cluster));
            };
            for old in &window.old_receivers {
                let edge = graph.edge_between(ejector, *old).map(|e| e.id);
                if let Some(edge) = edge {
                    graph.remove_edge(edge);
                }
                graph.storage_mut(*old)?.status = InstanceStatus::Unavailable;
            }
            for new in &window.new_receivers {
                graph.storage_mut(*new)?.status = InstanceStatus::Running;
            }
            graph.touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }

    /// Close the rebuild window on `ejector`, dropping the new receivers'
    /// edges. New receivers left without any edge are retired.
    pub fn abort_redo(&self, cluster: ClusterId, ejector: StorageId) -> MutationResult<OperationReport> {
        self.run("ABORT_REDO", Event::RebuildClosed, &ejector.to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            precheck::check_storages_member(tx.graph(), &record, &[ejector])?;
            precheck::check_rebuild_window_open(tx.graph(), ejector)?;

            let Some(window) = tx.graph_mut().close_rebuild_window(ejector) else {
                return Ok(Applied::cluster(cluster));
            };
            let mut orphans = Vec::new();
            for new in &window.new_receivers {
                let graph = tx.graph_mut();
                let edge = graph.edge_between(ejector, *new).map(|e| e.id);
                if let Some(edge) = edge {
                    graph.remove_edge(edge);
                }
                if graph.edges_from(*new).is_empty() && graph.edges_to(*new).is_empty() {
                    orphans.push(*new);
                }
            }

            let mut retirement = Retirement::default();
            for orphan in orphans {
                if record.storages.contains(&orphan) {
                    retirement.retire_storage(tx, cluster, orphan)?;
                }
            }
            let released = retirement.stage(
                tx,
                cluster,
                &record.immutable_domain,
                &self.settings().privileged_usernames,
            );
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied {
                cluster,
                released_hosts: released,
            })
        })
    }

    /// Start replicating from one master to another master of the same
    /// cluster, the first half of a master swap.
    pub fn make_sync(&self, cluster: ClusterId, ejector: StorageId, receiver: StorageId) -> MutationResult<OperationReport> {
        self.run("MAKE_SYNC", Event::ReplicationSynced, &ejector.to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            check_master_swap_shape(&record, "make_sync")?;
            let (from, to) = master_pair(tx.graph(), &record, ejector, receiver)?;
            precheck::check_no_edge(tx.graph(), &from, &to)?;
            precheck::check_no_edge(tx.graph(), &to, &from)?;

            let graph = tx.graph_mut();
            let existing: BTreeSet<StorageId> = graph.edges_from(ejector).iter().map(|e| e.receiver).collect();
            if !existing.is_empty() {
                match graph.rebuild_windows.get_mut(&ejector) {
                    Some(window) => {
                        window.new_receivers.insert(receiver);
                    }
                    None => graph.open_rebuild_window(RebuildWindow {
                        ejector,
                        old_receivers: existing,
                        new_receivers: BTreeSet::from([receiver]),
                        opened_at: Utc::now(),
                    }),
                }
            }
            graph.add_edge(ejector, receiver);
            graph.touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }

    /// Promote `new_master` in place of `old_master`: routes, entry
    /// bindings and the old master's remaining receivers move to the new
    /// master, and the old one is demoted to a slave.
    pub fn switch_tendis(
        &self,
        cluster: ClusterId,
        old_master: StorageId,
        new_master: StorageId,
    ) -> MutationResult<OperationReport> {
        self.run("SWITCH_TENDIS", Event::MasterSwapped, &new_master.to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            check_master_swap_shape(&record, "switch_tendis")?;
            let (from, to) = master_pair(tx.graph(), &record, old_master, new_master)?;
            // only the window opened by make_sync towards new_master may be open
            if let Some(window) = tx.graph().rebuild_window(old_master) {
                if window.new_receivers.iter().any(|r| *r != new_master) {
                    return Err(PrecheckError::RebuildInProgress { ejector: from.addr }.into());
                }
            }
            if let Some(receiver) = tx.graph().receivers_of(new_master).first() {
                return Err(PrecheckError::ReceiverAlreadyRunning {
                    ejector: to.addr.clone(),
                    receiver: receiver.addr.clone(),
                }
                .into());
            }

            let graph = tx.graph_mut();
            graph.close_rebuild_window(old_master);
            for edge in graph.remove_edges_touching(old_master) {
                if edge.ejector == old_master && edge.receiver != new_master {
                    graph.add_edge(new_master, edge.receiver);
                }
            }
            let shard = graph.storage(old_master)?.shard.clone();
            let promoted = graph.storage_mut(new_master)?;
            promoted.role = StorageRole::Master;
            promoted.inner_role = InnerRole::Master;
            promoted.shard = shard;
            let demoted = graph.storage_mut(old_master)?;
            demoted.role = StorageRole::Slave;
            demoted.inner_role = InnerRole::Slave;

            replace_backend(tx, old_master, new_master);
            swap_entry_member(tx, &record, old_master, new_master)?;
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn check_distinct_ejectors(graph: &TopologyGraph, ejectors: &[StorageId]) -> MutationResult<()> {
    let mut seen = BTreeSet::new();
    for id in ejectors {
        if !seen.insert(*id) {
            let addr = graph.storage(*id)?.addr.clone();
            return Err(PrecheckError::DuplicateAddress { addr }.into());
        }
    }
    Ok(())
}

/// Receivers must be new or free storage instances, or members of this
/// cluster that nothing replicates to yet.
fn check_receivers_free(graph: &TopologyGraph, cluster: &Cluster, receivers: &[InstanceAddr]) -> MutationResult<()> {
    for addr in receivers {
        let Some(existing) = graph.storage_by_addr(addr) else {
            continue;
        };
        let foreign = existing.clusters.iter().find(|c| **c != cluster.id);
        if let Some(other) = foreign {
            let domain = graph.cluster(*other)?.immutable_domain.clone();
            return Err(PrecheckError::InstanceAssigned {
                addr: addr.clone(),
                domain,
            }
            .into());
        }
        if let Some(edge) = graph.edges_to(existing.id).first() {
            let ejector = graph.storage(edge.ejector)?.addr.clone();
            return Err(PrecheckError::ReceiverAlreadyRunning {
                ejector,
                receiver: addr.clone(),
            }
            .into());
        }
    }
    Ok(())
}

fn check_master_swap_shape(cluster: &Cluster, operation: &'static str) -> MutationResult<()> {
    if !cluster.shape.supports_master_swap() {
        return Err(PrecheckError::UnsupportedShape {
            operation,
            cluster_type: cluster.shape.type_name().to_string(),
        }
        .into());
    }
    Ok(())
}

/// Both instances must be distinct master members of the cluster.
fn master_pair(
    graph: &TopologyGraph,
    cluster: &Cluster,
    a: StorageId,
    b: StorageId,
) -> MutationResult<(StorageInstance, StorageInstance)> {
    precheck::check_storages_member(graph, cluster, &[a, b])?;
    let first = graph.storage(a)?.clone();
    let second = graph.storage(b)?.clone();
    if a == b {
        return Err(PrecheckError::DuplicateAddress { addr: first.addr }.into());
    }
    precheck::check_inner_role_master(&first)?;
    precheck::check_inner_role_master(&second)?;
    Ok((first, second))
}

/// Move the old master's bindings on this cluster's entries to the new
/// master. A new master already bound to an entry just loses the old one.
fn swap_entry_member(tx: &mut Transaction, cluster: &Cluster, old: StorageId, new: StorageId) -> MutationResult<()> {
    let old_member = EntryMember::Storage(old);
    let new_member = EntryMember::Storage(new);
    for entry in tx.graph().entries_binding(old_member) {
        if !cluster.entries.contains(&entry) {
            continue;
        }
        AccessEntryRegistrar::unbind(tx, entry, &[old_member])?;
        AccessEntryRegistrar::bind(tx, entry, &[new_member])?;
    }
    Ok(())
}
