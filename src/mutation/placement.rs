//! Instance placement and retirement inside a transaction.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};

use super::request::{InstanceSpec, StorageSpec};
use crate::access::AccessEntryRegistrar;
use crate::outbox::{CredentialCall, InventoryCall, ServiceLabels, SideEffect};
use crate::topology::{
    Cluster, ClusterId, ClusterPhase, EntryMember, InstanceAddr, InstanceStatus, MachineRole, ProxyId,
    ProxyInstance, StorageId, StorageInstance, TopologyError, TopologyGraph, TopologyResult, Transaction,
};

// =============================================================================
// PLACEMENT
// =============================================================================

/// Reuse the storage record at the spec's address or create it, then make
/// it a running member of `cluster` with the requested role.
pub(super) fn place_storage(tx: &mut Transaction, cluster: ClusterId, spec: &StorageSpec) -> TopologyResult<StorageId> {
    let addr = spec.addr();
    let graph = tx.graph_mut();
    graph.claim_host(&spec.host, MachineRole::Storage);

    let id = match graph.storage_by_addr(&addr) {
        Some(existing) => existing.id,
        None => {
            let storage = StorageInstance {
                id: StorageId::new(),
                addr,
                role: spec.role,
                inner_role: spec.inner_role,
                status: InstanceStatus::Running,
                shard: spec.shard.clone(),
                clusters: BTreeSet::new(),
                created_at: Utc::now(),
            };
            let id = storage.id;
            graph.insert_storage(storage);
            id
        }
    };

    let storage = graph.storage_mut(id)?;
    storage.role = spec.role;
    storage.inner_role = spec.inner_role;
    storage.shard = spec.shard.clone();
    storage.status = InstanceStatus::Running;
    graph.attach_storage(cluster, id)?;
    Ok(id)
}

/// Reuse the proxy record at the spec's address or create it, then attach
/// it to `cluster`.
pub(super) fn place_proxy(tx: &mut Transaction, cluster: ClusterId, spec: &InstanceSpec) -> TopologyResult<ProxyId> {
    let addr = spec.addr();
    let graph = tx.graph_mut();
    graph.claim_host(&spec.host, MachineRole::Proxy);

    let id = match graph.proxy_by_addr(&addr) {
        Some(existing) => existing.id,
        None => {
            let proxy = ProxyInstance {
                id: ProxyId::new(),
                addr,
                status: InstanceStatus::Running,
                backends: BTreeSet::new(),
                entries: BTreeSet::new(),
                cluster: None,
                created_at: Utc::now(),
            };
            let id = proxy.id;
            graph.insert_proxy(proxy);
            id
        }
    };

    graph.proxy_mut(id)?.status = InstanceStatus::Running;
    graph.attach_proxy(cluster, id)?;
    Ok(id)
}

/// Add an edge from each spec's `replica_of` source to the spec itself.
pub(super) fn link_replicas(tx: &mut Transaction, specs: &[StorageSpec]) -> TopologyResult<()> {
    for spec in specs {
        let Some(source) = &spec.replica_of else {
            continue;
        };
        let ejector = storage_id_at(tx.graph(), source)?;
        let receiver = storage_id_at(tx.graph(), &spec.addr())?;
        if tx.graph().edge_between(ejector, receiver).is_none() {
            tx.graph_mut().add_edge(ejector, receiver);
        }
    }
    Ok(())
}

pub(super) fn storage_id_at(graph: &TopologyGraph, addr: &InstanceAddr) -> TopologyResult<StorageId> {
    graph
        .storage_by_addr(addr)
        .map(|s| s.id)
        .ok_or_else(|| TopologyError::not_found("storage instance", addr))
}

// =============================================================================
// ROUTING
// =============================================================================

/// Master-inner-role members of a cluster.
pub(super) fn master_ids(graph: &TopologyGraph, cluster: ClusterId) -> TopologyResult<BTreeSet<StorageId>> {
    let cluster = graph.cluster(cluster)?;
    Ok(graph.masters_of(cluster).into_iter().map(|s| s.id).collect())
}

/// Members a primary entry resolves to: the proxies for a proxied shape,
/// the masters otherwise.
pub(super) fn serving_members(graph: &TopologyGraph, cluster: ClusterId) -> TopologyResult<Vec<EntryMember>> {
    let record = graph.cluster(cluster)?;
    if record.shape.has_proxies() {
        Ok(record.proxies.iter().map(|id| EntryMember::Proxy(*id)).collect())
    } else {
        Ok(master_ids(graph, cluster)?.into_iter().map(EntryMember::Storage).collect())
    }
}

/// Port of the primary entry: the proxy port, or the first master's port.
pub(super) fn serving_port(graph: &TopologyGraph, cluster: ClusterId) -> TopologyResult<u16> {
    let record = graph.cluster(cluster)?;
    if let Some(port) = record.shape.proxy_port() {
        return Ok(port);
    }
    graph
        .masters_of(record)
        .first()
        .map(|s| s.addr.port)
        .ok_or_else(|| TopologyError::not_found("master storage", &record.immutable_domain))
}

/// Route every listed proxy to all masters of the cluster.
pub(super) fn route_to_masters(tx: &mut Transaction, cluster: ClusterId, proxies: &[ProxyId]) -> TopologyResult<()> {
    let masters = master_ids(tx.graph(), cluster)?;
    for proxy in proxies {
        tx.graph_mut().proxy_mut(*proxy)?.backends.extend(masters.iter().copied());
    }
    Ok(())
}

/// Replace `old` with `new` in every proxy routing to `old`.
pub(super) fn replace_backend(tx: &mut Transaction, old: StorageId, new: StorageId) {
    for proxy in tx.graph_mut().proxies.values_mut() {
        if proxy.backends.remove(&old) {
            proxy.backends.insert(new);
        }
    }
}

/// Stop every proxy in `proxies` from routing to `storage`.
pub(super) fn drop_backend(tx: &mut Transaction, proxies: &BTreeSet<ProxyId>, storage: StorageId) {
    for (id, proxy) in tx.graph_mut().proxies.iter_mut() {
        if proxies.contains(id) {
            proxy.backends.remove(&storage);
        }
    }
}

/// Whether a primary entry currently resolves to at least one member.
pub(super) fn is_online(graph: &TopologyGraph, cluster: ClusterId) -> TopologyResult<bool> {
    Ok(graph.summary(cluster)?.phase == ClusterPhase::Online)
}

// =============================================================================
// INVENTORY
// =============================================================================

pub(super) fn stage_inventory(tx: &mut Transaction, cluster: ClusterId, call: InventoryCall) {
    tx.stage(Some(cluster), SideEffect::Inventory(call));
}

pub(super) fn storage_labels(graph: &TopologyGraph, cluster: &Cluster, ids: &[StorageId]) -> TopologyResult<Vec<ServiceLabels>> {
    ids.iter()
        .map(|id| {
            let storage = graph.storage(*id)?;
            Ok(ServiceLabels {
                business_id: cluster.business_id,
                domain: cluster.immutable_domain.clone(),
                role: storage.role.as_str().to_string(),
                addr: storage.addr.clone(),
            })
        })
        .collect()
}

pub(super) fn proxy_labels(graph: &TopologyGraph, cluster: &Cluster, ids: &[ProxyId]) -> TopologyResult<Vec<ServiceLabels>> {
    ids.iter()
        .map(|id| {
            Ok(ServiceLabels {
                business_id: cluster.business_id,
                domain: cluster.immutable_domain.clone(),
                role: MachineRole::Proxy.as_str().to_string(),
                addr: graph.proxy(*id)?.addr.clone(),
            })
        })
        .collect()
}

/// Stage host transfer and service registration for newly placed
/// instances.
pub(super) fn stage_registration(tx: &mut Transaction, cluster: &Cluster, labels: Vec<ServiceLabels>) {
    if labels.is_empty() {
        return;
    }
    let hosts: BTreeSet<String> = labels.iter().map(|l| l.addr.ip.clone()).collect();
    stage_inventory(tx, cluster.id, InventoryCall::TransferHosts {
        domain: cluster.immutable_domain.clone(),
        hosts: hosts.into_iter().collect(),
    });
    stage_inventory(tx, cluster.id, InventoryCall::RegisterServiceInstances { instances: labels });
}

// =============================================================================
// RETIREMENT
// =============================================================================

/// Instances removed by a decommission, collected for the inventory and
/// credential calls staged at the end of the operation.
#[derive(Debug, Default)]
pub(super) struct Retirement {
    addrs: Vec<InstanceAddr>,
    released_hosts: Vec<String>,
    passwords: BTreeMap<u32, Vec<InstanceAddr>>,
}

impl Retirement {
    /// Remove a proxy record and release its host if nothing else runs
    /// there.
    pub(super) fn retire_proxy(&mut self, tx: &mut Transaction, cluster: ClusterId, id: ProxyId) -> TopologyResult<()> {
        AccessEntryRegistrar::unbind_everywhere(tx, EntryMember::Proxy(id))?;
        tx.graph_mut().detach_proxy(cluster, id)?;
        if let Some(proxy) = tx.graph_mut().remove_proxy(id) {
            if tx.graph_mut().release_host_if_unused(&proxy.addr.ip) {
                self.released_hosts.push(proxy.addr.ip.clone());
            }
            self.addrs.push(proxy.addr);
        }
        Ok(())
    }

    /// Detach a storage instance from `cluster`. The record is removed with
    /// its edges and bindings only once no cluster claims it.
    pub(super) fn retire_storage(&mut self, tx: &mut Transaction, cluster: ClusterId, id: StorageId) -> TopologyResult<()> {
        let record = tx.graph().cluster(cluster)?.clone();
        let member = EntryMember::Storage(id);
        for entry in tx.graph().entries_binding(member) {
            if record.entries.contains(&entry) {
                AccessEntryRegistrar::unbind(tx, entry, &[member])?;
            }
        }
        drop_backend(tx, &record.proxies, id);
        tx.graph_mut().detach_storage(cluster, id)?;

        let storage = tx.graph().storage(id)?.clone();
        self.addrs.push(storage.addr.clone());
        if !storage.clusters.is_empty() {
            return Ok(());
        }

        AccessEntryRegistrar::unbind_everywhere(tx, member)?;
        let graph = tx.graph_mut();
        for proxy in graph.proxies.values_mut() {
            proxy.backends.remove(&id);
        }
        graph.remove_edges_touching(id);
        graph.close_rebuild_window(id);
        for window in graph.rebuild_windows.values_mut() {
            window.old_receivers.remove(&id);
            window.new_receivers.remove(&id);
        }
        graph.remove_storage(id);

        let zone = graph.machine(&storage.addr.ip).map(|m| m.cloud_zone).unwrap_or_default();
        if graph.release_host_if_unused(&storage.addr.ip) {
            self.released_hosts.push(storage.addr.ip.clone());
        }
        self.passwords.entry(zone).or_default().push(storage.addr);
        Ok(())
    }

    /// Stage the inventory and credential cleanup. Returns the released
    /// hosts.
    pub(super) fn stage(self, tx: &mut Transaction, cluster: ClusterId, domain: &str, usernames: &[String]) -> Vec<String> {
        if !self.addrs.is_empty() {
            stage_inventory(tx, cluster, InventoryCall::DeleteServiceInstances {
                domain: domain.to_string(),
                addrs: self.addrs,
            });
        }
        if !self.released_hosts.is_empty() {
            stage_inventory(tx, cluster, InventoryCall::RecycleHosts {
                hosts: self.released_hosts.clone(),
            });
        }
        if !usernames.is_empty() {
            for (cloud_zone, instances) in self.passwords {
                tx.stage(
                    Some(cluster),
                    SideEffect::Credential(CredentialCall::DeletePasswords {
                        cloud_zone,
                        instances,
                        usernames: usernames.to_vec(),
                    }),
                );
            }
        }
        self.released_hosts
    }
}
