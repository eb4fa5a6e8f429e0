//! Proxy and storage membership: add, detach, decommission.

use std::collections::BTreeSet;

use super::engine::{Applied, TopologyEngine};
use super::errors::MutationResult;
use super::placement::{
    drop_backend, is_online, link_replicas, place_proxy, place_storage, proxy_labels, route_to_masters,
    stage_inventory, stage_registration, storage_labels, Retirement,
};
use super::report::OperationReport;
use super::request::{check_replica_sources, InstanceSpec, StorageSpec};
use crate::access::AccessEntryRegistrar;
use crate::observability::Event;
use crate::outbox::InventoryCall;
use crate::precheck;
use crate::topology::{
    ClusterId, EntryId, EntryMember, InstanceAddr, ProxyId, StorageId, TopologyError, Transaction,
};

impl TopologyEngine {
    // =========================================================================
    // PROXIES
    // =========================================================================

    /// Attach new proxies, route them to the masters and bind them to the
    /// primary entries.
    pub fn add_proxies(&self, cluster: ClusterId, proxies: &[InstanceSpec]) -> MutationResult<OperationReport> {
        self.run("ADD_PROXIES", Event::ProxiesAdded, &cluster.to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            let addrs: Vec<InstanceAddr> = proxies.iter().map(|p| p.addr()).collect();

            let port = precheck::check_shape_accepts_proxies(&record)?;
            precheck::check_not_empty(proxies, "proxies")?;
            precheck::check_proxy_port_uniform(port, &addrs)?;
            precheck::check_addrs_distinct(&addrs)?;
            precheck::check_proxies_unassigned(tx.graph(), &addrs)?;
            precheck::check_proxies_empty_backends(tx.graph(), &addrs)?;

            let online = is_online(tx.graph(), cluster)?;
            let ids = proxies
                .iter()
                .map(|spec| place_proxy(tx, cluster, spec))
                .collect::<Result<Vec<_>, TopologyError>>()?;
            route_to_masters(tx, cluster, &ids)?;
            if online {
                let members: Vec<EntryMember> = ids.iter().map(|id| EntryMember::Proxy(*id)).collect();
                for entry in AccessEntryRegistrar::direct_primary_entries(tx.graph(), cluster)? {
                    AccessEntryRegistrar::bind(tx, entry, &members)?;
                }
            }

            let labels = proxy_labels(tx.graph(), &record, &ids)?;
            stage_registration(tx, &record, labels);
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }

    /// Detach proxies from a cluster. The instance records and hosts stay
    /// so the proxies can be attached again later.
    pub fn delete_proxies(&self, cluster: ClusterId, proxies: &[ProxyId]) -> MutationResult<OperationReport> {
        self.run("DELETE_PROXIES", Event::ProxiesDeleted, &cluster.to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            precheck::check_not_empty(proxies, "proxies")?;
            precheck::check_proxies_member(tx.graph(), &record, proxies)?;

            let mut addrs = Vec::new();
            for proxy in proxies {
                AccessEntryRegistrar::unbind_everywhere(tx, EntryMember::Proxy(*proxy))?;
                tx.graph_mut().detach_proxy(cluster, *proxy)?;
                addrs.push(tx.graph().proxy(*proxy)?.addr.clone());
            }

            stage_inventory(tx, cluster, InventoryCall::DeleteServiceInstances {
                domain: record.immutable_domain.clone(),
                addrs,
            });
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }

    /// Remove proxies for good. Without `is_all` the subset may not cover
    /// every proxy of the cluster.
    pub fn decommission_proxies(
        &self,
        cluster: ClusterId,
        subset: &[ProxyId],
        is_all: bool,
    ) -> MutationResult<OperationReport> {
        let usernames = self.settings().privileged_usernames.clone();
        self.run("DECOMMISSION_PROXIES", Event::ProxiesDecommissioned, &cluster.to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            let targets: BTreeSet<ProxyId> = if is_all {
                record.proxies.clone()
            } else {
                precheck::check_not_empty(subset, "proxies")?;
                precheck::check_proxies_member(tx.graph(), &record, subset)?;
                subset.iter().copied().collect()
            };
            precheck::check_not_full_membership(&record, "proxy", &targets, &record.proxies, is_all)?;

            let mut retirement = Retirement::default();
            for proxy in &targets {
                retirement.retire_proxy(tx, cluster, *proxy)?;
            }
            let released = retirement.stage(tx, cluster, &record.immutable_domain, &usernames);
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied {
                cluster,
                released_hosts: released,
            })
        })
    }

    // =========================================================================
    // STORAGES
    // =========================================================================

    /// Attach new storage instances. Replicas get an edge from their
    /// master; new masters are routed by the proxies, or bound to the
    /// primary entries when the shape has no proxy tier.
    pub fn add_storages(&self, cluster: ClusterId, storages: &[StorageSpec]) -> MutationResult<OperationReport> {
        self.run("ADD_STORAGES", Event::StoragesAdded, &cluster.to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            let addrs: Vec<InstanceAddr> = storages.iter().map(|s| s.addr()).collect();

            precheck::check_not_empty(storages, "storages")?;
            precheck::check_addrs_distinct(&addrs)?;
            precheck::check_storages_unassigned(tx.graph(), &addrs)?;
            check_replica_sources(tx.graph(), Some(&record), storages)?;

            let online = is_online(tx.graph(), cluster)?;
            let ids = storages
                .iter()
                .map(|spec| place_storage(tx, cluster, spec))
                .collect::<Result<Vec<_>, TopologyError>>()?;
            link_replicas(tx, storages)?;

            let new_masters: Vec<StorageId> = ids
                .iter()
                .copied()
                .filter(|id| tx.graph().storage(*id).map(|s| s.inner_role.is_master_like()).unwrap_or(false))
                .collect();
            if record.shape.has_proxies() {
                let proxies: Vec<ProxyId> = record.proxies.iter().copied().collect();
                route_to_masters(tx, cluster, &proxies)?;
            } else if online && !new_masters.is_empty() {
                let members: Vec<EntryMember> = new_masters.iter().map(|id| EntryMember::Storage(*id)).collect();
                for entry in AccessEntryRegistrar::direct_primary_entries(tx.graph(), cluster)? {
                    AccessEntryRegistrar::bind(tx, entry, &members)?;
                }
            }

            let labels = storage_labels(tx.graph(), &record, &ids)?;
            stage_registration(tx, &record, labels);
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }

    /// Detach storage instances from a cluster. Records, edges and hosts
    /// stay.
    pub fn delete_storages(&self, cluster: ClusterId, storages: &[StorageId]) -> MutationResult<OperationReport> {
        self.run("DELETE_STORAGES", Event::StoragesDeleted, &cluster.to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            precheck::check_not_empty(storages, "storages")?;
            precheck::check_storages_member(tx.graph(), &record, storages)?;

            let mut addrs = Vec::new();
            for storage in storages {
                detach_storage_from(tx, &record.entries, &record.proxies, cluster, *storage)?;
                addrs.push(tx.graph().storage(*storage)?.addr.clone());
            }

            stage_inventory(tx, cluster, InventoryCall::DeleteServiceInstances {
                domain: record.immutable_domain.clone(),
                addrs,
            });
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }

    /// Remove storage instances for good, with their edges, bindings and
    /// privileged passwords. Without `is_all` the subset may not cover
    /// every storage instance of the cluster.
    pub fn decommission_storages(
        &self,
        cluster: ClusterId,
        subset: &[StorageId],
        is_all: bool,
    ) -> MutationResult<OperationReport> {
        let usernames = self.settings().privileged_usernames.clone();
        self.run("DECOMMISSION_STORAGES", Event::StoragesDecommissioned, &cluster.to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            let targets: BTreeSet<StorageId> = if is_all {
                record.storages.clone()
            } else {
                precheck::check_not_empty(subset, "storages")?;
                precheck::check_storages_member(tx.graph(), &record, subset)?;
                subset.iter().copied().collect()
            };
            precheck::check_not_full_membership(&record, "storage", &targets, &record.storages, is_all)?;

            let mut retirement = Retirement::default();
            for storage in &targets {
                retirement.retire_storage(tx, cluster, *storage)?;
            }
            let released = retirement.stage(tx, cluster, &record.immutable_domain, &usernames);
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied {
                cluster,
                released_hosts: released,
            })
        })
    }
}

/// Unbind a storage from the cluster's own entries and proxies, then drop
/// its membership.
fn detach_storage_from(
    tx: &mut Transaction,
    entries: &BTreeSet<EntryId>,
    proxies: &BTreeSet<ProxyId>,
    cluster: ClusterId,
    storage: StorageId,
) -> MutationResult<()> {
    let member = EntryMember::Storage(storage);
    for entry in tx.graph().entries_binding(member) {
        if entries.contains(&entry) {
            AccessEntryRegistrar::unbind(tx, entry, &[member])?;
        }
    }
    drop_backend(tx, proxies, storage);
    tx.graph_mut().detach_storage(cluster, storage)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testkit::{engine, proxied_request, storage_at, Harness};
    use super::*;
    use crate::topology::{HostPool, InnerRole};

    fn proxy_ids(h: &Harness, cluster: ClusterId) -> Vec<ProxyId> {
        h.engine
            .store()
            .read(|g| g.cluster(cluster).map(|c| c.proxies.iter().copied().collect()))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_add_proxy_binds_entry_and_backends() {
        let h = engine();
        let cid = h.engine.create_cluster(&proxied_request("d1.cache.db")).unwrap().cluster_id;

        h.engine.add_proxies(cid, &[InstanceSpec::new("10.0.0.2", 50000)]).unwrap();

        let graph = h.engine.store().snapshot().unwrap();
        let cluster = graph.cluster(cid).unwrap();
        assert_eq!(cluster.proxies.len(), 2);
        let added = graph.proxy_by_addr(&InstanceAddr::new("10.0.0.2", 50000)).unwrap();
        assert_eq!(added.backends.len(), 1);
        assert_eq!(added.entries.len(), 1);
        assert_eq!(h.dns.targets("d1.cache.db", 50000).unwrap().len(), 2);
    }

    #[test]
    fn test_add_proxy_port_mismatch_rejected() {
        let h = engine();
        let cid = h.engine.create_cluster(&proxied_request("d1.cache.db")).unwrap().cluster_id;
        let err = h.engine.add_proxies(cid, &[InstanceSpec::new("10.0.0.2", 50001)]).unwrap_err();
        assert_eq!(err.code(), "TOPO_PRECHECK_PROXY_PORT_MISMATCH");
    }

    #[test]
    fn test_delete_proxy_keeps_record_and_host() {
        let h = engine();
        let cid = h.engine.create_cluster(&proxied_request("d1.cache.db")).unwrap().cluster_id;
        h.engine.add_proxies(cid, &[InstanceSpec::new("10.0.0.2", 50000)]).unwrap();
        let target = h
            .engine
            .store()
            .read(|g| g.proxy_by_addr(&InstanceAddr::new("10.0.0.2", 50000)).map(|p| p.id))
            .unwrap()
            .unwrap();

        h.engine.delete_proxies(cid, &[target]).unwrap();

        let graph = h.engine.store().snapshot().unwrap();
        let proxy = graph.proxy(target).unwrap();
        assert_eq!(proxy.cluster, None);
        assert!(proxy.backends.is_empty() && proxy.entries.is_empty());
        assert_eq!(graph.machine("10.0.0.2").unwrap().pool, HostPool::InUse);

        // a detached proxy can be attached again
        h.engine.add_proxies(cid, &[InstanceSpec::new("10.0.0.2", 50000)]).unwrap();
        let graph = h.engine.store().snapshot().unwrap();
        assert_eq!(graph.proxy_by_addr(&InstanceAddr::new("10.0.0.2", 50000)).unwrap().id, target);
    }

    #[test]
    fn test_decommission_guard_and_host_release() {
        let h = engine();
        let cid = h.engine.create_cluster(&proxied_request("d1.cache.db")).unwrap().cluster_id;
        h.engine.add_proxies(cid, &[InstanceSpec::new("10.0.0.2", 50000)]).unwrap();
        let proxies = proxy_ids(&h, cid);

        let err = h.engine.decommission_proxies(cid, &proxies, false).unwrap_err();
        assert_eq!(err.code(), "TOPO_PRECHECK_FULL_MEMBERSHIP");

        let report = h.engine.decommission_proxies(cid, &proxies[..1], false).unwrap();
        assert_eq!(report.released_hosts.len(), 1);
        assert_eq!(proxy_ids(&h, cid).len(), 1);

        let report = h.engine.decommission_proxies(cid, &[], true).unwrap();
        assert_eq!(report.released_hosts.len(), 1);
        assert!(proxy_ids(&h, cid).is_empty());
    }

    #[test]
    fn test_add_storages_links_replica_to_existing_master() {
        let h = engine();
        let cid = h.engine.create_cluster(&proxied_request("d1.cache.db")).unwrap().cluster_id;

        let master = StorageSpec::master("10.0.1.3", 30000).with_shard("1");
        let slave = StorageSpec::slave("10.0.1.4", 30000, &master.addr()).with_shard("1");
        h.engine.add_storages(cid, &[master, slave]).unwrap();

        let graph = h.engine.store().snapshot().unwrap();
        let cluster = graph.cluster(cid).unwrap();
        assert_eq!(graph.cluster_edges(cluster).len(), 2);
        let proxy = graph.proxy(*cluster.proxies.iter().next().unwrap()).unwrap();
        assert_eq!(proxy.backends.len(), 2);

        // the original master already feeds a receiver
        let extra = StorageSpec::slave("10.0.1.5", 30000, &InstanceAddr::new("10.0.1.1", 30000));
        let err = h.engine.add_storages(cid, &[extra]).unwrap_err();
        assert_eq!(err.code(), "TOPO_PRECHECK_RECEIVER_RUNNING");
    }

    #[test]
    fn test_delete_storage_unroutes_master() {
        let h = engine();
        let cid = h.engine.create_cluster(&proxied_request("d1.cache.db")).unwrap().cluster_id;
        let master = storage_at(&h, "10.0.1.1");

        h.engine.delete_storages(cid, &[master]).unwrap();
        let graph = h.engine.store().snapshot().unwrap();
        assert!(graph.storage(master).unwrap().clusters.is_empty());
        assert!(graph.proxies.values().all(|p| !p.backends.contains(&master)));
        // edges are kept for a later re-attach
        assert_eq!(graph.edges_from(master).len(), 1);
    }

    #[test]
    fn test_decommission_storage_removes_edges() {
        let h = engine();
        let cid = h.engine.create_cluster(&proxied_request("d1.cache.db")).unwrap().cluster_id;
        let slave = storage_at(&h, "10.0.1.2");

        let report = h.engine.decommission_storages(cid, &[slave], false).unwrap();
        assert_eq!(report.released_hosts, vec!["10.0.1.2".to_string()]);
        let graph = h.engine.store().snapshot().unwrap();
        assert!(graph.storage(slave).is_err());
        assert_eq!(graph.cluster_edges(graph.cluster(cid).unwrap()).len(), 0);
        let remaining = graph.masters_of(graph.cluster(cid).unwrap());
        assert_eq!(remaining[0].inner_role, InnerRole::Master);
    }
}
