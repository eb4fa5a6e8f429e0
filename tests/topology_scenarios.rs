//! Topology Mutation Scenarios
//!
//! End-to-end behaviour of the mutation engine through the public API:
//! - cluster creation and its edges and entries
//! - prechecks never mutate
//! - single ownership of instances
//! - the decommission guard
//! - host release on hosts shared by proxies and storages
//! - the replication role guard
//! - outbox retry after a collaborator outage
//! - a durable store surviving a restart

mod support;

use std::collections::BTreeSet;

use support::{sharded, single_shard, Plane};
use tempfile::TempDir;
use topoplane::mutation::{InstanceSpec, StorageSpec};
use topoplane::topology::{
    ClusterPhase, ClusterStatus, EntryMember, EntryRole, HostPool, InstanceAddr, KvEngine, ProxyId, StorageId,
};

fn proxy_ids(plane: &Plane, domain: &str) -> Vec<ProxyId> {
    plane
        .topology
        .cluster_by_domain(domain)
        .unwrap()
        .unwrap()
        .proxies
        .into_iter()
        .collect()
}

fn storage_ids(plane: &Plane, domain: &str) -> Vec<StorageId> {
    plane
        .topology
        .cluster_by_domain(domain)
        .unwrap()
        .unwrap()
        .storages
        .into_iter()
        .collect()
}

// =============================================================================
// Creation
// =============================================================================

/// One proxy, a master and its slave: one edge, one primary entry bound
/// to the proxy, and the domain cannot be taken twice.
#[test]
fn test_create_cluster_layout() {
    let plane = Plane::in_memory();
    let report = plane.topology.create_cluster(&single_shard("d1.cache.db")).unwrap();
    assert!(!report.partially_applied());

    let graph = plane.topology.store().snapshot().unwrap();
    let cluster = graph.cluster(report.cluster_id).unwrap();
    let master = plane.storage_at("10.0.1.1");
    let slave = plane.storage_at("10.0.1.2");

    let edges = graph.cluster_edges(cluster);
    assert_eq!(edges.len(), 1);
    assert_eq!((edges[0].ejector, edges[0].receiver), (master, slave));

    let entries = graph.entries_of(cluster, EntryRole::Primary);
    assert_eq!(entries.len(), 1);
    let proxy = proxy_ids(&plane, "d1.cache.db")[0];
    let members = entries[0].binding.members().unwrap();
    assert_eq!(members, &BTreeSet::from([EntryMember::Proxy(proxy)]));
    assert_eq!(
        graph.resolve_entry(entries[0].id).unwrap(),
        vec![InstanceAddr::new("10.0.0.1", 50000)]
    );

    assert_eq!(
        plane.dns.targets("d1.cache.db", 50000),
        Some(BTreeSet::from([InstanceAddr::new("10.0.0.1", 50000)]))
    );

    let summary = plane.topology.summary(report.cluster_id).unwrap();
    assert_eq!(summary.phase, ClusterPhase::Online);
    assert_eq!(summary.status, ClusterStatus::Normal);
    assert_eq!(summary.edge_count, 1);
}

/// A rejected create is rejected every time and leaves the graph as it was.
#[test]
fn test_repeated_create_always_rejected() {
    let plane = Plane::in_memory();
    plane.topology.create_cluster(&single_shard("d1.cache.db")).unwrap();
    let before = plane.topology.store().snapshot().unwrap();

    for _ in 0..3 {
        let err = plane.topology.create_cluster(&single_shard("d1.cache.db")).unwrap_err();
        assert_eq!(err.code(), "TOPO_PRECHECK_DOMAIN_EXISTS");
        assert_eq!(plane.topology.store().snapshot().unwrap(), before);
    }
    assert_eq!(plane.metrics.snapshot().precheck_rejections, 3);
}

// =============================================================================
// Ownership
// =============================================================================

/// Instances belong to at most the cluster that was granted them.
#[test]
fn test_single_owner_across_operations() {
    let plane = Plane::in_memory();
    plane.topology.create_cluster(&single_shard("a.cache.db")).unwrap();

    let mut stolen = single_shard("b.cache.db");
    stolen.proxies = vec![InstanceSpec::new("10.0.0.9", 50000)];
    stolen.storages = vec![
        StorageSpec::master("10.0.1.9", 30000),
        StorageSpec::slave("10.0.1.2", 30000, &InstanceAddr::new("10.0.1.9", 30000)),
    ];
    let err = plane.topology.create_cluster(&stolen).unwrap_err();
    assert_eq!(err.code(), "TOPO_PRECHECK_INSTANCE_ASSIGNED");

    stolen.storages = vec![
        StorageSpec::master("10.0.1.9", 30000),
        StorageSpec::slave("10.0.1.8", 30000, &InstanceAddr::new("10.0.1.9", 30000)),
    ];
    let b = plane.topology.create_cluster(&stolen).unwrap().cluster_id;

    let err = plane
        .topology
        .add_proxies(b, &[InstanceSpec::new("10.0.0.1", 50000)])
        .unwrap_err();
    assert_eq!(err.code(), "TOPO_PRECHECK_INSTANCE_ASSIGNED");

    let graph = plane.topology.store().snapshot().unwrap();
    for cluster in graph.clusters() {
        for id in &cluster.storages {
            let storage = graph.storage(*id).unwrap();
            assert_eq!(storage.clusters, BTreeSet::from([cluster.id]));
        }
        for id in &cluster.proxies {
            assert_eq!(graph.proxy(*id).unwrap().cluster, Some(cluster.id));
        }
    }
}

// =============================================================================
// Decommission guard
// =============================================================================

/// Removing one of two proxies works; removing the last one without the
/// whole-cluster flag does not.
#[test]
fn test_proxy_decommission_guard() {
    let plane = Plane::in_memory();
    let cid = plane.topology.create_cluster(&single_shard("d1.cache.db")).unwrap().cluster_id;
    plane
        .topology
        .add_proxies(cid, &[InstanceSpec::new("10.0.0.2", 50000)])
        .unwrap();

    let proxies = proxy_ids(&plane, "d1.cache.db");
    assert_eq!(proxies.len(), 2);
    plane.topology.decommission_proxies(cid, &proxies[..1], false).unwrap();
    assert_eq!(proxy_ids(&plane, "d1.cache.db").len(), 1);

    let before = plane.topology.store().snapshot().unwrap();
    let remaining = proxy_ids(&plane, "d1.cache.db");
    let err = plane.topology.decommission_proxies(cid, &remaining, false).unwrap_err();
    assert_eq!(err.code(), "TOPO_PRECHECK_FULL_MEMBERSHIP");
    assert_eq!(plane.topology.store().snapshot().unwrap(), before);
    assert_eq!(proxy_ids(&plane, "d1.cache.db").len(), 1);
}

#[test]
fn test_storage_decommission_guard() {
    let plane = Plane::in_memory();
    let cid = plane.topology.create_cluster(&single_shard("d1.cache.db")).unwrap().cluster_id;
    let before = plane.topology.store().snapshot().unwrap();

    let all = storage_ids(&plane, "d1.cache.db");
    let err = plane.topology.decommission_storages(cid, &all, false).unwrap_err();
    assert_eq!(err.code(), "TOPO_PRECHECK_FULL_MEMBERSHIP");
    assert_eq!(plane.topology.store().snapshot().unwrap(), before);
}

fn host_pool(plane: &Plane, ip: &str) -> HostPool {
    plane
        .topology
        .store()
        .read(|g| g.machine(ip).map(|m| m.pool))
        .unwrap()
        .unwrap()
}

/// A host running a proxy and a slave stays in use until both are gone.
#[test]
fn test_shared_host_released_after_last_instance() {
    let plane = Plane::in_memory();
    let mut request = single_shard("d1.cache.db");
    request.proxies.push(InstanceSpec::new("10.0.0.2", 50000));
    request.storages = vec![
        StorageSpec::master("10.0.1.1", 30000),
        StorageSpec::slave("10.0.0.1", 30000, &InstanceAddr::new("10.0.1.1", 30000)),
    ];
    let cid = plane.topology.create_cluster(&request).unwrap().cluster_id;

    let slave = plane.storage_at("10.0.0.1");
    plane.topology.decommission_storages(cid, &[slave], false).unwrap();
    assert_eq!(host_pool(&plane, "10.0.0.1"), HostPool::InUse);
    assert_eq!(proxy_ids(&plane, "d1.cache.db").len(), 2);

    let proxy = plane
        .topology
        .store()
        .read(|g| g.proxy_by_addr(&InstanceAddr::new("10.0.0.1", 50000)).map(|p| p.id))
        .unwrap()
        .unwrap();
    plane.topology.decommission_proxies(cid, &[proxy], false).unwrap();
    assert_eq!(host_pool(&plane, "10.0.0.1"), HostPool::Idle);
    assert_eq!(host_pool(&plane, "10.0.0.2"), HostPool::InUse);
}

// =============================================================================
// Replication role guard
// =============================================================================

/// Sync and master swap refuse endpoints that are not masters, and change
/// nothing when they do.
#[test]
fn test_replication_role_guard() {
    let plane = Plane::in_memory();
    let (request, _) = sharded("kv.cache.db", KvEngine::TendisSsd, 2);
    let cid = plane.topology.create_cluster(&request).unwrap().cluster_id;
    let before = plane.topology.store().snapshot().unwrap();

    let master = plane.storage_at("10.0.1.1");
    let slave = plane.storage_at("10.0.2.2");

    let err = plane.topology.make_sync(cid, master, slave).unwrap_err();
    assert_eq!(err.code(), "TOPO_PRECHECK_NOT_MASTER");
    let err = plane.topology.make_sync(cid, slave, master).unwrap_err();
    assert_eq!(err.code(), "TOPO_PRECHECK_NOT_MASTER");
    let err = plane.topology.switch_tendis(cid, master, slave).unwrap_err();
    assert_eq!(err.code(), "TOPO_PRECHECK_NOT_MASTER");

    assert_eq!(plane.topology.store().snapshot().unwrap(), before);
}

// =============================================================================
// Outbox
// =============================================================================

/// A DNS outage leaves the topology committed and the entry call pending;
/// a retry delivers it.
#[test]
fn test_side_effects_survive_outage() {
    let plane = Plane::in_memory();
    plane.dns.set_failing(true);

    let report = plane.topology.create_cluster(&single_shard("d1.cache.db")).unwrap();
    assert!(report.partially_applied());
    assert!(plane.topology.cluster_by_domain("d1.cache.db").unwrap().is_some());
    assert!(plane.dns.targets("d1.cache.db", 50000).is_none());
    assert!(!plane.topology.store().pending_effects().unwrap().is_empty());

    plane.dns.set_failing(false);
    let delivery = plane.topology.retry_side_effects().unwrap();
    assert!(delivery.is_complete());
    assert!(plane.topology.store().pending_effects().unwrap().is_empty());
    assert_eq!(
        plane.dns.targets("d1.cache.db", 50000),
        Some(BTreeSet::from([InstanceAddr::new("10.0.0.1", 50000)]))
    );
}

// =============================================================================
// Durability
// =============================================================================

#[test]
fn test_topology_survives_restart() {
    let dir = TempDir::new().unwrap();
    let cid = {
        let plane = Plane::durable(dir.path());
        plane.topology.create_cluster(&single_shard("d1.cache.db")).unwrap().cluster_id
    };

    let plane = Plane::durable(dir.path());
    let cluster = plane.topology.cluster_by_domain("d1.cache.db").unwrap().unwrap();
    assert_eq!(cluster.id, cid);
    assert_eq!(plane.topology.summary(cid).unwrap().storage_count, 2);

    let err = plane.topology.create_cluster(&single_shard("d1.cache.db")).unwrap_err();
    assert_eq!(err.code(), "TOPO_PRECHECK_DOMAIN_EXISTS");
}
