//! Shared fixtures for engine tests.

use std::sync::Arc;

use super::engine::TopologyEngine;
use super::request::{CreateClusterRequest, InstanceSpec, StorageSpec};
use crate::collaborators::memory::{MemoryCredentials, MemoryEndpoint, MemoryInventory};
use crate::collaborators::EndpointRegistry;
use crate::config::TopologyConfig;
use crate::observability::MetricsRegistry;
use crate::outbox::SideEffectDispatcher;
use crate::topology::{ClusterShape, EntryKind, InstanceAddr, KvEngine, StorageId, TopologyStore};

pub(super) struct Harness {
    pub engine: TopologyEngine,
    pub dns: Arc<MemoryEndpoint>,
    pub lb: Arc<MemoryEndpoint>,
    pub inventory: Arc<MemoryInventory>,
    pub credentials: Arc<MemoryCredentials>,
}

/// In-memory engine wired to recording collaborators.
pub(super) fn engine() -> Harness {
    let metrics = Arc::new(MetricsRegistry::new());
    let dns = Arc::new(MemoryEndpoint::new(EntryKind::Dns));
    let lb = Arc::new(MemoryEndpoint::new(EntryKind::LoadBalancer));
    let mesh = Arc::new(MemoryEndpoint::new(EntryKind::ServiceMesh));
    let inventory = Arc::new(MemoryInventory::new());
    let credentials = Arc::new(MemoryCredentials::new());

    let endpoints = EndpointRegistry::new().with(dns.clone()).with(lb.clone()).with(mesh);
    let dispatcher = SideEffectDispatcher::new(inventory.clone(), endpoints, credentials.clone(), 5, metrics.clone());
    let engine = TopologyEngine::new(
        Arc::new(TopologyStore::in_memory()),
        Arc::new(dispatcher),
        metrics,
        TopologyConfig::default(),
    );
    Harness {
        engine,
        dns,
        lb,
        inventory,
        credentials,
    }
}

/// Redis behind one proxy: proxy 10.0.0.1, master 10.0.1.1 and its slave
/// 10.0.1.2. The cluster name is the domain's first label.
pub(super) fn proxied_request(domain: &str) -> CreateClusterRequest {
    let master = StorageSpec::master("10.0.1.1", 30000);
    let slave = StorageSpec::slave("10.0.1.2", 30000, &master.addr());
    let name = domain.split('.').next().unwrap_or(domain);
    CreateClusterRequest::new(
        1,
        name,
        domain,
        ClusterShape::ProxiedKv {
            engine: KvEngine::Redis,
            proxy_port: 50000,
        },
        vec![InstanceSpec::new("10.0.0.1", 50000)],
        vec![master, slave],
    )
}

/// Id of the storage instance on `ip:30000`.
pub(super) fn storage_at(h: &Harness, ip: &str) -> StorageId {
    h.engine
        .store()
        .read(|g| g.storage_by_addr(&InstanceAddr::new(ip, 30000)).map(|s| s.id))
        .unwrap()
        .unwrap()
}
