//! Shared fixtures for the scenario tests: an engine wired to in-memory
//! recording collaborators, and cluster requests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use topoplane::collaborators::memory::{
    MemoryCredentials, MemoryEndpoint, MemoryExecutor, MemoryInventory, StaticProbe,
};
use topoplane::collaborators::{CredentialStore, EndpointRegistry};
use topoplane::config::{MigrationConfig, TopologyConfig};
use topoplane::migration::{MigrationCollaborators, MigrationEngine, MigrationStore};
use topoplane::mutation::{CreateClusterRequest, InstanceSpec, StorageSpec, TopologyEngine};
use topoplane::observability::MetricsRegistry;
use topoplane::outbox::SideEffectDispatcher;
use topoplane::topology::{ClusterShape, EntryKind, InstanceAddr, KvEngine, StorageId, TopologyStore};

pub struct Plane {
    pub topology: Arc<TopologyEngine>,
    pub dns: Arc<MemoryEndpoint>,
    pub inventory: Arc<MemoryInventory>,
    pub credentials: Arc<MemoryCredentials>,
    pub executor: Arc<MemoryExecutor>,
    pub probe: Arc<StaticProbe>,
    pub metrics: Arc<MetricsRegistry>,
}

impl Plane {
    /// Everything in memory.
    pub fn in_memory() -> Self {
        Self::over(TopologyStore::in_memory())
    }

    /// Topology persisted under `dir`.
    pub fn durable(dir: &Path) -> Self {
        Self::over(TopologyStore::open(dir).unwrap())
    }

    fn over(store: TopologyStore) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let dns = Arc::new(MemoryEndpoint::new(EntryKind::Dns));
        let inventory = Arc::new(MemoryInventory::new());
        let credentials = Arc::new(MemoryCredentials::new());
        let endpoints = EndpointRegistry::new()
            .with(dns.clone())
            .with(Arc::new(MemoryEndpoint::new(EntryKind::LoadBalancer)));
        let dispatcher = SideEffectDispatcher::new(inventory.clone(), endpoints, credentials.clone(), 5, metrics.clone());
        let topology = Arc::new(TopologyEngine::new(
            Arc::new(store),
            Arc::new(dispatcher),
            metrics.clone(),
            TopologyConfig::default(),
        ));
        Self {
            topology,
            dns,
            inventory,
            credentials,
            executor: Arc::new(MemoryExecutor::new()),
            probe: Arc::new(StaticProbe::default()),
            metrics,
        }
    }

    /// Migration engine over `store` sharing this plane's collaborators.
    pub fn migration(&self, store: Arc<dyn MigrationStore>, config: MigrationConfig) -> MigrationEngine {
        MigrationEngine::new(
            store,
            self.topology.clone(),
            MigrationCollaborators {
                executor: self.executor.clone(),
                probe: self.probe.clone(),
                credentials: self.credentials.clone(),
            },
            self.metrics.clone(),
            config,
        )
    }

    /// Id of the storage instance on `ip:30000`.
    pub fn storage_at(&self, ip: &str) -> StorageId {
        self.topology
            .store()
            .read(|g| g.storage_by_addr(&InstanceAddr::new(ip, 30000)).map(|s| s.id))
            .unwrap()
            .unwrap()
    }

    /// Store the admin password of every instance on `ips` (port 30000).
    pub fn grant_passwords(&self, ips: &[String]) {
        for ip in ips {
            self.credentials
                .set_password(&InstanceAddr::new(ip.clone(), 30000), 0, "admin", "secret")
                .unwrap();
        }
    }
}

/// Scenario A layout: proxy 10.0.0.1, master 10.0.1.1, slave 10.0.1.2.
pub fn single_shard(domain: &str) -> CreateClusterRequest {
    let master = StorageSpec::master("10.0.1.1", 30000);
    let slave = StorageSpec::slave("10.0.1.2", 30000, &master.addr());
    CreateClusterRequest::new(
        1,
        domain.split('.').next().unwrap_or(domain),
        domain,
        ClusterShape::ProxiedKv {
            engine: KvEngine::Redis,
            proxy_port: 50000,
        },
        vec![InstanceSpec::new("10.0.0.1", 50000)],
        vec![master, slave],
    )
}

/// `shards` master/slave pairs behind one proxy. Masters on 10.0.1.x,
/// slaves on 10.0.2.x. Returns the request and the slave ips.
pub fn sharded(domain: &str, engine: KvEngine, shards: u8) -> (CreateClusterRequest, Vec<String>) {
    let mut storages = Vec::new();
    let mut slaves = Vec::new();
    for i in 1..=shards {
        let master = StorageSpec::master(format!("10.0.1.{}", i), 30000).with_shard(format!("shard-{}", i));
        let slave = StorageSpec::slave(format!("10.0.2.{}", i), 30000, &master.addr()).with_shard(format!("shard-{}", i));
        slaves.push(format!("10.0.2.{}", i));
        storages.push(master);
        storages.push(slave);
    }
    let request = CreateClusterRequest::new(
        1,
        domain.split('.').next().unwrap_or(domain),
        domain,
        ClusterShape::ProxiedKv {
            engine,
            proxy_port: 50000,
        },
        vec![InstanceSpec::new("10.0.0.1", 50000)],
        storages,
    );
    (request, slaves)
}
