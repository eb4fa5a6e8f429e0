//! Topology Graph
//!
//! In-memory relational graph of machines, instances, replication edges and
//! access entries. Mutation helpers are crate-private: records are only
//! created or removed by the mutation engine inside a store transaction.
//!
//! `check_invariants` is run on the working copy of every transaction before
//! it is committed. Any violation aborts the transaction.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::errors::{TopologyError, TopologyResult};
use super::model::{
    AccessEntry, Cluster, ClusterId, ClusterKey, ClusterPhase, ClusterStatus, ClusterSummary,
    EdgeId, EntryBinding, EntryId, EntryKind, EntryMember, EntryRole, HostPool, HostSpec,
    InstanceAddr, InstanceStatus, Machine, MachineRole, ProxyId, ProxyInstance, RebuildWindow,
    ReplicationEdge, StorageId, StorageInstance,
};

/// The topology graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyGraph {
    pub(crate) machines: BTreeMap<String, Machine>,
    pub(crate) clusters: BTreeMap<ClusterId, Cluster>,
    pub(crate) storages: BTreeMap<StorageId, StorageInstance>,
    pub(crate) proxies: BTreeMap<ProxyId, ProxyInstance>,
    pub(crate) edges: BTreeMap<EdgeId, ReplicationEdge>,
    pub(crate) entries: BTreeMap<EntryId, AccessEntry>,
    pub(crate) rebuild_windows: BTreeMap<StorageId, RebuildWindow>,
}

impl TopologyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // LOOKUPS
    // =========================================================================

    /// Get a cluster.
    pub fn cluster(&self, id: ClusterId) -> TopologyResult<&Cluster> {
        self.clusters
            .get(&id)
            .ok_or_else(|| TopologyError::not_found("cluster", id))
    }

    /// Get a storage instance.
    pub fn storage(&self, id: StorageId) -> TopologyResult<&StorageInstance> {
        self.storages
            .get(&id)
            .ok_or_else(|| TopologyError::not_found("storage instance", id))
    }

    /// Get a proxy instance.
    pub fn proxy(&self, id: ProxyId) -> TopologyResult<&ProxyInstance> {
        self.proxies
            .get(&id)
            .ok_or_else(|| TopologyError::not_found("proxy instance", id))
    }

    /// Get an access entry.
    pub fn entry(&self, id: EntryId) -> TopologyResult<&AccessEntry> {
        self.entries
            .get(&id)
            .ok_or_else(|| TopologyError::not_found("access entry", id))
    }

    /// Get a machine by IP.
    pub fn machine(&self, ip: &str) -> Option<&Machine> {
        self.machines.get(ip)
    }

    /// All clusters.
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    /// All machines.
    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    /// Storage instance at an address.
    pub fn storage_by_addr(&self, addr: &InstanceAddr) -> Option<&StorageInstance> {
        self.storages.values().find(|s| &s.addr == addr)
    }

    /// Proxy instance at an address.
    pub fn proxy_by_addr(&self, addr: &InstanceAddr) -> Option<&ProxyInstance> {
        self.proxies.values().find(|p| &p.addr == addr)
    }

    /// Cluster owning a primary domain.
    pub fn cluster_by_domain(&self, domain: &str) -> Option<&Cluster> {
        self.clusters
            .values()
            .find(|c| c.immutable_domain.eq_ignore_ascii_case(domain))
    }

    /// Cluster by `(business, name, type)`.
    pub fn cluster_by_key(&self, key: &ClusterKey) -> Option<&Cluster> {
        self.clusters.values().find(|c| &c.key() == key)
    }

    /// Whether any entry of any kind uses this name.
    pub fn entry_name_in_use(&self, name: &str) -> bool {
        self.entries
            .values()
            .any(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Edges leaving an ejector.
    pub fn edges_from(&self, ejector: StorageId) -> Vec<&ReplicationEdge> {
        self.edges.values().filter(|e| e.ejector == ejector).collect()
    }

    /// Edges arriving at a receiver.
    pub fn edges_to(&self, receiver: StorageId) -> Vec<&ReplicationEdge> {
        self.edges.values().filter(|e| e.receiver == receiver).collect()
    }

    /// Edge between two instances, if any.
    pub fn edge_between(&self, ejector: StorageId, receiver: StorageId) -> Option<&ReplicationEdge> {
        self.edges
            .values()
            .find(|e| e.ejector == ejector && e.receiver == receiver)
    }

    /// Edges whose both endpoints are members of the cluster.
    pub fn cluster_edges(&self, cluster: &Cluster) -> Vec<&ReplicationEdge> {
        self.edges
            .values()
            .filter(|e| cluster.storages.contains(&e.ejector) && cluster.storages.contains(&e.receiver))
            .collect()
    }

    /// Receivers of an ejector.
    pub fn receivers_of(&self, ejector: StorageId) -> Vec<&StorageInstance> {
        self.edges_from(ejector)
            .into_iter()
            .filter_map(|e| self.storages.get(&e.receiver))
            .collect()
    }

    /// Master-inner-role members of a cluster.
    pub fn masters_of(&self, cluster: &Cluster) -> Vec<&StorageInstance> {
        cluster
            .storages
            .iter()
            .filter_map(|id| self.storages.get(id))
            .filter(|s| s.inner_role.is_master_like())
            .collect()
    }

    /// Entries of a cluster with the given role.
    pub fn entries_of(&self, cluster: &Cluster, role: EntryRole) -> Vec<&AccessEntry> {
        cluster
            .entries
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|e| e.role == role)
            .collect()
    }

    /// Open rebuild window on an ejector.
    pub fn rebuild_window(&self, ejector: StorageId) -> Option<&RebuildWindow> {
        self.rebuild_windows.get(&ejector)
    }

    /// All open rebuild windows.
    pub fn rebuild_windows(&self) -> impl Iterator<Item = &RebuildWindow> {
        self.rebuild_windows.values()
    }

    /// Number of instances of a role class still placed on a host.
    pub fn instances_on_host(&self, ip: &str, role: MachineRole) -> usize {
        match role {
            MachineRole::Proxy => self.proxies.values().filter(|p| p.addr.ip == ip).count(),
            MachineRole::Storage | MachineRole::Config => {
                self.storages.values().filter(|s| s.addr.ip == ip).count()
            }
        }
    }

    /// Resolve an entry to the concrete member addresses it serves,
    /// following one level of forwarding.
    pub fn resolve_entry(&self, id: EntryId) -> TopologyResult<Vec<InstanceAddr>> {
        let entry = self.entry(id)?;
        let members = match &entry.binding {
            EntryBinding::Members(members) => members,
            EntryBinding::ForwardTo(target) => {
                let target = self.entry(*target)?;
                match &target.binding {
                    EntryBinding::Members(members) => members,
                    EntryBinding::ForwardTo(_) => {
                        return Err(TopologyError::invariant(
                            "forward_depth",
                            format!("entry {} forwards to a forwarding entry", entry.name),
                        ))
                    }
                }
            }
        };
        members.iter().map(|m| self.member_addr(*m)).collect()
    }

    /// Address of an entry member.
    pub fn member_addr(&self, member: EntryMember) -> TopologyResult<InstanceAddr> {
        match member {
            EntryMember::Storage(id) => Ok(self.storage(id)?.addr.clone()),
            EntryMember::Proxy(id) => Ok(self.proxy(id)?.addr.clone()),
        }
    }

    /// Derived health summary.
    pub fn summary(&self, id: ClusterId) -> TopologyResult<ClusterSummary> {
        let cluster = self.cluster(id)?;

        let all_running = cluster
            .storages
            .iter()
            .filter_map(|s| self.storages.get(s))
            .map(|s| s.status)
            .chain(cluster.proxies.iter().filter_map(|p| self.proxies.get(p)).map(|p| p.status))
            .all(|status| status == InstanceStatus::Running);

        let reachable = self
            .entries_of(cluster, EntryRole::Primary)
            .iter()
            .any(|e| self.resolve_entry(e.id).map(|m| !m.is_empty()).unwrap_or(false));

        Ok(ClusterSummary {
            id,
            domain: cluster.immutable_domain.clone(),
            cluster_type: cluster.shape.type_name().to_string(),
            phase: if reachable { ClusterPhase::Online } else { ClusterPhase::Offline },
            status: if all_running { ClusterStatus::Normal } else { ClusterStatus::Abnormal },
            proxy_count: cluster.proxies.len(),
            storage_count: cluster.storages.len(),
            edge_count: self.cluster_edges(cluster).len(),
        })
    }

    // =========================================================================
    // MUTATION HELPERS
    // =========================================================================

    pub(crate) fn cluster_mut(&mut self, id: ClusterId) -> TopologyResult<&mut Cluster> {
        self.clusters
            .get_mut(&id)
            .ok_or_else(|| TopologyError::not_found("cluster", id))
    }

    pub(crate) fn storage_mut(&mut self, id: StorageId) -> TopologyResult<&mut StorageInstance> {
        self.storages
            .get_mut(&id)
            .ok_or_else(|| TopologyError::not_found("storage instance", id))
    }

    pub(crate) fn proxy_mut(&mut self, id: ProxyId) -> TopologyResult<&mut ProxyInstance> {
        self.proxies
            .get_mut(&id)
            .ok_or_else(|| TopologyError::not_found("proxy instance", id))
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> TopologyResult<&mut AccessEntry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| TopologyError::not_found("access entry", id))
    }

    /// Register a host if unknown and mark it in use.
    pub(crate) fn claim_host(&mut self, host: &HostSpec, role: MachineRole) {
        let machine = self.machines.entry(host.ip.clone()).or_insert_with(|| Machine {
            ip: host.ip.clone(),
            cloud_zone: host.cloud_zone,
            role,
            spec: host.spec.clone(),
            pool: HostPool::InUse,
            created_at: Utc::now(),
        });
        machine.pool = HostPool::InUse;
    }

    /// Move a host to the idle pool once it runs no instance of any role.
    /// Returns whether the host was released.
    pub(crate) fn release_host_if_unused(&mut self, ip: &str) -> bool {
        if self.instances_on_host(ip, MachineRole::Proxy) > 0 || self.instances_on_host(ip, MachineRole::Storage) > 0 {
            return false;
        }
        match self.machines.get_mut(ip) {
            Some(machine) if machine.pool == HostPool::InUse => {
                machine.pool = HostPool::Idle;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn insert_cluster(&mut self, cluster: Cluster) {
        self.clusters.insert(cluster.id, cluster);
    }

    pub(crate) fn remove_cluster(&mut self, id: ClusterId) -> Option<Cluster> {
        self.clusters.remove(&id)
    }

    pub(crate) fn insert_storage(&mut self, storage: StorageInstance) {
        self.storages.insert(storage.id, storage);
    }

    pub(crate) fn remove_storage(&mut self, id: StorageId) -> Option<StorageInstance> {
        self.storages.remove(&id)
    }

    pub(crate) fn insert_proxy(&mut self, proxy: ProxyInstance) {
        self.proxies.insert(proxy.id, proxy);
    }

    pub(crate) fn remove_proxy(&mut self, id: ProxyId) -> Option<ProxyInstance> {
        self.proxies.remove(&id)
    }

    pub(crate) fn attach_storage(&mut self, cluster: ClusterId, id: StorageId) -> TopologyResult<()> {
        self.storage_mut(id)?.clusters.insert(cluster);
        self.cluster_mut(cluster)?.storages.insert(id);
        Ok(())
    }

    pub(crate) fn detach_storage(&mut self, cluster: ClusterId, id: StorageId) -> TopologyResult<()> {
        self.storage_mut(id)?.clusters.remove(&cluster);
        self.cluster_mut(cluster)?.storages.remove(&id);
        Ok(())
    }

    pub(crate) fn attach_proxy(&mut self, cluster: ClusterId, id: ProxyId) -> TopologyResult<()> {
        self.proxy_mut(id)?.cluster = Some(cluster);
        self.cluster_mut(cluster)?.proxies.insert(id);
        Ok(())
    }

    pub(crate) fn detach_proxy(&mut self, cluster: ClusterId, id: ProxyId) -> TopologyResult<()> {
        let proxy = self.proxy_mut(id)?;
        proxy.cluster = None;
        proxy.backends.clear();
        self.cluster_mut(cluster)?.proxies.remove(&id);
        Ok(())
    }

    pub(crate) fn add_edge(&mut self, ejector: StorageId, receiver: StorageId) -> EdgeId {
        let edge = ReplicationEdge {
            id: EdgeId::new(),
            ejector,
            receiver,
            created_at: Utc::now(),
        };
        let id = edge.id;
        self.edges.insert(id, edge);
        id
    }

    pub(crate) fn remove_edge(&mut self, id: EdgeId) -> Option<ReplicationEdge> {
        self.edges.remove(&id)
    }

    /// Remove every edge touching an instance.
    pub(crate) fn remove_edges_touching(&mut self, id: StorageId) -> Vec<ReplicationEdge> {
        let ids: Vec<EdgeId> = self
            .edges
            .values()
            .filter(|e| e.ejector == id || e.receiver == id)
            .map(|e| e.id)
            .collect();
        ids.into_iter().filter_map(|e| self.edges.remove(&e)).collect()
    }

    pub(crate) fn open_rebuild_window(&mut self, window: RebuildWindow) {
        self.rebuild_windows.insert(window.ejector, window);
    }

    pub(crate) fn close_rebuild_window(&mut self, ejector: StorageId) -> Option<RebuildWindow> {
        self.rebuild_windows.remove(&ejector)
    }

    pub(crate) fn insert_entry(&mut self, entry: AccessEntry) -> TopologyResult<()> {
        let id = entry.id;
        let cluster = entry.cluster;
        if let EntryBinding::Members(members) = &entry.binding {
            for member in members {
                if let EntryMember::Proxy(pid) = member {
                    self.proxy_mut(*pid)?.entries.insert(id);
                }
            }
        }
        self.entries.insert(id, entry);
        self.cluster_mut(cluster)?.entries.insert(id);
        Ok(())
    }

    pub(crate) fn remove_entry(&mut self, id: EntryId) -> TopologyResult<AccessEntry> {
        let entry = self
            .entries
            .remove(&id)
            .ok_or_else(|| TopologyError::not_found("access entry", id))?;
        for proxy in self.proxies.values_mut() {
            proxy.entries.remove(&id);
        }
        if let Some(cluster) = self.clusters.get_mut(&entry.cluster) {
            cluster.entries.remove(&id);
        }
        Ok(entry)
    }

    /// Add a member to a directly-bound entry. Returns false if it was
    /// already bound.
    pub(crate) fn bind_member(&mut self, entry: EntryId, member: EntryMember) -> TopologyResult<bool> {
        let record = self.entry_mut(entry)?;
        let added = match &mut record.binding {
            EntryBinding::Members(members) => members.insert(member),
            EntryBinding::ForwardTo(_) => {
                return Err(TopologyError::invariant(
                    "entry_binding_exclusive",
                    format!("entry {} forwards and cannot hold members", record.name),
                ))
            }
        };
        if let EntryMember::Proxy(pid) = member {
            self.proxy_mut(pid)?.entries.insert(entry);
        }
        Ok(added)
    }

    /// Remove a member from a directly-bound entry. Returns false if it was
    /// not bound.
    pub(crate) fn unbind_member(&mut self, entry: EntryId, member: EntryMember) -> TopologyResult<bool> {
        let record = self.entry_mut(entry)?;
        let removed = match &mut record.binding {
            EntryBinding::Members(members) => members.remove(&member),
            EntryBinding::ForwardTo(_) => false,
        };
        if let EntryMember::Proxy(pid) = member {
            if let Some(proxy) = self.proxies.get_mut(&pid) {
                proxy.entries.remove(&entry);
            }
        }
        Ok(removed)
    }

    /// Entries (of any cluster) that bind a member directly.
    pub(crate) fn entries_binding(&self, member: EntryMember) -> Vec<EntryId> {
        self.entries
            .values()
            .filter(|e| e.binding.members().map(|m| m.contains(&member)).unwrap_or(false))
            .map(|e| e.id)
            .collect()
    }

    pub(crate) fn touch_cluster(&mut self, id: ClusterId) {
        if let Some(cluster) = self.clusters.get_mut(&id) {
            cluster.updated_at = Utc::now();
        }
    }

    // =========================================================================
    // INVARIANTS
    // =========================================================================

    /// Check every structural invariant of the graph.
    pub fn check_invariants(&self) -> TopologyResult<()> {
        self.check_membership()?;
        self.check_proxies()?;
        self.check_edges()?;
        self.check_entries()?;
        self.check_domains()?;
        self.check_hosts()?;
        Ok(())
    }

    fn check_membership(&self) -> TopologyResult<()> {
        let mut proxy_owner: BTreeMap<ProxyId, ClusterId> = BTreeMap::new();

        for cluster in self.clusters.values() {
            for sid in &cluster.storages {
                let storage = self.storages.get(sid).ok_or_else(|| {
                    TopologyError::invariant(
                        "membership_bidirectional",
                        format!("cluster {} lists missing storage {}", cluster.immutable_domain, sid),
                    )
                })?;
                if !storage.clusters.contains(&cluster.id) {
                    return Err(TopologyError::invariant(
                        "membership_bidirectional",
                        format!("storage {} not marked as member of {}", storage.addr, cluster.immutable_domain),
                    ));
                }
            }
            for pid in &cluster.proxies {
                let proxy = self.proxies.get(pid).ok_or_else(|| {
                    TopologyError::invariant(
                        "membership_bidirectional",
                        format!("cluster {} lists missing proxy {}", cluster.immutable_domain, pid),
                    )
                })?;
                if proxy.cluster != Some(cluster.id) {
                    return Err(TopologyError::invariant(
                        "single_proxy_owner",
                        format!("proxy {} not owned by {}", proxy.addr, cluster.immutable_domain),
                    ));
                }
                if let Some(other) = proxy_owner.insert(*pid, cluster.id) {
                    return Err(TopologyError::invariant(
                        "single_proxy_owner",
                        format!("proxy {} listed by clusters {} and {}", proxy.addr, other, cluster.id),
                    ));
                }
            }
        }

        for storage in self.storages.values() {
            for cid in &storage.clusters {
                let owned = self
                    .clusters
                    .get(cid)
                    .map(|c| c.storages.contains(&storage.id))
                    .unwrap_or(false);
                if !owned {
                    return Err(TopologyError::invariant(
                        "membership_bidirectional",
                        format!("storage {} claims cluster {} which does not list it", storage.addr, cid),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_proxies(&self) -> TopologyResult<()> {
        for proxy in self.proxies.values() {
            match proxy.cluster {
                None => {
                    if !proxy.backends.is_empty() || !proxy.entries.is_empty() {
                        return Err(TopologyError::invariant(
                            "unattached_proxy_empty",
                            format!("unattached proxy {} still has backends or entries", proxy.addr),
                        ));
                    }
                }
                Some(cid) => {
                    let listed = self
                        .clusters
                        .get(&cid)
                        .map(|c| c.proxies.contains(&proxy.id))
                        .unwrap_or(false);
                    if !listed {
                        return Err(TopologyError::invariant(
                            "membership_bidirectional",
                            format!("proxy {} claims cluster {} which does not list it", proxy.addr, cid),
                        ));
                    }
                }
            }
            for backend in &proxy.backends {
                if !self.storages.contains_key(backend) {
                    return Err(TopologyError::invariant(
                        "backend_exists",
                        format!("proxy {} routes to missing storage {}", proxy.addr, backend),
                    ));
                }
            }
            for entry in &proxy.entries {
                let bound = self
                    .entries
                    .get(entry)
                    .and_then(|e| e.binding.members())
                    .map(|m| m.contains(&EntryMember::Proxy(proxy.id)))
                    .unwrap_or(false);
                if !bound {
                    return Err(TopologyError::invariant(
                        "entry_binding_bidirectional",
                        format!("proxy {} lists entry {} which does not bind it", proxy.addr, entry),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_edges(&self) -> TopologyResult<()> {
        let mut seen: HashSet<(StorageId, StorageId)> = HashSet::new();
        let mut fan_out: BTreeMap<StorageId, usize> = BTreeMap::new();

        for edge in self.edges.values() {
            if edge.ejector == edge.receiver {
                return Err(TopologyError::invariant("edge_not_self", format!("edge {} loops", edge.id)));
            }
            if !self.storages.contains_key(&edge.ejector) || !self.storages.contains_key(&edge.receiver) {
                return Err(TopologyError::invariant(
                    "edge_endpoints_exist",
                    format!("edge {} references a missing instance", edge.id),
                ));
            }
            if !seen.insert((edge.ejector, edge.receiver)) {
                return Err(TopologyError::invariant(
                    "edge_unique",
                    format!("duplicate edge {} -> {}", edge.ejector, edge.receiver),
                ));
            }
            *fan_out.entry(edge.ejector).or_insert(0) += 1;
        }

        for (ejector, count) in fan_out {
            if count > 1 && !self.rebuild_windows.contains_key(&ejector) {
                let addr = self
                    .storages
                    .get(&ejector)
                    .map(|s| s.addr.to_string())
                    .unwrap_or_else(|| ejector.to_string());
                return Err(TopologyError::invariant(
                    "single_live_receiver",
                    format!("ejector {} feeds {} receivers outside a rebuild window", addr, count),
                ));
            }
        }

        for window in self.rebuild_windows.values() {
            if !self.storages.contains_key(&window.ejector) {
                return Err(TopologyError::invariant(
                    "rebuild_window_ejector",
                    format!("rebuild window references missing ejector {}", window.ejector),
                ));
            }
        }
        Ok(())
    }

    fn check_entries(&self) -> TopologyResult<()> {
        for entry in self.entries.values() {
            let owned = self
                .clusters
                .get(&entry.cluster)
                .map(|c| c.entries.contains(&entry.id))
                .unwrap_or(false);
            if !owned {
                return Err(TopologyError::invariant(
                    "entry_owned",
                    format!("entry {} not owned by its cluster", entry.name),
                ));
            }
            match &entry.binding {
                EntryBinding::Members(members) => {
                    for member in members {
                        let exists = match member {
                            EntryMember::Storage(id) => self.storages.contains_key(id),
                            EntryMember::Proxy(id) => self
                                .proxies
                                .get(id)
                                .map(|p| p.entries.contains(&entry.id))
                                .unwrap_or(false),
                        };
                        if !exists {
                            return Err(TopologyError::invariant(
                                "entry_binding_bidirectional",
                                format!("entry {} binds a missing or unaware member", entry.name),
                            ));
                        }
                    }
                }
                EntryBinding::ForwardTo(target) => {
                    let target_entry = self.entries.get(target).ok_or_else(|| {
                        TopologyError::invariant(
                            "forward_target_exists",
                            format!("entry {} forwards to a missing entry", entry.name),
                        )
                    })?;
                    if target_entry.id == entry.id || target_entry.binding.members().is_none() {
                        return Err(TopologyError::invariant(
                            "forward_depth",
                            format!("entry {} must forward to a directly-bound entry", entry.name),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_domains(&self) -> TopologyResult<()> {
        let mut domains: HashSet<String> = HashSet::new();
        for cluster in self.clusters.values() {
            if !domains.insert(cluster.immutable_domain.to_ascii_lowercase()) {
                return Err(TopologyError::invariant(
                    "domain_unique",
                    format!("domain {} owned by more than one cluster", cluster.immutable_domain),
                ));
            }
        }
        let mut names: HashSet<(EntryKind, String, u16)> = HashSet::new();
        for entry in self.entries.values() {
            if !names.insert((entry.kind, entry.name.to_ascii_lowercase(), entry.port)) {
                return Err(TopologyError::invariant(
                    "entry_name_unique",
                    format!("{} entry {}:{} registered twice", entry.kind.as_str(), entry.name, entry.port),
                ));
            }
        }
        Ok(())
    }

    fn check_hosts(&self) -> TopologyResult<()> {
        let hosts: BTreeSet<&str> = self
            .storages
            .values()
            .map(|s| s.addr.ip.as_str())
            .chain(self.proxies.values().map(|p| p.addr.ip.as_str()))
            .collect();
        for ip in hosts {
            match self.machines.get(ip) {
                None => {
                    return Err(TopologyError::invariant(
                        "host_registered",
                        format!("instance placed on unregistered host {}", ip),
                    ))
                }
                Some(machine) if machine.pool == HostPool::Idle => {
                    return Err(TopologyError::invariant(
                        "idle_host_empty",
                        format!("idle host {} still owns instances", ip),
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::model::{InnerRole, StorageRole};
    use crate::topology::shape::{ClusterShape, KvEngine};

    fn storage(ip: &str, port: u16, inner_role: InnerRole) -> StorageInstance {
        StorageInstance {
            id: StorageId::new(),
            addr: InstanceAddr::new(ip, port),
            role: if inner_role == InnerRole::Master { StorageRole::Master } else { StorageRole::Slave },
            inner_role,
            status: InstanceStatus::Running,
            shard: None,
            clusters: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    fn cluster(domain: &str) -> Cluster {
        Cluster {
            id: ClusterId::new(),
            business_id: 1,
            name: "cache".to_string(),
            shape: ClusterShape::ProxiedKv { engine: KvEngine::Redis, proxy_port: 50000 },
            immutable_domain: domain.to_string(),
            proxies: BTreeSet::new(),
            storages: BTreeSet::new(),
            entries: BTreeSet::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn graph_with_pair() -> (TopologyGraph, ClusterId, StorageId, StorageId) {
        let mut graph = TopologyGraph::new();
        graph.claim_host(&HostSpec::new("10.0.0.1"), MachineRole::Storage);
        graph.claim_host(&HostSpec::new("10.0.0.2"), MachineRole::Storage);
        let c = cluster("cache.test.db");
        let cid = c.id;
        graph.insert_cluster(c);
        let master = storage("10.0.0.1", 30000, InnerRole::Master);
        let slave = storage("10.0.0.2", 30000, InnerRole::Slave);
        let (m, s) = (master.id, slave.id);
        graph.insert_storage(master);
        graph.insert_storage(slave);
        graph.attach_storage(cid, m).unwrap();
        graph.attach_storage(cid, s).unwrap();
        graph.add_edge(m, s);
        (graph, cid, m, s)
    }

    #[test]
    fn test_consistent_graph_passes() {
        let (graph, _, _, _) = graph_with_pair();
        assert!(graph.check_invariants().is_ok());
    }

    #[test]
    fn test_one_sided_membership_rejected() {
        let (mut graph, cid, m, _) = graph_with_pair();
        graph.storages.get_mut(&m).unwrap().clusters.remove(&cid);
        let err = graph.check_invariants().unwrap_err();
        assert!(err.to_string().contains("membership_bidirectional"));
    }

    #[test]
    fn test_fan_out_requires_rebuild_window() {
        let (mut graph, cid, m, _) = graph_with_pair();
        graph.claim_host(&HostSpec::new("10.0.0.3"), MachineRole::Storage);
        let extra = storage("10.0.0.3", 30000, InnerRole::Slave);
        let extra_id = extra.id;
        graph.insert_storage(extra);
        graph.attach_storage(cid, extra_id).unwrap();
        graph.add_edge(m, extra_id);

        let err = graph.check_invariants().unwrap_err();
        assert!(err.to_string().contains("single_live_receiver"));

        let old = graph.edges_from(m)[0].receiver;
        graph.open_rebuild_window(RebuildWindow {
            ejector: m,
            old_receivers: [old].into_iter().collect(),
            new_receivers: [extra_id].into_iter().collect(),
            opened_at: Utc::now(),
        });
        assert!(graph.check_invariants().is_ok());
    }

    #[test]
    fn test_duplicate_domain_rejected() {
        let (mut graph, _, _, _) = graph_with_pair();
        graph.insert_cluster(cluster("CACHE.test.db"));
        let err = graph.check_invariants().unwrap_err();
        assert!(err.to_string().contains("domain_unique"));
    }

    #[test]
    fn test_release_host_only_when_empty() {
        let (mut graph, cid, m, s) = graph_with_pair();
        assert!(!graph.release_host_if_unused("10.0.0.1"));

        graph.remove_edges_touching(m);
        graph.detach_storage(cid, m).unwrap();
        graph.remove_storage(m);
        assert!(graph.release_host_if_unused("10.0.0.1"));
        assert_eq!(graph.machine("10.0.0.1").unwrap().pool, HostPool::Idle);
        assert!(graph.storage(s).is_ok());
        assert!(graph.check_invariants().is_ok());
    }

    #[test]
    fn test_idle_host_with_instances_rejected() {
        let (mut graph, _, _, _) = graph_with_pair();
        graph.machines.get_mut("10.0.0.1").unwrap().pool = HostPool::Idle;
        let err = graph.check_invariants().unwrap_err();
        assert!(err.to_string().contains("idle_host_empty"));
    }

    #[test]
    fn test_summary_offline_without_entries() {
        let (graph, cid, _, _) = graph_with_pair();
        let summary = graph.summary(cid).unwrap();
        assert_eq!(summary.phase, ClusterPhase::Offline);
        assert_eq!(summary.status, ClusterStatus::Normal);
        assert_eq!(summary.edge_count, 1);
    }

    #[test]
    fn test_summary_online_and_abnormal() {
        let (mut graph, cid, m, s) = graph_with_pair();
        let entry = AccessEntry {
            id: EntryId::new(),
            cluster: cid,
            kind: EntryKind::Dns,
            name: "cache.test.db".to_string(),
            port: 30000,
            role: EntryRole::Primary,
            binding: EntryBinding::Members([EntryMember::Storage(m)].into_iter().collect()),
        };
        graph.insert_entry(entry).unwrap();
        graph.storage_mut(s).unwrap().status = InstanceStatus::Unavailable;

        let summary = graph.summary(cid).unwrap();
        assert_eq!(summary.phase, ClusterPhase::Online);
        assert_eq!(summary.status, ClusterStatus::Abnormal);
    }

    #[test]
    fn test_forward_entry_resolves_through_target() {
        let (mut graph, cid, m, _) = graph_with_pair();
        let target = EntryId::new();
        graph
            .insert_entry(AccessEntry {
                id: target,
                cluster: cid,
                kind: EntryKind::LoadBalancer,
                name: "10.1.1.1".to_string(),
                port: 30000,
                role: EntryRole::Primary,
                binding: EntryBinding::Members([EntryMember::Storage(m)].into_iter().collect()),
            })
            .unwrap();
        let dns = EntryId::new();
        graph
            .insert_entry(AccessEntry {
                id: dns,
                cluster: cid,
                kind: EntryKind::Dns,
                name: "cache.test.db".to_string(),
                port: 30000,
                role: EntryRole::Primary,
                binding: EntryBinding::ForwardTo(target),
            })
            .unwrap();

        assert!(graph.check_invariants().is_ok());
        assert_eq!(graph.resolve_entry(dns).unwrap(), vec![InstanceAddr::new("10.0.0.1", 30000)]);
        assert!(graph.bind_member(dns, EntryMember::Storage(m)).is_err());
    }
}
