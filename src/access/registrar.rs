//! Access-Entry Registrar
//!
//! Binds and unbinds DNS, load-balancer and service-mesh entries inside a
//! topology transaction. The graph change and the matching endpoint call
//! are always produced together: the binding is written to the working
//! copy, the endpoint call is staged on the outbox.
//!
//! An entry either holds members or forwards to another entry. A
//! forwarding entry is published to its endpoint as the target entry's
//! `name:port`.

use std::collections::BTreeSet;

use crate::outbox::{EndpointCall, SideEffect};
use crate::topology::{
    AccessEntry, ClusterId, EntryBinding, EntryId, EntryKind, EntryMember, EntryRole, InstanceAddr,
    TopologyError, TopologyGraph, TopologyResult, Transaction,
};

/// Stateless registrar; every method works on a transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessEntryRegistrar;

impl AccessEntryRegistrar {
    /// Addresses the endpoint provider should hold for an entry.
    pub fn endpoint_targets(graph: &TopologyGraph, id: EntryId) -> TopologyResult<Vec<InstanceAddr>> {
        let entry = graph.entry(id)?;
        match &entry.binding {
            EntryBinding::Members(members) => members.iter().map(|m| graph.member_addr(*m)).collect(),
            EntryBinding::ForwardTo(target) => {
                let target = graph.entry(*target)?;
                Ok(vec![InstanceAddr::new(target.name.clone(), target.port)])
            }
        }
    }

    /// Primary entries of a cluster that hold members directly.
    pub fn direct_primary_entries(graph: &TopologyGraph, cluster: ClusterId) -> TopologyResult<Vec<EntryId>> {
        let cluster = graph.cluster(cluster)?;
        Ok(graph
            .entries_of(cluster, EntryRole::Primary)
            .into_iter()
            .filter(|e| e.binding.members().is_some())
            .map(|e| e.id)
            .collect())
    }

    /// Primary entry of a given kind, if the cluster has one.
    pub fn primary_entry(graph: &TopologyGraph, cluster: ClusterId, kind: EntryKind) -> TopologyResult<Option<EntryId>> {
        let cluster = graph.cluster(cluster)?;
        Ok(graph
            .entries_of(cluster, EntryRole::Primary)
            .into_iter()
            .find(|e| e.kind == kind)
            .map(|e| e.id))
    }

    /// Create a directly-bound entry and publish its members.
    pub fn create_entry(
        tx: &mut Transaction,
        cluster: ClusterId,
        kind: EntryKind,
        name: &str,
        port: u16,
        role: EntryRole,
        members: BTreeSet<EntryMember>,
    ) -> TopologyResult<EntryId> {
        let entry = AccessEntry {
            id: EntryId::new(),
            cluster,
            kind,
            name: name.to_string(),
            port,
            role,
            binding: EntryBinding::Members(members),
        };
        let id = entry.id;
        tx.graph_mut().insert_entry(entry)?;

        let targets = Self::endpoint_targets(tx.graph(), id)?;
        if !targets.is_empty() {
            stage(tx, cluster, EndpointCall::AddTargets {
                kind,
                name: name.to_string(),
                port,
                targets,
            });
        }
        Ok(id)
    }

    /// Bind members to a directly-bound entry. Already-bound members are
    /// skipped.
    pub fn bind(tx: &mut Transaction, entry: EntryId, members: &[EntryMember]) -> TopologyResult<()> {
        let mut added = Vec::new();
        for member in members {
            if tx.graph_mut().bind_member(entry, *member)? {
                added.push(tx.graph().member_addr(*member)?);
            }
        }
        if !added.is_empty() {
            let record = tx.graph().entry(entry)?.clone();
            stage(tx, record.cluster, EndpointCall::AddTargets {
                kind: record.kind,
                name: record.name,
                port: record.port,
                targets: added,
            });
        }
        Ok(())
    }

    /// Unbind members from an entry. Members not bound are skipped.
    pub fn unbind(tx: &mut Transaction, entry: EntryId, members: &[EntryMember]) -> TopologyResult<()> {
        let mut removed = Vec::new();
        for member in members {
            let addr = tx.graph().member_addr(*member)?;
            if tx.graph_mut().unbind_member(entry, *member)? {
                removed.push(addr);
            }
        }
        if !removed.is_empty() {
            let record = tx.graph().entry(entry)?.clone();
            stage(tx, record.cluster, EndpointCall::RemoveTargets {
                kind: record.kind,
                name: record.name,
                port: record.port,
                targets: removed,
            });
        }
        Ok(())
    }

    /// Unbind a member from every entry that binds it.
    pub fn unbind_everywhere(tx: &mut Transaction, member: EntryMember) -> TopologyResult<Vec<EntryId>> {
        let entries = tx.graph().entries_binding(member);
        for entry in &entries {
            Self::unbind(tx, *entry, &[member])?;
        }
        Ok(entries)
    }

    /// Unbind every member of a directly-bound entry.
    pub fn clear(tx: &mut Transaction, entry: EntryId) -> TopologyResult<Vec<EntryMember>> {
        let members: Vec<EntryMember> = tx
            .graph()
            .entry(entry)?
            .binding
            .members()
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        Self::unbind(tx, entry, &members)?;
        Ok(members)
    }

    /// Move every binding of `old` to `new`. Returns the number of entries
    /// touched.
    pub fn replace_member(tx: &mut Transaction, old: EntryMember, new: EntryMember) -> TopologyResult<usize> {
        let entries = tx.graph().entries_binding(old);
        for entry in &entries {
            Self::bind(tx, *entry, &[new])?;
            Self::unbind(tx, *entry, &[old])?;
        }
        Ok(entries.len())
    }

    /// Turn a directly-bound entry into one forwarding to `target`.
    pub fn forward(tx: &mut Transaction, entry: EntryId, target: EntryId) -> TopologyResult<()> {
        if tx.graph().entry(target)?.binding.members().is_none() {
            return Err(TopologyError::invariant(
                "forward_depth",
                format!("entry {} must forward to a directly-bound entry", target),
            ));
        }
        Self::clear(tx, entry)?;
        tx.graph_mut().entry_mut(entry)?.binding = EntryBinding::ForwardTo(target);

        let record = tx.graph().entry(entry)?.clone();
        let targets = Self::endpoint_targets(tx.graph(), entry)?;
        stage(tx, record.cluster, EndpointCall::AddTargets {
            kind: record.kind,
            name: record.name,
            port: record.port,
            targets,
        });
        Ok(())
    }

    /// Turn a forwarding entry back into a directly-bound one holding
    /// `members`. Returns the entry it forwarded to.
    pub fn unforward(tx: &mut Transaction, entry: EntryId, members: &[EntryMember]) -> TopologyResult<EntryId> {
        let record = tx.graph().entry(entry)?.clone();
        let target = match record.binding {
            EntryBinding::ForwardTo(target) => target,
            EntryBinding::Members(_) => {
                return Err(TopologyError::invariant(
                    "entry_binding_exclusive",
                    format!("entry {} does not forward", record.name),
                ))
            }
        };
        let old_targets = Self::endpoint_targets(tx.graph(), entry)?;

        tx.graph_mut().entry_mut(entry)?.binding = EntryBinding::Members(BTreeSet::new());
        stage(tx, record.cluster, EndpointCall::RemoveTargets {
            kind: record.kind,
            name: record.name.clone(),
            port: record.port,
            targets: old_targets,
        });
        Self::bind(tx, entry, members)?;
        Ok(target)
    }

    /// Delete an entry and its endpoint record.
    pub fn delete_entry(tx: &mut Transaction, entry: EntryId) -> TopologyResult<()> {
        let record = tx.graph_mut().remove_entry(entry)?;
        stage(tx, record.cluster, EndpointCall::DeleteEntry {
            kind: record.kind,
            name: record.name,
            port: record.port,
        });
        Ok(())
    }

    /// Delete every entry owned by a cluster, forwarding entries first.
    pub fn delete_cluster_entries(tx: &mut Transaction, cluster: ClusterId) -> TopologyResult<()> {
        let mut entries: Vec<(bool, EntryId)> = tx
            .graph()
            .cluster(cluster)?
            .entries
            .iter()
            .filter_map(|id| tx.graph().entry(*id).ok())
            .map(|e| (e.binding.members().is_some(), e.id))
            .collect();
        // false (forwarding) sorts first
        entries.sort();
        for (_, id) in entries {
            Self::delete_entry(tx, id)?;
        }
        Ok(())
    }
}

fn stage(tx: &mut Transaction, cluster: ClusterId, call: EndpointCall) {
    tx.stage(Some(cluster), SideEffect::Endpoint(call));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ClusterShape, HostSpec, TopologyStore};

    // Cluster with two attached proxies and no entries yet.
    fn setup(store: &TopologyStore) -> (ClusterId, Vec<EntryMember>) {
        store
            .transaction(|tx| {
                let graph = tx.graph_mut();
                let cluster = crate::topology::Cluster {
                    id: ClusterId::new(),
                    business_id: 1,
                    name: "cache".into(),
                    shape: ClusterShape::RelationalHa { proxy_port: 10000 },
                    immutable_domain: "cache.test.db".into(),
                    proxies: BTreeSet::new(),
                    storages: BTreeSet::new(),
                    entries: BTreeSet::new(),
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                };
                let cid = cluster.id;
                graph.insert_cluster(cluster);
                let mut members = Vec::new();
                for ip in ["10.0.0.1", "10.0.0.2"] {
                    graph.claim_host(&HostSpec::new(ip), crate::topology::MachineRole::Proxy);
                    let proxy = crate::topology::ProxyInstance {
                        id: crate::topology::ProxyId::new(),
                        addr: InstanceAddr::new(ip, 10000),
                        status: crate::topology::InstanceStatus::Running,
                        backends: BTreeSet::new(),
                        entries: BTreeSet::new(),
                        cluster: None,
                        created_at: chrono::Utc::now(),
                    };
                    let pid = proxy.id;
                    graph.insert_proxy(proxy);
                    graph.attach_proxy(cid, pid)?;
                    members.push(EntryMember::Proxy(pid));
                }
                Ok::<_, TopologyError>((cid, members))
            })
            .unwrap()
            .value
    }

    #[test]
    fn test_create_entry_stages_add_targets() {
        let store = TopologyStore::in_memory();
        let (cid, members) = setup(&store);

        let committed = store
            .transaction(|tx| {
                AccessEntryRegistrar::create_entry(
                    tx,
                    cid,
                    EntryKind::Dns,
                    "cache.test.db",
                    10000,
                    EntryRole::Primary,
                    members.iter().copied().collect(),
                )
            })
            .unwrap();

        assert_eq!(committed.staged.len(), 1);
        let record = store.outbox_record(committed.staged[0]).unwrap().unwrap();
        match record.effect {
            SideEffect::Endpoint(EndpointCall::AddTargets { targets, .. }) => assert_eq!(targets.len(), 2),
            other => panic!("unexpected effect {:?}", other),
        }
        let graph = store.snapshot().unwrap();
        assert_eq!(graph.resolve_entry(committed.value).unwrap().len(), 2);
    }

    #[test]
    fn test_forward_and_unforward() {
        let store = TopologyStore::in_memory();
        let (cid, members) = setup(&store);

        let (dns, lb) = store
            .transaction(|tx| {
                let set: BTreeSet<_> = members.iter().copied().collect();
                let dns = AccessEntryRegistrar::create_entry(tx, cid, EntryKind::Dns, "cache.test.db", 10000, EntryRole::Primary, set.clone())?;
                let lb = AccessEntryRegistrar::create_entry(tx, cid, EntryKind::LoadBalancer, "10.9.9.9", 10000, EntryRole::Primary, set)?;
                AccessEntryRegistrar::forward(tx, dns, lb)?;
                Ok::<_, TopologyError>((dns, lb))
            })
            .unwrap()
            .value;

        let graph = store.snapshot().unwrap();
        assert_eq!(graph.entry(dns).unwrap().binding, EntryBinding::ForwardTo(lb));
        assert_eq!(graph.resolve_entry(dns).unwrap().len(), 2);
        assert_eq!(
            AccessEntryRegistrar::endpoint_targets(&graph, dns).unwrap(),
            vec![InstanceAddr::new("10.9.9.9", 10000)]
        );

        store
            .transaction(|tx| {
                let target = AccessEntryRegistrar::unforward(tx, dns, &members)?;
                assert_eq!(target, lb);
                AccessEntryRegistrar::delete_entry(tx, lb)
            })
            .unwrap();
        let graph = store.snapshot().unwrap();
        assert_eq!(graph.entry(dns).unwrap().binding.members().unwrap().len(), 2);
        assert!(graph.entry(lb).is_err());
    }

    #[test]
    fn test_replace_member_moves_bindings() {
        let store = TopologyStore::in_memory();
        let (cid, members) = setup(&store);

        let dns = store
            .transaction(|tx| {
                AccessEntryRegistrar::create_entry(
                    tx,
                    cid,
                    EntryKind::Dns,
                    "cache.test.db",
                    10000,
                    EntryRole::Primary,
                    [members[0]].into_iter().collect(),
                )
            })
            .unwrap()
            .value;

        let committed = store
            .transaction(|tx| AccessEntryRegistrar::replace_member(tx, members[0], members[1]))
            .unwrap();
        assert_eq!(committed.value, 1);
        assert_eq!(committed.staged.len(), 2);

        let graph = store.snapshot().unwrap();
        let bound = graph.entry(dns).unwrap().binding.members().unwrap().clone();
        assert_eq!(bound.into_iter().collect::<Vec<_>>(), vec![members[1]]);
    }
}
