//! Membership rules: instance ownership, proxy tier shape, and the partial
//! decommission guard.

use std::collections::{BTreeSet, HashSet};

use super::errors::{PrecheckError, PrecheckResult};
use crate::topology::{Cluster, ClusterId, InstanceAddr, ProxyId, StorageId, TopologyGraph};

fn domain_of(graph: &TopologyGraph, id: ClusterId) -> String {
    graph
        .cluster(id)
        .map(|c| c.immutable_domain.clone())
        .unwrap_or_else(|_| id.to_string())
}

/// Request must not be empty.
pub fn check_not_empty<T>(items: &[T], what: &'static str) -> PrecheckResult<()> {
    if items.is_empty() {
        return Err(PrecheckError::EmptyRequest { what });
    }
    Ok(())
}

/// No address may appear twice in one request.
pub fn check_addrs_distinct<'a>(addrs: impl IntoIterator<Item = &'a InstanceAddr>) -> PrecheckResult<()> {
    let mut seen = HashSet::new();
    for addr in addrs {
        if !seen.insert(addr) {
            return Err(PrecheckError::DuplicateAddress { addr: addr.clone() });
        }
    }
    Ok(())
}

/// Storage instances at these addresses, if already known, must belong to
/// no cluster.
pub fn check_storages_unassigned(graph: &TopologyGraph, addrs: &[InstanceAddr]) -> PrecheckResult<()> {
    for addr in addrs {
        if let Some(storage) = graph.storage_by_addr(addr) {
            if let Some(cid) = storage.clusters.iter().next() {
                return Err(PrecheckError::InstanceAssigned {
                    addr: addr.clone(),
                    domain: domain_of(graph, *cid),
                });
            }
        }
    }
    Ok(())
}

/// Proxy instances at these addresses, if already known, must belong to no
/// cluster.
pub fn check_proxies_unassigned(graph: &TopologyGraph, addrs: &[InstanceAddr]) -> PrecheckResult<()> {
    for addr in addrs {
        if let Some(cid) = graph.proxy_by_addr(addr).and_then(|p| p.cluster) {
            return Err(PrecheckError::InstanceAssigned {
                addr: addr.clone(),
                domain: domain_of(graph, cid),
            });
        }
    }
    Ok(())
}

/// Proxies must not route to any backend before they are registered.
pub fn check_proxies_empty_backends(graph: &TopologyGraph, addrs: &[InstanceAddr]) -> PrecheckResult<()> {
    for addr in addrs {
        if let Some(proxy) = graph.proxy_by_addr(addr) {
            if !proxy.backends.is_empty() {
                return Err(PrecheckError::ProxyHasBackends {
                    addr: addr.clone(),
                    backends: proxy.backends.len(),
                });
            }
        }
    }
    Ok(())
}

/// Cluster shape must have a proxy tier. Returns the uniform proxy port.
pub fn check_shape_accepts_proxies(cluster: &Cluster) -> PrecheckResult<u16> {
    cluster
        .shape
        .proxy_port()
        .ok_or_else(|| PrecheckError::ShapeHasNoProxies {
            cluster_type: cluster.shape.type_name().to_string(),
        })
}

/// Every proxy must listen on the cluster's proxy port.
pub fn check_proxy_port_uniform(expected: u16, addrs: &[InstanceAddr]) -> PrecheckResult<()> {
    for addr in addrs {
        if addr.port != expected {
            return Err(PrecheckError::ProxyPortMismatch {
                addr: addr.clone(),
                expected,
                actual: addr.port,
            });
        }
    }
    Ok(())
}

/// Every storage must be a member of the cluster.
pub fn check_storages_member(graph: &TopologyGraph, cluster: &Cluster, ids: &[StorageId]) -> PrecheckResult<()> {
    for id in ids {
        if !cluster.storages.contains(id) {
            let addr = graph
                .storage(*id)
                .map(|s| s.addr.to_string())
                .unwrap_or_else(|_| id.to_string());
            return Err(PrecheckError::NotAMember {
                addr,
                domain: cluster.immutable_domain.clone(),
            });
        }
    }
    Ok(())
}

/// Every proxy must be a member of the cluster.
pub fn check_proxies_member(graph: &TopologyGraph, cluster: &Cluster, ids: &[ProxyId]) -> PrecheckResult<()> {
    for id in ids {
        if !cluster.proxies.contains(id) {
            let addr = graph
                .proxy(*id)
                .map(|p| p.addr.to_string())
                .unwrap_or_else(|_| id.to_string());
            return Err(PrecheckError::NotAMember {
                addr,
                domain: cluster.immutable_domain.clone(),
            });
        }
    }
    Ok(())
}

/// A partial decommission must leave at least one member of the role.
/// `is_all` marks a whole-cluster decommission and skips the guard.
pub fn check_not_full_membership<T: Ord>(
    cluster: &Cluster,
    role: &'static str,
    subset: &BTreeSet<T>,
    members: &BTreeSet<T>,
    is_all: bool,
) -> PrecheckResult<()> {
    if is_all || members.is_empty() {
        return Ok(());
    }
    if members.iter().all(|m| subset.contains(m)) {
        return Err(PrecheckError::FullMembership {
            domain: cluster.immutable_domain.clone(),
            role,
            count: members.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ClusterShape, KvEngine};
    use chrono::Utc;

    fn cluster(shape: ClusterShape) -> Cluster {
        Cluster {
            id: ClusterId::new(),
            business_id: 1,
            name: "cache".into(),
            shape,
            immutable_domain: "cache.test.db".into(),
            proxies: BTreeSet::new(),
            storages: BTreeSet::new(),
            entries: BTreeSet::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_duplicate_addresses() {
        let a = InstanceAddr::new("10.0.0.1", 30000);
        let b = InstanceAddr::new("10.0.0.2", 30000);
        assert!(check_addrs_distinct([&a, &b]).is_ok());
        assert!(matches!(
            check_addrs_distinct([&a, &b, &a]),
            Err(PrecheckError::DuplicateAddress { .. })
        ));
    }

    #[test]
    fn test_proxy_tier_shape() {
        let proxied = cluster(ClusterShape::ProxiedKv { engine: KvEngine::Redis, proxy_port: 50000 });
        assert_eq!(check_shape_accepts_proxies(&proxied).unwrap(), 50000);

        let native = cluster(ClusterShape::NativeKvCluster { engine: KvEngine::Redis });
        assert!(matches!(
            check_shape_accepts_proxies(&native),
            Err(PrecheckError::ShapeHasNoProxies { .. })
        ));
    }

    #[test]
    fn test_proxy_port_uniform() {
        let ok = [InstanceAddr::new("10.0.0.1", 50000)];
        let bad = [InstanceAddr::new("10.0.0.1", 50000), InstanceAddr::new("10.0.0.2", 50001)];
        assert!(check_proxy_port_uniform(50000, &ok).is_ok());
        let err = check_proxy_port_uniform(50000, &bad).unwrap_err();
        assert_eq!(err.code(), "TOPO_PRECHECK_PROXY_PORT_MISMATCH");
    }

    #[test]
    fn test_full_membership_guard() {
        let c = cluster(ClusterShape::RelationalSingle);
        let members: BTreeSet<u32> = [1, 2].into_iter().collect();
        let one: BTreeSet<u32> = [1].into_iter().collect();

        assert!(check_not_full_membership(&c, "proxy", &one, &members, false).is_ok());
        assert!(check_not_full_membership(&c, "proxy", &members, &members, false).is_err());
        assert!(check_not_full_membership(&c, "proxy", &members, &members, true).is_ok());
    }
}
