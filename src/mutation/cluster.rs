//! Cluster lifecycle: create, disable, enable, decommission, load balancer.

use chrono::Utc;
use std::collections::BTreeSet;

use super::engine::{Applied, TopologyEngine};
use super::errors::MutationResult;
use super::placement::{
    is_online, link_replicas, place_proxy, place_storage, proxy_labels, route_to_masters, serving_members,
    serving_port, stage_inventory, stage_registration, storage_labels, Retirement,
};
use super::report::OperationReport;
use super::request::{check_has_master, check_replica_sources, CreateClusterRequest};
use crate::access::AccessEntryRegistrar;
use crate::observability::Event;
use crate::outbox::InventoryCall;
use crate::precheck::{self, PrecheckError};
use crate::topology::{
    Cluster, ClusterId, ClusterKey, EntryBinding, EntryKind, EntryRole, InstanceAddr, TopologyError,
};

impl TopologyEngine {
    /// Create a cluster with its instances, replication edges and primary
    /// access entry.
    pub fn create_cluster(&self, request: &CreateClusterRequest) -> MutationResult<OperationReport> {
        self.run("CREATE_CLUSTER", Event::ClusterCreated, &request.domain, |tx| {
            let graph = tx.graph();
            let shape = request.shape;

            precheck::check_domain_format(&request.domain)?;
            precheck::check_domain_available(graph, &request.domain)?;
            precheck::check_cluster_key_available(
                graph,
                &ClusterKey {
                    business_id: request.business_id,
                    name: request.name.clone(),
                    cluster_type: shape.type_name().to_string(),
                },
            )?;
            precheck::check_not_empty(&request.storages, "storages")?;
            check_has_master(&request.storages)?;

            let proxy_addrs: Vec<InstanceAddr> = request.proxies.iter().map(|p| p.addr()).collect();
            let storage_addrs: Vec<InstanceAddr> = request.storages.iter().map(|s| s.addr()).collect();
            match shape.proxy_port() {
                Some(port) => {
                    precheck::check_not_empty(&request.proxies, "proxies")?;
                    precheck::check_proxy_port_uniform(port, &proxy_addrs)?;
                }
                None if !request.proxies.is_empty() => {
                    return Err(PrecheckError::ShapeHasNoProxies {
                        cluster_type: shape.type_name().to_string(),
                    }
                    .into());
                }
                None => {}
            }
            precheck::check_addrs_distinct(proxy_addrs.iter().chain(storage_addrs.iter()))?;
            precheck::check_proxies_unassigned(graph, &proxy_addrs)?;
            precheck::check_proxies_empty_backends(graph, &proxy_addrs)?;
            precheck::check_storages_unassigned(graph, &storage_addrs)?;
            check_replica_sources(graph, None, &request.storages)?;

            let now = Utc::now();
            let cluster = Cluster {
                id: ClusterId::new(),
                business_id: request.business_id,
                name: request.name.clone(),
                shape,
                immutable_domain: request.domain.clone(),
                proxies: BTreeSet::new(),
                storages: BTreeSet::new(),
                entries: BTreeSet::new(),
                created_at: now,
                updated_at: now,
            };
            let cid = cluster.id;
            tx.graph_mut().insert_cluster(cluster);

            let storages = request
                .storages
                .iter()
                .map(|spec| place_storage(tx, cid, spec))
                .collect::<Result<Vec<_>, TopologyError>>()?;
            link_replicas(tx, &request.storages)?;
            let proxies = request
                .proxies
                .iter()
                .map(|spec| place_proxy(tx, cid, spec))
                .collect::<Result<Vec<_>, TopologyError>>()?;
            route_to_masters(tx, cid, &proxies)?;

            let members = serving_members(tx.graph(), cid)?.into_iter().collect();
            let port = serving_port(tx.graph(), cid)?;
            AccessEntryRegistrar::create_entry(
                tx,
                cid,
                request.entry_kind,
                &request.domain,
                port,
                EntryRole::Primary,
                members,
            )?;

            let record = tx.graph().cluster(cid)?.clone();
            let mut labels = storage_labels(tx.graph(), &record, &storages)?;
            labels.extend(proxy_labels(tx.graph(), &record, &proxies)?);
            stage_inventory(tx, cid, InventoryCall::CreateModule {
                cluster_id: cid,
                business_id: record.business_id,
                domain: record.immutable_domain.clone(),
            });
            stage_registration(tx, &record, labels);
            Ok(Applied::cluster(cid))
        })
    }

    /// Take a cluster out of service by unbinding its primary entries.
    pub fn disable_cluster(&self, cluster: ClusterId) -> MutationResult<OperationReport> {
        self.run("DISABLE_CLUSTER", Event::ClusterDisabled, &cluster.to_string(), |tx| {
            let domain = tx.graph().cluster(cluster)?.immutable_domain.clone();
            if !is_online(tx.graph(), cluster)? {
                return Err(PrecheckError::PhaseUnchanged { domain, phase: "offline" }.into());
            }

            for entry in AccessEntryRegistrar::direct_primary_entries(tx.graph(), cluster)? {
                AccessEntryRegistrar::clear(tx, entry)?;
            }
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }

    /// Bring a disabled cluster back into service.
    pub fn enable_cluster(&self, cluster: ClusterId) -> MutationResult<OperationReport> {
        self.run("ENABLE_CLUSTER", Event::ClusterEnabled, &cluster.to_string(), |tx| {
            let domain = tx.graph().cluster(cluster)?.immutable_domain.clone();
            if is_online(tx.graph(), cluster)? {
                return Err(PrecheckError::PhaseUnchanged { domain, phase: "online" }.into());
            }
            let members = serving_members(tx.graph(), cluster)?;
            if members.is_empty() {
                return Err(PrecheckError::EmptyRequest { what: "serving members" }.into());
            }

            for entry in AccessEntryRegistrar::direct_primary_entries(tx.graph(), cluster)? {
                AccessEntryRegistrar::bind(tx, entry, &members)?;
            }
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }

    /// Remove a cluster with all of its instances and entries.
    pub fn decommission_cluster(&self, cluster: ClusterId) -> MutationResult<OperationReport> {
        let usernames = self.settings().privileged_usernames.clone();
        self.run("DECOMMISSION_CLUSTER", Event::ClusterDecommissioned, &cluster.to_string(), |tx| {
            let record = tx.graph().cluster(cluster)?.clone();

            AccessEntryRegistrar::delete_cluster_entries(tx, cluster)?;
            let mut retirement = Retirement::default();
            for proxy in &record.proxies {
                retirement.retire_proxy(tx, cluster, *proxy)?;
            }
            for storage in &record.storages {
                retirement.retire_storage(tx, cluster, *storage)?;
            }
            let released = retirement.stage(tx, cluster, &record.immutable_domain, &usernames);

            tx.graph_mut().remove_cluster(cluster);
            stage_inventory(tx, cluster, InventoryCall::DeleteModule {
                cluster_id: cluster,
                domain: record.immutable_domain.clone(),
            });
            Ok(Applied {
                cluster,
                released_hosts: released,
            })
        })
    }

    /// Put a load balancer in front of the proxies and make the DNS entry
    /// forward to it.
    pub fn attach_load_balancer(&self, cluster: ClusterId, vip: &str) -> MutationResult<OperationReport> {
        self.run("ATTACH_LOAD_BALANCER", Event::LoadBalancerAttached, vip, |tx| {
            let record = tx.graph().cluster(cluster)?.clone();
            let port = precheck::check_shape_accepts_proxies(&record)?;
            if let Some(existing) = AccessEntryRegistrar::primary_entry(tx.graph(), cluster, EntryKind::LoadBalancer)? {
                return Err(PrecheckError::LoadBalancerAttached {
                    domain: record.immutable_domain.clone(),
                    name: tx.graph().entry(existing)?.name.clone(),
                }
                .into());
            }
            precheck::check_entry_name_available(tx.graph(), vip)?;
            let dns = AccessEntryRegistrar::primary_entry(tx.graph(), cluster, EntryKind::Dns)?
                .ok_or_else(|| TopologyError::not_found("dns entry", &record.immutable_domain))?;

            let members = tx
                .graph()
                .entry(dns)?
                .binding
                .members()
                .cloned()
                .unwrap_or_default();
            let lb = AccessEntryRegistrar::create_entry(
                tx,
                cluster,
                EntryKind::LoadBalancer,
                vip,
                port,
                EntryRole::Primary,
                members,
            )?;
            AccessEntryRegistrar::forward(tx, dns, lb)?;
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }

    /// Point the DNS entry back at the proxies and delete the load
    /// balancer entry.
    pub fn detach_load_balancer(&self, cluster: ClusterId) -> MutationResult<OperationReport> {
        self.run("DETACH_LOAD_BALANCER", Event::LoadBalancerDetached, &cluster.to_string(), |tx| {
            let domain = tx.graph().cluster(cluster)?.immutable_domain.clone();
            let lb = AccessEntryRegistrar::primary_entry(tx.graph(), cluster, EntryKind::LoadBalancer)?
                .ok_or(PrecheckError::NoLoadBalancer { domain })?;

            let members: Vec<_> = tx
                .graph()
                .entry(lb)?
                .binding
                .members()
                .map(|m| m.iter().copied().collect())
                .unwrap_or_default();
            let forwarding: Vec<_> = tx
                .graph()
                .entries
                .values()
                .filter(|e| e.binding == EntryBinding::ForwardTo(lb))
                .map(|e| e.id)
                .collect();
            for entry in forwarding {
                AccessEntryRegistrar::unforward(tx, entry, &members)?;
            }
            AccessEntryRegistrar::delete_entry(tx, lb)?;
            tx.graph_mut().touch_cluster(cluster);
            Ok(Applied::cluster(cluster))
        })
    }
}
