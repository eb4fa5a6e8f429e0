//! Migration precheck
//!
//! Runs once, before any task exists. Every failure is a
//! `PrecheckFailed` naming the instance, host or endpoint at fault.

use std::collections::BTreeMap;

use super::errors::{MigrationError, MigrationResult};
use super::job::{MigrationRequest, SourceShard};
use super::policy::DataCheckPolicy;
use crate::collaborators::{CredentialStore, HealthProbe, InstanceProbe};
use crate::config::MigrationConfig;
use crate::topology::{Cluster, InstanceStatus, StorageInstance, TopologyGraph};

/// Source cluster and the shards chosen as copy sources.
#[derive(Debug, Clone)]
pub struct SourcePlan {
    /// Source cluster record.
    pub cluster: Cluster,
    /// One entry per master.
    pub shards: Vec<SourceShard>,
}

/// Collaborators the precheck talks to.
pub struct PrecheckContext<'a> {
    pub probe: &'a dyn HealthProbe,
    pub credentials: &'a dyn CredentialStore,
    pub config: &'a MigrationConfig,
}

/// Validate the source and destination of a migration and pick the copy
/// source of every shard.
pub fn check_migration(
    graph: &TopologyGraph,
    request: &MigrationRequest,
    ctx: &PrecheckContext<'_>,
) -> MigrationResult<SourcePlan> {
    if let DataCheckPolicy::Periodic { interval_secs: 0 } = request.check_policy {
        return Err(MigrationError::precheck("periodic data check needs a positive interval"));
    }

    let cluster = graph
        .cluster_by_domain(&request.source_domain)
        .cloned()
        .ok_or_else(|| MigrationError::precheck(format!("source cluster {} not found", request.source_domain)))?;

    let masters = graph.masters_of(&cluster);
    if masters.is_empty() {
        return Err(MigrationError::precheck(format!(
            "source cluster {} has no master",
            cluster.immutable_domain
        )));
    }

    let mut shards = Vec::with_capacity(masters.len());
    for master in masters {
        let candidates: Vec<&StorageInstance> = graph
            .receivers_of(master.id)
            .into_iter()
            .filter(|r| r.clusters.contains(&cluster.id))
            .collect();
        let shard = if cluster.shape.is_slot_sharded() {
            first_healthy_replica(graph, request, ctx, master, &candidates)?
        } else {
            every_replica_healthy(graph, request, ctx, master, &candidates)?
        };
        shards.push(shard);
    }

    check_disk_headroom(ctx, &shards)?;

    let reachable = ctx
        .probe
        .probe_endpoint(&request.destination_domain, request.destination_port)?;
    if !reachable {
        return Err(MigrationError::precheck(format!(
            "destination {}:{} unreachable",
            request.destination_domain, request.destination_port
        )));
    }

    Ok(SourcePlan { cluster, shards })
}

/// Slot-sharded shapes need one healthy registered replica per master; the
/// first one found is the copy source.
fn first_healthy_replica(
    graph: &TopologyGraph,
    request: &MigrationRequest,
    ctx: &PrecheckContext<'_>,
    master: &StorageInstance,
    candidates: &[&StorageInstance],
) -> MigrationResult<SourceShard> {
    for candidate in candidates {
        if let Some(probe) = probe_healthy(graph, request, ctx, candidate)? {
            return Ok(SourceShard {
                master: master.addr.clone(),
                source: candidate.addr.clone(),
                data_size_bytes: probe.data_size_bytes,
            });
        }
    }
    Err(MigrationError::precheck(format!(
        "master {} has no healthy registered replica",
        master.addr
    )))
}

/// Other shapes copy from their replica when there is one, and every
/// replica must be healthy. Without a replica the master is the source.
fn every_replica_healthy(
    graph: &TopologyGraph,
    request: &MigrationRequest,
    ctx: &PrecheckContext<'_>,
    master: &StorageInstance,
    candidates: &[&StorageInstance],
) -> MigrationResult<SourceShard> {
    let sources: Vec<&StorageInstance> = if candidates.is_empty() {
        vec![master]
    } else {
        candidates.to_vec()
    };

    let mut chosen = None;
    for source in sources {
        match probe_healthy(graph, request, ctx, source)? {
            Some(probe) => {
                chosen.get_or_insert(SourceShard {
                    master: master.addr.clone(),
                    source: source.addr.clone(),
                    data_size_bytes: probe.data_size_bytes,
                });
            }
            None => {
                return Err(MigrationError::precheck(format!(
                    "source instance {} is not running or unreachable",
                    source.addr
                )))
            }
        }
    }
    chosen.ok_or_else(|| MigrationError::precheck(format!("master {} has no copy source", master.addr)))
}

/// Probe an instance that is Running in the topology. `None` when it is
/// not running or does not answer.
fn probe_healthy(
    graph: &TopologyGraph,
    request: &MigrationRequest,
    ctx: &PrecheckContext<'_>,
    instance: &StorageInstance,
) -> MigrationResult<Option<InstanceProbe>> {
    if instance.status != InstanceStatus::Running {
        return Ok(None);
    }
    let zone = graph.machine(&instance.addr.ip).map(|m| m.cloud_zone).unwrap_or_default();
    let password = ctx
        .credentials
        .get_password(&instance.addr, zone, &request.credential_user)
        .map_err(|e| {
            MigrationError::precheck(format!(
                "no password for {}@{}: {}",
                request.credential_user, instance.addr, e
            ))
        })?;
    match ctx.probe.probe_instance(&instance.addr, &password) {
        Ok(probe) if probe.reachable => Ok(Some(probe)),
        Ok(_) | Err(_) => Ok(None),
    }
}

/// Every source host needs `disk_headroom_ratio` times the data copied
/// from it in free disk.
fn check_disk_headroom(ctx: &PrecheckContext<'_>, shards: &[SourceShard]) -> MigrationResult<()> {
    let mut per_host: BTreeMap<&str, u64> = BTreeMap::new();
    for shard in shards {
        *per_host.entry(shard.source.ip.as_str()).or_insert(0) += shard.data_size_bytes;
    }
    for (host, data) in per_host {
        let free = ctx.probe.host_free_disk_bytes(host)?;
        let needed = data as f64 * ctx.config.disk_headroom_ratio;
        if (free as f64) < needed {
            return Err(MigrationError::precheck(format!(
                "host {} has {} bytes free, needs {:.0}",
                host, free, needed
            )));
        }
    }
    Ok(())
}
