//! Task planning and dispatch throttling

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::job::{MigrationJob, MigrationTask, SourceShard, TaskId};
use super::state::TaskPhase;
use crate::config::MigrationConfig;
use crate::topology::{ClusterShape, KvEngine};

/// Tasks for every shard, and the per-host ceiling on concurrent full syncs.
///
/// Engines with internal kvstores get one task per kvstore.
pub fn plan_tasks(
    shape: &ClusterShape,
    shards: &[SourceShard],
    config: &MigrationConfig,
    now: DateTime<Utc>,
) -> (Vec<MigrationTask>, BTreeMap<String, usize>) {
    let units: Option<u32> = match shape.kv_engine() {
        Some(KvEngine::Tendisplus) => Some(config.store_units.max(1)),
        _ => None,
    };
    let ceiling = concurrency_ceiling(shape, config);

    let mut tasks = Vec::new();
    let mut ceilings = BTreeMap::new();
    let mut next = 0u32;
    for shard in shards {
        ceilings.insert(shard.source.ip.clone(), ceiling);
        match units {
            Some(count) => {
                for unit in 0..count {
                    tasks.push(MigrationTask::new(TaskId(next), shard, Some(unit), now));
                    next += 1;
                }
            }
            None => {
                tasks.push(MigrationTask::new(TaskId(next), shard, None, now));
                next += 1;
            }
        }
    }
    (tasks, ceilings)
}

/// Copies allowed at once from one source host.
pub fn concurrency_ceiling(shape: &ClusterShape, config: &MigrationConfig) -> usize {
    let large = shape.kv_engine().is_some_and(|e| e.has_large_footprint());
    let ceiling = if large {
        config.large_footprint_concurrency
    } else {
        config.default_concurrency
    };
    ceiling.max(1)
}

/// Undispatched tasks that may be submitted now: per source host, only as
/// many as keep the number of copies in full sync within the ceiling.
pub fn dispatchable(job: &MigrationJob) -> Vec<TaskId> {
    let mut busy: BTreeMap<&str, usize> = BTreeMap::new();
    for task in &job.tasks {
        if task.is_dispatched() && task.failure.is_none() && task.phase == TaskPhase::FullSync {
            *busy.entry(task.source.ip.as_str()).or_insert(0) += 1;
        }
    }

    let mut ready = Vec::new();
    for task in job.tasks.iter().filter(|t| !t.is_dispatched() && t.failure.is_none()) {
        let host = task.source.ip.as_str();
        let ceiling = job.ceilings.get(host).copied().unwrap_or(1);
        let running = busy.entry(host).or_insert(0);
        if *running < ceiling {
            *running += 1;
            ready.push(task.id);
        }
    }
    ready
}
