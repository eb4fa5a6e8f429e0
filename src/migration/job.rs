//! Migration job and task records
//!
//! These records are the only state the orchestrator keeps between two
//! `advance()` calls. Everything here is serializable and persisted after
//! every change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::policy::{DataCheckPolicy, DataCheckRun, DisconnectPolicy};
use super::state::{JobState, SyncOperate, TaskPhase};
use crate::collaborators::RemoteJobId;
use crate::topology::InstanceAddr;

/// Migration job identifier, chosen by the caller so that `start` can be
/// retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Allocate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task identifier, unique within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

// =============================================================================
// REQUEST
// =============================================================================

/// A prepare or teardown step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// A nested workflow on the remote executor (install or flush a
    /// destination, and so on).
    Remote {
        /// Executor action name.
        action: String,
        /// Human-readable target.
        target: String,
        /// Opaque payload.
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// Take a cluster out of service through the mutation engine.
    DisableCluster {
        /// Primary domain of the cluster.
        domain: String,
    },
    /// Bring a cluster back into service through the mutation engine.
    EnableCluster {
        /// Primary domain of the cluster.
        domain: String,
    },
}

impl StepAction {
    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            StepAction::Remote { action, target, .. } => format!("{}:{}", action, target),
            StepAction::DisableCluster { domain } => format!("disable:{}", domain),
            StepAction::EnableCluster { domain } => format!("enable:{}", domain),
        }
    }
}

fn default_credential_user() -> String {
    "admin".to_string()
}

/// What to migrate, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequest {
    /// Primary domain of the source cluster.
    pub source_domain: String,
    /// Name the destination answers on.
    pub destination_domain: String,
    /// Port the destination answers on.
    pub destination_port: u16,
    /// Data-check cadence.
    #[serde(default)]
    pub check_policy: DataCheckPolicy,
    /// Whether replication stops without an operator.
    #[serde(default)]
    pub disconnect_policy: DisconnectPolicy,
    /// Steps completed before any copy is dispatched.
    #[serde(default)]
    pub prepare: Vec<StepAction>,
    /// Steps run after every task stopped.
    #[serde(default)]
    pub teardown: Vec<StepAction>,
    /// Account used to probe source instances.
    #[serde(default = "default_credential_user")]
    pub credential_user: String,
}

impl MigrationRequest {
    /// Request with default policies and no prepare or teardown steps.
    pub fn new(source_domain: impl Into<String>, destination_domain: impl Into<String>, destination_port: u16) -> Self {
        Self {
            source_domain: source_domain.into(),
            destination_domain: destination_domain.into(),
            destination_port,
            check_policy: DataCheckPolicy::default(),
            disconnect_policy: DisconnectPolicy::default(),
            prepare: Vec::new(),
            teardown: Vec::new(),
            credential_user: default_credential_user(),
        }
    }
}

// =============================================================================
// STEPS
// =============================================================================

/// Progress of a prepare or teardown step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Not issued yet.
    Pending,
    /// Issued to the executor, polled on every advance.
    Submitted {
        /// Nested workflow id.
        remote_job: RemoteJobId,
    },
    /// Finished.
    Succeeded,
    /// Finished with an error.
    Failed {
        /// Error reported by the step.
        reason: String,
    },
}

/// A prepare or teardown step and its progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// What to do.
    pub action: StepAction,
    /// How far it got.
    pub status: StepStatus,
}

impl Step {
    pub(crate) fn pending(action: StepAction) -> Self {
        Self {
            action,
            status: StepStatus::Pending,
        }
    }

    /// Whether the step finished successfully.
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

// =============================================================================
// TASKS
// =============================================================================

/// A shard chosen as a copy source during precheck.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceShard {
    /// Slot-owning master.
    pub master: InstanceAddr,
    /// Instance the copy reads from: a healthy replica, or the master of a
    /// shape without replicas.
    pub source: InstanceAddr,
    /// Estimated data size.
    pub data_size_bytes: u64,
}

/// One copy unit: a source instance, or one internal kvstore of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationTask {
    /// Task id.
    pub id: TaskId,
    /// Master of the shard being copied.
    pub master: InstanceAddr,
    /// Instance the copy reads from.
    pub source: InstanceAddr,
    /// Internal kvstore index, for engines that have several.
    pub store_unit: Option<u32>,
    /// Copy phase, advanced by the copy agent's reports.
    pub phase: TaskPhase,
    /// Whether replication should keep running.
    pub sync_operate: SyncOperate,
    /// Remote copy job, once dispatched.
    pub remote_job: Option<RemoteJobId>,
    /// Failure reported for this task.
    pub failure: Option<String>,
    /// Last time the phase changed or the task was dispatched.
    pub updated_at: DateTime<Utc>,
}

impl MigrationTask {
    pub(crate) fn new(id: TaskId, shard: &SourceShard, store_unit: Option<u32>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            master: shard.master.clone(),
            source: shard.source.clone(),
            store_unit,
            phase: TaskPhase::FullSync,
            sync_operate: SyncOperate::Running,
            remote_job: None,
            failure: None,
            updated_at: now,
        }
    }

    /// Whether the copy was handed to the executor.
    pub fn is_dispatched(&self) -> bool {
        self.remote_job.is_some()
    }

    /// Whether the task will not progress anymore.
    pub fn is_done(&self) -> bool {
        self.failure.is_some() || self.phase == TaskPhase::Stopped
    }

    /// Whether the task stopped without failure.
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.phase == TaskPhase::Stopped
    }
}

// =============================================================================
// JOB
// =============================================================================

/// A migration job and all its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    /// Job id.
    pub id: JobId,
    /// Original request.
    pub request: MigrationRequest,
    /// Job state.
    pub state: JobState,
    /// Copy tasks.
    pub tasks: Vec<MigrationTask>,
    /// Steps completed before copying.
    pub prepare: Vec<Step>,
    /// Steps run after disconnecting.
    pub teardown: Vec<Step>,
    /// Data-check cycles, oldest first.
    pub checks: Vec<DataCheckRun>,
    /// Per-source-host ceiling on copies in full sync.
    pub ceilings: BTreeMap<String, usize>,
    /// Operator confirmed the disconnect.
    pub disconnect_confirmed: bool,
    /// Set when no progress was seen for too long.
    pub stalled_since: Option<DateTime<Utc>>,
    /// Last observed task progress.
    pub last_progress_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last persisted change.
    pub updated_at: DateTime<Utc>,
}

impl MigrationJob {
    pub(crate) fn new(id: JobId, request: MigrationRequest, now: DateTime<Utc>) -> Self {
        let prepare = request.prepare.iter().cloned().map(Step::pending).collect();
        let teardown = request.teardown.iter().cloned().map(Step::pending).collect();
        Self {
            id,
            request,
            state: JobState::Precheck,
            tasks: Vec::new(),
            prepare,
            teardown,
            checks: Vec::new(),
            ceilings: BTreeMap::new(),
            disconnect_confirmed: false,
            stalled_since: None,
            last_progress_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Every task is done.
    pub fn all_done(&self) -> bool {
        self.tasks.iter().all(MigrationTask::is_done)
    }

    /// Every task stopped without failure.
    pub fn all_success(&self) -> bool {
        self.tasks.iter().all(MigrationTask::is_success)
    }

    /// Every task streams incrementally (or already stopped).
    pub fn all_incremental(&self) -> bool {
        !self.tasks.is_empty()
            && self
                .tasks
                .iter()
                .all(|t| t.failure.is_none() && t.phase >= TaskPhase::IncrementalSync)
    }

    /// First failed task, if any.
    pub fn failed_task(&self) -> Option<&MigrationTask> {
        self.tasks.iter().find(|t| t.failure.is_some())
    }

    /// Most recent data-check cycle.
    pub fn last_check(&self) -> Option<&DataCheckRun> {
        self.checks.last()
    }

    /// Number of tasks per phase.
    pub fn phase_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for task in &self.tasks {
            *counts.entry(task.phase.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Mutable task lookup.
    pub(crate) fn task_mut(&mut self, id: TaskId) -> Option<&mut MigrationTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> SourceShard {
        SourceShard {
            master: InstanceAddr::new("10.0.1.1", 30000),
            source: InstanceAddr::new("10.0.1.2", 30000),
            data_size_bytes: 1 << 20,
        }
    }

    #[test]
    fn test_completion_is_function_of_tasks() {
        let now = Utc::now();
        let mut job = MigrationJob::new(JobId::new(), MigrationRequest::new("src.db", "dst.db", 50000), now);
        job.tasks.push(MigrationTask::new(TaskId(0), &shard(), None, now));
        job.tasks.push(MigrationTask::new(TaskId(1), &shard(), None, now));
        assert!(!job.all_done());
        assert!(!job.all_incremental());

        job.tasks[0].phase = TaskPhase::IncrementalSync;
        job.tasks[1].phase = TaskPhase::IncrementalSync;
        assert!(job.all_incremental());

        job.tasks[0].phase = TaskPhase::Stopped;
        job.tasks[1].failure = Some("copy agent crashed".into());
        assert!(job.all_done());
        assert!(!job.all_success());
        assert_eq!(job.failed_task().map(|t| t.id), Some(TaskId(1)));
    }

    #[test]
    fn test_request_defaults() {
        let json = r#"{"source_domain":"a.db","destination_domain":"b.db","destination_port":50000}"#;
        let request: MigrationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.check_policy, DataCheckPolicy::Never);
        assert_eq!(request.disconnect_policy, DisconnectPolicy::Auto);
        assert_eq!(request.credential_user, "admin");
    }

    #[test]
    fn test_phase_counts() {
        let now = Utc::now();
        let mut job = MigrationJob::new(JobId::new(), MigrationRequest::new("src.db", "dst.db", 50000), now);
        for i in 0..3 {
            job.tasks.push(MigrationTask::new(TaskId(i), &shard(), Some(i), now));
        }
        job.tasks[2].phase = TaskPhase::IncrementalSync;
        let counts = job.phase_counts();
        assert_eq!(counts.get("FULL_SYNC"), Some(&2));
        assert_eq!(counts.get("INCREMENTAL_SYNC"), Some(&1));
    }
}
