//! Migration Orchestrator
//!
//! `advance()` is called by an external scheduler on a fixed interval. One
//! call loads the job, polls what it is waiting on, takes at most one state
//! step, persists the job if anything changed, and returns. It never waits
//! on a remote job; submissions and status reads return immediately.
//!
//! The copy agent reports task phases through `report_task_progress`. The
//! orchestrator only observes them.
//!
//! Every entry point that writes a job holds that job's lock from load to
//! save, so a report arriving during `advance()` waits for it instead of
//! being overwritten by a stale copy. Collaborators must not call back into
//! the orchestrator from inside `submit` or `status` on the same thread.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::errors::{MigrationError, MigrationResult};
use super::job::{JobId, MigrationJob, MigrationRequest, Step, StepAction, StepStatus, TaskId};
use super::planner::{dispatchable, plan_tasks};
use super::policy::{should_disconnect, should_start_check, DataCheckRun};
use super::precheck::{check_migration, PrecheckContext};
use super::state::{JobState, SyncOperate, TaskPhase};
use super::store::MigrationStore;
use crate::collaborators::{CredentialStore, HealthProbe, JobRequest, RemoteExecutor, RemoteJobStatus};
use crate::config::MigrationConfig;
use crate::mutation::TopologyEngine;
use crate::observability::{log_event_at, log_event_with_fields, Event, MetricsRegistry, ObservationScope, Severity};

/// Executor action copying one task's data.
pub const COPY_ACTION: &str = "migration_copy";

/// Executor action running one data-check-and-repair cycle.
pub const DATA_CHECK_ACTION: &str = "migration_data_check";

/// What one `advance()` call observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Call again later.
    NotDone,
    /// The job finished.
    Done,
    /// The job failed.
    Failed(String),
}

enum StepsOutcome {
    Pending,
    Done,
    Failed(String),
}

/// External systems the orchestrator drives.
pub struct MigrationCollaborators {
    pub executor: Arc<dyn RemoteExecutor>,
    pub probe: Arc<dyn HealthProbe>,
    pub credentials: Arc<dyn CredentialStore>,
}

/// The migration orchestrator.
pub struct MigrationEngine {
    store: Arc<dyn MigrationStore>,
    topology: Arc<TopologyEngine>,
    executor: Arc<dyn RemoteExecutor>,
    probe: Arc<dyn HealthProbe>,
    credentials: Arc<dyn CredentialStore>,
    metrics: Arc<MetricsRegistry>,
    config: MigrationConfig,
    locks: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
}

impl MigrationEngine {
    /// Create an orchestrator.
    pub fn new(
        store: Arc<dyn MigrationStore>,
        topology: Arc<TopologyEngine>,
        collaborators: MigrationCollaborators,
        metrics: Arc<MetricsRegistry>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            store,
            topology,
            executor: collaborators.executor,
            probe: collaborators.probe,
            credentials: collaborators.credentials,
            metrics,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Load a job.
    pub fn job(&self, id: JobId) -> MigrationResult<MigrationJob> {
        self.store
            .load(id)?
            .ok_or_else(|| MigrationError::JobNotFound(id.to_string()))
    }

    /// Every job.
    pub fn jobs(&self) -> MigrationResult<Vec<MigrationJob>> {
        self.store.list()
    }

    // =========================================================================
    // ENTRY POINTS
    // =========================================================================

    /// Precheck and plan a job.
    ///
    /// Re-entrant: if a job with this id already exists it is returned
    /// unchanged. A failed precheck persists the job as FAILED with no
    /// tasks and returns the precheck error.
    pub fn start(&self, id: JobId, request: MigrationRequest) -> MigrationResult<MigrationJob> {
        let job_field = id.to_string();
        let lock = self.job_lock(id)?;
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let scope = ObservationScope::with_fields("MIGRATION_START", &[("job", job_field.as_str())]);

        if let Some(existing) = self.store.load(id)? {
            scope.complete_with_fields(&[("resumed", "true"), ("state", existing.state.state_name())]);
            return Ok(existing);
        }

        let now = Utc::now();
        let mut job = MigrationJob::new(id, request, now);
        let graph = self.topology.store().snapshot()?;
        let ctx = PrecheckContext {
            probe: self.probe.as_ref(),
            credentials: self.credentials.as_ref(),
            config: &self.config,
        };

        let plan = match check_migration(&graph, &job.request, &ctx) {
            Ok(plan) => plan,
            Err(err) => {
                let reason = err.to_string();
                job.state = job.state.clone().fail(reason.clone())?;
                self.store.save(&job)?;
                self.metrics.increment_migration_jobs_failed();
                log_event_at(
                    Severity::Error,
                    Event::MigrationFailed,
                    &[("job", job_field.as_str()), ("reason", reason.as_str())],
                );
                scope.fail(err.code(), &reason);
                return Err(err);
            }
        };

        let (tasks, ceilings) = plan_tasks(&plan.cluster.shape, &plan.shards, &self.config, now);
        job.tasks = tasks;
        job.ceilings = ceilings;
        job.state = job.state.clone().begin_execution()?;
        self.store.save(&job)?;
        self.metrics.increment_migration_jobs_started();

        let tasks = job.tasks.len().to_string();
        log_event_with_fields(
            Event::MigrationStarted,
            &[
                ("job", job_field.as_str()),
                ("source", job.request.source_domain.as_str()),
                ("destination", job.request.destination_domain.as_str()),
                ("tasks", tasks.as_str()),
            ],
        );
        scope.complete_with_fields(&[("tasks", tasks.as_str())]);
        Ok(job)
    }

    /// Evaluate a job once. Never blocks; idempotent for an unchanged
    /// observed state.
    pub fn advance(&self, id: JobId) -> MigrationResult<AdvanceOutcome> {
        self.metrics.increment_migration_polls();
        let lock = self.job_lock(id)?;
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut job = self.job(id)?;
        if let Some(outcome) = terminal_outcome(&job.state) {
            return Ok(outcome);
        }

        let before = job.clone();
        let now = Utc::now();
        let outcome = self.step(&mut job, now)?;

        if job != before {
            job.last_progress_at = now;
            job.stalled_since = None;
            let job_field = job.id.to_string();
            let counts = serde_json::to_string(&job.phase_counts()).unwrap_or_default();
            log_event_with_fields(
                Event::MigrationAdvanced,
                &[
                    ("job", job_field.as_str()),
                    ("state", job.state.state_name()),
                    ("tasks", counts.as_str()),
                ],
            );
        } else {
            self.detect_stall(&mut job, now);
        }

        if job != before {
            job.updated_at = now;
            self.store.save(&job)?;
        }
        Ok(outcome)
    }

    /// Ingest a phase report from the copy agent.
    ///
    /// Repeating the current phase is a no-op; a lower phase is rejected.
    pub fn report_task_progress(&self, id: JobId, task: TaskId, phase: TaskPhase) -> MigrationResult<MigrationJob> {
        let lock = self.job_lock(id)?;
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut job = self.active_job(id, "EXECUTING")?;
        let now = Utc::now();
        let record = job.task_mut(task).ok_or_else(|| MigrationError::TaskNotFound {
            job: id.to_string(),
            task: task.to_string(),
        })?;

        if phase < record.phase {
            return Err(MigrationError::BackwardProgress {
                task: task.to_string(),
                from: record.phase.as_str(),
                to: phase.as_str(),
            });
        }
        if phase == record.phase {
            return Ok(job);
        }
        record.phase = phase;
        record.updated_at = now;

        job.last_progress_at = now;
        job.stalled_since = None;
        job.updated_at = now;
        self.store.save(&job)?;
        Ok(job)
    }

    /// Record a task failure reported by the copy agent. The job fails on
    /// the next `advance()`.
    pub fn report_task_failure(&self, id: JobId, task: TaskId, reason: &str) -> MigrationResult<MigrationJob> {
        let lock = self.job_lock(id)?;
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut job = self.active_job(id, "FAILED")?;
        let now = Utc::now();
        let record = job.task_mut(task).ok_or_else(|| MigrationError::TaskNotFound {
            job: id.to_string(),
            task: task.to_string(),
        })?;
        if record.failure.is_none() {
            record.failure = Some(reason.to_string());
            record.updated_at = now;
            job.updated_at = now;
            self.store.save(&job)?;
        }
        Ok(job)
    }

    /// Operator confirmation for a manual disconnect.
    pub fn confirm_disconnect(&self, id: JobId) -> MigrationResult<MigrationJob> {
        let lock = self.job_lock(id)?;
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut job = self.active_job(id, "DISCONNECTING")?;
        if !job.disconnect_confirmed {
            job.disconnect_confirmed = true;
            job.updated_at = Utc::now();
            self.store.save(&job)?;
        }
        Ok(job)
    }

    /// Abandon a job. Remote jobs already dispatched keep running; nothing
    /// is reverted.
    pub fn cancel(&self, id: JobId) -> MigrationResult<MigrationJob> {
        let lock = self.job_lock(id)?;
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut job = self.job(id)?;
        job.state = job.state.clone().fail("cancelled")?;
        job.updated_at = Utc::now();
        self.store.save(&job)?;
        self.metrics.increment_migration_jobs_failed();
        let job_field = id.to_string();
        log_event_at(
            Severity::Warn,
            Event::MigrationFailed,
            &[("job", job_field.as_str()), ("reason", "cancelled")],
        );
        Ok(job)
    }

    /// Lock serializing writers of one job. It guards no data, so a
    /// poisoned lock is still usable.
    fn job_lock(&self, id: JobId) -> MigrationResult<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(|_| MigrationError::LockPoisoned)?;
        Ok(Arc::clone(locks.entry(id).or_default()))
    }

    fn active_job(&self, id: JobId, to: &'static str) -> MigrationResult<MigrationJob> {
        let job = self.job(id)?;
        if job.state.is_terminal() {
            return Err(MigrationError::ForbiddenTransition {
                from: job.state.state_name(),
                to,
            });
        }
        Ok(job)
    }

    // =========================================================================
    // STATE STEP
    // =========================================================================

    fn step(&self, job: &mut MigrationJob, now: DateTime<Utc>) -> MigrationResult<AdvanceOutcome> {
        match self.poll_steps(job.id, &mut job.prepare) {
            StepsOutcome::Done => {}
            StepsOutcome::Pending => return Ok(AdvanceOutcome::NotDone),
            StepsOutcome::Failed(reason) => return self.fail(job, reason),
        }

        self.poll_tasks(job, now);
        if let Some(task) = job.failed_task() {
            let reason = format!("{} failed: {}", task.id, task.failure.as_deref().unwrap_or_default());
            return self.fail(job, reason);
        }
        if job.state != JobState::Disconnecting {
            self.dispatch_tasks(job, now);
        }

        match job.state {
            JobState::Executing => self.evaluate_streaming(job, now),
            JobState::DataCheckRepair => self.poll_data_check(job, now),
            JobState::Disconnecting => self.finish_disconnect(job),
            // Precheck jobs never get here: `start` leaves them Executing or Failed.
            JobState::Precheck | JobState::Done | JobState::Failed { .. } => {
                Ok(terminal_outcome(&job.state).unwrap_or(AdvanceOutcome::NotDone))
            }
        }
    }

    /// Executing with every task streaming: start a check cycle or
    /// disconnect, as the policies say.
    fn evaluate_streaming(&self, job: &mut MigrationJob, now: DateTime<Utc>) -> MigrationResult<AdvanceOutcome> {
        if !job.all_incremental() {
            return Ok(AdvanceOutcome::NotDone);
        }
        let request = &job.request;

        if should_start_check(request.check_policy, job.last_check(), now) {
            let submit = JobRequest::new(
                DATA_CHECK_ACTION,
                request.destination_domain.clone(),
                json!({
                    "job": job.id,
                    "cycle": job.checks.len(),
                    "source": request.source_domain,
                    "destination": request.destination_domain,
                }),
            );
            match self.executor.submit(&submit) {
                Ok(remote) => {
                    job.checks.push(DataCheckRun::submitted(remote, now));
                    job.state = job.state.clone().begin_data_check()?;
                    let job_field = job.id.to_string();
                    let cycle = job.checks.len().to_string();
                    log_event_with_fields(
                        Event::MigrationDataCheckStarted,
                        &[("job", job_field.as_str()), ("cycle", cycle.as_str())],
                    );
                }
                Err(err) => self.log_deferred(job, "data_check", &err.to_string()),
            }
            return Ok(AdvanceOutcome::NotDone);
        }

        if should_disconnect(
            request.check_policy,
            request.disconnect_policy,
            job.last_check(),
            job.disconnect_confirmed,
        ) {
            for task in &mut job.tasks {
                task.sync_operate = SyncOperate::StopRequested;
            }
            job.state = job.state.clone().begin_disconnect()?;
            let job_field = job.id.to_string();
            log_event_with_fields(Event::MigrationDisconnectRequested, &[("job", job_field.as_str())]);
        }
        Ok(AdvanceOutcome::NotDone)
    }

    fn poll_data_check(&self, job: &mut MigrationJob, now: DateTime<Utc>) -> MigrationResult<AdvanceOutcome> {
        let Some(run) = job.checks.last_mut() else {
            job.state = job.state.clone().finish_data_check()?;
            return Ok(AdvanceOutcome::NotDone);
        };
        let status = match self.executor.status(&run.remote_job) {
            Ok(status) => status,
            Err(err) => {
                let reason = err.to_string();
                self.log_deferred(job, "data_check_status", &reason);
                return Ok(AdvanceOutcome::NotDone);
            }
        };
        run.observe(status.clone(), now);

        match status {
            RemoteJobStatus::Succeeded => {
                job.state = job.state.clone().finish_data_check()?;
                self.evaluate_streaming(job, now)
            }
            RemoteJobStatus::Failed(reason) => self.fail(job, format!("data check failed: {}", reason)),
            RemoteJobStatus::Pending | RemoteJobStatus::Running => Ok(AdvanceOutcome::NotDone),
        }
    }

    fn finish_disconnect(&self, job: &mut MigrationJob) -> MigrationResult<AdvanceOutcome> {
        if !(job.all_done() && job.all_success()) {
            return Ok(AdvanceOutcome::NotDone);
        }
        match self.poll_steps(job.id, &mut job.teardown) {
            StepsOutcome::Pending => Ok(AdvanceOutcome::NotDone),
            StepsOutcome::Failed(reason) => self.fail(job, reason),
            StepsOutcome::Done => {
                job.state = job.state.clone().complete()?;
                self.metrics.increment_migration_jobs_done();
                let job_field = job.id.to_string();
                log_event_with_fields(Event::MigrationDone, &[("job", job_field.as_str())]);
                Ok(AdvanceOutcome::Done)
            }
        }
    }

    fn fail(&self, job: &mut MigrationJob, reason: String) -> MigrationResult<AdvanceOutcome> {
        job.state = job.state.clone().fail(reason.clone())?;
        self.metrics.increment_migration_jobs_failed();
        let job_field = job.id.to_string();
        log_event_at(
            Severity::Error,
            Event::MigrationFailed,
            &[("job", job_field.as_str()), ("reason", reason.as_str())],
        );
        Ok(AdvanceOutcome::Failed(reason))
    }

    // =========================================================================
    // TASKS
    // =========================================================================

    /// A failed remote copy job fails its task.
    fn poll_tasks(&self, job: &mut MigrationJob, now: DateTime<Utc>) {
        for task in job.tasks.iter_mut().filter(|t| !t.is_done()) {
            let Some(remote) = &task.remote_job else {
                continue;
            };
            if let Ok(RemoteJobStatus::Failed(reason)) = self.executor.status(remote) {
                task.failure = Some(reason);
                task.updated_at = now;
            }
        }
    }

    fn dispatch_tasks(&self, job: &mut MigrationJob, now: DateTime<Utc>) {
        for id in dispatchable(job) {
            let job_id = job.id;
            let destination = job.request.destination_domain.clone();
            let Some(task) = job.task_mut(id) else {
                continue;
            };
            let request = JobRequest::new(
                COPY_ACTION,
                task.source.to_string(),
                json!({
                    "job": job_id,
                    "task": task.id.0,
                    "source": task.source,
                    "master": task.master,
                    "store_unit": task.store_unit,
                    "destination": destination,
                }),
            );
            match self.executor.submit(&request) {
                Ok(remote) => {
                    task.remote_job = Some(remote);
                    task.updated_at = now;
                }
                Err(err) => {
                    let reason = err.to_string();
                    self.log_deferred(job, "copy", &reason);
                    break;
                }
            }
        }
    }

    // =========================================================================
    // PREPARE / TEARDOWN
    // =========================================================================

    /// Run steps in order; each must succeed before the next is issued.
    fn poll_steps(&self, job: JobId, steps: &mut [Step]) -> StepsOutcome {
        for step in steps.iter_mut() {
            if step.status == StepStatus::Pending {
                self.issue_step(job, step);
            }
            if let StepStatus::Submitted { remote_job } = &step.status {
                match self.executor.status(remote_job) {
                    Ok(RemoteJobStatus::Succeeded) => step.status = StepStatus::Succeeded,
                    Ok(RemoteJobStatus::Failed(reason)) => step.status = StepStatus::Failed { reason },
                    Ok(_) | Err(_) => {}
                }
            }
            match &step.status {
                StepStatus::Succeeded => continue,
                StepStatus::Failed { reason } => {
                    return StepsOutcome::Failed(format!("step {} failed: {}", step.action.label(), reason))
                }
                StepStatus::Pending | StepStatus::Submitted { .. } => return StepsOutcome::Pending,
            }
        }
        StepsOutcome::Done
    }

    fn issue_step(&self, job: JobId, step: &mut Step) {
        step.status = match &step.action {
            StepAction::Remote { action, target, payload } => {
                match self.executor.submit(&JobRequest::new(action.clone(), target.clone(), payload.clone())) {
                    Ok(remote_job) => StepStatus::Submitted { remote_job },
                    Err(err) => {
                        let job_field = job.to_string();
                        let reason = err.to_string();
                        let label = step.action.label();
                        log_event_at(
                            Severity::Warn,
                            Event::MigrationDispatchDeferred,
                            &[("job", job_field.as_str()), ("step", label.as_str()), ("error", reason.as_str())],
                        );
                        StepStatus::Pending
                    }
                }
            }
            StepAction::DisableCluster { domain } => self.toggle_cluster(domain, false),
            StepAction::EnableCluster { domain } => self.toggle_cluster(domain, true),
        };
    }

    /// Enable or disable a cluster through the mutation engine. A cluster
    /// already in the wanted phase counts as done.
    fn toggle_cluster(&self, domain: &str, enable: bool) -> StepStatus {
        let cluster = match self.topology.cluster_by_domain(domain) {
            Ok(Some(cluster)) => cluster,
            Ok(None) => {
                return StepStatus::Failed {
                    reason: format!("cluster {} not found", domain),
                }
            }
            Err(err) => return StepStatus::Failed { reason: err.to_string() },
        };
        let result = if enable {
            self.topology.enable_cluster(cluster.id)
        } else {
            self.topology.disable_cluster(cluster.id)
        };
        match result {
            Ok(_) => StepStatus::Succeeded,
            Err(err) if err.code() == "TOPO_PRECHECK_PHASE_UNCHANGED" => StepStatus::Succeeded,
            Err(err) => StepStatus::Failed { reason: err.to_string() },
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn detect_stall(&self, job: &mut MigrationJob, now: DateTime<Utc>) {
        if job.stalled_since.is_some() {
            return;
        }
        let idle = now.signed_duration_since(job.last_progress_at).num_seconds();
        let stalled = u64::try_from(idle)
            .map(|idle| idle >= self.config.stall_after_secs)
            .unwrap_or(false);
        if stalled {
            job.stalled_since = Some(now);
            let job_field = job.id.to_string();
            let idle = idle.to_string();
            log_event_at(
                Severity::Warn,
                Event::MigrationStalled,
                &[
                    ("job", job_field.as_str()),
                    ("state", job.state.state_name()),
                    ("idle_secs", idle.as_str()),
                ],
            );
        }
    }

    fn log_deferred(&self, job: &MigrationJob, what: &str, reason: &str) {
        let job_field = job.id.to_string();
        log_event_at(
            Severity::Warn,
            Event::MigrationDispatchDeferred,
            &[("job", job_field.as_str()), ("what", what), ("error", reason)],
        );
    }
}

fn terminal_outcome(state: &JobState) -> Option<AdvanceOutcome> {
    match state {
        JobState::Done => Some(AdvanceOutcome::Done),
        JobState::Failed { reason } => Some(AdvanceOutcome::Failed(reason.clone())),
        _ => None,
    }
}

impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
