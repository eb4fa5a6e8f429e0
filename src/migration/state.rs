//! Migration State Machines
//!
//! Job: `Precheck -> Executing -> [DataCheckRepair -> Executing]* ->
//! Disconnecting -> Done`, with `Failed` reachable from every non-terminal
//! state. Transitions consume the current state and return the next one or
//! a `ForbiddenTransition` error.
//!
//! Task: `FullSync -> IncrementalSync -> Stopped`, never backwards.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::{MigrationError, MigrationResult};

// =============================================================================
// JOB STATE
// =============================================================================

/// State of a migration job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Sources and destination are being validated. No task exists yet.
    Precheck,

    /// Tasks exist and are copying.
    Executing,

    /// A data-check-and-repair cycle is running.
    DataCheckRepair,

    /// Replication stop was requested on every task.
    Disconnecting,

    /// Every task stopped successfully and teardown finished.
    Done,

    /// Absorbing failure state.
    Failed {
        /// Why the job failed.
        reason: String,
    },
}

impl JobState {
    /// State name for logs and errors.
    pub fn state_name(&self) -> &'static str {
        match self {
            JobState::Precheck => "PRECHECK",
            JobState::Executing => "EXECUTING",
            JobState::DataCheckRepair => "DATA_CHECK_REPAIR",
            JobState::Disconnecting => "DISCONNECTING",
            JobState::Done => "DONE",
            JobState::Failed { .. } => "FAILED",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed { .. })
    }

    fn forbidden(self, to: &'static str) -> MigrationError {
        MigrationError::ForbiddenTransition {
            from: self.state_name(),
            to,
        }
    }

    /// Precheck -> Executing
    pub fn begin_execution(self) -> MigrationResult<Self> {
        match self {
            JobState::Precheck => Ok(JobState::Executing),
            other => Err(other.forbidden("EXECUTING")),
        }
    }

    /// Executing -> DataCheckRepair
    pub fn begin_data_check(self) -> MigrationResult<Self> {
        match self {
            JobState::Executing => Ok(JobState::DataCheckRepair),
            other => Err(other.forbidden("DATA_CHECK_REPAIR")),
        }
    }

    /// DataCheckRepair -> Executing
    pub fn finish_data_check(self) -> MigrationResult<Self> {
        match self {
            JobState::DataCheckRepair => Ok(JobState::Executing),
            other => Err(other.forbidden("EXECUTING")),
        }
    }

    /// Executing -> Disconnecting
    pub fn begin_disconnect(self) -> MigrationResult<Self> {
        match self {
            JobState::Executing => Ok(JobState::Disconnecting),
            other => Err(other.forbidden("DISCONNECTING")),
        }
    }

    /// Disconnecting -> Done
    pub fn complete(self) -> MigrationResult<Self> {
        match self {
            JobState::Disconnecting => Ok(JobState::Done),
            other => Err(other.forbidden("DONE")),
        }
    }

    /// Any non-terminal state -> Failed
    pub fn fail(self, reason: impl Into<String>) -> MigrationResult<Self> {
        if self.is_terminal() {
            return Err(self.forbidden("FAILED"));
        }
        Ok(JobState::Failed { reason: reason.into() })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Failed { reason } => write!(f, "FAILED({})", reason),
            other => write!(f, "{}", other.state_name()),
        }
    }
}

// =============================================================================
// TASK PHASE
// =============================================================================

/// Copy phase of one task. Ordered: a task only moves to a greater phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPhase {
    /// Initial bulk copy.
    FullSync,
    /// Streaming changes after the bulk copy.
    IncrementalSync,
    /// Replication stopped.
    Stopped,
}

impl TaskPhase {
    /// Phase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::FullSync => "FULL_SYNC",
            TaskPhase::IncrementalSync => "INCREMENTAL_SYNC",
            TaskPhase::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Operator intent for a task's replication stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncOperate {
    /// Keep replicating.
    #[default]
    Running,
    /// Stop replicating from source to destination.
    StopRequested,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let state = JobState::Precheck
            .begin_execution()
            .and_then(JobState::begin_data_check)
            .and_then(JobState::finish_data_check)
            .and_then(JobState::begin_disconnect)
            .and_then(JobState::complete)
            .unwrap();
        assert_eq!(state, JobState::Done);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_cannot_skip_to_disconnect() {
        let err = JobState::Precheck.begin_disconnect().unwrap_err();
        assert_eq!(err.code(), "MIGRATION_FORBIDDEN_TRANSITION");
        assert!(JobState::DataCheckRepair.begin_disconnect().is_err());
    }

    #[test]
    fn test_failed_is_absorbing() {
        let failed = JobState::Executing.fail("task t1 failed").unwrap();
        assert_eq!(failed.state_name(), "FAILED");
        assert!(failed.clone().fail("again").is_err());
        assert!(failed.begin_execution().is_err());
        assert!(JobState::Done.fail("late").is_err());
    }

    #[test]
    fn test_task_phase_order() {
        assert!(TaskPhase::FullSync < TaskPhase::IncrementalSync);
        assert!(TaskPhase::IncrementalSync < TaskPhase::Stopped);
    }

    #[test]
    fn test_display() {
        let failed = JobState::Failed { reason: "cancelled".into() };
        assert_eq!(failed.to_string(), "FAILED(cancelled)");
        assert_eq!(TaskPhase::IncrementalSync.to_string(), "INCREMENTAL_SYNC");
    }
}
