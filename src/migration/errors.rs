//! Migration Errors

use thiserror::Error;

use crate::collaborators::CollaboratorError;
use crate::durable::DurableError;
use crate::errors::ErrorClass;
use crate::mutation::MutationError;
use crate::topology::TopologyError;

/// Result type for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Migration orchestration errors
#[derive(Debug, Error)]
pub enum MigrationError {
    /// No job with this id.
    #[error("migration job {0} not found")]
    JobNotFound(String),

    /// No task with this id in the job.
    #[error("task {task} not found in job {job}")]
    TaskNotFound { job: String, task: String },

    /// The job state does not allow the requested step.
    #[error("forbidden transition: {from} -> {to}")]
    ForbiddenTransition { from: &'static str, to: &'static str },

    /// A task phase report would move the task backwards.
    #[error("task {task} cannot move from {from} back to {to}")]
    BackwardProgress {
        task: String,
        from: &'static str,
        to: &'static str,
    },

    /// Migration precheck rejected the job; no task was created.
    #[error("migration precheck failed: {0}")]
    PrecheckFailed(String),

    /// A remote collaborator call failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// A topology sub-step failed.
    #[error(transparent)]
    Mutation(#[from] MutationError),

    /// Reading the topology failed.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// Job records could not be read or written.
    #[error("job persistence failure: {0}")]
    Persistence(#[from] DurableError),

    /// A lock was poisoned by a panicking writer.
    #[error("migration store lock poisoned")]
    LockPoisoned,
}

impl MigrationError {
    /// Create a precheck failure.
    pub fn precheck(reason: impl Into<String>) -> Self {
        MigrationError::PrecheckFailed(reason.into())
    }

    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            MigrationError::JobNotFound(_) => "MIGRATION_JOB_NOT_FOUND",
            MigrationError::TaskNotFound { .. } => "MIGRATION_TASK_NOT_FOUND",
            MigrationError::ForbiddenTransition { .. } => "MIGRATION_FORBIDDEN_TRANSITION",
            MigrationError::BackwardProgress { .. } => "MIGRATION_BACKWARD_PROGRESS",
            MigrationError::PrecheckFailed(_) => "MIGRATION_PRECHECK_FAILED",
            MigrationError::Collaborator(e) => e.code(),
            MigrationError::Mutation(e) => e.code(),
            MigrationError::Topology(e) => e.code(),
            MigrationError::Persistence(_) => "MIGRATION_PERSISTENCE_FAILED",
            MigrationError::LockPoisoned => "MIGRATION_LOCK_POISONED",
        }
    }

    /// Error class.
    pub fn class(&self) -> ErrorClass {
        match self {
            MigrationError::JobNotFound(_)
            | MigrationError::TaskNotFound { .. }
            | MigrationError::ForbiddenTransition { .. }
            | MigrationError::BackwardProgress { .. }
            | MigrationError::PrecheckFailed(_) => ErrorClass::Precheck,
            MigrationError::Collaborator(e) => e.class(),
            MigrationError::Mutation(e) => e.class(),
            MigrationError::Topology(e) => e.class(),
            MigrationError::Persistence(_) | MigrationError::LockPoisoned => ErrorClass::Infrastructure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backward_progress_is_rejected_input() {
        let err = MigrationError::BackwardProgress {
            task: "t1".into(),
            from: "INCREMENTAL_SYNC",
            to: "FULL_SYNC",
        };
        assert_eq!(err.code(), "MIGRATION_BACKWARD_PROGRESS");
        assert_eq!(err.class(), ErrorClass::Precheck);
        assert!(err.to_string().contains("INCREMENTAL_SYNC"));
    }

    #[test]
    fn test_collaborator_class_passes_through() {
        let err: MigrationError = CollaboratorError::unavailable("executor", "down").into();
        assert_eq!(err.class(), ErrorClass::SideEffect);
        assert_eq!(err.code(), "TOPO_COLLABORATOR_UNAVAILABLE");
    }
}
