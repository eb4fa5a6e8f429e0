//! Remote execution collaborator
//!
//! Every install / flush / copy / data-check action is an opaque job: the
//! core submits a request, records the returned id, and later polls the
//! status. Neither call may block on the job itself.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::CollaboratorResult;

/// Identifier assigned by the remote executor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteJobId(pub String);

impl fmt::Display for RemoteJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request for a remote job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Action name understood by the executor.
    pub action: String,
    /// Human-readable target (cluster domain or instance address).
    pub target: String,
    /// Opaque action payload.
    pub payload: serde_json::Value,
}

impl JobRequest {
    /// Create a request.
    pub fn new(action: impl Into<String>, target: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            target: target.into(),
            payload,
        }
    }
}

/// Observed status of a remote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteJobStatus {
    /// Accepted, not started.
    Pending,
    /// In progress.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed(String),
}

impl RemoteJobStatus {
    /// Whether the job will not change status anymore.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteJobStatus::Succeeded | RemoteJobStatus::Failed(_))
    }
}

/// Remote execution client.
pub trait RemoteExecutor: Send + Sync {
    /// Submit a job. Must return without waiting for the job.
    fn submit(&self, request: &JobRequest) -> CollaboratorResult<RemoteJobId>;

    /// Current status of a submitted job.
    fn status(&self, id: &RemoteJobId) -> CollaboratorResult<RemoteJobStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!RemoteJobStatus::Pending.is_terminal());
        assert!(!RemoteJobStatus::Running.is_terminal());
        assert!(RemoteJobStatus::Succeeded.is_terminal());
        assert!(RemoteJobStatus::Failed("disk full".into()).is_terminal());
    }
}
