//! Topology Store Errors

use thiserror::Error;

use crate::errors::ErrorClass;

/// Result type for topology store operations
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Topology store errors
#[derive(Debug, Clone, Error)]
pub enum TopologyError {
    /// A graph invariant would be broken by the pending transaction.
    #[error("invariant '{invariant}' violated: {detail}")]
    InvariantViolation {
        /// Short invariant name.
        invariant: &'static str,
        /// Which records are involved.
        detail: String,
    },

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind.
        kind: &'static str,
        /// Identifier or address that was looked up.
        id: String,
    },

    /// Writing or reading the durable snapshot failed.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The durable snapshot failed its checksum or could not be parsed.
    #[error("snapshot corrupted: {0}")]
    Corrupted(String),

    /// A lock was poisoned by a panicking writer.
    #[error("topology lock poisoned")]
    LockPoisoned,
}

impl TopologyError {
    /// Create an invariant violation.
    pub fn invariant(invariant: &'static str, detail: impl Into<String>) -> Self {
        TopologyError::InvariantViolation {
            invariant,
            detail: detail.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        TopologyError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            TopologyError::InvariantViolation { .. } => "TOPO_INVARIANT_VIOLATION",
            TopologyError::NotFound { .. } => "TOPO_NOT_FOUND",
            TopologyError::Persistence(_) => "TOPO_PERSISTENCE_FAILED",
            TopologyError::Corrupted(_) => "TOPO_SNAPSHOT_CORRUPTED",
            TopologyError::LockPoisoned => "TOPO_LOCK_POISONED",
        }
    }

    /// Error class.
    pub fn class(&self) -> ErrorClass {
        match self {
            TopologyError::InvariantViolation { .. } => ErrorClass::Invariant,
            // A missing record discovered while loading is an input problem.
            TopologyError::NotFound { .. } => ErrorClass::Precheck,
            TopologyError::Persistence(_)
            | TopologyError::Corrupted(_)
            | TopologyError::LockPoisoned => ErrorClass::Infrastructure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_display() {
        let err = TopologyError::invariant("single_proxy_owner", "proxy 1.1.1.1:50000");
        assert!(err.to_string().contains("single_proxy_owner"));
        assert_eq!(err.class(), ErrorClass::Invariant);
        assert_eq!(err.code(), "TOPO_INVARIANT_VIOLATION");
    }

    #[test]
    fn test_not_found_is_precheck_class() {
        let err = TopologyError::not_found("cluster", "abc");
        assert_eq!(err.class(), ErrorClass::Precheck);
        assert_eq!(err.to_string(), "cluster not found: abc");
    }
}
