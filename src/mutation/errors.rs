//! Mutation Engine Errors

use thiserror::Error;

use crate::errors::ErrorClass;
use crate::precheck::PrecheckError;
use crate::topology::TopologyError;

/// Result type for mutation operations
pub type MutationResult<T> = Result<T, MutationError>;

/// Mutation operation errors.
///
/// Both variants mean the topology graph was left exactly as it was.
/// Collaborator failures after commit are never reported here; they show
/// up in the operation report instead.
#[derive(Debug, Clone, Error)]
pub enum MutationError {
    #[error(transparent)]
    Precheck(#[from] PrecheckError),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl MutationError {
    /// Stable error code of the wrapped error.
    pub fn code(&self) -> &'static str {
        match self {
            MutationError::Precheck(e) => e.code(),
            MutationError::Topology(e) => e.code(),
        }
    }

    /// Error class of the wrapped error.
    pub fn class(&self) -> ErrorClass {
        match self {
            MutationError::Precheck(e) => e.class(),
            MutationError::Topology(e) => e.class(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_pass_through() {
        let err: MutationError = PrecheckError::DomainExists {
            domain: "cache.db".into(),
        }
        .into();
        assert_eq!(err.code(), "TOPO_PRECHECK_DOMAIN_EXISTS");
        assert_eq!(err.class(), ErrorClass::Precheck);

        let err: MutationError = TopologyError::invariant("edge_unique", "dup").into();
        assert_eq!(err.class(), ErrorClass::Invariant);
        assert!(err.class().graph_untouched());
    }
}
