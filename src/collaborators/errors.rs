//! Collaborator Errors

use thiserror::Error;

use crate::errors::ErrorClass;

/// Result type for collaborator calls
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Collaborator call errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// The service answered with a non-success response.
    #[error("{service} rejected the call: {message}")]
    Rejected { service: &'static str, message: String },

    /// The service could not be reached.
    #[error("{service} unavailable: {message}")]
    Unavailable { service: &'static str, message: String },

    /// No provider is registered for the requested endpoint kind.
    #[error("no endpoint provider registered for {0}")]
    NoProvider(&'static str),

    /// The requested record does not exist on the collaborator side.
    #[error("{service}: {what} not found")]
    NotFound { service: &'static str, what: String },
}

impl CollaboratorError {
    /// Create a rejected error.
    pub fn rejected(service: &'static str, message: impl Into<String>) -> Self {
        CollaboratorError::Rejected {
            service,
            message: message.into(),
        }
    }

    /// Create an unavailable error.
    pub fn unavailable(service: &'static str, message: impl Into<String>) -> Self {
        CollaboratorError::Unavailable {
            service,
            message: message.into(),
        }
    }

    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            CollaboratorError::Rejected { .. } => "TOPO_COLLABORATOR_REJECTED",
            CollaboratorError::Unavailable { .. } => "TOPO_COLLABORATOR_UNAVAILABLE",
            CollaboratorError::NoProvider(_) => "TOPO_COLLABORATOR_NO_PROVIDER",
            CollaboratorError::NotFound { .. } => "TOPO_COLLABORATOR_NOT_FOUND",
        }
    }

    /// Error class.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::SideEffect
    }
}
