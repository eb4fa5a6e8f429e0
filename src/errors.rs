//! Error classification shared by every subsystem
//!
//! Each subsystem owns its own error enum. All of them map onto one of the
//! classes below so callers can decide what to do without matching on
//! every variant:
//!
//! 1. Precheck violations: nothing was mutated, fix the input and retry
//! 2. Invariant violations: the transaction was aborted, graph untouched
//! 3. Side-effect failures: graph committed, external mirror pending retry
//! 4. Task failures: isolated to one migration task
//! 5. Infrastructure: persistence or lock failures inside this process

use std::fmt;

/// Error class, one per failure domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Deterministic validation failure before any write.
    Precheck,

    /// Graph invariant broken during a mutation; transaction aborted.
    Invariant,

    /// External collaborator call failed after commit.
    SideEffect,

    /// A migration task failed.
    TaskFailure,

    /// Storage, serialization or lock failure.
    Infrastructure,
}

impl ErrorClass {
    /// Returns the class name string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Precheck => "PRECHECK",
            ErrorClass::Invariant => "INVARIANT",
            ErrorClass::SideEffect => "SIDE_EFFECT",
            ErrorClass::TaskFailure => "TASK_FAILURE",
            ErrorClass::Infrastructure => "INFRASTRUCTURE",
        }
    }

    /// Whether the topology graph is guaranteed unchanged by the failed call.
    pub fn graph_untouched(&self) -> bool {
        matches!(self, ErrorClass::Precheck | ErrorClass::Invariant)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_untouched() {
        assert!(ErrorClass::Precheck.graph_untouched());
        assert!(ErrorClass::Invariant.graph_untouched());
        assert!(!ErrorClass::SideEffect.graph_untouched());
        assert!(!ErrorClass::TaskFailure.graph_untouched());
    }

    #[test]
    fn test_class_names() {
        assert_eq!(ErrorClass::Precheck.to_string(), "PRECHECK");
        assert_eq!(ErrorClass::Infrastructure.as_str(), "INFRASTRUCTURE");
    }
}
