//! Metrics registry
//!
//! Counters only, monotonic, reset on process start.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operational counters of the control plane.
///
/// All counters use Relaxed atomics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    operations_committed: AtomicU64,
    precheck_rejections: AtomicU64,
    invariant_aborts: AtomicU64,
    side_effects_delivered: AtomicU64,
    side_effects_deferred: AtomicU64,
    side_effects_dead_lettered: AtomicU64,
    migration_polls: AtomicU64,
    migration_jobs_started: AtomicU64,
    migration_jobs_done: AtomicU64,
    migration_jobs_failed: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Mutation engine

    /// A topology transaction committed
    pub fn increment_operations_committed(&self) {
        self.operations_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// An operation failed precheck
    pub fn increment_precheck_rejections(&self) {
        self.precheck_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// A transaction aborted on an invariant
    pub fn increment_invariant_aborts(&self) {
        self.invariant_aborts.fetch_add(1, Ordering::Relaxed);
    }

    // Outbox

    /// A side effect was delivered
    pub fn increment_side_effects_delivered(&self) {
        self.side_effects_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// A side-effect delivery failed
    pub fn increment_side_effects_deferred(&self) {
        self.side_effects_deferred.fetch_add(1, Ordering::Relaxed);
    }

    /// A side effect was dead-lettered
    pub fn increment_side_effects_dead_lettered(&self) {
        self.side_effects_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    // Migration

    /// `advance()` was called
    pub fn increment_migration_polls(&self) {
        self.migration_polls.fetch_add(1, Ordering::Relaxed);
    }

    /// A job was started
    pub fn increment_migration_jobs_started(&self) {
        self.migration_jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A job reached DONE
    pub fn increment_migration_jobs_done(&self) {
        self.migration_jobs_done.fetch_add(1, Ordering::Relaxed);
    }

    /// A job reached FAILED
    pub fn increment_migration_jobs_failed(&self) {
        self.migration_jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations_committed: self.operations_committed.load(Ordering::Relaxed),
            precheck_rejections: self.precheck_rejections.load(Ordering::Relaxed),
            invariant_aborts: self.invariant_aborts.load(Ordering::Relaxed),
            side_effects_delivered: self.side_effects_delivered.load(Ordering::Relaxed),
            side_effects_deferred: self.side_effects_deferred.load(Ordering::Relaxed),
            side_effects_dead_lettered: self.side_effects_dead_lettered.load(Ordering::Relaxed),
            migration_polls: self.migration_polls.load(Ordering::Relaxed),
            migration_jobs_started: self.migration_jobs_started.load(Ordering::Relaxed),
            migration_jobs_done: self.migration_jobs_done.load(Ordering::Relaxed),
            migration_jobs_failed: self.migration_jobs_failed.load(Ordering::Relaxed),
        }
    }

    /// Snapshot rendered as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_default()
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub operations_committed: u64,
    pub precheck_rejections: u64,
    pub invariant_aborts: u64,
    pub side_effects_delivered: u64,
    pub side_effects_deferred: u64,
    pub side_effects_dead_lettered: u64,
    pub migration_polls: u64,
    pub migration_jobs_started: u64,
    pub migration_jobs_done: u64,
    pub migration_jobs_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_zero_values() {
        let snapshot = MetricsRegistry::new().snapshot();
        assert_eq!(snapshot.operations_committed, 0);
        assert_eq!(snapshot.side_effects_deferred, 0);
        assert_eq!(snapshot.migration_polls, 0);
    }

    #[test]
    fn test_to_json() {
        let registry = MetricsRegistry::new();
        registry.increment_operations_committed();
        registry.increment_side_effects_deferred();
        registry.increment_side_effects_deferred();

        let parsed: serde_json::Value = serde_json::from_str(&registry.to_json()).unwrap();
        assert_eq!(parsed["operations_committed"], 1);
        assert_eq!(parsed["side_effects_deferred"], 2);
    }

    #[test]
    fn test_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..100 {
                        reg.increment_migration_polls();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.snapshot().migration_polls, 800);
    }
}
