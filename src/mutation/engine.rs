//! Topology Mutation Engine
//!
//! Every operation follows the same sequence:
//! 1. Open a store transaction on a working copy of the graph
//! 2. Run the operation's precheck rules against that copy
//! 3. Mutate the copy, registering entries through the registrar and
//!    staging inventory calls on the outbox
//! 4. Commit (the store checks graph invariants first)
//! 5. Deliver the staged side effects
//!
//! A failure in steps 1-4 leaves the store untouched and is returned as an
//! error. A failure in step 5 is not an error: the topology is already
//! consistent, the failed call stays on the outbox and is listed in the
//! returned report.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::errors::{MutationError, MutationResult};
use super::report::OperationReport;
use crate::config::TopologyConfig;
use crate::errors::ErrorClass;
use crate::observability::{
    log_event_at, log_event_with_fields, Event, MetricsRegistry, ObservationScope, Severity,
};
use crate::outbox::{DeliveryReport, SideEffectDispatcher};
use crate::topology::{
    Cluster, ClusterId, ClusterSummary, Committed, RebuildWindow, TopologyStore, Transaction,
};

/// What a transaction closure hands back to `run`.
pub(super) struct Applied {
    pub cluster: ClusterId,
    pub released_hosts: Vec<String>,
}

impl Applied {
    pub(super) fn cluster(cluster: ClusterId) -> Self {
        Self {
            cluster,
            released_hosts: Vec::new(),
        }
    }
}

/// The topology mutation engine.
pub struct TopologyEngine {
    store: Arc<TopologyStore>,
    dispatcher: Arc<SideEffectDispatcher>,
    metrics: Arc<MetricsRegistry>,
    settings: TopologyConfig,
}

impl TopologyEngine {
    /// Create an engine over a store.
    pub fn new(
        store: Arc<TopologyStore>,
        dispatcher: Arc<SideEffectDispatcher>,
        metrics: Arc<MetricsRegistry>,
        settings: TopologyConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            metrics,
            settings,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<TopologyStore> {
        &self.store
    }

    /// Engine counters.
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub(super) fn settings(&self) -> &TopologyConfig {
        &self.settings
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Derived health summary of a cluster.
    pub fn summary(&self, cluster: ClusterId) -> MutationResult<ClusterSummary> {
        Ok(self.store.read(|g| g.summary(cluster))??)
    }

    /// Cluster owning a primary domain.
    pub fn cluster_by_domain(&self, domain: &str) -> MutationResult<Option<Cluster>> {
        Ok(self.store.read(|g| g.cluster_by_domain(domain).cloned())?)
    }

    /// Rebuild windows open for longer than the configured limit.
    pub fn overdue_rebuild_windows(&self, now: DateTime<Utc>) -> MutationResult<Vec<RebuildWindow>> {
        let limit = self.settings.rebuild_window_secs;
        Ok(self.store.read(|g| {
            g.rebuild_windows()
                .filter(|w| {
                    let age = now.signed_duration_since(w.opened_at).num_seconds();
                    u64::try_from(age).map(|age| age > limit).unwrap_or(false)
                })
                .cloned()
                .collect()
        })?)
    }

    /// Redeliver every pending side effect.
    pub fn retry_side_effects(&self) -> MutationResult<DeliveryReport> {
        Ok(self.dispatcher.retry_pending(&self.store)?)
    }

    // =========================================================================
    // TRANSACTION DRIVER
    // =========================================================================

    /// Run one operation as a transaction and deliver what it staged.
    pub(super) fn run<F>(&self, op: &'static str, event: Event, target: &str, f: F) -> MutationResult<OperationReport>
    where
        F: FnOnce(&mut Transaction) -> MutationResult<Applied>,
    {
        let scope = ObservationScope::with_fields(op, &[("target", target)]);

        let Committed { value: applied, staged } = match self.store.transaction(f) {
            Ok(committed) => committed,
            Err(err) => {
                self.record_rejection(op, target, &err);
                scope.fail(err.code(), &err.to_string());
                return Err(err);
            }
        };
        self.metrics.increment_operations_committed();

        let cluster = applied.cluster.to_string();
        log_event_with_fields(event, &[("cluster", cluster.as_str()), ("target", target)]);
        for host in &applied.released_hosts {
            log_event_with_fields(Event::HostReleased, &[("cluster", cluster.as_str()), ("host", host.as_str())]);
        }

        let delivery = match self.dispatcher.dispatch(&self.store, &staged) {
            Ok(delivery) => delivery,
            Err(err) => {
                // Records stay pending in the outbox; retry_side_effects picks them up.
                let reason = err.to_string();
                log_event_at(
                    Severity::Error,
                    Event::SideEffectDeferred,
                    &[("cluster", cluster.as_str()), ("error", reason.as_str())],
                );
                DeliveryReport {
                    deferred: staged.iter().map(|seq| (*seq, reason.clone())).collect(),
                    ..Default::default()
                }
            }
        };

        let report = OperationReport::new(applied.cluster, staged, delivery, applied.released_hosts);
        let delivered = report.delivered.len().to_string();
        let pending = (report.pending.len() + report.dead_lettered.len()).to_string();
        scope.complete_with_fields(&[("delivered", delivered.as_str()), ("pending", pending.as_str())]);
        Ok(report)
    }

    fn record_rejection(&self, op: &str, target: &str, err: &MutationError) {
        let reason = err.to_string();
        let fields = [
            ("operation", op),
            ("target", target),
            ("code", err.code()),
            ("reason", reason.as_str()),
        ];
        match err.class() {
            ErrorClass::Precheck => {
                self.metrics.increment_precheck_rejections();
                log_event_at(Severity::Warn, Event::PrecheckRejected, &fields);
            }
            ErrorClass::Invariant => {
                self.metrics.increment_invariant_aborts();
                log_event_at(Severity::Error, Event::InvariantAborted, &fields);
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for TopologyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyEngine")
            .field("durable", &self.store.is_durable())
            .field("dispatcher", &self.dispatcher)
            .field("settings", &self.settings)
            .finish()
    }
}
