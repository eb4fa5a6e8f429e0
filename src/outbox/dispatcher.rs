//! Side-Effect Dispatcher
//!
//! Delivers committed outbox records to the collaborators and settles each
//! record in the store. A failed delivery is logged and left pending; it
//! never unwinds the topology change that staged it.

use std::sync::Arc;

use super::effect::{CredentialCall, EndpointCall, InventoryCall, SideEffect};
use super::queue::DeliveryState;
use crate::collaborators::{CollaboratorResult, CredentialStore, EndpointRegistry, InventoryClient};
use crate::observability::{log_event_at, log_event_with_fields, Event, MetricsRegistry, Severity};
use crate::topology::{TopologyResult, TopologyStore};

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sequence numbers delivered in this pass.
    pub delivered: Vec<u64>,
    /// Sequence numbers that failed and stay pending, with the error.
    pub deferred: Vec<(u64, String)>,
    /// Sequence numbers parked as dead letters in this pass.
    pub dead_lettered: Vec<u64>,
}

impl DeliveryReport {
    /// Whether every attempted effect was delivered.
    pub fn is_complete(&self) -> bool {
        self.deferred.is_empty() && self.dead_lettered.is_empty()
    }

    /// Sequence numbers still owed to a collaborator.
    pub fn outstanding(&self) -> Vec<u64> {
        self.deferred
            .iter()
            .map(|(seq, _)| *seq)
            .chain(self.dead_lettered.iter().copied())
            .collect()
    }
}

/// Delivers staged side effects.
pub struct SideEffectDispatcher {
    inventory: Arc<dyn InventoryClient>,
    endpoints: EndpointRegistry,
    credentials: Arc<dyn CredentialStore>,
    max_attempts: u32,
    metrics: Arc<MetricsRegistry>,
}

impl SideEffectDispatcher {
    /// Create a dispatcher.
    pub fn new(
        inventory: Arc<dyn InventoryClient>,
        endpoints: EndpointRegistry,
        credentials: Arc<dyn CredentialStore>,
        max_attempts: u32,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            inventory,
            endpoints,
            credentials,
            max_attempts,
            metrics,
        }
    }

    /// Make one collaborator call.
    pub fn deliver(&self, effect: &SideEffect) -> CollaboratorResult<()> {
        match effect {
            SideEffect::Inventory(call) => self.deliver_inventory(call),
            SideEffect::Endpoint(call) => self.deliver_endpoint(call),
            SideEffect::Credential(CredentialCall::DeletePasswords {
                cloud_zone,
                instances,
                usernames,
            }) => self.credentials.delete_passwords(*cloud_zone, instances, usernames),
        }
    }

    fn deliver_inventory(&self, call: &InventoryCall) -> CollaboratorResult<()> {
        let inventory = &self.inventory;
        match call {
            InventoryCall::CreateModule {
                cluster_id,
                business_id,
                domain,
            } => inventory.create_module(*cluster_id, *business_id, domain),
            InventoryCall::TransferHosts { domain, hosts } => inventory.transfer_hosts(domain, hosts),
            InventoryCall::RegisterServiceInstances { instances } => {
                inventory.register_service_instances(instances)
            }
            InventoryCall::DeleteServiceInstances { domain, addrs } => {
                inventory.delete_service_instances(domain, addrs)
            }
            InventoryCall::RecycleHosts { hosts } => inventory.recycle_hosts(hosts),
            InventoryCall::DeleteModule { cluster_id, domain } => inventory.delete_module(*cluster_id, domain),
        }
    }

    fn deliver_endpoint(&self, call: &EndpointCall) -> CollaboratorResult<()> {
        let provider = self.endpoints.get(call.kind())?;
        match call {
            EndpointCall::AddTargets {
                name, port, targets, ..
            } => provider.add_targets(name, *port, targets),
            EndpointCall::RemoveTargets {
                name, port, targets, ..
            } => provider.remove_targets(name, *port, targets),
            EndpointCall::DeleteEntry { name, port, .. } => provider.delete_entry(name, *port),
        }
    }

    /// Deliver the given records in order and settle each one.
    ///
    /// Records that are no longer pending (already delivered or parked)
    /// are skipped.
    pub fn dispatch(&self, store: &TopologyStore, seqs: &[u64]) -> TopologyResult<DeliveryReport> {
        let mut report = DeliveryReport::default();

        for &seq in seqs {
            let record = match store.outbox_record(seq)? {
                Some(record) if record.state == DeliveryState::Pending => record,
                _ => continue,
            };
            let seq_str = seq.to_string();

            match self.deliver(&record.effect) {
                Ok(()) => {
                    store.settle_effect(seq, Ok(()), self.max_attempts)?;
                    self.metrics.increment_side_effects_delivered();
                    log_event_at(
                        Severity::Trace,
                        Event::SideEffectDelivered,
                        &[("effect", record.effect.label()), ("seq", seq_str.as_str())],
                    );
                    report.delivered.push(seq);
                }
                Err(err) => {
                    let message = err.to_string();
                    let state = store.settle_effect(seq, Err(message.clone()), self.max_attempts)?;
                    let attempts = (record.attempts + 1).to_string();
                    let fields = [
                        ("attempts", attempts.as_str()),
                        ("code", err.code()),
                        ("effect", record.effect.label()),
                        ("error", message.as_str()),
                        ("seq", seq_str.as_str()),
                    ];
                    if state == Some(DeliveryState::DeadLetter) {
                        self.metrics.increment_side_effects_dead_lettered();
                        log_event_at(Severity::Error, Event::SideEffectDeadLettered, &fields);
                        report.dead_lettered.push(seq);
                    } else {
                        self.metrics.increment_side_effects_deferred();
                        log_event_at(Severity::Warn, Event::SideEffectDeferred, &fields);
                        report.deferred.push((seq, message));
                    }
                }
            }
        }

        Ok(report)
    }

    /// Redeliver every pending record, oldest first.
    pub fn retry_pending(&self, store: &TopologyStore) -> TopologyResult<DeliveryReport> {
        let seqs: Vec<u64> = store.pending_effects()?.iter().map(|r| r.seq).collect();
        let report = self.dispatch(store, &seqs)?;
        if !seqs.is_empty() {
            let delivered = report.delivered.len().to_string();
            let outstanding = report.outstanding().len().to_string();
            log_event_with_fields(
                Event::SideEffectDelivered,
                &[
                    ("delivered", delivered.as_str()),
                    ("outstanding", outstanding.as_str()),
                    ("pass", "retry"),
                ],
            );
        }
        Ok(report)
    }
}

impl std::fmt::Debug for SideEffectDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideEffectDispatcher")
            .field("endpoints", &self.endpoints)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::{MemoryCredentials, MemoryEndpoint, MemoryInventory};
    use crate::topology::{EntryKind, InstanceAddr, TopologyError};

    fn dispatcher(
        inventory: Arc<MemoryInventory>,
        dns: Arc<MemoryEndpoint>,
        max_attempts: u32,
    ) -> SideEffectDispatcher {
        SideEffectDispatcher::new(
            inventory,
            EndpointRegistry::new().with(dns),
            Arc::new(MemoryCredentials::new()),
            max_attempts,
            Arc::new(MetricsRegistry::new()),
        )
    }

    fn stage_dns_add(store: &TopologyStore) -> Vec<u64> {
        store
            .transaction(|tx| {
                tx.stage(
                    None,
                    SideEffect::Endpoint(EndpointCall::AddTargets {
                        kind: EntryKind::Dns,
                        name: "cache.db".into(),
                        port: 50000,
                        targets: vec![InstanceAddr::new("10.0.0.1", 50000)],
                    }),
                );
                Ok::<_, TopologyError>(())
            })
            .unwrap()
            .staged
    }

    #[test]
    fn test_dispatch_delivers_and_removes() {
        let store = TopologyStore::in_memory();
        let dns = Arc::new(MemoryEndpoint::new(EntryKind::Dns));
        let d = dispatcher(Arc::new(MemoryInventory::new()), Arc::clone(&dns), 3);

        let seqs = stage_dns_add(&store);
        let report = d.dispatch(&store, &seqs).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.delivered, seqs);
        assert!(store.pending_effects().unwrap().is_empty());
        assert_eq!(dns.targets("cache.db", 50000).unwrap().len(), 1);
    }

    #[test]
    fn test_failure_defers_then_retry_delivers() {
        let store = TopologyStore::in_memory();
        let dns = Arc::new(MemoryEndpoint::new(EntryKind::Dns));
        let d = dispatcher(Arc::new(MemoryInventory::new()), Arc::clone(&dns), 5);

        dns.set_failing(true);
        let seqs = stage_dns_add(&store);
        let report = d.dispatch(&store, &seqs).unwrap();
        assert_eq!(report.deferred.len(), 1);

        let pending = store.pending_effects().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());

        dns.set_failing(false);
        let report = d.retry_pending(&store).unwrap();
        assert!(report.is_complete());
        assert!(store.pending_effects().unwrap().is_empty());
    }

    #[test]
    fn test_dead_letter_after_max_attempts() {
        let store = TopologyStore::in_memory();
        let dns = Arc::new(MemoryEndpoint::new(EntryKind::Dns));
        let d = dispatcher(Arc::new(MemoryInventory::new()), Arc::clone(&dns), 2);

        dns.set_failing(true);
        let seqs = stage_dns_add(&store);
        d.dispatch(&store, &seqs).unwrap();
        let report = d.retry_pending(&store).unwrap();

        assert_eq!(report.dead_lettered, seqs);
        assert!(store.pending_effects().unwrap().is_empty());
        assert_eq!(store.dead_letters().unwrap().len(), 1);

        // Parked records are not retried.
        dns.set_failing(false);
        assert!(d.retry_pending(&store).unwrap().delivered.is_empty());

        assert!(store.requeue_effect(seqs[0]).unwrap());
        assert_eq!(d.retry_pending(&store).unwrap().delivered, seqs);
    }

    #[test]
    fn test_missing_provider_is_deferred() {
        let store = TopologyStore::in_memory();
        let d = SideEffectDispatcher::new(
            Arc::new(MemoryInventory::new()),
            EndpointRegistry::new(),
            Arc::new(MemoryCredentials::new()),
            3,
            Arc::new(MetricsRegistry::new()),
        );
        let seqs = stage_dns_add(&store);
        let report = d.dispatch(&store, &seqs).unwrap();
        assert_eq!(report.deferred.len(), 1);
        assert!(report.deferred[0].1.contains("dns"));
    }
}
