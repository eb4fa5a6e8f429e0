//! Outbox Queue
//!
//! Ordered log of staged side effects. Records are appended by a committing
//! topology transaction and removed only once delivery succeeded, which
//! gives at-least-once delivery across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::effect::SideEffect;
use crate::topology::ClusterId;

/// Delivery state of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Waiting for (re)delivery.
    Pending,
    /// Gave up after too many attempts; needs an operator.
    DeadLetter,
}

/// A staged side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Monotonic sequence number.
    pub seq: u64,
    /// Cluster the effect belongs to, if any.
    pub cluster: Option<ClusterId>,
    /// The call to make.
    pub effect: SideEffect,
    /// When the owning transaction committed.
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Last delivery error.
    pub last_error: Option<String>,
    /// Delivery state.
    pub state: DeliveryState,
}

/// The outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxQueue {
    next_seq: u64,
    records: BTreeMap<u64, OutboxRecord>,
}

impl Default for OutboxQueue {
    fn default() -> Self {
        Self {
            next_seq: 1,
            records: BTreeMap::new(),
        }
    }
}

impl OutboxQueue {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an effect. Returns its sequence number.
    pub fn enqueue(&mut self, cluster: Option<ClusterId>, effect: SideEffect) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.insert(
            seq,
            OutboxRecord {
                seq,
                cluster,
                effect,
                enqueued_at: Utc::now(),
                attempts: 0,
                last_error: None,
                state: DeliveryState::Pending,
            },
        );
        seq
    }

    /// Get a record.
    pub fn get(&self, seq: u64) -> Option<&OutboxRecord> {
        self.records.get(&seq)
    }

    /// Pending records in sequence order.
    pub fn pending(&self) -> Vec<OutboxRecord> {
        self.records
            .values()
            .filter(|r| r.state == DeliveryState::Pending)
            .cloned()
            .collect()
    }

    /// Dead-lettered records in sequence order.
    pub fn dead_letters(&self) -> Vec<OutboxRecord> {
        self.records
            .values()
            .filter(|r| r.state == DeliveryState::DeadLetter)
            .cloned()
            .collect()
    }

    /// Remove a delivered record. Returns false if it was already gone.
    pub fn mark_delivered(&mut self, seq: u64) -> bool {
        self.records.remove(&seq).is_some()
    }

    /// Record a failed attempt; dead-letter after `max_attempts`.
    /// Returns the resulting state, or `None` if the record is unknown.
    pub fn mark_failed(&mut self, seq: u64, error: &str, max_attempts: u32) -> Option<DeliveryState> {
        let record = self.records.get_mut(&seq)?;
        record.attempts += 1;
        record.last_error = Some(error.to_string());
        if record.attempts >= max_attempts {
            record.state = DeliveryState::DeadLetter;
        }
        Some(record.state)
    }

    /// Move a dead-lettered record back to pending with a fresh budget.
    pub fn requeue(&mut self, seq: u64) -> bool {
        match self.records.get_mut(&seq) {
            Some(record) if record.state == DeliveryState::DeadLetter => {
                record.state = DeliveryState::Pending;
                record.attempts = 0;
                true
            }
            _ => false,
        }
    }

    /// Number of records not yet delivered.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether everything was delivered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::effect::InventoryCall;

    fn recycle(host: &str) -> SideEffect {
        SideEffect::Inventory(InventoryCall::RecycleHosts {
            hosts: vec![host.to_string()],
        })
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let mut queue = OutboxQueue::new();
        let a = queue.enqueue(None, recycle("10.0.0.1"));
        let b = queue.enqueue(None, recycle("10.0.0.2"));
        assert!(b > a);
        let pending = queue.pending();
        assert_eq!(pending[0].seq, a);
        assert_eq!(pending[1].seq, b);
    }

    #[test]
    fn test_delivered_record_removed() {
        let mut queue = OutboxQueue::new();
        let seq = queue.enqueue(None, recycle("10.0.0.1"));
        assert!(queue.mark_delivered(seq));
        assert!(!queue.mark_delivered(seq));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dead_letter_after_max_attempts() {
        let mut queue = OutboxQueue::new();
        let seq = queue.enqueue(None, recycle("10.0.0.1"));

        assert_eq!(queue.mark_failed(seq, "timeout", 2), Some(DeliveryState::Pending));
        assert_eq!(queue.mark_failed(seq, "timeout", 2), Some(DeliveryState::DeadLetter));
        assert!(queue.pending().is_empty());
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.get(seq).unwrap().last_error.as_deref(), Some("timeout"));

        assert!(queue.requeue(seq));
        assert_eq!(queue.pending().len(), 1);
        assert_eq!(queue.get(seq).unwrap().attempts, 0);
    }

    #[test]
    fn test_requeue_pending_is_noop() {
        let mut queue = OutboxQueue::new();
        let seq = queue.enqueue(None, recycle("10.0.0.1"));
        assert!(!queue.requeue(seq));
    }
}
