//! Topology Store
//!
//! Durable home of the topology graph and of the side-effect outbox.
//!
//! Every mutation runs through `transaction`:
//! 1. The closure works on a private copy of the graph
//! 2. Side effects are staged on the transaction, not executed
//! 3. On `Ok`, invariants are checked on the copy
//! 4. The copy plus staged effects are persisted, then swapped in
//!
//! Any error in steps 1-4 discards the copy: the visible graph never reaches
//! a partially-mutated state. Writers are serialized by the store's lock,
//! so two operations on the same cluster cannot interleave their write
//! phases. Readers always see the last committed graph.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::errors::{TopologyError, TopologyResult};
use super::graph::TopologyGraph;
use super::model::ClusterId;
use crate::durable::{self, DurableError};
use crate::outbox::{DeliveryState, OutboxQueue, OutboxRecord, SideEffect};

/// Snapshot file name inside the data directory.
const SNAPSHOT_FILE_NAME: &str = "topology.snapshot";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    graph: TopologyGraph,
    outbox: OutboxQueue,
}

/// An in-flight topology transaction.
pub struct Transaction {
    graph: TopologyGraph,
    staged: Vec<(Option<ClusterId>, SideEffect)>,
}

impl Transaction {
    /// Read access to the working copy.
    pub fn graph(&self) -> &TopologyGraph {
        &self.graph
    }

    pub(crate) fn graph_mut(&mut self) -> &mut TopologyGraph {
        &mut self.graph
    }

    /// Stage a side effect for delivery after commit.
    pub fn stage(&mut self, cluster: Option<ClusterId>, effect: SideEffect) {
        self.staged.push((cluster, effect));
    }

    /// Number of staged effects.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

/// Result of a committed transaction.
#[derive(Debug)]
pub struct Committed<T> {
    /// Value returned by the transaction closure.
    pub value: T,
    /// Outbox sequence numbers of the staged effects.
    pub staged: Vec<u64>,
}

/// The topology store.
pub struct TopologyStore {
    state: RwLock<StoreState>,
    snapshot_path: Option<PathBuf>,
}

impl TopologyStore {
    /// Store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            snapshot_path: None,
        }
    }

    /// Open (or initialize) a durable store in `data_dir`.
    ///
    /// The snapshot must pass its checksum and the graph invariants.
    pub fn open(data_dir: &Path) -> TopologyResult<Self> {
        let snapshot_path = data_dir.join(SNAPSHOT_FILE_NAME);
        let state = match durable::read_document::<StoreState>(&snapshot_path).map_err(map_durable)? {
            Some(state) => {
                state.graph.check_invariants().map_err(|e| {
                    TopologyError::Corrupted(format!("snapshot fails invariants: {}", e))
                })?;
                state
            }
            None => StoreState::default(),
        };
        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(snapshot_path),
        })
    }

    /// Whether commits are persisted.
    pub fn is_durable(&self) -> bool {
        self.snapshot_path.is_some()
    }

    /// Run a read-only closure against the committed graph.
    pub fn read<R>(&self, f: impl FnOnce(&TopologyGraph) -> R) -> TopologyResult<R> {
        let state = self.state.read().map_err(|_| TopologyError::LockPoisoned)?;
        Ok(f(&state.graph))
    }

    /// Clone of the committed graph.
    pub fn snapshot(&self) -> TopologyResult<TopologyGraph> {
        self.read(|g| g.clone())
    }

    /// Run a mutating closure as one atomic transaction.
    pub fn transaction<T, E>(
        &self,
        f: impl FnOnce(&mut Transaction) -> Result<T, E>,
    ) -> Result<Committed<T>, E>
    where
        E: From<TopologyError>,
    {
        let mut state = self.state.write().map_err(|_| TopologyError::LockPoisoned)?;

        let mut tx = Transaction {
            graph: state.graph.clone(),
            staged: Vec::new(),
        };
        let value = f(&mut tx)?;
        tx.graph.check_invariants()?;

        let mut outbox = state.outbox.clone();
        let staged = tx
            .staged
            .into_iter()
            .map(|(cluster, effect)| outbox.enqueue(cluster, effect))
            .collect();

        let next = StoreState {
            graph: tx.graph,
            outbox,
        };
        self.persist(&next)?;
        *state = next;

        Ok(Committed { value, staged })
    }

    // =========================================================================
    // OUTBOX
    // =========================================================================

    /// Pending outbox records in sequence order.
    pub fn pending_effects(&self) -> TopologyResult<Vec<OutboxRecord>> {
        let state = self.state.read().map_err(|_| TopologyError::LockPoisoned)?;
        Ok(state.outbox.pending())
    }

    /// Dead-lettered outbox records.
    pub fn dead_letters(&self) -> TopologyResult<Vec<OutboxRecord>> {
        let state = self.state.read().map_err(|_| TopologyError::LockPoisoned)?;
        Ok(state.outbox.dead_letters())
    }

    /// Get one outbox record.
    pub fn outbox_record(&self, seq: u64) -> TopologyResult<Option<OutboxRecord>> {
        let state = self.state.read().map_err(|_| TopologyError::LockPoisoned)?;
        Ok(state.outbox.get(seq).cloned())
    }

    /// Record the outcome of a delivery attempt.
    ///
    /// Returns `None` once the record is delivered (removed), otherwise its
    /// resulting delivery state.
    pub fn settle_effect(
        &self,
        seq: u64,
        outcome: Result<(), String>,
        max_attempts: u32,
    ) -> TopologyResult<Option<DeliveryState>> {
        self.update_outbox(|outbox| match outcome {
            Ok(()) => {
                outbox.mark_delivered(seq);
                None
            }
            Err(error) => outbox.mark_failed(seq, &error, max_attempts),
        })
    }

    /// Move a dead-lettered record back to pending.
    pub fn requeue_effect(&self, seq: u64) -> TopologyResult<bool> {
        self.update_outbox(|outbox| outbox.requeue(seq))
    }

    fn update_outbox<R>(&self, f: impl FnOnce(&mut OutboxQueue) -> R) -> TopologyResult<R> {
        let mut state = self.state.write().map_err(|_| TopologyError::LockPoisoned)?;
        let mut outbox = state.outbox.clone();
        let result = f(&mut outbox);
        let next = StoreState {
            graph: state.graph.clone(),
            outbox,
        };
        self.persist(&next)?;
        *state = next;
        Ok(result)
    }

    fn persist(&self, state: &StoreState) -> TopologyResult<()> {
        match &self.snapshot_path {
            Some(path) => durable::write_document(path, state).map_err(map_durable),
            None => Ok(()),
        }
    }
}

fn map_durable(err: DurableError) -> TopologyError {
    match err {
        DurableError::Corrupted { .. } => TopologyError::Corrupted(err.to_string()),
        other => TopologyError::Persistence(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::InventoryCall;
    use crate::topology::model::{HostSpec, MachineRole};
    use tempfile::TempDir;

    fn recycle() -> SideEffect {
        SideEffect::Inventory(InventoryCall::RecycleHosts {
            hosts: vec!["10.0.0.9".to_string()],
        })
    }

    #[test]
    fn test_commit_applies_graph_and_stages_effects() {
        let store = TopologyStore::in_memory();
        let committed = store
            .transaction(|tx| {
                tx.graph_mut().claim_host(&HostSpec::new("10.0.0.9"), MachineRole::Storage);
                tx.stage(None, recycle());
                Ok::<_, TopologyError>(7)
            })
            .unwrap();

        assert_eq!(committed.value, 7);
        assert_eq!(committed.staged.len(), 1);
        assert!(store.read(|g| g.machine("10.0.0.9").is_some()).unwrap());
        assert_eq!(store.pending_effects().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_closure_leaves_graph_untouched() {
        let store = TopologyStore::in_memory();
        let result = store.transaction(|tx| {
            tx.graph_mut().claim_host(&HostSpec::new("10.0.0.9"), MachineRole::Storage);
            tx.stage(None, recycle());
            Err::<(), _>(TopologyError::not_found("cluster", "x"))
        });

        assert!(result.is_err());
        assert!(store.read(|g| g.machine("10.0.0.9").is_none()).unwrap());
        assert!(store.pending_effects().unwrap().is_empty());
    }

    #[test]
    fn test_settle_effect() {
        let store = TopologyStore::in_memory();
        let committed = store
            .transaction(|tx| {
                tx.stage(None, recycle());
                Ok::<_, TopologyError>(())
            })
            .unwrap();
        let seq = committed.staged[0];

        let state = store.settle_effect(seq, Err("503".into()), 3).unwrap();
        assert_eq!(state, Some(DeliveryState::Pending));
        assert_eq!(store.outbox_record(seq).unwrap().unwrap().attempts, 1);

        assert_eq!(store.settle_effect(seq, Ok(()), 3).unwrap(), None);
        assert!(store.pending_effects().unwrap().is_empty());
    }

    #[test]
    fn test_durable_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = TopologyStore::open(dir.path()).unwrap();
            assert!(store.is_durable());
            store
                .transaction(|tx| {
                    tx.graph_mut().claim_host(&HostSpec::new("10.0.0.9"), MachineRole::Proxy);
                    tx.stage(None, recycle());
                    Ok::<_, TopologyError>(())
                })
                .unwrap();
        }

        let reopened = TopologyStore::open(dir.path()).unwrap();
        assert!(reopened.read(|g| g.machine("10.0.0.9").is_some()).unwrap());
        assert_eq!(reopened.pending_effects().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupted_snapshot_refused() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(SNAPSHOT_FILE_NAME), b"not an envelope").unwrap();
        assert!(matches!(
            TopologyStore::open(dir.path()),
            Err(TopologyError::Corrupted(_))
        ));
    }
}
