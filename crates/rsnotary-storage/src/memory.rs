//! In-memory store implementation for tests and single-instance
//! development.
//!
//! Transactions are serialized behind one `tokio::sync::Mutex`: a
//! transaction owns the guard for its whole lifetime, which trivially
//! gives the snapshot-consistent read-then-write the engine requires.
//! Uncommitted transactions roll back by construction — writes are only
//! applied in `commit`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::instrument;

use rsnotary_domain::{StateRef, TxId};

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    BatchWrite, RequestLogEntry, StoreTransaction, UniquenessStore,
};

#[derive(Debug, Default)]
struct MemoryInner {
    committed_states: BTreeMap<StateRef, TxId>,
    committed_transactions: BTreeSet<TxId>,
    request_log: Vec<RequestLogEntry>,
}

/// In-memory implementation of [`UniquenessStore`].
///
/// # Characteristics
///
/// - **find_committed**: O(k log n) map lookups
/// - **commit**: O(m log n) inserts, atomic under the transaction mutex
/// - One transaction at a time; `begin` waits for the previous
///   transaction to finish
///
/// Suitable for tests and a single-process engine. Durability across
/// restarts requires the PostgreSQL backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory store wrapped in Arc.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of committed-state rows. Test inspection helper.
    pub async fn committed_state_count(&self) -> usize {
        self.inner.lock().await.committed_states.len()
    }

    /// The transaction that consumed `state_ref`, if any. Test inspection
    /// helper.
    pub async fn consuming_tx(&self, state_ref: &StateRef) -> Option<TxId> {
        self.inner.lock().await.committed_states.get(state_ref).copied()
    }

    /// Whether `tx_id` holds a committed-transaction marker. Test
    /// inspection helper.
    pub async fn is_transaction_committed(&self, tx_id: &TxId) -> bool {
        self.inner
            .lock()
            .await
            .committed_transactions
            .contains(tx_id)
    }

    /// Number of request audit log entries. Test inspection helper.
    pub async fn request_log_len(&self) -> usize {
        self.inner.lock().await.request_log.len()
    }
}

#[async_trait]
impl UniquenessStore for MemoryStore {
    #[instrument(skip(self))]
    async fn begin(&self) -> StorageResult<Box<dyn StoreTransaction>> {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        Ok(Box::new(MemoryTransaction { guard }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryInner>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn find_committed(
        &mut self,
        refs: &[StateRef],
    ) -> StorageResult<Vec<(StateRef, TxId)>> {
        Ok(refs
            .iter()
            .filter_map(|r| {
                self.guard
                    .committed_states
                    .get(r)
                    .map(|tx_id| (*r, *tx_id))
            })
            .collect())
    }

    async fn transaction_committed(&mut self, tx_id: &TxId) -> StorageResult<bool> {
        Ok(self.guard.committed_transactions.contains(tx_id))
    }

    async fn commit(mut self: Box<Self>, batch: BatchWrite) -> StorageResult<()> {
        // Mirror the relational backend's primary-key constraint: a
        // second row for the same state ref is a bug upstream, reported
        // in the same transient class as a PostgreSQL uniqueness race.
        for state in &batch.committed_states {
            if self.guard.committed_states.contains_key(&state.state_ref) {
                return Err(StorageError::Serialization {
                    message: format!(
                        "committed-state row already exists for {}",
                        state.state_ref
                    ),
                });
            }
        }

        for state in batch.committed_states {
            self.guard
                .committed_states
                .insert(state.state_ref, state.consuming_tx_id);
        }
        for tx_id in batch.committed_transactions {
            self.guard.committed_transactions.insert(tx_id);
        }
        self.guard.request_log.extend(batch.request_log);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::CommittedState;
    use chrono::Utc;
    use rsnotary_domain::Party;
    use uuid::Uuid;

    fn tx(n: u8) -> TxId {
        TxId([n; 32])
    }

    fn state(n: u8, index: u32) -> StateRef {
        StateRef::new(tx(n), index)
    }

    fn log_entry(sequence: u64, tx_id: TxId) -> RequestLogEntry {
        RequestLogEntry {
            instance_id: Uuid::nil(),
            sequence,
            tx_id,
            caller: Party::new("party-a"),
            request_signature: vec![1, 2, 3],
            received_at: Utc::now(),
        }
    }

    // Test: committed rows are visible to a later transaction
    #[tokio::test]
    async fn test_commit_then_find() {
        let store = MemoryStore::new();
        let s = state(9, 0);

        let tx1 = store.begin().await.unwrap();
        tx1.commit(BatchWrite {
            committed_states: vec![CommittedState {
                state_ref: s,
                consuming_tx_id: tx(1),
            }],
            committed_transactions: vec![tx(1)],
            request_log: vec![log_entry(0, tx(1))],
        })
        .await
        .unwrap();

        let mut tx2 = store.begin().await.unwrap();
        let found = tx2.find_committed(&[s, state(9, 1)]).await.unwrap();
        assert_eq!(found, vec![(s, tx(1))]);
        assert!(tx2.transaction_committed(&tx(1)).await.unwrap());
        assert!(!tx2.transaction_committed(&tx(2)).await.unwrap());
    }

    // Test: a dropped transaction leaves no trace
    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = MemoryStore::new();

        {
            let mut tx1 = store.begin().await.unwrap();
            let _ = tx1.find_committed(&[state(9, 0)]).await.unwrap();
            // Dropped without commit.
        }

        assert_eq!(store.committed_state_count().await, 0);
        assert_eq!(store.request_log_len().await, 0);
    }

    // Test: writing a second row for the same state ref fails and the
    // whole batch is discarded
    #[tokio::test]
    async fn test_double_commit_rejected_atomically() {
        let store = MemoryStore::new();
        let s = state(9, 0);

        let tx1 = store.begin().await.unwrap();
        tx1.commit(BatchWrite {
            committed_states: vec![CommittedState {
                state_ref: s,
                consuming_tx_id: tx(1),
            }],
            ..Default::default()
        })
        .await
        .unwrap();

        let tx2 = store.begin().await.unwrap();
        let result = tx2
            .commit(BatchWrite {
                committed_states: vec![
                    CommittedState {
                        state_ref: state(8, 0),
                        consuming_tx_id: tx(2),
                    },
                    CommittedState {
                        state_ref: s,
                        consuming_tx_id: tx(2),
                    },
                ],
                committed_transactions: vec![tx(2)],
                request_log: vec![log_entry(0, tx(2))],
            })
            .await;

        assert!(matches!(
            result,
            Err(StorageError::Serialization { .. })
        ));
        // Nothing from the failed batch landed.
        assert_eq!(store.committed_state_count().await, 1);
        assert_eq!(store.consuming_tx(&s).await, Some(tx(1)));
        assert!(!store.is_transaction_committed(&tx(2)).await);
        assert_eq!(store.request_log_len().await, 0);
    }

    // Test: request log is append-only across batches
    #[tokio::test]
    async fn test_request_log_appends() {
        let store = MemoryStore::new();

        for sequence in 0..3 {
            let txn = store.begin().await.unwrap();
            txn.commit(BatchWrite {
                request_log: vec![log_entry(sequence, tx(1))],
                ..Default::default()
            })
            .await
            .unwrap();
        }

        assert_eq!(store.request_log_len().await, 3);
    }

    // Test: transactions serialize; a begun transaction blocks the next
    #[tokio::test]
    async fn test_transactions_serialize() {
        let store = MemoryStore::new_shared();

        let tx1 = store.begin().await.unwrap();
        let store2 = Arc::clone(&store);
        let second = tokio::spawn(async move {
            let txn = store2.begin().await.unwrap();
            txn.commit(BatchWrite::default()).await.unwrap();
        });

        // The second begin cannot proceed until tx1 is finished.
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        tx1.commit(BatchWrite::default()).await.unwrap();
        second.await.unwrap();
    }
}
