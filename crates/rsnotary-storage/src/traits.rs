//! UniquenessStore trait definition and persisted record types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use rsnotary_domain::{Party, StateRef, TxId};

use crate::error::StorageResult;

/// A durable fact: `state_ref` was consumed by `consuming_tx_id`.
///
/// Written once, never updated or deleted. The store must hold at most one
/// row per `state_ref` for its entire lifetime; that is the invariant the
/// whole engine exists to protect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedState {
    pub state_ref: StateRef,
    pub consuming_tx_id: TxId,
}

/// Audit record of one request received, successful or not.
///
/// Keyed by `(instance_id, sequence)`: the instance id is unique per
/// engine process and the sequence is process-local monotonic, so multiple
/// writer instances sharing one store never collide. Append-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLogEntry {
    pub instance_id: Uuid,
    pub sequence: u64,
    pub tx_id: TxId,
    pub caller: Party,
    pub request_signature: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Everything one batch persists atomically.
#[derive(Debug, Clone, Default)]
pub struct BatchWrite {
    /// New committed-state rows: one per input of each committable request.
    pub committed_states: Vec<CommittedState>,
    /// New committed-transaction markers: one per committable request,
    /// covering zero-input transactions that leave no state rows.
    pub committed_transactions: Vec<TxId>,
    /// Audit entries for every request in the batch, unconditionally.
    pub request_log: Vec<RequestLogEntry>,
}

impl BatchWrite {
    pub fn is_empty(&self) -> bool {
        self.committed_states.is_empty()
            && self.committed_transactions.is_empty()
            && self.request_log.is_empty()
    }
}

/// Abstract durable store for notarization facts.
///
/// Implementations must be thread-safe (Send + Sync). The only capability
/// the engine requires is a transaction offering snapshot-consistent reads
/// followed by an atomic multi-row write — any transactional engine
/// (relational, embedded KV with ACID transactions) qualifies.
#[async_trait]
pub trait UniquenessStore: Send + Sync + 'static {
    /// Opens one store transaction. Every read and write for one batch
    /// happens inside a single transaction; that is what arbitrates races
    /// between engine instances sharing this store.
    async fn begin(&self) -> StorageResult<Box<dyn StoreTransaction>>;
}

/// One open store transaction.
///
/// Dropping a transaction without calling [`StoreTransaction::commit`]
/// rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Returns the subset of `refs` that already have committed-state
    /// rows, paired with the consuming transaction id. A pure read.
    ///
    /// Callers bound the size of `refs` per call; implementations need not
    /// chunk internally.
    async fn find_committed(
        &mut self,
        refs: &[StateRef],
    ) -> StorageResult<Vec<(StateRef, TxId)>>;

    /// Whether `tx_id` holds a committed-transaction marker.
    async fn transaction_committed(&mut self, tx_id: &TxId) -> StorageResult<bool>;

    /// Atomically persists the batch and commits the transaction.
    /// All-or-nothing: a failure leaves no partial state behind.
    async fn commit(self: Box<Self>, batch: BatchWrite) -> StorageResult<()>;
}
