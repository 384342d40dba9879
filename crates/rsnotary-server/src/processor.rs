//! The batch processor: the engine's single dedicated worker.
//!
//! Drains the request queue into batches bounded by count and elapsed
//! time, processes each batch inside one store transaction (retrying
//! transient contention with exponential backoff), and completes every
//! request's one-shot handle strictly after the batch is durable.
//!
//! All conflict-resolution state is local to one batch invocation and one
//! task; the single-writer design is what makes the resolver's fold order
//! a total order over this instance's commits.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use rsnotary_domain::{
    resolve_batch, Clock, CommitRequest, Decision, NotaryError, ResolvedBatch, StateRef, TxId,
};
use rsnotary_storage::{
    BatchWrite, CommittedState, StorageResult, StoreTransaction, UniquenessStore,
};

use crate::config::EngineSettings;
use crate::service::PendingRequest;
use crate::signer::BatchSigner;

pub(crate) struct BatchProcessor {
    settings: EngineSettings,
    store: Arc<dyn UniquenessStore>,
    signer: Arc<dyn BatchSigner>,
    clock: Arc<dyn Clock>,
}

impl BatchProcessor {
    pub(crate) fn new(
        settings: EngineSettings,
        store: Arc<dyn UniquenessStore>,
        signer: Arc<dyn BatchSigner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            store,
            signer,
            clock,
        }
    }

    /// The worker loop. Exits when shutdown is signalled or every sender
    /// is gone; any requests still queued at that point are failed with
    /// `ServiceStopped`.
    pub(crate) async fn run(
        self,
        mut queue: mpsc::Receiver<PendingRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let first = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                item = queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let batch = self.accumulate(first, &mut queue).await;
            debug!(batch_size = batch.len(), "processing batch");
            self.process_batch(batch).await;

            if *shutdown.borrow() {
                break;
            }
        }

        // Explicitly fail whatever never reached a batch; callers must
        // not be left waiting on a handle forever.
        queue.close();
        let mut abandoned = 0usize;
        while let Ok(pending) = queue.try_recv() {
            let _ = pending.reply.send(Err(NotaryError::ServiceStopped));
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!(abandoned, "failed queued requests on shutdown");
        }
        debug!("batch processor stopped");
    }

    /// Drains the queue until the batch is full or the timeout since the
    /// batch's first request has elapsed.
    async fn accumulate(
        &self,
        first: PendingRequest,
        queue: &mut mpsc::Receiver<PendingRequest>,
    ) -> Vec<PendingRequest> {
        let mut batch = Vec::with_capacity(self.settings.max_batch_size);
        batch.push(first);

        let deadline = Instant::now() + self.settings.batch_timeout();
        while batch.len() < self.settings.max_batch_size {
            match tokio::time::timeout_at(deadline, queue.recv()).await {
                Ok(Some(item)) => batch.push(item),
                // Channel closed or deadline hit: the batch is what it is.
                Ok(None) | Err(_) => break,
            }
        }
        batch
    }

    async fn process_batch(&self, batch: Vec<PendingRequest>) {
        let requests: Vec<CommitRequest> =
            batch.iter().map(|p| p.request.clone()).collect();

        match self.execute_with_retry(&batch, &requests).await {
            Ok(resolved) => self.deliver(batch, &requests, resolved).await,
            Err(error) => {
                // Retry budget exhausted or a non-transient failure: the
                // store write was all-or-nothing, so the whole batch fails
                // uniformly with nothing partially committed.
                error!(%error, batch_size = batch.len(), "batch failed");
                let message = format!("store transaction failed: {error}");
                for pending in batch {
                    let _ = pending
                        .reply
                        .send(Err(NotaryError::general(message.clone())));
                }
            }
        }
    }

    /// Runs the batch's store transaction, retrying transient contention
    /// with exponentially growing backoff.
    async fn execute_with_retry(
        &self,
        batch: &[PendingRequest],
        requests: &[CommitRequest],
    ) -> StorageResult<ResolvedBatch> {
        let mut attempt: u32 = 0;
        loop {
            match self.execute_once(batch, requests).await {
                Ok(resolved) => return Ok(resolved),
                Err(error) if error.is_transient() && attempt + 1 < self.settings.max_retries => {
                    let backoff = backoff_delay(self.settings.backoff_base(), attempt);
                    warn!(
                        %error,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient store contention, retrying batch"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// One attempt: a single store transaction wrapping conflict
    /// detection, resolution, and the batch write.
    async fn execute_once(
        &self,
        batch: &[PendingRequest],
        requests: &[CommitRequest],
    ) -> StorageResult<ResolvedBatch> {
        let mut txn = self.store.begin().await?;

        let snapshot = self.find_conflicts(txn.as_mut(), requests).await?;
        let committed_txs = self
            .find_committed_transactions(txn.as_mut(), requests)
            .await?;

        let resolved = resolve_batch(requests, snapshot, &committed_txs, self.clock.now());

        let mut write = BatchWrite {
            // Every request is audited, committed or not.
            request_log: batch.iter().map(|p| p.log_entry.clone()).collect(),
            ..Default::default()
        };
        for &index in &resolved.to_persist {
            let request = &requests[index];
            // Distinct inputs only: a request may legitimately list the
            // same state twice, but the store holds one row per state.
            let inputs: BTreeSet<StateRef> = request.inputs.iter().copied().collect();
            write
                .committed_states
                .extend(inputs.into_iter().map(|state_ref| CommittedState {
                    state_ref,
                    consuming_tx_id: request.tx_id,
                }));
            write.committed_transactions.push(request.tx_id);
        }

        txn.commit(write).await?;
        Ok(resolved)
    }

    /// Conflict detection: which of the batch's states are already
    /// committed, and by whom. Queries are chunked so individual lookups
    /// stay bounded regardless of batch size.
    async fn find_conflicts(
        &self,
        txn: &mut dyn StoreTransaction,
        requests: &[CommitRequest],
    ) -> StorageResult<BTreeMap<StateRef, TxId>> {
        let refs: BTreeSet<StateRef> = requests
            .iter()
            .flat_map(|r| r.inputs.iter().chain(r.references.iter()))
            .copied()
            .collect();
        let refs: Vec<StateRef> = refs.into_iter().collect();

        let mut consumed = BTreeMap::new();
        for chunk in refs.chunks(self.settings.max_lookup_size) {
            for (state_ref, tx_id) in txn.find_committed(chunk).await? {
                consumed.insert(state_ref, tx_id);
            }
        }
        Ok(consumed)
    }

    /// Committed-transaction markers for the batch's zero-input requests;
    /// only those can need the marker-based idempotency path.
    async fn find_committed_transactions(
        &self,
        txn: &mut dyn StoreTransaction,
        requests: &[CommitRequest],
    ) -> StorageResult<HashSet<TxId>> {
        let mut committed = HashSet::new();
        let mut checked = HashSet::new();
        for request in requests.iter().filter(|r| r.inputs.is_empty()) {
            if !checked.insert(request.tx_id) {
                continue;
            }
            if txn.transaction_committed(&request.tx_id).await? {
                committed.insert(request.tx_id);
            }
        }
        Ok(committed)
    }

    /// Signs the batch's successful transactions and completes every
    /// handle. Runs strictly after the store transaction committed, so a
    /// caller can never observe success before the fact is durable.
    async fn deliver(
        &self,
        batch: Vec<PendingRequest>,
        requests: &[CommitRequest],
        resolved: ResolvedBatch,
    ) {
        let signable = resolved.signable_tx_ids(requests);
        let signature = if signable.is_empty() {
            None
        } else {
            match self.signer.sign(&signable).await {
                Ok(signature) => Some(signature),
                Err(error) => {
                    // The commits are durable; the callers still cannot be
                    // told "success" without a signature. A retry will
                    // land on the idempotent-duplicate path.
                    error!(%error, "batch signing failed");
                    let message = format!("batch signing failed: {error}");
                    for pending in batch {
                        let _ = pending
                            .reply
                            .send(Err(NotaryError::general(message.clone())));
                    }
                    return;
                }
            }
        };

        let committed = resolved
            .decisions
            .iter()
            .filter(|d| matches!(d, Decision::Commit))
            .count();
        debug!(
            batch_size = batch.len(),
            committed,
            signed = signable.len(),
            "batch durable, delivering outcomes"
        );

        for (pending, decision) in batch.into_iter().zip(resolved.decisions) {
            let outcome = match decision {
                Decision::Commit | Decision::Duplicate => signature
                    .as_ref()
                    .and_then(|s| s.for_participant(&pending.request.tx_id))
                    .ok_or_else(|| {
                        NotaryError::general("transaction missing from batch signature")
                    }),
                Decision::Reject(error) => Err(error),
            };
            let _ = pending.reply.send(outcome);
        }
    }
}

/// `base * 2^attempt`, saturating.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}
