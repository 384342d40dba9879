//! The ingress API: enqueue commit requests, hand out one-shot handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use rsnotary_domain::{
    Clock, CommitRequest, NotaryError, Outcome, Party, StateRef, SystemClock, TimeWindow, TxId,
};
use rsnotary_storage::{RequestLogEntry, UniquenessStore};

use crate::config::EngineSettings;
use crate::processor::BatchProcessor;
use crate::signer::BatchSigner;

/// One queued request: the commit ask, its audit entry, and the sender
/// half of the caller's handle. The reply sender is consumed exactly once
/// by the batch processor.
pub(crate) struct PendingRequest {
    pub request: CommitRequest,
    pub log_entry: RequestLogEntry,
    pub reply: oneshot::Sender<Outcome>,
}

/// The caller's half of one commit request: resolves exactly once with
/// the notarization outcome.
///
/// Dropping the handle abandons the result without affecting processing.
#[derive(Debug)]
pub struct CommitHandle {
    rx: oneshot::Receiver<Outcome>,
}

impl CommitHandle {
    /// Waits for the outcome. If the engine dropped the request without
    /// resolving it (it was shut down), this reports `ServiceStopped`
    /// rather than hanging forever.
    pub async fn outcome(self) -> Outcome {
        self.rx
            .await
            .unwrap_or(Err(NotaryError::ServiceStopped))
    }

    fn stopped() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(NotaryError::ServiceStopped));
        Self { rx }
    }
}

/// The uniqueness engine service.
///
/// Cloneable; all clones share one queue and one worker. Construction
/// spawns the worker task; [`NotaryService::shutdown`] stops it and fails
/// outstanding queued requests with `ServiceStopped`.
#[derive(Clone)]
pub struct NotaryService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    queue: mpsc::Sender<PendingRequest>,
    shutdown: watch::Sender<bool>,
    sequence: AtomicU64,
    instance_id: Uuid,
    clock: Arc<dyn Clock>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotaryService {
    /// Starts the engine with the system clock and a fresh instance id.
    pub fn start(
        settings: EngineSettings,
        store: Arc<dyn UniquenessStore>,
        signer: Arc<dyn BatchSigner>,
    ) -> Self {
        Self::start_with_clock(settings, store, signer, Arc::new(SystemClock))
    }

    /// Starts the engine with an injected clock (tests pin time-window
    /// evaluation through this).
    pub fn start_with_clock(
        settings: EngineSettings,
        store: Arc<dyn UniquenessStore>,
        signer: Arc<dyn BatchSigner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let instance_id = Uuid::new_v4();
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(%instance_id, max_batch_size = settings.max_batch_size, "starting notary service");

        let processor =
            BatchProcessor::new(settings, store, signer, Arc::clone(&clock));
        let worker = tokio::spawn(processor.run(queue_rx, shutdown_rx));

        Self {
            inner: Arc::new(ServiceInner {
                queue: queue_tx,
                shutdown: shutdown_tx,
                sequence: AtomicU64::new(0),
                instance_id,
                clock,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    /// Submits one notarization request and returns immediately with an
    /// unresolved handle.
    ///
    /// Performs no semantic validation — that is the upstream request
    /// handler's job. If the queue is full, this call waits for space
    /// (backpressure by slowdown, never rejection). The handle resolves
    /// exactly once, after the request's batch is durable.
    #[allow(clippy::too_many_arguments)]
    pub async fn commit(
        &self,
        inputs: Vec<StateRef>,
        references: Vec<StateRef>,
        tx_id: TxId,
        caller: Party,
        request_signature: Vec<u8>,
        time_window: Option<TimeWindow>,
    ) -> CommitHandle {
        if *self.inner.shutdown.borrow() {
            return CommitHandle::stopped();
        }

        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let log_entry = RequestLogEntry {
            instance_id: self.inner.instance_id,
            sequence,
            tx_id,
            caller: caller.clone(),
            request_signature: request_signature.clone(),
            received_at: self.inner.clock.now(),
        };
        let request = CommitRequest {
            inputs,
            references,
            tx_id,
            caller,
            request_signature,
            time_window,
        };

        let (reply, rx) = oneshot::channel();
        let pending = PendingRequest {
            request,
            log_entry,
            reply,
        };

        // Blocks while the queue is full. A send error means the worker
        // is gone; dropping `pending` (and its reply sender with it)
        // resolves the handle as ServiceStopped.
        let _ = self.inner.queue.send(pending).await;

        CommitHandle { rx }
    }

    /// The id under which this instance writes its audit log entries.
    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    /// Stops the worker. The batch in flight (if any) completes normally;
    /// everything still queued is failed with `ServiceStopped`, and later
    /// `commit` calls resolve the same way immediately.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let handle = self.inner.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(instance_id = %self.inner.instance_id, "notary service stopped");
    }
}
