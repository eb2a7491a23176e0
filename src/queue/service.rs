//! Event queue service
//!
//! Producers call [`AccessLogQueue::enqueue`] from any task or thread; it
//! never blocks and never touches storage. A single background worker
//! drains the queue in batches.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::worker::{QueueWorker, WorkerState};
use crate::config::QueueConfig;
use crate::notify::Notifier;
use crate::overflow::{OverflowError, RecoveryManager, RecoveryReport, RecoverySource};
use crate::processor::BatchProcessor;
use crate::store::ConnectionPool;
use crate::types::AccessEvent;

/// Errors surfaced to queue callers
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("access log worker is not running")]
    NotRunning,

    #[error("invalid access event: {0}")]
    InvalidEvent(String),

    #[error(transparent)]
    Overflow(#[from] OverflowError),
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

struct WorkerHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// The in-memory event queue and its worker
pub struct AccessLogQueue {
    config: QueueConfig,
    sender: mpsc::UnboundedSender<AccessEvent>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<AccessEvent>>>,
    pending: Arc<AtomicUsize>,
    processor: BatchProcessor,
    recovery: Arc<RecoveryManager>,
    state: Arc<watch::Sender<WorkerState>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl AccessLogQueue {
    pub fn new(
        config: QueueConfig,
        pool: Arc<dyn ConnectionPool>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let processor = BatchProcessor::new(pool);
        let recovery = Arc::new(RecoveryManager::new(processor.clone(), notifier, &config));
        let (state, _) = watch::channel(WorkerState::Idle);

        Self {
            config,
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            pending: Arc::new(AtomicUsize::new(0)),
            processor,
            recovery,
            state: Arc::new(state),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add one event to the back of the queue.
    ///
    /// Fails with [`QueueError::NotRunning`] unless the worker has been
    /// started and has not stopped or terminated.
    pub fn enqueue(&self, event: AccessEvent) -> QueueResult<()> {
        event.check_encodable().map_err(QueueError::InvalidEvent)?;

        if !self.state().accepts_events() {
            return Err(QueueError::NotRunning);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(event).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::NotRunning);
        }
        Ok(())
    }

    /// Start the worker. Does nothing if a worker is already alive.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_worker(&self) {
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.as_ref() {
            let stopping = *handle.stop.borrow();
            if !stopping && self.state().is_active() && !handle.join.is_finished() {
                debug!("Access log worker already started");
                return;
            }
        }

        self.state.send_replace(WorkerState::Initializing);
        let (stop, stop_rx) = watch::channel(false);
        let run = QueueWorker {
            receiver: Arc::clone(&self.receiver),
            pending: Arc::clone(&self.pending),
            processor: self.processor.clone(),
            recovery: Arc::clone(&self.recovery),
            state: Arc::clone(&self.state),
            batch_size: self.config.effective_batch_size(),
            retry_interval: self.config.retry_interval(),
        };
        let join = tokio::spawn(run.run(stop_rx));
        *worker = Some(WorkerHandle { stop, join });
        info!("Access log worker started");
    }

    /// Ask the worker to stop after its in-flight batch. Queued events stay
    /// queued for the next start.
    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().as_ref() {
            handle.stop.send_replace(true);
        }
    }

    /// Stop the worker and wait for it to finish
    pub async fn shutdown(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle.stop.send_replace(true);
            if let Err(e) = handle.join.await {
                warn!(error = %e, "Access log worker did not shut down cleanly");
            }
        }
    }

    /// Events enqueued but not yet taken by the worker
    pub fn size(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch worker state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Wait until the worker reaches a state matching `pred`
    pub async fn wait_for_state<F>(&self, pred: F) -> WorkerState
    where
        F: FnMut(&WorkerState) -> bool,
    {
        let mut states = self.subscribe_state();
        let state = match states.wait_for(pred).await {
            Ok(state) => *state,
            // The sender lives as long as `self`
            Err(_) => self.state(),
        };
        state
    }

    /// Where the canonical overflow log lives
    pub async fn overflow_path(&self) -> QueueResult<PathBuf> {
        Ok(self.recovery.overflow_path().await?)
    }

    /// Run a recovery pass over the canonical overflow log now
    pub async fn recover(&self) -> QueueResult<RecoveryReport> {
        Ok(self.recovery.retry_canonical().await?)
    }

    /// Replay an overflow log at an arbitrary path. Chunks that still fail
    /// are moved into the canonical log and the file is removed.
    pub async fn recover_file<P: AsRef<Path>>(&self, path: P) -> QueueResult<RecoveryReport> {
        let source = RecoverySource::File(path.as_ref().to_path_buf());
        Ok(self.recovery.retry(source).await?)
    }

    /// Replay overflow log content handed in directly. Chunks that still
    /// fail are appended to the canonical log.
    pub async fn recover_text(&self, text: &str) -> QueueResult<RecoveryReport> {
        let source = RecoverySource::Text(text.to_string());
        Ok(self.recovery.retry(source).await?)
    }

    /// Re-arm outage alerts without waiting for a full recovery
    pub fn clear_alert_flag(&self) {
        self.recovery.gate().clear();
    }

    pub fn alert_sent(&self) -> bool {
        self.recovery.gate().is_sent()
    }
}

impl Drop for AccessLogQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            handle.stop.send_replace(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    fn queue(store: &MemoryStore, temp_dir: &TempDir) -> AccessLogQueue {
        AccessLogQueue::new(
            QueueConfig::new(temp_dir.path().join("overflow")),
            Arc::new(store.clone()),
            Arc::new(RecordingNotifier::new()),
        )
    }

    #[tokio::test]
    async fn test_enqueue_before_start_fails() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&MemoryStore::new(), &temp_dir);

        let result = queue.enqueue(AccessEvent::new(1, 1, 1, "h"));
        assert!(matches!(result, Err(QueueError::NotRunning)));
        assert_eq!(queue.state(), WorkerState::Idle);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_event_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&MemoryStore::new(), &temp_dir);
        queue.start_worker();

        let event = AccessEvent::new(1, 1, 1, "bad;host");
        assert!(matches!(queue.enqueue(event), Err(QueueError::InvalidEvent(_))));
        assert_eq!(queue.size(), 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&MemoryStore::new(), &temp_dir);

        queue.start_worker();
        queue.start_worker();
        let state = queue
            .wait_for_state(|s| *s == WorkerState::Running)
            .await;
        assert_eq!(state, WorkerState::Running);

        queue.shutdown().await;
        assert_eq!(queue.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_refused_connection_terminates() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.set_refuse_connections(true);
        let queue = queue(&store, &temp_dir);

        queue.start_worker();
        let state = queue
            .wait_for_state(|s| *s == WorkerState::Terminated)
            .await;
        assert_eq!(state, WorkerState::Terminated);
        assert!(matches!(
            queue.enqueue(AccessEvent::new(1, 1, 1, "h")),
            Err(QueueError::NotRunning)
        ));
    }
}
