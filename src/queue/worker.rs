//! Queue Worker
//!
//! The single consumer of the event queue. Once connected it loops:
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────┐   ┌──────────────────┐
//! │ wake: events │──►│ process batch     │──►│ retry overflow   │──► wait
//! │ or timer     │   │ (divert on error) │   │ log              │
//! └──────────────┘   └───────────────────┘   └──────────────────┘
//! ```
//!
//! It blocks on the queue instead of polling; the retry timer keeps the
//! overflow log moving while no events arrive.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::overflow::RecoveryManager;
use crate::processor::BatchProcessor;
use crate::types::AccessEvent;

/// Lifecycle of the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Never started
    Idle,
    /// Spawned, waiting for the queue
    Initializing,
    /// Checking that the store is reachable
    Connecting,
    Running,
    /// Stopped on request; queued events are kept for the next start
    Stopped,
    /// The store was unreachable at startup. Needs an explicit restart.
    Terminated,
}

impl WorkerState {
    /// Whether producers may enqueue in this state
    pub fn accepts_events(self) -> bool {
        matches!(
            self,
            WorkerState::Initializing | WorkerState::Connecting | WorkerState::Running
        )
    }

    /// Whether a worker task is (or is about to be) alive
    pub fn is_active(self) -> bool {
        self.accepts_events()
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Initializing => write!(f, "initializing"),
            WorkerState::Connecting => write!(f, "connecting"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Stopped => write!(f, "stopped"),
            WorkerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Everything one worker run needs
pub(crate) struct QueueWorker {
    pub(crate) receiver: Arc<Mutex<mpsc::UnboundedReceiver<AccessEvent>>>,
    pub(crate) pending: Arc<AtomicUsize>,
    pub(crate) processor: BatchProcessor,
    pub(crate) recovery: Arc<RecoveryManager>,
    pub(crate) state: Arc<watch::Sender<WorkerState>>,
    pub(crate) batch_size: usize,
    pub(crate) retry_interval: Duration,
}

impl QueueWorker {
    /// Run until stopped, or until the store turns out to be unreachable
    pub(crate) async fn run(self, mut stop: watch::Receiver<bool>) {
        // A previous worker may still be finishing its last batch
        let mut receiver = self.receiver.lock().await;

        self.state.send_replace(WorkerState::Connecting);
        info!("Connecting access log worker to store");
        if let Err(e) = self.processor.pool().acquire().await {
            error!(error = %e, "Unable to connect to store; access log worker terminated");
            self.state.send_replace(WorkerState::Terminated);
            return;
        }

        self.state.send_replace(WorkerState::Running);
        info!(
            batch_size = self.batch_size,
            retry_interval_ms = self.retry_interval.as_millis() as u64,
            "Access log worker running"
        );

        let mut timer = interval(self.retry_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut batch = Vec::with_capacity(self.batch_size);

        loop {
            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow_and_update() {
                        break;
                    }
                    continue;
                }

                received = receiver.recv_many(&mut batch, self.batch_size) => {
                    if received == 0 {
                        // Every sender is gone
                        break;
                    }
                    self.pending.fetch_sub(received, Ordering::SeqCst);
                    self.drain(std::mem::take(&mut batch)).await;
                }

                _ = timer.tick() => {}
            }

            self.retry_overflow().await;
        }

        // A restart may already have claimed the state for its own worker
        self.state.send_if_modified(|state| {
            let running = *state == WorkerState::Running;
            if running {
                *state = WorkerState::Stopped;
            }
            running
        });
        info!(
            queued = self.pending.load(Ordering::SeqCst),
            "Access log worker stopped"
        );
    }

    /// Commit one batch, or divert it to the overflow log
    async fn drain(&self, batch: Vec<AccessEvent>) {
        debug!(events = batch.len(), "Processing access batch");
        match self.processor.process(&batch).await {
            Ok(report) => {
                debug!(
                    events = report.events,
                    decrements_skipped = report.decrements_skipped,
                    "Access batch committed"
                );
            }
            Err(e) => {
                warn!(events = batch.len(), error = %e, "Access batch failed");
                if let Err(overflow_error) = self.recovery.divert(&e, batch).await {
                    error!(error = %overflow_error, "Failed batch could not be diverted");
                }
            }
        }
    }

    async fn retry_overflow(&self) {
        match self.recovery.retry_canonical().await {
            Ok(report) if !report.is_success() => {
                debug!(
                    processed = report.chunks_processed,
                    remaining = report.chunks_remaining(),
                    "Overflow log not fully drained"
                );
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Overflow retry pass failed"),
        }
    }
}
