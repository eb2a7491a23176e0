//! Access Ledger
//!
//! A durable write-behind queue for entitlement access events. Callers
//! enqueue events without waiting on storage; a background worker commits
//! them in batches. Batches that cannot be committed are kept in an
//! on-disk overflow log and replayed once the store is back.
//!
//! # Features
//!
//! - **Non-blocking enqueue**: producers never wait on storage
//! - **Batched transactions**: up to `batch_size` events per commit
//! - **Overflow log**: failed batches survive restarts and are retried in order
//! - **Alert rate-limiting**: one alert per outage, re-armed on full recovery
//!
//! # Modules
//!
//! - `types`: The access event and its line encoding
//! - `overflow`: Overflow chunk codec, log file and recovery manager
//! - `processor`: Commits one batch in one transaction
//! - `queue`: The event queue and its worker
//! - `store`: Storage collaborator traits and an in-memory store
//! - `notify`: Alert delivery and the alert gate
//! - `config`: Queue configuration
//! - `utils`: Atomic file writes and timestamps
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use access_ledger::{AccessEvent, AccessLogQueue, LogNotifier, MemoryStore, QueueConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new().with_entitlement(5, 7, 10);
//!     let queue = AccessLogQueue::new(
//!         QueueConfig::from_env(),
//!         Arc::new(store),
//!         Arc::new(LogNotifier),
//!     );
//!     queue.start_worker();
//!     queue
//!         .enqueue(AccessEvent::new(5, 10, 7, "1.2.3.4").with_attribute("a", "1"))
//!         .unwrap();
//!     queue.shutdown().await;
//! }
//! ```

pub mod config;
pub mod notify;
pub mod overflow;
pub mod processor;
pub mod queue;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used items at crate root
pub use config::{ConfigError, QueueConfig};
pub use notify::{Alert, AlertGate, LogNotifier, Notifier, RecordingNotifier};
pub use overflow::{
    OverflowChunk, OverflowError, OverflowLog, RecoveryManager, RecoveryReport, RecoverySource,
};
pub use processor::{BatchProcessor, BatchReport};
pub use queue::{AccessLogQueue, QueueError, QueueResult, WorkerState};
pub use store::{ConnectionPool, MemoryStore, StoreConnection, StoreError, StoreResult};
pub use types::{AccessEvent, EventCodecError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
