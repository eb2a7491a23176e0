//! Storage collaborator
//!
//! The relational store itself lives outside this crate. The queue only
//! needs a pool that hands out connections, and connections that can run
//! one transaction of three statement kinds:
//!
//! - `insert_entitlement_log` - one row per access in the entitlement log
//! - `insert_access_log` - one row per access in the source-address log
//! - `decrement_entitlement_if_available` - guarded `units - 1`
//!
//! Transaction boundaries (`begin`/`commit`/`rollback`) are driven by
//! [`BatchProcessor`](crate::processor::BatchProcessor).
//!
//! [`MemoryStore`] is a complete in-memory implementation used by the tests
//! and the demo binary.

mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{AccessLogRow, EntitlementLogRow, MemoryStore, MemoryStoreStats};

/// Errors raised by the storage collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No connection could be obtained or the backend is down
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A statement failed
    #[error("query failed: {0}")]
    Query(String),

    /// begin/commit/rollback failed or was called out of order
    #[error("transaction error: {0}")]
    Transaction(String),
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Hands out connections, one per processing attempt
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn acquire(&self) -> StoreResult<Box<dyn StoreConnection>>;
}

/// One connection to the store, able to run a single open transaction
#[async_trait]
pub trait StoreConnection: Send {
    async fn begin(&mut self) -> StoreResult<()>;

    async fn insert_entitlement_log(
        &mut self,
        occurred_at_millis: i64,
        user_id: i32,
        entitlement_id: i64,
        product_id: i32,
        attributes_csv: &str,
    ) -> StoreResult<()>;

    async fn insert_access_log(
        &mut self,
        source_address: &str,
        user_id: i32,
        occurred_at_millis: i64,
    ) -> StoreResult<()>;

    /// Decrement remaining units when `units > 0` and the user matches.
    ///
    /// Returns `false` when no row qualified.
    async fn decrement_entitlement_if_available(
        &mut self,
        entitlement_id: i64,
        user_id: i32,
    ) -> StoreResult<bool>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}
