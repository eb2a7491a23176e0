//! Batch Processor
//!
//! Writes one batch of access events to the store inside a single
//! transaction. For every event, in order:
//!
//! 1. insert an entitlement log row
//! 2. insert an access log row
//! 3. try to decrement the entitlement's remaining units
//!
//! A failed insert rolls the whole transaction back and returns the error;
//! the caller still owns the batch and decides where it goes. A decrement
//! that finds nothing to decrement is counted, not treated as a failure.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::store::{ConnectionPool, StoreConnection, StoreResult};
use crate::types::AccessEvent;

/// Outcome of a committed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub events: usize,
    pub decrements_applied: usize,
    /// Decrements that matched no row or failed
    pub decrements_skipped: usize,
}

/// Runs all-or-nothing batch transactions against a connection pool
#[derive(Clone)]
pub struct BatchProcessor {
    pool: Arc<dyn ConnectionPool>,
}

impl BatchProcessor {
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self { pool }
    }

    /// The pool connections are drawn from
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Acquire a fresh connection and process `batch` on it
    pub async fn process(&self, batch: &[AccessEvent]) -> StoreResult<BatchReport> {
        let mut conn = self.pool.acquire().await?;
        Self::process_with(conn.as_mut(), batch).await
    }

    /// Process `batch` in one transaction on `conn`
    pub async fn process_with(
        conn: &mut dyn StoreConnection,
        batch: &[AccessEvent],
    ) -> StoreResult<BatchReport> {
        conn.begin().await?;

        let result = match Self::write_events(conn, batch).await {
            Ok(report) => conn.commit().await.map(|_| report),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Err(e) = conn.rollback().await {
                warn!(error = %e, "Rollback failed after batch error");
            }
        }
        result
    }

    async fn write_events(
        conn: &mut dyn StoreConnection,
        batch: &[AccessEvent],
    ) -> StoreResult<BatchReport> {
        let mut report = BatchReport {
            events: batch.len(),
            ..Default::default()
        };

        for event in batch {
            conn.insert_entitlement_log(
                event.occurred_at_millis,
                event.user_id,
                event.entitlement_id,
                event.product_id,
                &event.attributes_csv(),
            )
            .await?;
            conn.insert_access_log(&event.source_address, event.user_id, event.occurred_at_millis)
                .await?;

            match conn
                .decrement_entitlement_if_available(event.entitlement_id, event.user_id)
                .await
            {
                Ok(true) => report.decrements_applied += 1,
                Ok(false) => {
                    debug!(
                        entitlement_id = event.entitlement_id,
                        user_id = event.user_id,
                        "No units left to decrement"
                    );
                    report.decrements_skipped += 1;
                }
                Err(e) => {
                    warn!(
                        entitlement_id = event.entitlement_id,
                        user_id = event.user_id,
                        error = %e,
                        "Entitlement decrement failed"
                    );
                    report.decrements_skipped += 1;
                }
            }
        }

        Ok(report)
    }
}
