//! In-memory transactional store
//!
//! Writes are staged per connection and applied under a single lock at
//! commit, so a batch is either fully visible or not visible at all. Faults
//! can be switched on to simulate an outage.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use super::{ConnectionPool, StoreConnection, StoreError, StoreResult};

/// A committed entitlement log row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementLogRow {
    pub occurred_at_millis: i64,
    pub user_id: i32,
    pub entitlement_id: i64,
    pub product_id: i32,
    pub data: String,
}

/// A committed access (source address) log row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessLogRow {
    pub source_address: String,
    pub user_id: i32,
    pub occurred_at_millis: i64,
}

/// Row counts and transaction counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStoreStats {
    pub entitlement_log_rows: usize,
    pub access_log_rows: usize,
    pub connections: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Clone, Copy)]
struct Entitlement {
    user_id: i32,
    units: u32,
}

#[derive(Debug, Default)]
struct Tables {
    entitlement_log: Vec<EntitlementLogRow>,
    access_log: Vec<AccessLogRow>,
    entitlements: HashMap<i64, Entitlement>,
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    refuse_connections: bool,
    failing_entitlements: HashSet<i64>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    connections: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// Cloneable handle to one in-memory database
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entitlement owned by `user_id` with `units` remaining
    pub fn with_entitlement(self, entitlement_id: i64, user_id: i32, units: u32) -> Self {
        self.add_entitlement(entitlement_id, user_id, units);
        self
    }

    pub fn add_entitlement(&self, entitlement_id: i64, user_id: i32, units: u32) {
        self.shared
            .tables
            .lock()
            .entitlements
            .insert(entitlement_id, Entitlement { user_id, units });
    }

    /// Remaining units, if the entitlement exists
    pub fn units(&self, entitlement_id: i64) -> Option<u32> {
        self.shared
            .tables
            .lock()
            .entitlements
            .get(&entitlement_id)
            .map(|e| e.units)
    }

    /// Make every statement and commit fail
    pub fn set_offline(&self, offline: bool) {
        self.shared.faults.lock().offline = offline;
    }

    /// Make `acquire` fail
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.shared.faults.lock().refuse_connections = refuse;
    }

    /// Make entitlement log inserts for one entitlement fail
    pub fn fail_entitlement(&self, entitlement_id: i64) {
        self.shared
            .faults
            .lock()
            .failing_entitlements
            .insert(entitlement_id);
    }

    pub fn heal_entitlement(&self, entitlement_id: i64) {
        self.shared
            .faults
            .lock()
            .failing_entitlements
            .remove(&entitlement_id);
    }

    pub fn entitlement_log(&self) -> Vec<EntitlementLogRow> {
        self.shared.tables.lock().entitlement_log.clone()
    }

    pub fn access_log(&self) -> Vec<AccessLogRow> {
        self.shared.tables.lock().access_log.clone()
    }

    pub fn stats(&self) -> MemoryStoreStats {
        let tables = self.shared.tables.lock();
        MemoryStoreStats {
            entitlement_log_rows: tables.entitlement_log.len(),
            access_log_rows: tables.access_log.len(),
            connections: self.shared.connections.load(Ordering::SeqCst),
            commits: self.shared.commits.load(Ordering::SeqCst),
            rollbacks: self.shared.rollbacks.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl ConnectionPool for MemoryStore {
    async fn acquire(&self) -> StoreResult<Box<dyn StoreConnection>> {
        if self.shared.faults.lock().refuse_connections {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.shared.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            tx: None,
        }))
    }
}

#[derive(Debug, Default)]
struct Staged {
    entitlement_log: Vec<EntitlementLogRow>,
    access_log: Vec<AccessLogRow>,
    decrements: Vec<(i64, i32)>,
}

struct MemoryConnection {
    shared: Arc<Shared>,
    tx: Option<Staged>,
}

impl MemoryConnection {
    fn check_online(&self) -> StoreResult<()> {
        if self.shared.faults.lock().offline {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }

    fn staged(&mut self) -> StoreResult<&mut Staged> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Transaction("no open transaction".to_string()))
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn begin(&mut self) -> StoreResult<()> {
        if self.tx.is_some() {
            return Err(StoreError::Transaction(
                "transaction already open".to_string(),
            ));
        }
        self.tx = Some(Staged::default());
        Ok(())
    }

    async fn insert_entitlement_log(
        &mut self,
        occurred_at_millis: i64,
        user_id: i32,
        entitlement_id: i64,
        product_id: i32,
        attributes_csv: &str,
    ) -> StoreResult<()> {
        self.check_online()?;
        if self
            .shared
            .faults
            .lock()
            .failing_entitlements
            .contains(&entitlement_id)
        {
            return Err(StoreError::Query(format!(
                "entitlement log insert rejected for entitlement {}",
                entitlement_id
            )));
        }
        self.staged()?.entitlement_log.push(EntitlementLogRow {
            occurred_at_millis,
            user_id,
            entitlement_id,
            product_id,
            data: attributes_csv.to_string(),
        });
        Ok(())
    }

    async fn insert_access_log(
        &mut self,
        source_address: &str,
        user_id: i32,
        occurred_at_millis: i64,
    ) -> StoreResult<()> {
        self.check_online()?;
        self.staged()?.access_log.push(AccessLogRow {
            source_address: source_address.to_string(),
            user_id,
            occurred_at_millis,
        });
        Ok(())
    }

    async fn decrement_entitlement_if_available(
        &mut self,
        entitlement_id: i64,
        user_id: i32,
    ) -> StoreResult<bool> {
        self.check_online()?;
        let available = {
            let tables = self.shared.tables.lock();
            tables.entitlements.get(&entitlement_id).copied()
        };
        let staged = self.staged()?;
        let pending = staged
            .decrements
            .iter()
            .filter(|(id, _)| *id == entitlement_id)
            .count();

        match available {
            Some(e) if e.user_id == user_id && e.units as usize > pending => {
                staged.decrements.push((entitlement_id, user_id));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.check_online()?;
        let staged = self
            .tx
            .take()
            .ok_or_else(|| StoreError::Transaction("no open transaction".to_string()))?;

        let mut tables = self.shared.tables.lock();
        tables.entitlement_log.extend(staged.entitlement_log);
        tables.access_log.extend(staged.access_log);
        for (entitlement_id, user_id) in staged.decrements {
            if let Some(e) = tables.entitlements.get_mut(&entitlement_id) {
                if e.user_id == user_id && e.units > 0 {
                    e.units -= 1;
                }
            }
        }
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.tx = None;
        self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
