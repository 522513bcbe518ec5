//! Shared test fixtures: a temp-file store and an in-memory remote backend.

use crate::error::{OfflineError, OfflineResult};
use crate::local_store::{LocalStore, LocalStoreConfig};
use crate::remote::{RemoteBackend, RemoteQuery};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;

pub(crate) async fn test_store() -> (Arc<LocalStore>, NamedTempFile) {
    let file = NamedTempFile::new().unwrap();
    let config = LocalStoreConfig {
        db_path: file.path().to_str().unwrap().to_string(),
        audit: None,
        ..Default::default()
    };
    let store = LocalStore::open(config).await.unwrap();
    (Arc::new(store), file)
}

pub(crate) async fn test_pool() -> (sqlx::sqlite::SqlitePool, NamedTempFile) {
    let (store, file) = test_store().await;
    (store.pool().clone(), file)
}

/// In-memory [`RemoteBackend`] with failure injection, per-call delay and an
/// apply log for ordering assertions.
#[derive(Default)]
pub(crate) struct MockRemote {
    tables: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    fail_all: AtomicBool,
    fail_tables: Mutex<HashSet<String>>,
    delay_ms: AtomicU64,
    calls: AtomicUsize,
    applied: Mutex<Vec<String>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, table: &str, id: &str, record: Value) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), record);
    }

    pub fn record(&self, table: &str, id: &str) -> Option<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    pub fn table_len(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn fail_table(&self, table: &str) {
        self.fail_tables.lock().unwrap().insert(table.to_string());
    }

    pub fn set_delay_ms(&self, delay: u64) {
        self.delay_ms.store(delay, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Write operations in arrival order, as `op:table/id` strings.
    pub fn applied_ops(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    async fn before_call(&self, table: &str) -> OfflineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_all.load(Ordering::SeqCst)
            || self.fail_tables.lock().unwrap().contains(table)
        {
            return Err(OfflineError::Remote(
                "simulated network failure".to_string(),
            ));
        }
        Ok(())
    }

    fn matches(row: &Value, column: &str, expected: &str) -> bool {
        match row.get(column) {
            Some(Value::String(s)) => s == expected,
            Some(other) => other.to_string() == expected,
            None => false,
        }
    }
}

#[async_trait]
impl RemoteBackend for MockRemote {
    async fn select(&self, table: &str, query: &RemoteQuery) -> OfflineResult<Vec<Value>> {
        self.before_call(table).await?;

        let mut rows: Vec<Value> = self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();

        rows.retain(|row| {
            query
                .filters
                .iter()
                .all(|(column, value)| Self::matches(row, column, value))
        });

        if let Some(column) = &query.order_by {
            rows.sort_by(|a, b| {
                match (a[column.as_str()].as_i64(), b[column.as_str()].as_i64()) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    _ => a[column.as_str()]
                        .to_string()
                        .cmp(&b[column.as_str()].to_string()),
                }
            });
            if query.descending {
                rows.reverse();
            }
        }

        if let Some(limit) = query.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn fetch_by_id(&self, table: &str, id: &str) -> OfflineResult<Option<Value>> {
        self.before_call(table).await?;
        Ok(self.record(table, id))
    }

    async fn insert(&self, table: &str, record: &Value) -> OfflineResult<()> {
        self.before_call(table).await?;
        let id = record
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OfflineError::InvalidOperation("record has no id".to_string()))?
            .to_string();
        self.applied
            .lock()
            .unwrap()
            .push(format!("insert:{}/{}", table, id));
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(id, record.clone());
        Ok(())
    }

    async fn update(&self, table: &str, id: &str, record: &Value) -> OfflineResult<()> {
        self.before_call(table).await?;
        self.applied
            .lock()
            .unwrap()
            .push(format!("update:{}/{}", table, id));
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> OfflineResult<()> {
        self.before_call(table).await?;
        self.applied
            .lock()
            .unwrap()
            .push(format!("delete:{}/{}", table, id));
        if let Some(rows) = self.tables.lock().unwrap().get_mut(table) {
            rows.remove(id);
        }
        Ok(())
    }
}
