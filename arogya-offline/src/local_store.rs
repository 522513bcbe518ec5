//! Local SQLite store for offline-first operations
//!
//! Provides:
//! - Durable persistence of domain records (patients, consultations,
//!   prescriptions) with the secondary indexes the cache and sync layers need
//! - The mutation outbox (sync queue)
//! - A small key/value metadata table (last-sync marker, parked conflicts)

use crate::audit::{AuditAction, AuditConfig, AuditLogger};
use crate::error::{OfflineError, OfflineResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;

/// Bumped only on incompatible schema changes. Re-opening a database at the
/// current version never touches existing rows.
const SCHEMA_VERSION: i64 = 1;

/// Millisecond wall clock.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Millisecond wall clock, forced strictly monotonic across calls so queue
/// item ids stay unique and FIFO order holds for calls within the same
/// millisecond.
pub(crate) fn next_timestamp() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = now_ms();
    let mut prev = LAST.load(Ordering::SeqCst);
    loop {
        let candidate = if now > prev { now } else { prev + 1 };
        match LAST.compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return candidate,
            Err(observed) => prev = observed,
        }
    }
}

/// Record collections held in the local store. The sync queue and metadata
/// tables complete the five persisted collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Patients,
    Consultations,
    Prescriptions,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Patients,
        Collection::Consultations,
        Collection::Prescriptions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Patients => "patients",
            Collection::Consultations => "consultations",
            Collection::Prescriptions => "prescriptions",
        }
    }

    pub fn from_str(s: &str) -> OfflineResult<Self> {
        match s {
            "patients" => Ok(Collection::Patients),
            "consultations" => Ok(Collection::Consultations),
            "prescriptions" => Ok(Collection::Prescriptions),
            _ => Err(OfflineError::InvalidOperation(format!(
                "Unknown collection: {}",
                s
            ))),
        }
    }

    /// Collections owned by a patient record.
    pub fn patient_scoped(&self) -> bool {
        matches!(self, Collection::Consultations | Collection::Prescriptions)
    }

    /// Collections whose records can be in-progress drafts.
    pub fn supports_drafts(&self) -> bool {
        self.patient_scoped()
    }
}

/// Closed set of secondary lookups. Each variant maps to a real SQLite index,
/// so a lookup that cannot exist is a compile-time (or at worst a checked
/// runtime) error instead of a silent empty result.
#[derive(Debug, Clone)]
pub enum RecordIndex {
    ByPatient(String),
    BySynced(bool),
    ByDraft(bool),
}

/// Operation type in the sync queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> OfflineResult<Self> {
        match s {
            "insert" => Ok(OperationType::Insert),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            _ => Err(OfflineError::InvalidOperation(format!(
                "Unknown operation type: {}",
                s
            ))),
        }
    }
}

/// Wrapper persisted for every domain record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Unique within its collection; never changes across the record's life.
    pub id: String,

    /// The domain payload, opaque to this layer beyond the indexed fields.
    pub data: serde_json::Value,

    /// Last local write, ms since epoch.
    pub updated_at: i64,

    /// False until the sync engine confirms the latest local state was
    /// applied to the remote backend.
    pub synced: bool,

    /// Owning patient id, for patient-scoped collections.
    pub patient_id: Option<String>,

    /// Draft flag, for draft-capable collections. Drafts are exempt from
    /// cache eviction.
    pub is_draft: Option<bool>,
}

/// One pending mutation awaiting propagation to the remote backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// `{table}_{record_id}_{timestamp}`
    pub id: String,

    pub table: Collection,

    pub operation: OperationType,

    /// Full record for insert/update; last-known payload for delete.
    pub data: serde_json::Value,

    /// Creation time, the FIFO tiebreak within a priority band.
    pub timestamp: i64,

    pub retry_count: i32,

    /// Higher values drain first.
    pub priority: i32,

    /// Last failure message, set only after a failed apply attempt.
    pub error: Option<String>,
}

impl SyncQueueItem {
    pub fn new(
        table: Collection,
        record_id: &str,
        operation: OperationType,
        data: serde_json::Value,
        priority: i32,
    ) -> Self {
        let timestamp = next_timestamp();
        Self {
            id: format!("{}_{}_{}", table.as_str(), record_id, timestamp),
            table,
            operation,
            data,
            timestamp,
            retry_count: 0,
            priority,
            error: None,
        }
    }
}

/// Generic key/value metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: i64,
}

/// Configuration for the local store
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// Path to the database file
    pub db_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Audit configuration; `None` disables the audit trail
    pub audit: Option<AuditConfig>,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            db_path: "arogya_offline.db".to_string(),
            max_connections: 5,
            enable_wal: true,
            audit: Some(AuditConfig::default()),
        }
    }
}

/// Local database handle
pub struct LocalStore {
    pool: SqlitePool,
    audit: Option<Mutex<AuditLogger>>,
}

const RECORD_COLUMNS: &str = "id, data, updated_at, synced, patient_id, is_draft";

impl LocalStore {
    /// Open (creating if necessary) the local store.
    pub async fn open(config: LocalStoreConfig) -> OfflineResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| OfflineError::StorageUnavailable(e.to_string()))?;

        if config.enable_wal {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&pool)
                .await?;
        }

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        let row = sqlx::query("PRAGMA user_version").fetch_one(&pool).await?;
        let version: i64 = row.try_get(0)?;
        if version > SCHEMA_VERSION {
            return Err(OfflineError::StorageUnavailable(format!(
                "local database schema v{} is newer than supported v{}",
                version, SCHEMA_VERSION
            )));
        }

        Self::initialize_schema(&pool).await?;

        if version < SCHEMA_VERSION {
            sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
                .execute(&pool)
                .await?;
        }

        let audit = match config.audit {
            Some(audit_config) => Some(Mutex::new(
                AuditLogger::new(pool.clone(), audit_config).await?,
            )),
            None => None,
        };

        tracing::debug!(db_path = %config.db_path, "opened local store");

        Ok(Self { pool, audit })
    }

    /// Capability probe: can a store be opened with this configuration?
    /// Never panics; callers use a `false` result to degrade to online-only
    /// mode.
    pub async fn probe(config: &LocalStoreConfig) -> bool {
        match Self::open(config.clone()).await {
            Ok(store) => {
                store.close().await;
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "local store probe failed");
                false
            }
        }
    }

    async fn initialize_schema(pool: &SqlitePool) -> OfflineResult<()> {
        for collection in Collection::ALL {
            let table = collection.as_str();
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    data TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    synced INTEGER NOT NULL DEFAULT 0,
                    patient_id TEXT,
                    is_draft INTEGER
                )
                "#
            ))
            .execute(pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_synced ON {table}(synced)"
            ))
            .execute(pool)
            .await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_updated ON {table}(updated_at)"
            ))
            .execute(pool)
            .await?;

            if collection.patient_scoped() {
                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_patient ON {table}(patient_id)"
                ))
                .execute(pool)
                .await?;
                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_draft ON {table}(is_draft)"
                ))
                .execute(pool)
                .await?;
            }
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                operation TEXT NOT NULL,
                data TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 0,
                error TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_queue_table ON sync_queue(table_name)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_queue_timestamp ON sync_queue(timestamp)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_queue_priority ON sync_queue(priority)")
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    pub(crate) async fn audit_log(
        &self,
        action: AuditAction,
        resource: &str,
        detail: serde_json::Value,
    ) -> OfflineResult<()> {
        if let Some(ref logger) = self.audit {
            let mut guard = logger.lock().await;
            guard.log(action, resource, detail).await?;
        }
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> OfflineResult<StoredRecord> {
        let data: String = row.try_get("data")?;
        let is_draft: Option<i64> = row.try_get("is_draft")?;
        Ok(StoredRecord {
            id: row.try_get("id")?,
            data: serde_json::from_str(&data)?,
            updated_at: row.try_get("updated_at")?,
            synced: row.try_get::<i64, _>("synced")? != 0,
            patient_id: row.try_get("patient_id")?,
            is_draft: is_draft.map(|v| v != 0),
        })
    }

    /// Fetch one record by id; absent is not an error.
    pub async fn get(
        &self,
        collection: Collection,
        id: &str,
    ) -> OfflineResult<Option<StoredRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE id = ?",
            collection.as_str()
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    pub async fn get_all(&self, collection: Collection) -> OfflineResult<Vec<StoredRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} ORDER BY updated_at DESC",
            collection.as_str()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    /// Fetch records matching one secondary index value.
    pub async fn get_by_index(
        &self,
        collection: Collection,
        index: &RecordIndex,
    ) -> OfflineResult<Vec<StoredRecord>> {
        let table = collection.as_str();
        let rows = match index {
            RecordIndex::ByPatient(patient_id) => {
                if !collection.patient_scoped() {
                    return Err(OfflineError::InvalidOperation(format!(
                        "{} records are not patient-scoped",
                        table
                    )));
                }
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM {table} WHERE patient_id = ? ORDER BY updated_at DESC"
                );
                sqlx::query(&sql)
                    .bind(patient_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            RecordIndex::BySynced(synced) => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM {table} WHERE synced = ? ORDER BY updated_at DESC"
                );
                sqlx::query(&sql)
                    .bind(*synced as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            RecordIndex::ByDraft(is_draft) => {
                if !collection.supports_drafts() {
                    return Err(OfflineError::InvalidOperation(format!(
                        "{} records have no draft flag",
                        table
                    )));
                }
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM {table} WHERE is_draft = ? ORDER BY updated_at DESC"
                );
                sqlx::query(&sql)
                    .bind(*is_draft as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_record).collect()
    }

    /// Upsert one record.
    pub async fn put(&self, collection: Collection, record: &StoredRecord) -> OfflineResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, data, updated_at, synced, patient_id, is_draft)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at,
                synced = excluded.synced,
                patient_id = excluded.patient_id,
                is_draft = excluded.is_draft
            "#,
            collection.as_str()
        );
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(record.data.to_string())
            .bind(record.updated_at)
            .bind(record.synced as i64)
            .bind(record.patient_id.as_deref())
            .bind(record.is_draft.map(|v| v as i64))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove one record. Returns whether a row existed.
    pub async fn delete(&self, collection: Collection, id: &str) -> OfflineResult<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?", collection.as_str());
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self, collection: Collection) -> OfflineResult<i64> {
        let sql = format!("SELECT COUNT(*) AS count FROM {}", collection.as_str());
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("count")?)
    }

    /// Flip a record's synced flag to true, preserving everything else.
    /// Idempotent; a missing id is a no-op.
    pub async fn mark_synced(&self, collection: Collection, id: &str) -> OfflineResult<()> {
        let sql = format!("UPDATE {} SET synced = 1 WHERE id = ?", collection.as_str());
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Delete synced, non-draft records strictly older than `cutoff`.
    /// Unsynced and draft rows are never touched regardless of age.
    pub async fn evict_expired(&self, collection: Collection, cutoff: i64) -> OfflineResult<u64> {
        let sql = format!(
            r#"
            DELETE FROM {}
            WHERE synced = 1
              AND (is_draft IS NULL OR is_draft = 0)
              AND updated_at < ?
            "#,
            collection.as_str()
        );
        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Append one mutation to the outbox.
    pub async fn enqueue(&self, item: &SyncQueueItem) -> OfflineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                id, table_name, operation, data,
                timestamp, retry_count, priority, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(item.table.as_str())
        .bind(item.operation.as_str())
        .bind(item.data.to_string())
        .bind(item.timestamp)
        .bind(item.retry_count)
        .bind(item.priority)
        .bind(item.error.as_deref())
        .execute(&self.pool)
        .await?;

        self.audit_log(
            match item.operation {
                OperationType::Insert => AuditAction::Create,
                OperationType::Update => AuditAction::Update,
                OperationType::Delete => AuditAction::Delete,
            },
            &format!("{}/{}", item.table.as_str(), item.id),
            serde_json::json!({ "priority": item.priority }),
        )
        .await?;

        tracing::debug!(
            item_id = %item.id,
            table = item.table.as_str(),
            operation = item.operation.as_str(),
            priority = item.priority,
            "queued mutation for sync"
        );

        Ok(())
    }

    /// Write back a queue item after a failed apply attempt.
    pub async fn put_queue_item(&self, item: &SyncQueueItem) -> OfflineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                id, table_name, operation, data,
                timestamp, retry_count, priority, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                timestamp = excluded.timestamp,
                retry_count = excluded.retry_count,
                priority = excluded.priority,
                error = excluded.error
            "#,
        )
        .bind(&item.id)
        .bind(item.table.as_str())
        .bind(item.operation.as_str())
        .bind(item.data.to_string())
        .bind(item.timestamp)
        .bind(item.retry_count)
        .bind(item.priority)
        .bind(item.error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_queue_item(&self, id: &str) -> OfflineResult<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The full outbox, ordered for draining: priority descending, then
    /// timestamp ascending (oldest first within a priority band).
    pub async fn queue_all(&self) -> OfflineResult<Vec<SyncQueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, table_name, operation, data,
                   timestamp, retry_count, priority, error
            FROM sync_queue
            ORDER BY priority DESC, timestamp ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let table: String = row.try_get("table_name")?;
            let operation: String = row.try_get("operation")?;
            let data: String = row.try_get("data")?;
            items.push(SyncQueueItem {
                id: row.try_get("id")?,
                table: Collection::from_str(&table)?,
                operation: OperationType::from_str(&operation)?,
                data: serde_json::from_str(&data)?,
                timestamp: row.try_get("timestamp")?,
                retry_count: row.try_get("retry_count")?,
                priority: row.try_get("priority")?,
                error: row.try_get("error")?,
            });
        }
        Ok(items)
    }

    pub async fn queue_len(&self) -> OfflineResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM sync_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    pub async fn set_metadata(&self, key: &str, value: &serde_json::Value) -> OfflineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_metadata(&self, key: &str) -> OfflineResult<Option<MetadataEntry>> {
        let row = sqlx::query("SELECT key, value, updated_at FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: String = row.try_get("value")?;
                Ok(Some(MetadataEntry {
                    key: row.try_get("key")?,
                    value: serde_json::from_str(&value)?,
                    updated_at: row.try_get("updated_at")?,
                }))
            }
            None => Ok(None),
        }
    }

    /// All metadata entries whose key starts with `prefix` (literal match;
    /// LIKE wildcards in the prefix are escaped).
    pub async fn metadata_with_prefix(&self, prefix: &str) -> OfflineResult<Vec<MetadataEntry>> {
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let rows = sqlx::query(
            "SELECT key, value, updated_at FROM metadata WHERE key LIKE ? ESCAPE '\\' ORDER BY key",
        )
        .bind(format!("{}%", escaped))
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let value: String = row.try_get("value")?;
            entries.push(MetadataEntry {
                key: row.try_get("key")?,
                value: serde_json::from_str(&value)?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(entries)
    }

    /// Drop and recreate every table. Used on logout and for test isolation.
    pub async fn reset(&self) -> OfflineResult<()> {
        for collection in Collection::ALL {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", collection.as_str()))
                .execute(&self.pool)
                .await?;
        }
        sqlx::query("DROP TABLE IF EXISTS sync_queue")
            .execute(&self.pool)
            .await?;
        sqlx::query("DROP TABLE IF EXISTS metadata")
            .execute(&self.pool)
            .await?;
        sqlx::query("DROP TABLE IF EXISTS audit_log")
            .execute(&self.pool)
            .await?;

        Self::initialize_schema(&self.pool).await?;
        if self.audit.is_some() {
            AuditLogger::ensure_table(&self.pool).await?;
        }

        self.audit_log(AuditAction::StoreReset, "store", serde_json::json!({}))
            .await?;

        tracing::info!("local store reset");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
