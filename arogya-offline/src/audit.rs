//! Audit trail for sync operations
//!
//! Append-only log of every queued mutation, sync cycle and conflict event,
//! chained with SHA-256 hashes so tampering with a past entry is detectable.
//! Entries are never updated or deleted; `verify_chain` recomputes the chain
//! end to end.

use crate::error::{OfflineError, OfflineResult};
use crate::local_store::now_ms;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use uuid::Uuid;

/// Audit event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A create mutation was queued
    Create,
    /// An update mutation was queued
    Update,
    /// A delete mutation was queued
    Delete,
    /// Sync cycle started
    SyncStart,
    /// Sync cycle completed
    SyncComplete,
    /// A write-write conflict was parked for manual review
    ConflictDetected,
    /// A parked conflict was resolved
    ConflictResolved,
    /// The local store was dropped and recreated
    StoreReset,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::SyncStart => "sync_start",
            AuditAction::SyncComplete => "sync_complete",
            AuditAction::ConflictDetected => "conflict_detected",
            AuditAction::ConflictResolved => "conflict_resolved",
            AuditAction::StoreReset => "store_reset",
        }
    }
}

/// Audit configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Actor recorded on each entry (user id or device label)
    pub actor: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            actor: "system".to_string(),
        }
    }
}

/// One audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: i64,
    pub action: String,
    pub actor: String,
    pub resource: String,
    pub detail: serde_json::Value,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// Append-only, hash-chained audit logger sharing the store's pool.
pub struct AuditLogger {
    pool: SqlitePool,
    config: AuditConfig,
}

fn chain_hash(prev_hash: &str, timestamp: i64, action: &str, resource: &str, detail: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update(action.as_bytes());
    hasher.update(resource.as_bytes());
    hasher.update(detail.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

impl AuditLogger {
    pub async fn new(pool: SqlitePool, config: AuditConfig) -> OfflineResult<Self> {
        Self::ensure_table(&pool).await?;
        Ok(Self { pool, config })
    }

    pub(crate) async fn ensure_table(pool: &SqlitePool) -> OfflineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                action TEXT NOT NULL,
                actor TEXT NOT NULL,
                resource TEXT NOT NULL,
                detail TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                entry_hash TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn last_hash(&self) -> OfflineResult<String> {
        let row = sqlx::query("SELECT entry_hash FROM audit_log ORDER BY rowid DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("entry_hash")?,
            None => String::new(),
        })
    }

    /// Append one entry, linking it to the previous one.
    pub async fn log(
        &mut self,
        action: AuditAction,
        resource: &str,
        detail: serde_json::Value,
    ) -> OfflineResult<()> {
        let prev_hash = self.last_hash().await?;
        let timestamp = now_ms();
        let detail_text = detail.to_string();
        let entry_hash = chain_hash(&prev_hash, timestamp, action.as_str(), resource, &detail_text);

        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, timestamp, action, actor, resource, detail, prev_hash, entry_hash
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(timestamp)
        .bind(action.as_str())
        .bind(&self.config.actor)
        .bind(resource)
        .bind(detail_text)
        .bind(&prev_hash)
        .bind(&entry_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, limit: i64) -> OfflineResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, action, actor, resource, detail, prev_hash, entry_hash
            FROM audit_log
            ORDER BY rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let detail: String = row.try_get("detail")?;
            entries.push(AuditEntry {
                id: row.try_get("id")?,
                timestamp: row.try_get("timestamp")?,
                action: row.try_get("action")?,
                actor: row.try_get("actor")?,
                resource: row.try_get("resource")?,
                detail: serde_json::from_str(&detail)?,
                prev_hash: row.try_get("prev_hash")?,
                entry_hash: row.try_get("entry_hash")?,
            });
        }
        Ok(entries)
    }

    /// Recompute the hash chain from the first entry. Returns an error naming
    /// the first entry whose stored hash does not match.
    pub async fn verify_chain(&self) -> OfflineResult<()> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, action, resource, detail, prev_hash, entry_hash
            FROM audit_log
            ORDER BY rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut expected_prev = String::new();
        for row in rows {
            let id: String = row.try_get("id")?;
            let timestamp: i64 = row.try_get("timestamp")?;
            let action: String = row.try_get("action")?;
            let resource: String = row.try_get("resource")?;
            let detail: String = row.try_get("detail")?;
            let prev_hash: String = row.try_get("prev_hash")?;
            let entry_hash: String = row.try_get("entry_hash")?;

            if prev_hash != expected_prev {
                return Err(OfflineError::Internal(format!(
                    "audit chain broken before entry {}",
                    id
                )));
            }
            let recomputed = chain_hash(&prev_hash, timestamp, &action, &resource, &detail);
            if recomputed != entry_hash {
                return Err(OfflineError::Internal(format!(
                    "audit entry {} has been altered",
                    id
                )));
            }
            expected_prev = entry_hash;
        }
        Ok(())
    }
}
