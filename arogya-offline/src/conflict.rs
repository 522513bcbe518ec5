//! Write-write conflict handling
//!
//! A conflict is a remote record that already exists where a queued local
//! mutation expected to apply. It is a first-class outcome, not an error;
//! resolution follows the configured strategy.

use crate::error::{OfflineError, OfflineResult};
use crate::local_store::Collection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata key prefix under which unresolved conflicts are parked.
pub const CONFLICT_KEY_PREFIX: &str = "conflict_";

/// Strategy for resolving a write-write conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Remote record is overwritten wholesale with the local payload
    ClientWins,
    /// Local mutation is discarded; no remote write occurs
    ServerWins,
    /// Field-by-field merge of the local payload over the remote record
    Merge,
    /// Both versions are parked for human review. Recording the conflict is
    /// the terminal outcome for the queued mutation: it will not be retried
    /// automatically, and the local record stays unsynced until
    /// `resolve_conflict` applies a resolution.
    Manual,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::Merge
    }
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> OfflineResult<Self> {
        match s {
            "client_wins" => Ok(ConflictStrategy::ClientWins),
            "server_wins" => Ok(ConflictStrategy::ServerWins),
            "merge" => Ok(ConflictStrategy::Merge),
            "manual" => Ok(ConflictStrategy::Manual),
            _ => Err(OfflineError::InvalidOperation(format!(
                "Unknown conflict strategy: {}",
                s
            ))),
        }
    }
}

/// A conflict awaiting (or retaining the history of) manual resolution,
/// persisted as a metadata entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredConflict {
    pub table: Collection,
    pub record_id: String,
    /// The queued local payload that could not be applied
    pub local: Value,
    /// The remote record as found at detection time
    pub remote: Value,
    pub detected_at: i64,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
}

impl StoredConflict {
    /// `conflict_{table}_{record_id}_{detected_at}`
    pub fn metadata_key(&self) -> String {
        format!(
            "{}{}_{}_{}",
            CONFLICT_KEY_PREFIX,
            self.table.as_str(),
            self.record_id,
            self.detected_at
        )
    }
}

/// Merge a local payload over a remote record.
///
/// Starts from the remote record and overlays every local field except `id`
/// and `created_at`. A field that is an object on both sides is shallow-merged
/// key by key (local winning on collisions) instead of replaced wholesale.
pub fn merge_records(remote: &Value, local: &Value) -> Value {
    let (Some(remote_obj), Some(local_obj)) = (remote.as_object(), local.as_object()) else {
        // Payloads are records; a non-object side means the local mutation
        // carries the whole truth.
        return local.clone();
    };

    let mut merged = remote_obj.clone();
    for (key, local_value) in local_obj {
        if key == "id" || key == "created_at" {
            continue;
        }
        match (merged.get_mut(key), local_value.as_object()) {
            (Some(Value::Object(existing)), Some(local_nested)) => {
                for (nested_key, nested_value) in local_nested {
                    existing.insert(nested_key.clone(), nested_value.clone());
                }
            }
            _ => {
                merged.insert(key.clone(), local_value.clone());
            }
        }
    }
    Value::Object(merged)
}
