//! Sync engine
//!
//! Drains the mutation outbox against the remote backend: priority bands
//! first, FIFO within a band, fixed-size batches with progress reporting.
//! Conflicts resolve per the configured strategy; failures defer the item
//! with a retry count and eventual priority demotion so one poisoned
//! mutation cannot starve the queue. Triggered by the online transition, a
//! periodic timer, or an explicit call.

use crate::audit::AuditAction;
use crate::conflict::{merge_records, ConflictStrategy, StoredConflict, CONFLICT_KEY_PREFIX};
use crate::error::{OfflineError, OfflineResult};
use crate::local_store::{
    next_timestamp, now_ms, Collection, LocalStore, OperationType, SyncQueueItem,
};
use crate::network::{ListenerId, NetworkMonitor};
use crate::remote::RemoteBackend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Metadata key holding the last successful sync time (ms since epoch).
pub const LAST_SYNC_KEY: &str = "last_sync_time";

pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;
pub type CompletionCallback = Arc<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&OfflineError) + Send + Sync>;

/// Per-call options for [`SyncEngine::sync`].
#[derive(Clone, Default)]
pub struct SyncOptions {
    /// Start a cycle even while another is running
    pub force: bool,
    /// Override the engine's conflict strategy for this cycle
    pub strategy: Option<ConflictStrategy>,
    /// Restrict the cycle to these collections
    pub tables: Option<Vec<Collection>>,
    /// Override the engine's batch size for this cycle
    pub batch_size: Option<usize>,
    /// Fractional progress (`processed / total`) after each batch
    pub on_progress: Option<ProgressCallback>,
    pub on_complete: Option<CompletionCallback>,
    pub on_error: Option<ErrorCallback>,
}

#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Items per batch between progress reports
    pub batch_size: usize,
    /// Failed attempts before an item's priority is demoted
    pub max_retries: i32,
    /// Period of the background timer trigger
    pub sync_interval: Duration,
    /// Conflict strategy when none is given per call
    pub strategy: ConflictStrategy,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 5,
            sync_interval: Duration::from_secs(300),
            strategy: ConflictStrategy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Last successful cycle, ms since epoch
    pub last_sync: Option<i64>,
    /// Queue items awaiting propagation
    pub pending: i64,
    pub is_syncing: bool,
    pub unresolved_conflicts: usize,
}

/// An unresolved parked conflict together with the metadata key addressing it.
#[derive(Debug, Clone)]
pub struct ConflictEntry {
    pub key: String,
    pub conflict: StoredConflict,
}

enum ApplyOutcome {
    /// The mutation reached the remote backend
    Applied,
    /// Manual strategy: both versions parked, nothing written
    Parked,
    /// Server-wins: the local mutation was dropped, nothing written
    Discarded,
}

struct BackgroundTasks {
    online_listener: ListenerId,
    timer: JoinHandle<()>,
}

pub struct SyncEngine {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteBackend>,
    network: Arc<NetworkMonitor>,
    config: SyncEngineConfig,
    is_syncing: AtomicBool,
    background: Mutex<Option<BackgroundTasks>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteBackend>,
        network: Arc<NetworkMonitor>,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            store,
            remote,
            network,
            config,
            is_syncing: AtomicBool::new(false),
            background: Mutex::new(None),
        }
    }

    /// Wire the became-online trigger and the periodic timer. Idempotent.
    /// Must be called from within a Tokio runtime.
    pub fn initialize(self: &Arc<Self>) {
        let mut background = self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if background.is_some() {
            return;
        }

        let runtime = tokio::runtime::Handle::current();
        let weak = Arc::downgrade(self);
        let online_listener = self.network.on_online(move || {
            let Some(engine) = weak.upgrade() else { return };
            runtime.spawn(async move {
                let _ = engine.sync(SyncOptions::default()).await;
            });
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sync_interval;
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else { break };
                if engine.network.is_online() {
                    let _ = engine.sync(SyncOptions::default()).await;
                }
            }
        });

        *background = Some(BackgroundTasks {
            online_listener,
            timer,
        });
    }

    /// Unregister the triggers wired by [`initialize`](Self::initialize).
    pub fn shutdown(&self) {
        let tasks = self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tasks) = tasks {
            self.network.remove_online_listener(tasks.online_listener);
            tasks.timer.abort();
        }
    }

    /// Run one sync cycle. Returns `Ok(false)` without touching the remote
    /// when offline, or when a cycle is already running and `force` is not
    /// set. Cycle-level errors are funneled through `on_error` rather than
    /// returned: the timer trigger has no caller to catch them.
    pub async fn sync(&self, options: SyncOptions) -> OfflineResult<bool> {
        if !self.network.is_online() {
            tracing::debug!("skipping sync: offline");
            return Ok(false);
        }

        if options.force {
            self.is_syncing.store(true, Ordering::SeqCst);
        } else if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("skipping sync: a cycle is already running");
            return Ok(false);
        }

        let result = self.run_cycle(&options).await;
        // The guard clears on every exit path; a failed cycle must not block
        // the next trigger.
        self.is_syncing.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                if let Some(on_complete) = &options.on_complete {
                    on_complete();
                }
                Ok(true)
            }
            Err(error) => {
                tracing::error!(error = %error, "sync cycle aborted");
                if let Some(on_error) = &options.on_error {
                    on_error(&error);
                }
                Ok(false)
            }
        }
    }

    async fn run_cycle(&self, options: &SyncOptions) -> OfflineResult<()> {
        let strategy = options.strategy.unwrap_or(self.config.strategy);
        let batch_size = options.batch_size.unwrap_or(self.config.batch_size).max(1);

        let mut items = self.store.queue_all().await?;
        if let Some(tables) = &options.tables {
            items.retain(|item| tables.contains(&item.table));
        }
        let total = items.len();

        self.store
            .audit_log(
                AuditAction::SyncStart,
                "sync",
                serde_json::json!({ "pending": total }),
            )
            .await?;
        tracing::info!(total, strategy = strategy.as_str(), "sync cycle started");

        let mut processed = 0usize;
        for batch in items.chunks(batch_size) {
            for item in batch {
                self.apply_item(item, strategy).await?;
                processed += 1;
            }
            if let Some(on_progress) = &options.on_progress {
                on_progress(processed as f32 / total as f32);
            }
        }

        self.store
            .set_metadata(LAST_SYNC_KEY, &serde_json::json!(now_ms()))
            .await?;
        self.store
            .audit_log(
                AuditAction::SyncComplete,
                "sync",
                serde_json::json!({ "processed": processed }),
            )
            .await?;
        tracing::info!(processed, "sync cycle complete");
        Ok(())
    }

    /// Apply one queue item. Remote failures defer the item and return `Ok`;
    /// only local-store failures abort the cycle.
    async fn apply_item(
        &self,
        item: &SyncQueueItem,
        strategy: ConflictStrategy,
    ) -> OfflineResult<()> {
        let Some(record_id) = item.data.get("id").and_then(|v| v.as_str()) else {
            // Entity stores always journal the id; an item without one can
            // never apply, so retrying it forever helps nobody.
            tracing::error!(item_id = %item.id, "queue item payload has no id; dropping");
            self.store.remove_queue_item(&item.id).await?;
            return Ok(());
        };

        match self.apply_remote(item, record_id, strategy).await {
            Ok(outcome) => {
                self.store.remove_queue_item(&item.id).await?;
                if matches!(outcome, ApplyOutcome::Applied) {
                    self.store.mark_synced(item.table, record_id).await?;
                }
                Ok(())
            }
            Err(error) => self.defer_item(item, &error).await,
        }
    }

    async fn apply_remote(
        &self,
        item: &SyncQueueItem,
        record_id: &str,
        strategy: ConflictStrategy,
    ) -> OfflineResult<ApplyOutcome> {
        let table = item.table.as_str();
        match item.operation {
            OperationType::Delete => {
                self.remote.delete(table, record_id).await?;
                Ok(ApplyOutcome::Applied)
            }
            OperationType::Insert | OperationType::Update => {
                match self.remote.fetch_by_id(table, record_id).await? {
                    None => {
                        self.remote.insert(table, &item.data).await?;
                        Ok(ApplyOutcome::Applied)
                    }
                    Some(remote_record) => {
                        self.resolve(item, record_id, remote_record, strategy).await
                    }
                }
            }
        }
    }

    async fn resolve(
        &self,
        item: &SyncQueueItem,
        record_id: &str,
        remote_record: serde_json::Value,
        strategy: ConflictStrategy,
    ) -> OfflineResult<ApplyOutcome> {
        let table = item.table.as_str();
        match strategy {
            ConflictStrategy::ClientWins => {
                self.remote.update(table, record_id, &item.data).await?;
                Ok(ApplyOutcome::Applied)
            }
            ConflictStrategy::ServerWins => {
                tracing::debug!(table, record_id, "conflict: server wins, local mutation dropped");
                Ok(ApplyOutcome::Discarded)
            }
            ConflictStrategy::Merge => {
                let merged = merge_records(&remote_record, &item.data);
                self.remote.update(table, record_id, &merged).await?;
                Ok(ApplyOutcome::Applied)
            }
            ConflictStrategy::Manual => {
                let conflict = StoredConflict {
                    table: item.table,
                    record_id: record_id.to_string(),
                    local: item.data.clone(),
                    remote: remote_record,
                    detected_at: now_ms(),
                    resolved: false,
                    resolved_at: None,
                };
                let key = conflict.metadata_key();
                self.store
                    .set_metadata(&key, &serde_json::to_value(&conflict)?)
                    .await?;
                self.store
                    .audit_log(
                        AuditAction::ConflictDetected,
                        &format!("{}/{}", table, record_id),
                        serde_json::json!({ "key": key }),
                    )
                    .await?;
                tracing::info!(table, record_id, "conflict parked for manual resolution");
                Ok(ApplyOutcome::Parked)
            }
        }
    }

    /// Record the failure and write the item back for the next cycle. At the
    /// retry ceiling the priority drops one band (floor 0) and the timestamp
    /// refreshes, cycling the item behind its new band.
    async fn defer_item(&self, item: &SyncQueueItem, error: &OfflineError) -> OfflineResult<()> {
        let mut updated = item.clone();
        updated.retry_count += 1;
        updated.error = Some(error.to_string());
        if updated.retry_count >= self.config.max_retries {
            updated.priority = (updated.priority - 1).max(0);
            updated.timestamp = next_timestamp();
        }
        self.store.put_queue_item(&updated).await?;

        tracing::warn!(
            item_id = %item.id,
            retry_count = updated.retry_count,
            priority = updated.priority,
            error = %error,
            "sync item failed; deferred"
        );
        Ok(())
    }

    pub async fn get_sync_status(&self) -> OfflineResult<SyncStatus> {
        let last_sync = self
            .store
            .get_metadata(LAST_SYNC_KEY)
            .await?
            .and_then(|entry| entry.value.as_i64());
        let pending = self.store.queue_len().await?;
        let unresolved_conflicts = self.get_conflicts().await?.len();
        Ok(SyncStatus {
            last_sync,
            pending,
            is_syncing: self.is_syncing.load(Ordering::SeqCst),
            unresolved_conflicts,
        })
    }

    /// Parked conflicts still awaiting resolution.
    pub async fn get_conflicts(&self) -> OfflineResult<Vec<ConflictEntry>> {
        let entries = self.store.metadata_with_prefix(CONFLICT_KEY_PREFIX).await?;
        let mut conflicts = Vec::new();
        for entry in entries {
            match serde_json::from_value::<StoredConflict>(entry.value) {
                Ok(conflict) if !conflict.resolved => {
                    conflicts.push(ConflictEntry {
                        key: entry.key,
                        conflict,
                    });
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(key = %entry.key, error = %error, "undecodable conflict entry")
                }
            }
        }
        Ok(conflicts)
    }

    /// Apply a human-chosen resolution: write it to the remote record, then
    /// mark the parked conflict resolved. The entry is kept as history.
    pub async fn resolve_conflict(
        &self,
        key: &str,
        resolution: serde_json::Value,
    ) -> OfflineResult<()> {
        let entry = self.store.get_metadata(key).await?.ok_or_else(|| {
            OfflineError::NotFound(format!("no conflict stored under {}", key))
        })?;
        let mut conflict: StoredConflict = serde_json::from_value(entry.value)?;
        if conflict.resolved {
            return Err(OfflineError::InvalidOperation(format!(
                "conflict {} is already resolved",
                key
            )));
        }

        self.remote
            .update(conflict.table.as_str(), &conflict.record_id, &resolution)
            .await?;

        conflict.resolved = true;
        conflict.resolved_at = Some(now_ms());
        self.store
            .set_metadata(key, &serde_json::to_value(&conflict)?)
            .await?;
        self.store
            .audit_log(
                AuditAction::ConflictResolved,
                &format!("{}/{}", conflict.table.as_str(), conflict.record_id),
                serde_json::json!({ "key": key }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_store::{Patient, PatientStore};
    use crate::local_store::RecordIndex;
    use crate::test_util::{test_store, MockRemote};
    use serde_json::json;
    use tempfile::NamedTempFile;

    async fn fixture(
        online: bool,
    ) -> (
        Arc<SyncEngine>,
        Arc<LocalStore>,
        Arc<MockRemote>,
        Arc<NetworkMonitor>,
        NamedTempFile,
    ) {
        fixture_with(online, SyncEngineConfig::default()).await
    }

    async fn fixture_with(
        online: bool,
        config: SyncEngineConfig,
    ) -> (
        Arc<SyncEngine>,
        Arc<LocalStore>,
        Arc<MockRemote>,
        Arc<NetworkMonitor>,
        NamedTempFile,
    ) {
        let (store, file) = test_store().await;
        let remote = MockRemote::new();
        let network = Arc::new(NetworkMonitor::new(online));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            remote.clone(),
            network.clone(),
            config,
        ));
        (engine, store, remote, network, file)
    }

    fn patient(name: &str) -> Patient {
        let mut fields = serde_json::Map::new();
        fields.insert("name".to_string(), json!(name));
        Patient { id: None, fields }
    }

    #[tokio::test]
    async fn successful_drain_marks_synced_and_empties_queue() {
        let (engine, store, remote, _network, _file) = fixture(true).await;
        let patients = PatientStore::new(store.clone());

        let id = patients.save(patient("Alice")).await.unwrap();
        assert_eq!(store.queue_len().await.unwrap(), 1);

        assert!(engine.sync(SyncOptions::default()).await.unwrap());

        assert_eq!(store.queue_len().await.unwrap(), 0);
        assert_eq!(remote.record("patients", &id).unwrap()["name"], json!("Alice"));
        let raw = store.get(Collection::Patients, &id).await.unwrap().unwrap();
        assert!(raw.synced);

        let status = engine.get_sync_status().await.unwrap();
        assert!(status.last_sync.is_some());
        assert_eq!(status.pending, 0);
        assert!(!status.is_syncing);
    }

    #[tokio::test]
    async fn priority_bands_drain_before_timestamps() {
        let (engine, store, remote, _network, _file) = fixture(true).await;

        // Priorities [3, 1, 2], created in timestamp order.
        for (record_id, priority) in [("a", 3), ("b", 1), ("c", 2)] {
            store
                .enqueue(&SyncQueueItem::new(
                    Collection::Patients,
                    record_id,
                    OperationType::Insert,
                    json!({ "id": record_id }),
                    priority,
                ))
                .await
                .unwrap();
        }

        engine.sync(SyncOptions::default()).await.unwrap();

        assert_eq!(
            remote.applied_ops(),
            vec![
                "insert:patients/a".to_string(),
                "insert:patients/c".to_string(),
                "insert:patients/b".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn retry_ceiling_demotes_priority_once_per_failure() {
        let (engine, store, remote, _network, _file) = fixture(true).await;
        remote.set_fail_all(true);

        store
            .enqueue(&SyncQueueItem::new(
                Collection::Patients,
                "p1",
                OperationType::Insert,
                json!({ "id": "p1" }),
                2,
            ))
            .await
            .unwrap();
        let original_timestamp = store.queue_all().await.unwrap()[0].timestamp;

        for _ in 0..4 {
            engine.sync(SyncOptions::default()).await.unwrap();
        }
        let item = &store.queue_all().await.unwrap()[0];
        assert_eq!(item.retry_count, 4);
        assert_eq!(item.priority, 2);
        assert_eq!(item.timestamp, original_timestamp);
        assert!(item.error.as_deref().unwrap().contains("network failure"));

        // Fifth consecutive failure reaches the ceiling: priority drops by
        // exactly one and the timestamp refreshes.
        engine.sync(SyncOptions::default()).await.unwrap();
        let item = &store.queue_all().await.unwrap()[0];
        assert_eq!(item.retry_count, 5);
        assert_eq!(item.priority, 1);
        assert!(item.timestamp >= original_timestamp);

        // Past the ceiling it keeps dropping, flooring at zero.
        engine.sync(SyncOptions::default()).await.unwrap();
        engine.sync(SyncOptions::default()).await.unwrap();
        let item = &store.queue_all().await.unwrap()[0];
        assert_eq!(item.priority, 0);
        engine.sync(SyncOptions::default()).await.unwrap();
        assert_eq!(store.queue_all().await.unwrap()[0].priority, 0);
    }

    #[tokio::test]
    async fn second_sync_is_a_noop_while_running() {
        let (engine, store, remote, _network, _file) = fixture(true).await;
        remote.set_delay_ms(100);

        store
            .enqueue(&SyncQueueItem::new(
                Collection::Patients,
                "p1",
                OperationType::Insert,
                json!({ "id": "p1" }),
                2,
            ))
            .await
            .unwrap();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync(SyncOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!engine.sync(SyncOptions::default()).await.unwrap());
        assert!(first.await.unwrap().unwrap());
        assert_eq!(store.queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn force_overrides_the_running_guard() {
        let (engine, store, remote, _network, _file) = fixture(true).await;
        remote.set_delay_ms(100);

        store
            .enqueue(&SyncQueueItem::new(
                Collection::Patients,
                "p1",
                OperationType::Insert,
                json!({ "id": "p1" }),
                2,
            ))
            .await
            .unwrap();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync(SyncOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let forced = engine
            .sync(SyncOptions {
                force: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(forced);
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn offline_sync_is_a_noop() {
        let (engine, store, remote, _network, _file) = fixture(false).await;

        store
            .enqueue(&SyncQueueItem::new(
                Collection::Patients,
                "p1",
                OperationType::Insert,
                json!({ "id": "p1" }),
                2,
            ))
            .await
            .unwrap();

        assert!(!engine.sync(SyncOptions::default()).await.unwrap());
        assert_eq!(remote.call_count(), 0);
        assert_eq!(store.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn merge_strategy_overlays_local_over_remote() {
        let (engine, store, remote, _network, _file) = fixture(true).await;
        let patients = PatientStore::new(store.clone());

        remote.seed(
            "patients",
            "p1",
            json!({ "id": "p1", "a": 1, "b": { "x": 1 }, "created_at": 100 }),
        );

        let mut local = patient("ignored");
        local.id = Some("p1".to_string());
        local.fields.clear();
        local.fields.insert("a".to_string(), json!(2));
        local.fields.insert("b".to_string(), json!({ "y": 2 }));
        local.fields.insert("created_at".to_string(), json!(999));
        patients.save(local).await.unwrap();

        engine.sync(SyncOptions::default()).await.unwrap();

        assert_eq!(
            remote.record("patients", "p1").unwrap(),
            json!({ "id": "p1", "a": 2, "b": { "x": 1, "y": 2 }, "created_at": 100 })
        );
        assert!(store
            .get(Collection::Patients, "p1")
            .await
            .unwrap()
            .unwrap()
            .synced);
    }

    #[tokio::test]
    async fn client_wins_overwrites_and_server_wins_discards() {
        let (engine, store, remote, _network, _file) = fixture(true).await;
        let patients = PatientStore::new(store.clone());

        remote.seed("patients", "p1", json!({ "id": "p1", "name": "Server" }));
        let mut local = patient("Client");
        local.id = Some("p1".to_string());
        patients.save(local.clone()).await.unwrap();

        engine
            .sync(SyncOptions {
                strategy: Some(ConflictStrategy::ClientWins),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            remote.record("patients", "p1").unwrap()["name"],
            json!("Client")
        );

        // Server-wins: the queued mutation vanishes without a remote write,
        // and the record stays unsynced because it never applied.
        remote.seed("patients", "p2", json!({ "id": "p2", "name": "Server" }));
        let mut second = patient("Client");
        second.id = Some("p2".to_string());
        patients.save(second).await.unwrap();

        engine
            .sync(SyncOptions {
                strategy: Some(ConflictStrategy::ServerWins),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            remote.record("patients", "p2").unwrap()["name"],
            json!("Server")
        );
        assert_eq!(store.queue_len().await.unwrap(), 0);
        assert!(!store
            .get(Collection::Patients, "p2")
            .await
            .unwrap()
            .unwrap()
            .synced);
    }

    #[tokio::test]
    async fn manual_strategy_parks_and_resolution_applies() {
        let (engine, store, remote, _network, _file) = fixture(true).await;
        let patients = PatientStore::new(store.clone());

        remote.seed("patients", "p1", json!({ "id": "p1", "name": "Server" }));
        let mut local = patient("Client");
        local.id = Some("p1".to_string());
        patients.save(local).await.unwrap();

        engine
            .sync(SyncOptions {
                strategy: Some(ConflictStrategy::Manual),
                ..Default::default()
            })
            .await
            .unwrap();

        // Parked: queue drained, nothing written, record still unsynced.
        assert_eq!(store.queue_len().await.unwrap(), 0);
        assert_eq!(
            remote.record("patients", "p1").unwrap()["name"],
            json!("Server")
        );
        assert!(!store
            .get(Collection::Patients, "p1")
            .await
            .unwrap()
            .unwrap()
            .synced);

        let conflicts = engine.get_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict.record_id, "p1");
        assert_eq!(conflicts[0].conflict.local["name"], json!("Client"));
        assert_eq!(conflicts[0].conflict.remote["name"], json!("Server"));
        assert_eq!(
            engine.get_sync_status().await.unwrap().unresolved_conflicts,
            1
        );

        let key = conflicts[0].key.clone();
        engine
            .resolve_conflict(&key, json!({ "id": "p1", "name": "Reviewed" }))
            .await
            .unwrap();

        assert_eq!(
            remote.record("patients", "p1").unwrap()["name"],
            json!("Reviewed")
        );
        assert!(engine.get_conflicts().await.unwrap().is_empty());

        // The resolved entry is history, not deleted.
        let entry = store.get_metadata(&key).await.unwrap().unwrap();
        assert_eq!(entry.value["resolved"], json!(true));

        // Resolving twice is an error.
        assert!(engine
            .resolve_conflict(&key, json!({ "id": "p1" }))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn progress_reports_after_each_batch() {
        let (engine, store, _remote, _network, _file) = fixture(true).await;

        for i in 0..25 {
            store
                .enqueue(&SyncQueueItem::new(
                    Collection::Patients,
                    &format!("p{}", i),
                    OperationType::Insert,
                    json!({ "id": format!("p{}", i) }),
                    2,
                ))
                .await
                .unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress: ProgressCallback = {
            let seen = seen.clone();
            Arc::new(move |fraction| seen.lock().unwrap().push(fraction))
        };
        let completed = Arc::new(AtomicBool::new(false));
        let on_complete: CompletionCallback = {
            let completed = completed.clone();
            Arc::new(move || completed.store(true, Ordering::SeqCst))
        };

        engine
            .sync(SyncOptions {
                on_progress: Some(progress),
                on_complete: Some(on_complete),
                ..Default::default()
            })
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert!((seen[0] - 0.4).abs() < 1e-6);
        assert!((seen[1] - 0.8).abs() < 1e-6);
        assert!((seen[2] - 1.0).abs() < 1e-6);
        assert!(completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn table_allow_list_restricts_the_cycle() {
        let (engine, store, remote, _network, _file) = fixture(true).await;

        store
            .enqueue(&SyncQueueItem::new(
                Collection::Patients,
                "p1",
                OperationType::Insert,
                json!({ "id": "p1" }),
                2,
            ))
            .await
            .unwrap();
        store
            .enqueue(&SyncQueueItem::new(
                Collection::Consultations,
                "c1",
                OperationType::Insert,
                json!({ "id": "c1", "patient_id": "p1" }),
                3,
            ))
            .await
            .unwrap();

        engine
            .sync(SyncOptions {
                tables: Some(vec![Collection::Consultations]),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(remote.table_len("consultations"), 1);
        assert_eq!(remote.table_len("patients"), 0);
        assert_eq!(store.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cycle_error_funnels_through_callback_and_releases_guard() {
        let (engine, store, _remote, _network, _file) = fixture(true).await;
        store.close().await;

        let errors = Arc::new(AtomicBool::new(false));
        let on_error: ErrorCallback = {
            let errors = errors.clone();
            Arc::new(move |_| errors.store(true, Ordering::SeqCst))
        };

        let ran = engine
            .sync(SyncOptions {
                on_error: Some(on_error.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!ran);
        assert!(errors.load(Ordering::SeqCst));

        // The guard cleared: the next trigger attempts a fresh cycle instead
        // of seeing a wedged engine.
        errors.store(false, Ordering::SeqCst);
        engine
            .sync(SyncOptions {
                on_error: Some(on_error),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(errors.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn online_transition_triggers_a_sync() {
        let (engine, store, remote, network, _file) = fixture(false).await;
        let patients = PatientStore::new(store.clone());
        engine.initialize();

        let id = patients.save(patient("Alice")).await.unwrap();
        assert_eq!(store.queue_len().await.unwrap(), 1);

        network.set_online(true);

        let mut drained = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.queue_len().await.unwrap() == 0 {
                drained = true;
                break;
            }
        }
        assert!(drained, "online transition did not trigger a drain");
        assert!(remote.record("patients", &id).is_some());

        engine.shutdown();
    }

    #[tokio::test]
    async fn periodic_timer_triggers_while_online() {
        let config = SyncEngineConfig {
            sync_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let (engine, store, _remote, _network, _file) = fixture_with(true, config).await;
        engine.initialize();

        store
            .enqueue(&SyncQueueItem::new(
                Collection::Patients,
                "p1",
                OperationType::Insert,
                json!({ "id": "p1" }),
                2,
            ))
            .await
            .unwrap();

        let mut drained = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.queue_len().await.unwrap() == 0 {
                drained = true;
                break;
            }
        }
        assert!(drained, "timer did not trigger a drain");

        engine.shutdown();
    }

    #[tokio::test]
    async fn end_to_end_offline_edit_then_sync_then_delete() {
        let (engine, store, remote, network, _file) = fixture(false).await;
        let patients = PatientStore::new(store.clone());

        // Offline: the write lands locally and queues an insert.
        let id = patients.save(patient("Alice")).await.unwrap();
        assert_eq!(store.queue_len().await.unwrap(), 1);
        assert_eq!(
            store.queue_all().await.unwrap()[0].operation,
            OperationType::Insert
        );
        let local = patients.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(local.fields["name"], json!("Alice"));
        assert_eq!(patients.get_unsynced().await.unwrap().len(), 1);

        // Back online: the drain applies the insert and marks it synced.
        network.set_online(true);
        assert!(engine.sync(SyncOptions::default()).await.unwrap());
        assert_eq!(store.queue_len().await.unwrap(), 0);
        assert!(remote.record("patients", &id).is_some());
        assert!(store
            .get(Collection::Patients, &id)
            .await
            .unwrap()
            .unwrap()
            .synced);

        // Delete queues the last-known payload, and the next drain applies it.
        patients.delete(&id).await.unwrap();
        let queue = store.queue_all().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].operation, OperationType::Delete);
        assert_eq!(queue[0].data["name"], json!("Alice"));

        assert!(engine.sync(SyncOptions::default()).await.unwrap());
        assert_eq!(store.queue_len().await.unwrap(), 0);
        assert!(remote.record("patients", &id).is_none());
        assert!(store.get(Collection::Patients, &id).await.unwrap().is_none());
        assert!(store
            .get_by_index(Collection::Patients, &RecordIndex::BySynced(false))
            .await
            .unwrap()
            .is_empty());
    }
}
