//! Offline-first data synchronization engine for the Arogya hospital
//! management system
//!
//! Provides:
//! - Durable local SQLite store for patients, consultations and prescriptions
//! - Mutation outbox drained in priority order with retry and demotion
//! - Conflict resolution (client-wins / server-wins / merge / manual)
//! - Connectivity tracking and background sync triggers
//! - Read-through caching of essential data with expiry-based eviction
//! - Hash-chained audit trail of sync activity
//!
//! Local writes always succeed immediately; only eventual remote consistency
//! is delayed. Pages and forms talk to the typed [`EntityStore`]s, the app
//! shell drives [`SyncEngine`] and [`EssentialCache`], and everything is
//! wired once per process through [`OfflineServices`].

pub mod audit;
pub mod cache;
pub mod conflict;
pub mod entity_store;
pub mod error;
pub mod local_store;
pub mod network;
pub mod remote;
pub mod sync_engine;

#[cfg(test)]
pub(crate) mod test_util;

pub use audit::{AuditAction, AuditConfig, AuditEntry, AuditLogger};
pub use cache::{CacheConfig, CacheStats, EssentialCache};
pub use conflict::{merge_records, ConflictStrategy, StoredConflict, CONFLICT_KEY_PREFIX};
pub use entity_store::{
    Consultation, ConsultationStore, EntityStore, OfflineEntity, Patient, PatientScoped,
    PatientStore, Prescription, PrescriptionStore,
};
pub use error::{OfflineError, OfflineResult};
pub use local_store::{
    Collection, LocalStore, LocalStoreConfig, MetadataEntry, OperationType, RecordIndex,
    StoredRecord, SyncQueueItem,
};
pub use network::{ListenerId, NetworkMonitor};
pub use remote::{HttpRemote, HttpRemoteConfig, RemoteBackend, RemoteQuery};
pub use sync_engine::{
    ConflictEntry, SyncEngine, SyncEngineConfig, SyncOptions, SyncStatus, LAST_SYNC_KEY,
};

use std::sync::Arc;

/// Aggregate configuration for [`OfflineServices::start`].
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    pub store: LocalStoreConfig,
    pub cache: CacheConfig,
    pub sync: SyncEngineConfig,
    /// Connectivity state seeded from the host before the first transition
    /// event arrives
    pub initially_online: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            store: LocalStoreConfig::default(),
            cache: CacheConfig::default(),
            sync: SyncEngineConfig::default(),
            initially_online: true,
        }
    }
}

/// The process-wide service bundle: created once at startup, torn down on
/// logout. Consumers receive these handles explicitly instead of importing
/// shared module state, so tests can substitute fakes at the
/// [`RemoteBackend`] seam.
pub struct OfflineServices {
    pub store: Arc<LocalStore>,
    pub network: Arc<NetworkMonitor>,
    pub patients: PatientStore,
    pub consultations: ConsultationStore,
    pub prescriptions: PrescriptionStore,
    pub cache: Arc<EssentialCache>,
    pub sync: Arc<SyncEngine>,
}

impl OfflineServices {
    /// Open the local store and wire every component, including the sync
    /// engine's background triggers. Call once per process, from within a
    /// Tokio runtime.
    pub async fn start(
        config: OfflineConfig,
        remote: Arc<dyn RemoteBackend>,
    ) -> OfflineResult<Self> {
        let store = Arc::new(LocalStore::open(config.store).await?);
        let network = Arc::new(NetworkMonitor::new(config.initially_online));

        let cache = Arc::new(EssentialCache::new(
            store.clone(),
            remote.clone(),
            network.clone(),
            config.cache,
        ));
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            remote,
            network.clone(),
            config.sync,
        ));
        sync.initialize();

        Ok(Self {
            patients: PatientStore::new(store.clone()),
            consultations: ConsultationStore::new(store.clone()),
            prescriptions: PrescriptionStore::new(store.clone()),
            store,
            network,
            cache,
            sync,
        })
    }

    /// Logout path: stop the background triggers and drop all local data.
    pub async fn reset(&self) -> OfflineResult<()> {
        self.sync.shutdown();
        self.store.reset().await
    }

    /// Stop the background triggers and close the local store.
    pub async fn shutdown(&self) {
        self.sync.shutdown();
        self.store.close().await;
    }
}
