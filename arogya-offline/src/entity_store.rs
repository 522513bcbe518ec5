//! Typed repositories over the local store
//!
//! [`EntityStore`] is the CRUD surface pages and forms talk to, online or
//! offline. Every mutation lands durably in the local store and journals
//! exactly one outbox item; propagation to the remote backend is the sync
//! engine's job. Domain payloads stay open-ended: the typed wrappers pin the
//! fields this layer indexes on (`id`, `patient_id`, `is_draft`) and flatten
//! everything else through untouched.

use crate::error::{OfflineError, OfflineResult};
use crate::local_store::{
    now_ms, Collection, LocalStore, OperationType, RecordIndex, StoredRecord, SyncQueueItem,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

/// Minimal structural contract for offline-managed domain records.
pub trait OfflineEntity:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Collection this entity family persists to.
    const COLLECTION: Collection;

    /// Default priority for queued mutations. Clinically urgent families
    /// drain ahead of the rest during partial connectivity.
    const SYNC_PRIORITY: i32;

    fn id(&self) -> Option<&str>;

    fn assign_id(&mut self, id: String);

    /// Owning patient id, for patient-scoped families.
    fn patient_id(&self) -> Option<&str> {
        None
    }

    /// Draft records are exempt from cache eviction.
    fn is_draft(&self) -> bool {
        false
    }
}

/// Marker for entity families owned by a patient record.
pub trait PatientScoped: OfflineEntity {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consultation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub patient_id: String,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub patient_id: String,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl OfflineEntity for Patient {
    const COLLECTION: Collection = Collection::Patients;
    const SYNC_PRIORITY: i32 = 2;

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn assign_id(&mut self, id: String) {
        self.id = Some(id);
    }
}

impl OfflineEntity for Consultation {
    const COLLECTION: Collection = Collection::Consultations;
    const SYNC_PRIORITY: i32 = 3;

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn assign_id(&mut self, id: String) {
        self.id = Some(id);
    }

    fn patient_id(&self) -> Option<&str> {
        Some(&self.patient_id)
    }

    fn is_draft(&self) -> bool {
        self.is_draft
    }
}

impl OfflineEntity for Prescription {
    const COLLECTION: Collection = Collection::Prescriptions;
    const SYNC_PRIORITY: i32 = 2;

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn assign_id(&mut self, id: String) {
        self.id = Some(id);
    }

    fn patient_id(&self) -> Option<&str> {
        Some(&self.patient_id)
    }

    fn is_draft(&self) -> bool {
        self.is_draft
    }
}

impl PatientScoped for Consultation {}
impl PatientScoped for Prescription {}

/// Typed CRUD over one collection, with automatic outbox journaling.
#[derive(Clone)]
pub struct EntityStore<T: OfflineEntity> {
    store: Arc<LocalStore>,
    _entity: PhantomData<fn() -> T>,
}

pub type PatientStore = EntityStore<Patient>;
pub type ConsultationStore = EntityStore<Consultation>;
pub type PrescriptionStore = EntityStore<Prescription>;

impl<T: OfflineEntity> EntityStore<T> {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    fn decode(record: StoredRecord) -> OfflineResult<T> {
        serde_json::from_value(record.data).map_err(|e| {
            OfflineError::Serialization(format!(
                "stored {} record {} is not decodable: {}",
                T::COLLECTION.as_str(),
                record.id,
                e
            ))
        })
    }

    pub async fn get_all(&self) -> OfflineResult<Vec<T>> {
        self.store
            .get_all(T::COLLECTION)
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    /// One payload by id; absent is not an error.
    pub async fn get_by_id(&self, id: &str) -> OfflineResult<Option<T>> {
        self.store
            .get(T::COLLECTION, id)
            .await?
            .map(Self::decode)
            .transpose()
    }

    pub async fn get_by_index(&self, index: RecordIndex) -> OfflineResult<Vec<T>> {
        self.store
            .get_by_index(T::COLLECTION, &index)
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    /// Persist a local mutation and journal it for sync.
    ///
    /// An entity without an id gets a fresh one and journals as an insert;
    /// an entity that already carries its id journals as an update. Exactly
    /// one record write and one queue append per call.
    pub async fn save(&self, mut entity: T) -> OfflineResult<String> {
        let is_new = entity.id().is_none();
        let id = match entity.id() {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        entity.assign_id(id.clone());

        let data = serde_json::to_value(&entity)?;
        let record = StoredRecord {
            id: id.clone(),
            data: data.clone(),
            updated_at: now_ms(),
            synced: false,
            patient_id: entity.patient_id().map(str::to_string),
            is_draft: if T::COLLECTION.supports_drafts() {
                Some(entity.is_draft())
            } else {
                None
            },
        };
        self.store.put(T::COLLECTION, &record).await?;

        let operation = if is_new {
            OperationType::Insert
        } else {
            OperationType::Update
        };
        self.store
            .enqueue(&SyncQueueItem::new(
                T::COLLECTION,
                &id,
                operation,
                data,
                T::SYNC_PRIORITY,
            ))
            .await?;

        Ok(id)
    }

    /// Remove a record and journal the deletion, carrying the last-known
    /// payload for the remote call and the audit trail. No-op when absent.
    pub async fn delete(&self, id: &str) -> OfflineResult<()> {
        let Some(existing) = self.store.get(T::COLLECTION, id).await? else {
            tracing::debug!(
                collection = T::COLLECTION.as_str(),
                id,
                "delete of absent record ignored"
            );
            return Ok(());
        };

        self.store.delete(T::COLLECTION, id).await?;
        self.store
            .enqueue(&SyncQueueItem::new(
                T::COLLECTION,
                id,
                OperationType::Delete,
                existing.data,
                T::SYNC_PRIORITY,
            ))
            .await?;
        Ok(())
    }

    /// Payloads whose latest local state has not been confirmed remote.
    pub async fn get_unsynced(&self) -> OfflineResult<Vec<T>> {
        self.get_by_index(RecordIndex::BySynced(false)).await
    }

    /// Flip a record's synced flag in place; idempotent.
    pub async fn mark_as_synced(&self, id: &str) -> OfflineResult<()> {
        self.store.mark_synced(T::COLLECTION, id).await
    }

    /// Cache write path: store a record already confirmed on the remote
    /// backend (`synced = true`) without journaling a mutation. The entity
    /// must carry its id.
    pub async fn put_synced(&self, entity: &T) -> OfflineResult<String> {
        let id = entity
            .id()
            .ok_or_else(|| {
                OfflineError::InvalidOperation(format!(
                    "cannot cache a {} record without an id",
                    T::COLLECTION.as_str()
                ))
            })?
            .to_string();

        let record = StoredRecord {
            id: id.clone(),
            data: serde_json::to_value(entity)?,
            updated_at: now_ms(),
            synced: true,
            patient_id: entity.patient_id().map(str::to_string),
            is_draft: if T::COLLECTION.supports_drafts() {
                Some(entity.is_draft())
            } else {
                None
            },
        };
        self.store.put(T::COLLECTION, &record).await?;
        Ok(id)
    }
}

impl<T: PatientScoped> EntityStore<T> {
    /// In-progress drafts, exempt from cache eviction.
    pub async fn get_drafts(&self) -> OfflineResult<Vec<T>> {
        self.get_by_index(RecordIndex::ByDraft(true)).await
    }

    pub async fn get_by_patient(&self, patient_id: &str) -> OfflineResult<Vec<T>> {
        self.get_by_index(RecordIndex::ByPatient(patient_id.to_string()))
            .await
    }
}
