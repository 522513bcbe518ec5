//! Essential-data cache
//!
//! Pre-populates the local store from the remote backend so the application
//! stays usable offline, and evicts stale synced data to bound growth.
//! Cached records enter through the entity stores' `put_synced` path: they
//! are remote truth, not local mutations, so nothing is journaled.

use crate::entity_store::{
    Consultation, ConsultationStore, Patient, PatientStore, Prescription, PrescriptionStore,
};
use crate::error::OfflineResult;
use crate::local_store::{now_ms, Collection, LocalStore};
use crate::network::NetworkMonitor;
use crate::remote::{RemoteBackend, RemoteQuery};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Rough per-record payload sizes used for the display-only size estimate.
const AVG_PATIENT_BYTES: i64 = 2048;
const AVG_CONSULTATION_BYTES: i64 = 4096;
const AVG_PRESCRIPTION_BYTES: i64 = 1536;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Most-recently-active patients cached per scope
    pub max_patients: u32,
    /// Consultations/prescriptions cached per patient or scope
    pub max_records_per_type: u32,
    /// Synced, non-draft records older than this are evicted
    pub cache_expiry: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_patients: 50,
            max_records_per_type: 20,
            cache_expiry: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Per-collection counts and a rough, display-only size estimate.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub patients: i64,
    pub consultations: i64,
    pub prescriptions: i64,
    pub estimated_size: String,
}

pub struct EssentialCache {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteBackend>,
    network: Arc<NetworkMonitor>,
    patients: PatientStore,
    consultations: ConsultationStore,
    prescriptions: PrescriptionStore,
    config: CacheConfig,
    caching: AtomicBool,
}

impl EssentialCache {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteBackend>,
        network: Arc<NetworkMonitor>,
        config: CacheConfig,
    ) -> Self {
        Self {
            patients: PatientStore::new(store.clone()),
            consultations: ConsultationStore::new(store.clone()),
            prescriptions: PrescriptionStore::new(store.clone()),
            store,
            remote,
            network,
            config,
            caching: AtomicBool::new(false),
        }
    }

    /// Pre-stage the data a hospital needs to keep working offline: recent
    /// patients, today's scheduled appointments (each cached as its patient
    /// plus a draft consultation for the visit), and recent prescriptions.
    ///
    /// Returns `Ok(false)` without any remote call when offline or when a
    /// population run is already in flight. Each sub-fetch fails in
    /// isolation: a dead endpoint for one of them never invalidates what the
    /// others cached.
    pub async fn cache_essential_data(&self, hospital_id: &str) -> OfflineResult<bool> {
        if !self.network.is_online() {
            tracing::debug!("skipping essential-data cache: offline");
            return Ok(false);
        }
        if self
            .caching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("skipping essential-data cache: a run is already in flight");
            return Ok(false);
        }

        tracing::info!(hospital_id, "caching essential data");
        if let Err(error) = self.cache_recent_patients(hospital_id).await {
            tracing::warn!(error = %error, "recent-patient cache fetch failed");
        }
        if let Err(error) = self.cache_today_appointments(hospital_id).await {
            tracing::warn!(error = %error, "appointment cache fetch failed");
        }
        if let Err(error) = self.cache_recent_prescriptions(hospital_id).await {
            tracing::warn!(error = %error, "prescription cache fetch failed");
        }

        self.caching.store(false, Ordering::SeqCst);
        Ok(true)
    }

    /// Deep-cache one patient with their most recent consultations and
    /// prescriptions, for when the UI navigates to a record while online.
    pub async fn cache_patient(&self, patient_id: &str) -> OfflineResult<bool> {
        if !self.network.is_online() {
            tracing::debug!("skipping patient cache: offline");
            return Ok(false);
        }
        if self
            .caching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("skipping patient cache: a run is already in flight");
            return Ok(false);
        }

        let result = self.populate_patient(patient_id).await;
        self.caching.store(false, Ordering::SeqCst);
        result
    }

    async fn populate_patient(&self, patient_id: &str) -> OfflineResult<bool> {
        let Some(row) = self.remote.fetch_by_id("patients", patient_id).await? else {
            tracing::warn!(patient_id, "patient not found remotely; nothing cached");
            return Ok(false);
        };
        let patient: Patient = serde_json::from_value(row)?;
        self.patients.put_synced(&patient).await?;

        if let Err(error) = self.cache_patient_records(patient_id).await {
            tracing::warn!(error = %error, patient_id, "related-record cache fetch failed");
        }
        tracing::debug!(patient_id, "cached patient");
        Ok(true)
    }

    async fn cache_recent_patients(&self, hospital_id: &str) -> OfflineResult<()> {
        let query = RemoteQuery::new()
            .filter("hospital_id", hospital_id)
            .order_desc("updated_at")
            .limit(self.config.max_patients);
        let rows = self.remote.select("patients", &query).await?;

        let mut cached = 0;
        for row in rows {
            match serde_json::from_value::<Patient>(row) {
                Ok(patient) => {
                    self.patients.put_synced(&patient).await?;
                    cached += 1;
                }
                Err(error) => {
                    tracing::warn!(error = %error, "skipping undecodable remote patient")
                }
            }
        }
        tracing::debug!(cached, "cached recent patients");
        Ok(())
    }

    /// Today's scheduled appointments, each written as its patient record
    /// plus a draft-flagged consultation pre-staged for the visit.
    async fn cache_today_appointments(&self, hospital_id: &str) -> OfflineResult<()> {
        let today = Utc::now().date_naive().to_string();
        let query = RemoteQuery::new()
            .filter("hospital_id", hospital_id)
            .filter("appointment_date", today.as_str())
            .filter("status", "scheduled");
        let appointments = self.remote.select("appointments", &query).await?;

        let mut cached = 0;
        for appointment in appointments {
            let Some(patient_id) = appointment.get("patient_id").and_then(|v| v.as_str()) else {
                tracing::warn!("skipping appointment without patient_id");
                continue;
            };
            let Some(appointment_id) = appointment.get("id").and_then(|v| v.as_str()) else {
                tracing::warn!("skipping appointment without id");
                continue;
            };

            if let Some(row) = self.remote.fetch_by_id("patients", patient_id).await? {
                match serde_json::from_value::<Patient>(row) {
                    Ok(patient) => {
                        self.patients.put_synced(&patient).await?;
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, patient_id, "skipping undecodable remote patient")
                    }
                }
            }

            let mut fields = appointment
                .as_object()
                .cloned()
                .unwrap_or_default();
            fields.remove("id");
            fields.remove("patient_id");
            let draft = Consultation {
                id: Some(appointment_id.to_string()),
                patient_id: patient_id.to_string(),
                is_draft: true,
                fields,
            };
            self.consultations.put_synced(&draft).await?;
            cached += 1;
        }
        tracing::debug!(cached, "cached today's appointments");
        Ok(())
    }

    async fn cache_recent_prescriptions(&self, hospital_id: &str) -> OfflineResult<()> {
        let query = RemoteQuery::new()
            .filter("hospital_id", hospital_id)
            .order_desc("updated_at")
            .limit(self.config.max_records_per_type);
        let rows = self.remote.select("prescriptions", &query).await?;

        let mut cached = 0;
        for row in rows {
            match serde_json::from_value::<Prescription>(row) {
                Ok(prescription) => {
                    self.prescriptions.put_synced(&prescription).await?;
                    cached += 1;
                }
                Err(error) => {
                    tracing::warn!(error = %error, "skipping undecodable remote prescription")
                }
            }
        }
        tracing::debug!(cached, "cached recent prescriptions");
        Ok(())
    }

    async fn cache_patient_records(&self, patient_id: &str) -> OfflineResult<()> {
        let query = RemoteQuery::new()
            .filter("patient_id", patient_id)
            .order_desc("updated_at")
            .limit(self.config.max_records_per_type);

        for row in self.remote.select("consultations", &query).await? {
            match serde_json::from_value::<Consultation>(row) {
                Ok(consultation) => {
                    self.consultations.put_synced(&consultation).await?;
                }
                Err(error) => {
                    tracing::warn!(error = %error, "skipping undecodable remote consultation")
                }
            }
        }
        for row in self.remote.select("prescriptions", &query).await? {
            match serde_json::from_value::<Prescription>(row) {
                Ok(prescription) => {
                    self.prescriptions.put_synced(&prescription).await?;
                }
                Err(error) => {
                    tracing::warn!(error = %error, "skipping undecodable remote prescription")
                }
            }
        }
        Ok(())
    }

    /// Evict synced, non-draft records strictly older than the expiry
    /// window. Unsynced work and drafts survive at any age; not-yet-uploaded
    /// clinical notes must never be collected.
    pub async fn clean_expired_cache(&self) -> OfflineResult<u64> {
        let cutoff = now_ms() - self.config.cache_expiry.as_millis() as i64;
        let mut evicted = 0;
        for collection in Collection::ALL {
            evicted += self.store.evict_expired(collection, cutoff).await?;
        }
        if evicted > 0 {
            tracing::info!(evicted, "evicted expired cache records");
        }
        Ok(evicted)
    }

    pub async fn get_cache_stats(&self) -> OfflineResult<CacheStats> {
        let patients = self.store.count(Collection::Patients).await?;
        let consultations = self.store.count(Collection::Consultations).await?;
        let prescriptions = self.store.count(Collection::Prescriptions).await?;

        let bytes = patients * AVG_PATIENT_BYTES
            + consultations * AVG_CONSULTATION_BYTES
            + prescriptions * AVG_PRESCRIPTION_BYTES;

        Ok(CacheStats {
            patients,
            consultations,
            prescriptions,
            estimated_size: format_size(bytes),
        })
    }
}

fn format_size(bytes: i64) -> String {
    if bytes < 1024 {
        format!("~{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("~{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("~{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
