use serde_json::Value;

use crate::error::StoreError;

use super::model::{
    Collection, CollectionPatient, CustomMetric, Entity, EntitySummary, Metadata, MetricType,
    Patient, PatientSummary, RecordRef,
};

/// Operations the tool needs from the remote ProKnow service.
///
/// Calls are awaited one at a time by a single caller. Metadata is keyed by
/// metric name on both sides of this trait.
#[allow(async_fn_in_trait)]
pub trait ProKnowStore {
    async fn resolve_metric(&self, name: &str) -> Result<CustomMetric, StoreError>;

    async fn create_metric(
        &self,
        name: &str,
        context: &str,
        metric_type: MetricType,
    ) -> Result<CustomMetric, StoreError>;

    /// Patients whose MRN matches one of `mrns`. Unmatched MRNs are dropped.
    async fn lookup_patients(
        &self,
        workspace: &str,
        mrns: &[String],
    ) -> Result<Vec<PatientSummary>, StoreError>;

    async fn get_patient(&self, workspace: &str, patient_id: &str) -> Result<Patient, StoreError>;

    async fn get_entity(
        &self,
        workspace: &str,
        summary: &EntitySummary,
    ) -> Result<Entity, StoreError>;

    async fn get_metadata(
        &self,
        workspace: &str,
        record: &RecordRef,
    ) -> Result<Metadata, StoreError>;

    /// Replaces the record's whole metadata bag.
    async fn save_metadata(
        &self,
        workspace: &str,
        record: &RecordRef,
        metadata: &Metadata,
    ) -> Result<(), StoreError>;

    async fn find_collection(&self, workspace: &str, name: &str)
    -> Result<Collection, StoreError>;

    async fn collection_patients(
        &self,
        workspace: &str,
        collection: &Collection,
    ) -> Result<Vec<CollectionPatient>, StoreError>;

    async fn plan_delivery(&self, workspace: &str, plan_id: &str) -> Result<Value, StoreError>;
}
