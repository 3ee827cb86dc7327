//! In-memory `ProKnowStore` for unit tests.

use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use crate::{
    error::StoreError,
    proknow::{
        Collection, CollectionPatient, CustomMetric, Entity, EntitySummary, Metadata, MetricType,
        Patient, PatientSummary, ProKnowStore, RecordRef,
    },
};

#[derive(Default)]
struct State {
    metrics: Vec<CustomMetric>,
    created: Vec<String>,
    patients: Vec<Value>,
    entities: HashMap<String, Value>,
    metadata: HashMap<RecordRef, Metadata>,
    saves: usize,
    collections: Vec<(Collection, Vec<CollectionPatient>)>,
    deliveries: HashMap<String, Value>,
    deny_metric_lookup: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn with_metric(self, name: &str, context: &str, metric_type: MetricType) -> Self {
        {
            let mut state = self.state();
            let id = format!("metric-{}", state.metrics.len() + 1);
            state.metrics.push(CustomMetric {
                id,
                name: name.to_string(),
                context: context.to_string(),
                metric_type,
            });
        }
        self
    }

    /// Adds a patient payload (`id`, `mrn`, `studies`, ...).
    pub fn with_patient(self, patient: Value) -> Self {
        self.state().patients.push(patient);
        self
    }

    /// Adds a full entity payload served by `get_entity`.
    pub fn with_entity(self, entity: Value) -> Self {
        {
            let mut state = self.state();
            let id = entity["id"].as_str().unwrap_or_default().to_string();
            state.entities.insert(id, entity);
        }
        self
    }

    pub fn with_metadata(self, record: RecordRef, metadata: Metadata) -> Self {
        self.state().metadata.insert(record, metadata);
        self
    }

    pub fn with_collection(self, collection: Collection, patients: Vec<CollectionPatient>) -> Self {
        self.state().collections.push((collection, patients));
        self
    }

    pub fn with_delivery(self, plan_id: &str, delivery: Value) -> Self {
        self.state()
            .deliveries
            .insert(plan_id.to_string(), delivery);
        self
    }

    pub fn deny_metric_lookup(self) -> Self {
        self.state().deny_metric_lookup = true;
        self
    }

    pub fn created_metrics(&self) -> Vec<String> {
        self.state().created.clone()
    }

    pub fn metric(&self, name: &str) -> Option<CustomMetric> {
        self.state().metrics.iter().find(|m| m.name == name).cloned()
    }

    pub fn metadata(&self, record: &RecordRef) -> Metadata {
        self.state()
            .metadata
            .get(record)
            .cloned()
            .unwrap_or_default()
    }

    pub fn save_count(&self) -> usize {
        self.state().saves
    }
}

impl ProKnowStore for MemoryStore {
    async fn resolve_metric(&self, name: &str) -> Result<CustomMetric, StoreError> {
        let state = self.state();
        if state.deny_metric_lookup {
            return Err(StoreError::PermissionDenied {
                path: "/customMetrics".into(),
                status: reqwest::StatusCode::FORBIDDEN,
            });
        }
        state
            .metrics
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("custom metric {name}")))
    }

    async fn create_metric(
        &self,
        name: &str,
        context: &str,
        metric_type: MetricType,
    ) -> Result<CustomMetric, StoreError> {
        let mut state = self.state();
        let metric = CustomMetric {
            id: format!("metric-{}", state.metrics.len() + 1),
            name: name.to_string(),
            context: context.to_string(),
            metric_type,
        };
        state.metrics.push(metric.clone());
        state.created.push(name.to_string());
        Ok(metric)
    }

    async fn lookup_patients(
        &self,
        _workspace: &str,
        mrns: &[String],
    ) -> Result<Vec<PatientSummary>, StoreError> {
        let state = self.state();
        let mut found = Vec::new();
        for patient in &state.patients {
            let mrn = patient["mrn"].as_str().unwrap_or_default();
            if mrns.iter().any(|m| m == mrn) {
                found.push(PatientSummary {
                    id: patient["id"].as_str().unwrap_or_default().to_string(),
                    mrn: mrn.to_string(),
                });
            }
        }
        Ok(found)
    }

    async fn get_patient(&self, _workspace: &str, patient_id: &str) -> Result<Patient, StoreError> {
        let state = self.state();
        let data = state
            .patients
            .iter()
            .find(|p| p["id"] == patient_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("patient {patient_id}")))?;
        Patient::from_value(data).map_err(|err| StoreError::Decode {
            path: patient_id.to_string(),
            message: err.to_string(),
        })
    }

    async fn get_entity(
        &self,
        _workspace: &str,
        summary: &EntitySummary,
    ) -> Result<Entity, StoreError> {
        let state = self.state();
        let data = state
            .entities
            .get(&summary.id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("entity {}", summary.id)))?;
        Entity::from_value(data).map_err(|err| StoreError::Decode {
            path: summary.id.clone(),
            message: err.to_string(),
        })
    }

    async fn get_metadata(
        &self,
        _workspace: &str,
        record: &RecordRef,
    ) -> Result<Metadata, StoreError> {
        Ok(self.metadata(record))
    }

    async fn save_metadata(
        &self,
        _workspace: &str,
        record: &RecordRef,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        state.metadata.insert(record.clone(), metadata.clone());
        state.saves += 1;
        Ok(())
    }

    async fn find_collection(
        &self,
        _workspace: &str,
        name: &str,
    ) -> Result<Collection, StoreError> {
        self.state()
            .collections
            .iter()
            .find(|(c, _)| c.name == name)
            .map(|(c, _)| c.clone())
            .ok_or_else(|| StoreError::not_found(format!("collection {name}")))
    }

    async fn collection_patients(
        &self,
        _workspace: &str,
        collection: &Collection,
    ) -> Result<Vec<CollectionPatient>, StoreError> {
        self.state()
            .collections
            .iter()
            .find(|(c, _)| c.id == collection.id)
            .map(|(_, patients)| patients.clone())
            .ok_or_else(|| StoreError::not_found(format!("collection {}", collection.id)))
    }

    async fn plan_delivery(&self, _workspace: &str, plan_id: &str) -> Result<Value, StoreError> {
        self.state()
            .deliveries
            .get(plan_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("plan delivery {plan_id}")))
    }
}
