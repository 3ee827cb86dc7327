mod client;
mod model;
mod store;

pub use client::{Credentials, ProKnowClient};
pub use model::{
    Collection, CollectionPatient, CustomMetric, DeliveryInformation, Entity, EntitySummary,
    Metadata, MetricType, MetricValue, Patient, PatientSummary, RecordRef, parse_finite,
};
pub use store::ProKnowStore;

/// A store handle bound to one resolved workspace.
#[derive(Debug)]
pub struct Session<S> {
    pub store: S,
    pub workspace: String,
}

impl<S: ProKnowStore> Session<S> {
    pub fn new(store: S, workspace: impl Into<String>) -> Self {
        Self {
            store,
            workspace: workspace.into(),
        }
    }
}
