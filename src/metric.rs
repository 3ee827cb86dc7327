use serde::Deserialize;
use std::collections::HashMap;

use crate::{
    error::StoreError,
    proknow::{CustomMetric, MetricType, ProKnowStore},
};

/// One CSV row: a value to set on a patient or on one of its entities.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricRequest {
    #[serde(rename = "PatientID")]
    pub patient_id: String,
    #[serde(rename = "CustomMetricName")]
    pub metric_name: String,
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "Context")]
    pub context: String,
    #[serde(rename = "Description", default)]
    pub description: String,
}

impl MetricRequest {
    pub fn normalized(mut self) -> Self {
        self.context = normalize_context(&self.context);
        self
    }
}

/// ProKnow only accepts `patient`, `study`, `image_set`, `structure_set`,
/// `plan` and `dose`. Anything else is passed through and fails to match later.
pub fn normalize_context(raw: &str) -> String {
    raw.trim().to_lowercase().replace(' ', "_")
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnsureOutcome {
    Exists,
    Created(MetricType),
}

impl EnsureOutcome {
    /// The resolve line and the create line written to the run log.
    pub fn log_lines(&self, name: &str) -> [String; 2] {
        match self {
            EnsureOutcome::Exists => [
                format!("{name} exists in ProKnow."),
                format!("{name} not created."),
            ],
            EnsureOutcome::Created(metric_type) => [
                format!("Could not resolve {name} by Name, attempt to create a new CM."),
                format!(
                    "Custom Metric: {name} will be added as type {}.",
                    metric_type.label()
                ),
            ],
        }
    }
}

/// Custom metric definitions seen during a run.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    known: HashMap<String, CustomMetric>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `name`, creating it when the store has no such metric. The
    /// type of a new metric is inferred from `sample`.
    pub async fn ensure<S: ProKnowStore>(
        &mut self,
        store: &S,
        name: &str,
        context: &str,
        sample: &str,
    ) -> Result<(CustomMetric, EnsureOutcome), StoreError> {
        if let Some(metric) = self.known.get(name) {
            return Ok((metric.clone(), EnsureOutcome::Exists));
        }

        let (metric, outcome) = match store.resolve_metric(name).await {
            Ok(metric) => (metric, EnsureOutcome::Exists),
            Err(err) if err.is_not_found() => {
                let metric_type = MetricType::infer(sample);
                tracing::info!(
                    metric = name,
                    context,
                    kind = metric_type.label(),
                    "creating custom metric"
                );
                let metric = store.create_metric(name, context, metric_type.clone()).await?;
                (metric, EnsureOutcome::Created(metric_type))
            }
            Err(err) => return Err(err),
        };

        self.known.insert(name.to_string(), metric.clone());
        Ok((metric, outcome))
    }
}
