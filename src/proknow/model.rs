use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct Workspace {
    pub id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

impl Workspace {
    pub fn matches(&self, key: &str) -> bool {
        self.id == key || self.slug == key || self.name == key
    }
}

/// Custom metric value type, in the API's `{"number": {}}` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Number {},
    String {},
    Enum {
        #[serde(default)]
        values: Vec<String>,
    },
}

impl MetricType {
    /// Numeric when the sample value parses as a finite float, text otherwise.
    pub fn infer(sample: &str) -> Self {
        if parse_finite(sample).is_some() {
            MetricType::Number {}
        } else {
            MetricType::String {}
        }
    }

    pub fn stores_text(&self) -> bool {
        !matches!(self, MetricType::Number {})
    }

    pub fn label(&self) -> &'static str {
        match self {
            MetricType::Number {} => "Numbers",
            MetricType::String {} => "Text",
            MetricType::Enum { .. } => "Enum",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMetric {
    pub id: String,
    pub name: String,
    pub context: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
}

/// A stored metric value. Anything that is neither a number nor a string
/// (`null`, lists, objects) is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
    Other(Value),
}

/// `NaN` and infinities are rejected since JSON writes them as `null`.
pub fn parse_finite(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Number(value)
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

/// Metadata bag keyed by metric name.
pub type Metadata = BTreeMap<String, MetricValue>;

/// A record that carries a metadata bag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordRef {
    Patient { id: String },
    Entity { id: String },
}

impl RecordRef {
    pub fn id(&self) -> &str {
        match self {
            RecordRef::Patient { id } | RecordRef::Entity { id } => id,
        }
    }

    pub(crate) fn collection_segment(&self) -> &'static str {
        match self {
            RecordRef::Patient { .. } => "patients",
            RecordRef::Entity { .. } => "entities",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatientSummary {
    pub id: String,
    pub mrn: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntitySummary {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub entities: Vec<EntitySummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StudySummary {
    #[serde(default)]
    pub entities: Vec<EntitySummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Patient {
    pub id: String,
    pub mrn: String,
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub studies: Vec<StudySummary>,
    #[serde(skip)]
    pub data: Value,
}

impl Patient {
    pub fn from_value(data: Value) -> serde_json::Result<Self> {
        let mut patient: Patient = serde_json::from_value(data.clone())?;
        patient.data = data;
        Ok(patient)
    }

    pub fn record(&self) -> RecordRef {
        RecordRef::Patient {
            id: self.id.clone(),
        }
    }

    /// Entities of `kind` anywhere under the patient's studies, optionally
    /// restricted to an exact description.
    pub fn find_entities(&self, kind: &str, description: Option<&str>) -> Vec<&EntitySummary> {
        let mut found = Vec::new();
        for study in &self.studies {
            collect_entities(&study.entities, kind, description, &mut found);
        }
        found
    }
}

fn collect_entities<'a>(
    entities: &'a [EntitySummary],
    kind: &str,
    description: Option<&str>,
    found: &mut Vec<&'a EntitySummary>,
) {
    for entity in entities {
        let description_ok = match description {
            Some(wanted) => entity.description.as_deref() == Some(wanted),
            None => true,
        };
        if entity.kind == kind && description_ok {
            found.push(entity);
        }
        collect_entities(&entity.entities, kind, description, found);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip)]
    pub data: Value,
}

impl Entity {
    pub fn from_value(data: Value) -> serde_json::Result<Self> {
        let mut entity: Entity = serde_json::from_value(data.clone())?;
        entity.data = data;
        Ok(entity)
    }

    pub fn record(&self) -> RecordRef {
        RecordRef::Entity {
            id: self.id.clone(),
        }
    }

    pub fn series_date(&self) -> Option<&str> {
        self.data
            .pointer("/series/date")
            .and_then(Value::as_str)
            .filter(|date| !date.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionEntityRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionPatient {
    pub id: String,
    pub mrn: String,
    #[serde(default)]
    pub entity: Option<CollectionEntityRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryInformation {
    pub equipment: Equipment,
    #[serde(default)]
    pub fraction_groups: Vec<FractionGroup>,
    #[serde(default)]
    pub beams: Vec<Beam>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Equipment {
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub manufacturer_model_name: Option<String>,
    #[serde(default)]
    pub device_serial_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FractionGroup {
    #[serde(default)]
    pub number_of_fractions_planned: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Beam {
    #[serde(default)]
    pub delivery_modality: String,
    #[serde(default)]
    pub radiation_type: String,
    #[serde(default)]
    pub is_modulated: bool,
    #[serde(default)]
    pub is_helical: bool,
    #[serde(default)]
    pub primary_fluence_mode: Option<FluenceMode>,
    #[serde(default)]
    pub control_point_summary: Option<ControlPointSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FluenceMode {
    pub mode: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlPointSummary {
    #[serde(default)]
    pub nominal_beam_energies: Vec<f64>,
}
