use anyhow::{Context, Result};
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
};

use crate::{
    error::StoreError,
    metric::MetricRegistry,
    proknow::{
        CustomMetric, DeliveryInformation, EntitySummary, Metadata, MetricValue, ProKnowStore,
        Session,
    },
    run_log::RowLog,
    updater::{conform_value, merge_metadata},
};

type Definitions = HashMap<String, CustomMetric>;

pub const TPS_VENDOR: &str = "*NHS - TPS Vendor";
pub const TPS: &str = "*NHS - TPS";
pub const TDS_SERIAL: &str = "*NHS - TDS S/N";
pub const FRACTIONS: &str = "*NHS - #Fractions";
pub const MODALITY: &str = "*NHS - Modality";
pub const FLUENCE_MODE: &str = "*NHS - Fluence Mode";
pub const MEAN_BEAM_ENERGY: &str = "*NHS - MeanBeamEnergy";
pub const PRESCRIPTIONS: &str = "*NHS - Prescriptions [Gy]";
pub const AGE_AT_IMAGING: &str = "*NHS - Approx. age at imaging [years]";

const NO_SERIAL: &str = "No TDS S/N specified in plan.";
const FAILURE: &str = "FAILURE";
const DAYS_PER_YEAR: f64 = 365.2425;

/// (name, sample value, context). The sample decides the metric type.
const DERIVED_METRICS: [(&str, &str, &str); 9] = [
    (TPS_VENDOR, "VARIAN", "plan"),
    (TPS, "Eclipse v.x", "plan"),
    (TDS_SERIAL, "sn2079", "plan"),
    (FRACTIONS, "20", "plan"),
    (MODALITY, "Electrons", "plan"),
    (FLUENCE_MODE, "FFF", "plan"),
    (MEAN_BEAM_ENERGY, "6", "plan"),
    (PRESCRIPTIONS, "60/48", "plan"),
    (AGE_AT_IMAGING, "52", "image_set"),
];

#[derive(Debug, Serialize)]
struct DeriveRow {
    #[serde(rename = "PatientID")]
    patient_id: String,
    #[serde(rename = "Context")]
    context: String,
    #[serde(rename = "EntityID")]
    entity_id: String,
    #[serde(rename = "Status")]
    status: &'static str,
    #[serde(rename = "Message")]
    message: String,
}

enum EntityOutcome {
    Updated(usize),
    Skipped(&'static str),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeriveSummary {
    pub patients: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub async fn run<S: ProKnowStore>(
    session: &Session<S>,
    collection_name: &str,
    log_dir: &Path,
) -> Result<DeriveSummary> {
    let store = &session.store;
    let workspace = session.workspace.as_str();

    let collection = store
        .find_collection(workspace, collection_name)
        .await
        .with_context(|| format!("Failed finding collection {collection_name}"))?;
    let patients = store
        .collection_patients(workspace, &collection)
        .await
        .with_context(|| format!("Failed listing patients of {collection_name}"))?;

    let mut registry = MetricRegistry::new();
    let mut definitions = Definitions::new();
    for (name, sample, context) in DERIVED_METRICS {
        let (definition, outcome) = registry
            .ensure(store, name, context, sample)
            .await
            .with_context(|| format!("Failed ensuring custom metric {name}"))?;
        tracing::debug!(metric = name, ?outcome, "derived metric ready");
        definitions.insert(name.to_string(), definition);
    }

    let mut log = RowLog::<DeriveRow>::create(log_dir, "derive_metrics")?;
    println!("Writing *NHS custom metrics for patients in {collection_name}.");
    let progress = ProgressBar::new(patients.len() as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [Patients {elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }

    let mut summary = DeriveSummary::default();
    for member in &patients {
        summary.patients += 1;
        progress.inc(1);

        let patient = match store.get_patient(workspace, &member.id).await {
            Ok(patient) => patient,
            Err(err) => {
                record(&mut log, &mut summary, &member.mrn, "patient", &member.id, Err(err))?;
                continue;
            }
        };

        let birth_date = patient.birth_date.as_deref().and_then(parse_date);
        if let Some(birth_date) = birth_date {
            for image_set in patient.find_entities("image_set", None) {
                let result =
                    derive_image_set(store, workspace, &definitions, image_set, birth_date).await;
                record(&mut log, &mut summary, &patient.mrn, "image_set", &image_set.id, result)?;
            }
        }

        for plan in patient.find_entities("plan", None) {
            let result = derive_plan(store, workspace, &definitions, plan).await;
            record(&mut log, &mut summary, &patient.mrn, "plan", &plan.id, result)?;
        }

        progress.set_message(format!(
            "updated={} failed={}",
            summary.updated, summary.failed
        ));
    }

    progress.finish_with_message("done");
    println!("Done! {} rows logged to {}", log.rows(), log.path().display());
    Ok(summary)
}

fn record(
    log: &mut RowLog<DeriveRow>,
    summary: &mut DeriveSummary,
    patient_id: &str,
    context: &str,
    entity_id: &str,
    result: Result<EntityOutcome, StoreError>,
) -> Result<()> {
    let (status, message) = match result {
        Ok(EntityOutcome::Updated(count)) => {
            summary.updated += 1;
            ("updated", format!("{count} metrics written"))
        }
        Ok(EntityOutcome::Skipped(reason)) => {
            summary.skipped += 1;
            ("skipped", reason.to_string())
        }
        Err(err) => {
            summary.failed += 1;
            tracing::warn!(patient = patient_id, context, entity = entity_id, "{err}");
            ("error", err.to_string())
        }
    };
    log.write(&DeriveRow {
        patient_id: patient_id.to_string(),
        context: context.to_string(),
        entity_id: entity_id.to_string(),
        status,
        message,
    })
}

async fn derive_image_set<S: ProKnowStore>(
    store: &S,
    workspace: &str,
    definitions: &Definitions,
    summary: &EntitySummary,
    birth_date: NaiveDate,
) -> Result<EntityOutcome, StoreError> {
    let entity = store.get_entity(workspace, summary).await?;
    let Some(series_date) = entity.series_date().and_then(parse_date) else {
        return Ok(EntityOutcome::Skipped("no series date"));
    };

    let mut update = Metadata::new();
    update.insert(
        AGE_AT_IMAGING.to_string(),
        MetricValue::Number(age_at_imaging(birth_date, series_date)),
    );
    let update = conform_to_definitions(update, definitions);
    if update.is_empty() {
        return Ok(EntityOutcome::Skipped("age does not fit metric type"));
    }
    merge_metadata(store, workspace, &entity.record(), update).await?;
    Ok(EntityOutcome::Updated(1))
}

async fn derive_plan<S: ProKnowStore>(
    store: &S,
    workspace: &str,
    definitions: &Definitions,
    summary: &EntitySummary,
) -> Result<EntityOutcome, StoreError> {
    let entity = store.get_entity(workspace, summary).await?;
    let raw = store.plan_delivery(workspace, &entity.id).await?;
    let delivery: DeliveryInformation =
        serde_json::from_value(raw).map_err(|err| StoreError::Decode {
            path: format!("plan {} delivery", entity.id),
            message: err.to_string(),
        })?;

    let update = conform_to_definitions(plan_metrics(&delivery, &entity.data), definitions);
    let count = update.len();
    merge_metadata(store, workspace, &entity.record(), update).await?;
    Ok(EntityOutcome::Updated(count))
}

/// Casts each value to its metric's declared type. Values the type cannot
/// hold are dropped with a warning.
fn conform_to_definitions(update: Metadata, definitions: &Definitions) -> Metadata {
    update
        .into_iter()
        .filter_map(|(name, value)| {
            let Some(definition) = definitions.get(&name) else {
                return Some((name, value));
            };
            match conform_value(definition, value) {
                Some(value) => Some((name, value)),
                None => {
                    tracing::warn!(
                        metric = %name,
                        kind = definition.metric_type.label(),
                        "derived value does not fit metric type, skipped"
                    );
                    None
                }
            }
        })
        .collect()
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}

/// Whole years between birth and imaging, using the mean Gregorian year.
pub fn age_at_imaging(birth_date: NaiveDate, series_date: NaiveDate) -> f64 {
    let days = (series_date - birth_date).num_days() as f64;
    (days / DAYS_PER_YEAR).floor()
}

pub fn plan_metrics(delivery: &DeliveryInformation, plan_data: &Value) -> Metadata {
    let equipment = &delivery.equipment;
    let mut metrics = Metadata::new();

    metrics.insert(
        TPS_VENDOR.to_string(),
        equipment.manufacturer.clone().unwrap_or_default().into(),
    );
    metrics.insert(
        TPS.to_string(),
        equipment
            .manufacturer_model_name
            .clone()
            .unwrap_or_default()
            .into(),
    );
    let serial = equipment
        .device_serial_number
        .as_deref()
        .map(str::trim)
        .filter(|sn| !sn.is_empty())
        .unwrap_or(NO_SERIAL);
    metrics.insert(TDS_SERIAL.to_string(), serial.into());

    let fractions: f64 = delivery
        .fraction_groups
        .iter()
        .map(|fg| f64::from(fg.number_of_fractions_planned))
        .sum();
    metrics.insert(FRACTIONS.to_string(), fractions.into());

    let technique: BTreeSet<String> = delivery
        .beams
        .iter()
        .map(|beam| {
            format!(
                "{} {} {} IMRT: {} Helical: {}",
                beam.delivery_modality,
                beam.radiation_type,
                beam.delivery_modality,
                beam.is_modulated,
                beam.is_helical
            )
        })
        .collect();
    metrics.insert(MODALITY.to_string(), join(&technique).into());

    let fluence_modes: Option<BTreeSet<&str>> = delivery
        .beams
        .iter()
        .map(|beam| beam.primary_fluence_mode.as_ref().map(|f| f.mode.as_str()))
        .collect();
    let fluence = fluence_modes
        .map(|modes| modes.into_iter().collect::<Vec<_>>().join(" "))
        .unwrap_or_else(|| FAILURE.to_string());
    metrics.insert(FLUENCE_MODE.to_string(), fluence.into());

    let energies: Vec<f64> = delivery
        .beams
        .iter()
        .filter_map(|beam| beam.control_point_summary.as_ref())
        .flat_map(|summary| summary.nominal_beam_energies.iter().copied())
        .collect();
    if !energies.is_empty() {
        let mean = energies.iter().sum::<f64>() / energies.len() as f64;
        metrics.insert(MEAN_BEAM_ENERGY.to_string(), mean.into());
    }

    let prescriptions = prescriptions(plan_data).unwrap_or_else(|| FAILURE.to_string());
    metrics.insert(PRESCRIPTIONS.to_string(), prescriptions.into());

    metrics
}

fn join(items: &BTreeSet<String>) -> String {
    items.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

fn prescriptions(plan_data: &Value) -> Option<String> {
    let references = plan_data
        .pointer("/prescription/dose_references")?
        .as_array()?;
    let doses = references
        .iter()
        .map(|reference| match reference.get("prescribed_dose")? {
            Value::String(dose) => Some(dose.clone()),
            Value::Number(dose) => Some(dose.to_string()),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(doses.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        proknow::{Collection, CollectionPatient, MetricType, RecordRef},
        testing::MemoryStore,
    };
    use serde_json::json;
    use std::fs;

    fn delivery() -> Value {
        json!({
            "equipment": {
                "manufacturer": "Varian Medical Systems",
                "manufacturer_model_name": "Eclipse",
                "device_serial_number": ""
            },
            "fraction_groups": [
                {"number_of_fractions_planned": 15},
                {"number_of_fractions_planned": 5}
            ],
            "beams": [
                {
                    "delivery_modality": "VMAT",
                    "radiation_type": "PHOTON",
                    "is_modulated": true,
                    "is_helical": false,
                    "primary_fluence_mode": {"mode": "FFF"},
                    "control_point_summary": {"nominal_beam_energies": [6.0, 6.0]}
                },
                {
                    "delivery_modality": "VMAT",
                    "radiation_type": "PHOTON",
                    "is_modulated": true,
                    "is_helical": false,
                    "primary_fluence_mode": {"mode": "STANDARD"},
                    "control_point_summary": {"nominal_beam_energies": [10.0]}
                }
            ]
        })
    }

    #[test]
    fn plan_metrics_from_delivery_information() {
        let delivery: DeliveryInformation = serde_json::from_value(delivery()).unwrap();
        let plan = json!({
            "prescription": {"dose_references": [
                {"prescribed_dose": "60"},
                {"prescribed_dose": 48}
            ]}
        });

        let metrics = plan_metrics(&delivery, &plan);

        assert_eq!(metrics[TPS_VENDOR], MetricValue::from("Varian Medical Systems"));
        assert_eq!(metrics[TDS_SERIAL], MetricValue::from(NO_SERIAL));
        assert_eq!(metrics[FRACTIONS], MetricValue::Number(20.0));
        assert_eq!(
            metrics[MODALITY],
            MetricValue::from("VMAT PHOTON VMAT IMRT: true Helical: false")
        );
        assert_eq!(metrics[FLUENCE_MODE], MetricValue::from("FFF STANDARD"));
        assert_eq!(metrics[MEAN_BEAM_ENERGY], MetricValue::Number(22.0 / 3.0));
        assert_eq!(metrics[PRESCRIPTIONS], MetricValue::from("60/48"));
    }

    #[test]
    fn missing_fluence_or_prescription_is_a_failure_marker() {
        let mut raw = delivery();
        raw["beams"][1]["primary_fluence_mode"] = Value::Null;
        raw["beams"][0]["control_point_summary"] = Value::Null;
        raw["beams"][1]["control_point_summary"] = Value::Null;
        let delivery: DeliveryInformation = serde_json::from_value(raw).unwrap();

        let metrics = plan_metrics(&delivery, &json!({}));

        assert_eq!(metrics[FLUENCE_MODE], MetricValue::from(FAILURE));
        assert_eq!(metrics[PRESCRIPTIONS], MetricValue::from(FAILURE));
        assert!(!metrics.contains_key(MEAN_BEAM_ENERGY));
    }

    #[test]
    fn large_fraction_counts_do_not_overflow() {
        let mut raw = delivery();
        raw["fraction_groups"] = json!([
            {"number_of_fractions_planned": u32::MAX},
            {"number_of_fractions_planned": u32::MAX}
        ]);
        let delivery: DeliveryInformation = serde_json::from_value(raw).unwrap();

        let metrics = plan_metrics(&delivery, &json!({}));

        assert_eq!(
            metrics[FRACTIONS],
            MetricValue::Number(2.0 * f64::from(u32::MAX))
        );
    }

    #[test]
    fn age_is_whole_years() {
        let born = parse_date("1970-06-15").unwrap();
        assert_eq!(age_at_imaging(born, parse_date("2022-06-14").unwrap()), 51.0);
        assert_eq!(age_at_imaging(born, parse_date("2022-06-16").unwrap()), 52.0);
        assert!(parse_date("15/06/1970").is_none());
    }

    #[tokio::test]
    async fn collection_run_writes_plan_and_image_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new()
            .with_metric(TPS_VENDOR, "plan", MetricType::String {})
            .with_collection(
                Collection {
                    id: "c1".into(),
                    name: "My Collection".into(),
                },
                vec![CollectionPatient {
                    id: "p1".into(),
                    mrn: "123".into(),
                    entity: None,
                }],
            )
            .with_patient(json!({
                "id": "p1",
                "mrn": "123",
                "birth_date": "1970-06-15",
                "studies": [{"id": "s1", "entities": [
                    {"id": "img1", "type": "image_set", "description": "CT", "entities": [
                        {"id": "plan1", "type": "plan", "description": "PlanA"}
                    ]},
                    {"id": "img2", "type": "image_set", "description": "MR"}
                ]}]
            }))
            .with_entity(json!({
                "id": "img1",
                "type": "image_set",
                "series": {"date": "2022-06-16"}
            }))
            .with_entity(json!({"id": "img2", "type": "image_set", "series": {"date": null}}))
            .with_entity(json!({"id": "plan1", "type": "plan", "description": "PlanA"}))
            .with_delivery("plan1", delivery());
        let session = Session::new(store, "ws");

        let summary = run(&session, "My Collection", dir.path()).await.unwrap();

        assert_eq!(
            summary,
            DeriveSummary {
                patients: 1,
                updated: 2,
                skipped: 1,
                failed: 0
            }
        );
        // Only the eight metrics that did not exist yet are created.
        assert_eq!(session.store.created_metrics().len(), 8);
        assert_eq!(
            session.store.metric(FRACTIONS).unwrap().metric_type,
            MetricType::Number {}
        );

        let image = session.store.metadata(&RecordRef::Entity { id: "img1".into() });
        assert_eq!(image[AGE_AT_IMAGING], MetricValue::Number(52.0));
        let plan = session.store.metadata(&RecordRef::Entity { id: "plan1".into() });
        assert_eq!(plan[FRACTIONS], MetricValue::Number(20.0));
        assert_eq!(plan[PRESCRIPTIONS], MetricValue::from(FAILURE));

        let log_file = fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap().path();
        let text = fs::read_to_string(log_file).unwrap();
        assert!(text.starts_with("PatientID,Context,EntityID,Status,Message\n"));
        assert!(text.contains("123,image_set,img2,skipped,no series date"));
    }

    #[tokio::test]
    async fn existing_text_definitions_receive_text_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new()
            .with_metric(FRACTIONS, "plan", MetricType::String {})
            .with_metric(MEAN_BEAM_ENERGY, "plan", MetricType::String {})
            .with_metric(PRESCRIPTIONS, "plan", MetricType::Number {})
            .with_collection(
                Collection {
                    id: "c1".into(),
                    name: "My Collection".into(),
                },
                vec![CollectionPatient {
                    id: "p1".into(),
                    mrn: "123".into(),
                    entity: None,
                }],
            )
            .with_patient(json!({
                "id": "p1",
                "mrn": "123",
                "studies": [{"id": "s1", "entities": [
                    {"id": "plan1", "type": "plan", "description": "PlanA"}
                ]}]
            }))
            .with_entity(json!({"id": "plan1", "type": "plan"}))
            .with_delivery("plan1", delivery());
        let session = Session::new(store, "ws");

        let summary = run(&session, "My Collection", dir.path()).await.unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(
            session.store.metric(FRACTIONS).unwrap().metric_type,
            MetricType::String {}
        );
        let plan = session.store.metadata(&RecordRef::Entity { id: "plan1".into() });
        assert_eq!(plan[FRACTIONS], MetricValue::from("20"));
        assert!(matches!(plan[MEAN_BEAM_ENERGY], MetricValue::Text(_)));
        // "FAILURE" cannot be stored under a number definition.
        assert!(!plan.contains_key(PRESCRIPTIONS));
        assert_eq!(plan[TPS], MetricValue::from("Eclipse"));
    }

    #[tokio::test]
    async fn unknown_collection_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(MemoryStore::new(), "ws");
        assert!(run(&session, "Missing", dir.path()).await.is_err());
    }
}
