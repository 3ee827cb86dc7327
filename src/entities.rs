use anyhow::{Context, Result};
use csv::Writer;
use indicatif::{ProgressBar, ProgressStyle};
use std::{fs, path::Path};

use crate::{
    common::ensure_parent_dir,
    constants::ENTITY_CONTEXTS,
    proknow::{Patient, ProKnowStore, Session},
};

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub patient_id: String,
    pub context: String,
    pub description: String,
    pub in_collection: bool,
}

pub fn default_output_name(collection: &str) -> String {
    format!("{collection}_patient_entities.csv")
}

/// One row per plan, dose, image set and structure set of `patient`.
pub fn entity_rows(patient: &Patient, collection_entity_id: Option<&str>) -> Vec<EntityRow> {
    ENTITY_CONTEXTS
        .iter()
        .flat_map(|context| {
            patient
                .find_entities(context, None)
                .into_iter()
                .map(move |entity| EntityRow {
                    patient_id: patient.mrn.clone(),
                    context: context.to_string(),
                    description: entity.description.clone().unwrap_or_default(),
                    in_collection: collection_entity_id == Some(entity.id.as_str()),
                })
        })
        .collect()
}

pub async fn run<S: ProKnowStore>(
    session: &Session<S>,
    collection_name: &str,
    csv_out: &Path,
) -> Result<usize> {
    let store = &session.store;
    let workspace = session.workspace.as_str();

    let collection = store
        .find_collection(workspace, collection_name)
        .await
        .with_context(|| format!("Failed finding collection {collection_name}"))?;
    let members = store
        .collection_patients(workspace, &collection)
        .await
        .with_context(|| format!("Failed listing patients of {collection_name}"))?;

    println!("Getting entities for patients in collection {collection_name}.");
    let progress = ProgressBar::new(members.len() as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [Patients {elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }

    let mut rows = Vec::new();
    for member in &members {
        let patient = store
            .get_patient(workspace, &member.id)
            .await
            .with_context(|| format!("Failed fetching patient {}", member.mrn))?;
        let in_collection = member.entity.as_ref().map(|e| e.id.as_str());
        rows.extend(entity_rows(&patient, in_collection));
        progress.inc(1);
    }
    progress.finish();

    write_rows(csv_out, &rows)?;
    println!("Wrote {} entities to {}", rows.len(), csv_out.display());
    Ok(rows.len())
}

fn write_rows(csv_out: &Path, rows: &[EntityRow]) -> Result<()> {
    ensure_parent_dir(csv_out)?;
    let file_name = csv_out
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or("patient_entities.csv");
    let tmp_path = csv_out.with_file_name(format!("{file_name}.tmp"));

    let mut writer = Writer::from_path(&tmp_path)
        .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
    // Written by hand so an empty collection still gets a header.
    writer
        .write_record(["PatientID", "Context", "Description", "InCollection?"])
        .context("Failed writing entity CSV header")?;
    for row in rows {
        writer
            .write_record([
                row.patient_id.as_str(),
                row.context.as_str(),
                row.description.as_str(),
                if row.in_collection { "True" } else { "False" },
            ])
            .context("Failed writing entity CSV row")?;
    }
    writer.flush().context("Failed flushing entity CSV")?;

    fs::rename(&tmp_path, csv_out).with_context(|| {
        format!(
            "Failed moving {} to {}",
            tmp_path.display(),
            csv_out.display()
        )
    })?;
    Ok(())
}
