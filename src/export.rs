use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::{
    common::write_json_pretty,
    constants::ENTITY_CONTEXTS,
    matcher::{match_entity, match_patient},
    metric::normalize_context,
    proknow::{Entity, EntitySummary, ProKnowStore, Session},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub written: usize,
    pub failed: usize,
}

impl ExportSummary {
    fn note(&mut self, label: &str, result: Result<PathBuf>) {
        match result {
            Ok(path) => {
                self.written += 1;
                tracing::debug!(path = %path.display(), "wrote {label}");
            }
            Err(err) => {
                self.failed += 1;
                tracing::warn!("export of {label} failed: {err:#}");
                println!("FAILURE: {label}");
            }
        }
    }
}

/// Selects a single entity instead of the whole patient.
#[derive(Debug, Clone, Copy)]
pub struct EntitySelector<'a> {
    pub context: &'a str,
    pub description: &'a str,
}

pub fn entity_file_name(kind: &str, id: &str) -> String {
    format!("{kind}_{id}.json")
}

pub fn delivery_file_name(plan_id: &str) -> String {
    format!("plan_delivery_info_{plan_id}.json")
}

/// Dumps raw ProKnow payloads under `out_dir`. The patient must be unique;
/// individual file failures are reported and skipped.
pub async fn run<S: ProKnowStore>(
    session: &Session<S>,
    mrn: &str,
    out_dir: &Path,
    selector: Option<EntitySelector<'_>>,
) -> Result<ExportSummary> {
    let store = &session.store;
    let workspace = session.workspace.as_str();

    let patient = match_patient(store, workspace, mrn)
        .await
        .with_context(|| format!("Failed resolving patient {mrn}"))?;
    let mut summary = ExportSummary::default();

    if let Some(selector) = selector {
        let context = normalize_context(selector.context);
        let entity = match_entity(&patient, &context, selector.description)
            .with_context(|| format!("Failed selecting entity for {mrn}"))?;
        let label = entity_label(entity);
        let result = export_entity(store, workspace, entity, out_dir).await;
        summary.note(&label, result);
        return Ok(summary);
    }

    for plan in patient.find_entities("plan", None) {
        let label = format!("{} get_delivery_info()", describe(plan));
        let result = export_delivery(store, workspace, plan, out_dir).await;
        summary.note(&label, result);
    }

    for context in ENTITY_CONTEXTS {
        for entity in patient.find_entities(context, None) {
            let label = entity_label(entity);
            let result = export_entity(store, workspace, entity, out_dir).await;
            summary.note(&label, result);
        }
    }

    let patient_path = out_dir.join(format!("{}.json", patient.mrn));
    let result = write_json_pretty(&patient_path, &patient.data).map(|_| patient_path);
    summary.note(&patient.mrn, result);

    println!(
        "Exported {} files for {} ({} failed) to {}",
        summary.written,
        mrn,
        summary.failed,
        out_dir.display()
    );
    Ok(summary)
}

async fn export_entity<S: ProKnowStore>(
    store: &S,
    workspace: &str,
    summary: &EntitySummary,
    out_dir: &Path,
) -> Result<PathBuf> {
    let entity: Entity = store.get_entity(workspace, summary).await?;
    let path = out_dir.join(entity_file_name(&entity.kind, &entity.id));
    write_json_pretty(&path, &entity.data)?;
    Ok(path)
}

async fn export_delivery<S: ProKnowStore>(
    store: &S,
    workspace: &str,
    plan: &EntitySummary,
    out_dir: &Path,
) -> Result<PathBuf> {
    let delivery = store.plan_delivery(workspace, &plan.id).await?;
    let path = out_dir.join(delivery_file_name(&plan.id));
    write_json_pretty(&path, &delivery)?;
    Ok(path)
}

fn describe(entity: &EntitySummary) -> &str {
    entity.description.as_deref().unwrap_or(entity.id.as_str())
}

fn entity_label(entity: &EntitySummary) -> String {
    format!("{} of type: {}", describe(entity), entity.kind)
}
