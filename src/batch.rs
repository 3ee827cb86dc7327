use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;

use crate::{
    constants::LOG_SEPARATOR,
    error::{ConfigError, RowError},
    matcher::{match_entity, match_patient},
    metric::{MetricRegistry, MetricRequest},
    proknow::{ProKnowStore, RecordRef, Session},
    run_log::RunLog,
    updater::apply_value,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub rows: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Reads every row of the metrics CSV. A missing file is fatal.
pub fn load_requests(csv_path: &Path) -> Result<Vec<MetricRequest>> {
    if !csv_path.is_file() {
        return Err(ConfigError::CsvNotFound {
            path: csv_path.to_path_buf(),
        }
        .into());
    }
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b',')
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_path(csv_path)
        .with_context(|| format!("Failed opening {}", csv_path.display()))?;

    let mut requests = Vec::new();
    for (index, row) in reader.deserialize::<MetricRequest>().enumerate() {
        let request = row.with_context(|| {
            format!("Failed reading row {} of {}", index + 1, csv_path.display())
        })?;
        requests.push(request);
    }
    Ok(requests)
}

pub async fn run<S: ProKnowStore>(
    session: &Session<S>,
    csv_path: &Path,
    log_dir: &Path,
) -> Result<BatchSummary> {
    let requests = load_requests(csv_path)?;
    let mut log = RunLog::create(log_dir, None)?;
    tracing::info!(
        rows = requests.len(),
        log = %log.path().display(),
        "applying custom metrics from {}",
        csv_path.display()
    );

    println!("Adding Custom Metric values to entities from csv...");
    let summary = apply_requests(session, requests, &mut log).await?;
    println!("Done!");
    println!(
        "Processed {} rows: {} succeeded, {} failed. Log: {}",
        summary.rows,
        summary.succeeded,
        summary.failed,
        log.path().display()
    );
    Ok(summary)
}

/// Processes rows in order. Row failures are logged and counted; only log
/// write failures stop the batch.
pub async fn apply_requests<S: ProKnowStore>(
    session: &Session<S>,
    requests: Vec<MetricRequest>,
    log: &mut RunLog,
) -> Result<BatchSummary> {
    let progress = ProgressBar::new(requests.len() as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [CMs {elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }

    let mut registry = MetricRegistry::new();
    let mut summary = BatchSummary::default();

    for request in requests {
        let request = request.normalized();
        summary.rows += 1;

        match process_row(session, &mut registry, &request, log).await? {
            Ok(()) => {
                summary.succeeded += 1;
                log.line(&format!(
                    "SUCCESS! {} {} with value: {} added.",
                    request.patient_id, request.metric_name, request.value
                ))?;
            }
            Err(err) => {
                summary.failed += 1;
                tracing::warn!(
                    patient = %request.patient_id,
                    metric = %request.metric_name,
                    "row skipped: {err}"
                );
                let line = if err.is_patient_level() {
                    format!(
                        "ERROR! {err} No further processing on {}",
                        request.metric_name
                    )
                } else {
                    format!("ERROR! {err}")
                };
                log.line(&line)?;
            }
        }
        log.line(LOG_SEPARATOR)?;

        progress.inc(1);
        progress.set_message(format!(
            "ok={} failed={}",
            summary.succeeded, summary.failed
        ));
    }

    progress.finish_with_message(format!(
        "done: rows={} ok={} failed={}",
        summary.rows, summary.succeeded, summary.failed
    ));
    Ok(summary)
}

// Outer error: the log could not be written. Inner error: the row failed.
async fn process_row<S: ProKnowStore>(
    session: &Session<S>,
    registry: &mut MetricRegistry,
    request: &MetricRequest,
    log: &mut RunLog,
) -> Result<Result<(), RowError>> {
    let store = &session.store;
    let workspace = session.workspace.as_str();

    let (definition, outcome) = match registry
        .ensure(store, &request.metric_name, &request.context, &request.value)
        .await
    {
        Ok(resolved) => resolved,
        Err(err) => return Ok(Err(RowError::store(&request.patient_id, err))),
    };
    for line in outcome.log_lines(&request.metric_name) {
        log.line(&line)?;
    }

    let patient = match match_patient(store, workspace, &request.patient_id).await {
        Ok(patient) => patient,
        Err(err) => return Ok(Err(err)),
    };

    let record = if request.context == "patient" {
        patient.record()
    } else {
        match match_entity(&patient, &request.context, &request.description) {
            Ok(summary) => RecordRef::Entity {
                id: summary.id.clone(),
            },
            Err(err) => return Ok(Err(err)),
        }
    };

    let result = apply_value(
        store,
        workspace,
        &record,
        &definition,
        &request.value,
        &request.patient_id,
    )
    .await
    .map(|_| ());
    Ok(result)
}
