use crate::{
    error::{RowError, StoreError},
    proknow::{CustomMetric, Metadata, MetricValue, ProKnowStore, RecordRef, parse_finite},
};

/// Typed value for `definition`: text metrics keep the raw string, the rest
/// must parse as a finite float.
pub fn typed_value(definition: &CustomMetric, raw: &str) -> Option<MetricValue> {
    if definition.metric_type.stores_text() {
        Some(MetricValue::Text(raw.to_string()))
    } else {
        parse_finite(raw).map(MetricValue::Number)
    }
}

/// Converts an already computed value to the type `definition` declares.
/// Numbers become their decimal text for text metrics. `None` when a number
/// metric gets something that is not a finite number.
pub fn conform_value(definition: &CustomMetric, value: MetricValue) -> Option<MetricValue> {
    match value {
        MetricValue::Number(number) if definition.metric_type.stores_text() => {
            Some(MetricValue::Text(number.to_string()))
        }
        MetricValue::Number(number) => number.is_finite().then_some(MetricValue::Number(number)),
        MetricValue::Text(text) => typed_value(definition, &text),
        MetricValue::Other(_) => None,
    }
}

/// Sets one metric on `record`. Returns the value as stored.
pub async fn apply_value<S: ProKnowStore>(
    store: &S,
    workspace: &str,
    record: &RecordRef,
    definition: &CustomMetric,
    raw: &str,
    patient_id: &str,
) -> Result<MetricValue, RowError> {
    let value = typed_value(definition, raw).ok_or_else(|| RowError::InvalidValue {
        patient_id: patient_id.to_string(),
        metric: definition.name.clone(),
        value: raw.to_string(),
    })?;

    let mut update = Metadata::new();
    update.insert(definition.name.clone(), value.clone());
    merge_metadata(store, workspace, record, update)
        .await
        .map_err(|err| RowError::store(patient_id, err))?;
    Ok(value)
}

/// Overlays `update` on the record's current metadata and writes the whole
/// bag back. Concurrent edits made between the read and the write are lost.
pub async fn merge_metadata<S: ProKnowStore>(
    store: &S,
    workspace: &str,
    record: &RecordRef,
    update: Metadata,
) -> Result<Metadata, StoreError> {
    let mut metadata = store.get_metadata(workspace, record).await?;
    metadata.extend(update);
    store.save_metadata(workspace, record, &metadata).await?;
    Ok(metadata)
}
