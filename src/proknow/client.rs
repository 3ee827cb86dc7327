use anyhow::{Context, Result};
use reqwest::{Client, Method, StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::{
    fs,
    path::Path,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use crate::{
    common::{is_retryable_status, next_backoff, parse_retry_after, truncate_for_log},
    constants::USER_AGENT,
    error::{ConfigError, StoreError},
};

use super::{
    model::{
        Collection, CollectionPatient, CustomMetric, Entity, EntitySummary, Metadata, MetricType,
        Patient, PatientSummary, RecordRef, Workspace,
    },
    store::ProKnowStore,
};

/// API credentials as downloaded from the ProKnow user profile page.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub id: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("id", &self.id)
            .field("secret", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.ok_or_else(|| ConfigError::NoApiKey {
            path: "<none>".into(),
        })?;
        let no_key = || ConfigError::NoApiKey {
            path: path.to_path_buf(),
        };
        let text = fs::read_to_string(path).map_err(|_| no_key())?;
        let credentials: Credentials = serde_json::from_str(&text).map_err(|_| no_key())?;
        if credentials.id.trim().is_empty() || credentials.secret.trim().is_empty() {
            return Err(no_key());
        }
        Ok(credentials)
    }
}

pub struct ProKnowClient {
    http: Client,
    api_base: String,
    credentials: Credentials,
    max_retries: u32,
    metrics: Mutex<Option<Vec<CustomMetric>>>,
}

impl ProKnowClient {
    pub fn new(base_url: &str, credentials: Credentials, max_retries: u32) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed creating HTTP client")?;
        Ok(Self {
            http,
            api_base: api_base_url(base_url),
            credentials,
            max_retries: max_retries.max(1),
            metrics: Mutex::new(None),
        })
    }

    pub async fn resolve_workspace(&self, key: &str) -> Result<Workspace, StoreError> {
        let workspaces: Vec<Workspace> = self.get_json("/workspaces", &[]).await?;
        workspaces
            .into_iter()
            .find(|ws| ws.matches(key))
            .ok_or_else(|| StoreError::not_found(format!("workspace {key}")))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, StoreError> {
        let body = self.send(Method::GET, path, query, None).await?;
        decode(path, &body)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Vec<u8>, StoreError> {
        let url = format!("{}{}", self.api_base, path);
        let attempts = self.max_retries;
        let mut backoff = Duration::from_secs(1);

        for attempt in 1..=attempts {
            tracing::debug!(%method, path, attempt, "ProKnow request");
            let mut request = self
                .http
                .request(method.clone(), &url)
                .basic_auth(&self.credentials.id, Some(&self.credentials.secret))
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }

            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt == attempts {
                        return Err(StoreError::Transport {
                            path: path.to_string(),
                            source: err,
                        });
                    }
                    tracing::warn!(path, attempt, "ProKnow request failed, retrying: {err}");
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                    continue;
                }
            };

            let status = resp.status();
            match classify(status, attempt, attempts) {
                StatusAction::Success => {
                    let bytes = resp.bytes().await.map_err(|err| StoreError::Transport {
                        path: path.to_string(),
                        source: err,
                    })?;
                    return Ok(bytes.to_vec());
                }
                StatusAction::NotFound => return Err(StoreError::not_found(path)),
                StatusAction::Denied => {
                    return Err(StoreError::PermissionDenied {
                        path: path.to_string(),
                        status,
                    });
                }
                StatusAction::Retry => {
                    let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                    tracing::warn!(path, attempt, %status, "ProKnow retryable status");
                    tokio::time::sleep(retry_after.unwrap_or(backoff)).await;
                    backoff = next_backoff(backoff);
                }
                StatusAction::Fail => {
                    let text = resp.text().await.unwrap_or_default();
                    return Err(StoreError::Status {
                        path: path.to_string(),
                        status,
                        body: truncate_for_log(&text),
                    });
                }
            }
        }

        Err(StoreError::Status {
            path: path.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "no attempts made".to_string(),
        })
    }

    fn metric_cache(&self) -> MutexGuard<'_, Option<Vec<CustomMetric>>> {
        match self.metrics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn custom_metrics(&self, refresh: bool) -> Result<Vec<CustomMetric>, StoreError> {
        if !refresh {
            if let Some(cached) = self.metric_cache().clone() {
                return Ok(cached);
            }
        }
        let metrics: Vec<CustomMetric> = self.get_json("/customMetrics", &[]).await?;
        *self.metric_cache() = Some(metrics.clone());
        Ok(metrics)
    }
}

impl ProKnowStore for ProKnowClient {
    async fn resolve_metric(&self, name: &str) -> Result<CustomMetric, StoreError> {
        for refresh in [false, true] {
            let metrics = self.custom_metrics(refresh).await?;
            if let Some(metric) = metrics.into_iter().find(|m| m.name == name) {
                return Ok(metric);
            }
        }
        Err(StoreError::not_found(format!("custom metric {name}")))
    }

    async fn create_metric(
        &self,
        name: &str,
        context: &str,
        metric_type: MetricType,
    ) -> Result<CustomMetric, StoreError> {
        let body = json!({
            "name": name,
            "context": context,
            "type": metric_type,
        });
        let bytes = self
            .send(Method::POST, "/customMetrics", &[], Some(&body))
            .await?;
        let created: CustomMetric = decode("/customMetrics", &bytes)?;
        if let Some(cached) = self.metric_cache().as_mut() {
            cached.push(created.clone());
        }
        Ok(created)
    }

    async fn lookup_patients(
        &self,
        workspace: &str,
        mrns: &[String],
    ) -> Result<Vec<PatientSummary>, StoreError> {
        let path = format!("/workspaces/{workspace}/patients/lookup");
        let body = json!(mrns);
        let bytes = self.send(Method::POST, &path, &[], Some(&body)).await?;
        let found: Vec<Option<PatientSummary>> = decode(&path, &bytes)?;
        Ok(found.into_iter().flatten().collect())
    }

    async fn get_patient(&self, workspace: &str, patient_id: &str) -> Result<Patient, StoreError> {
        let path = format!("/workspaces/{workspace}/patients/{patient_id}");
        let data: Value = self.get_json(&path, &[]).await?;
        Patient::from_value(data).map_err(|err| StoreError::Decode {
            path,
            message: err.to_string(),
        })
    }

    async fn get_entity(
        &self,
        workspace: &str,
        summary: &EntitySummary,
    ) -> Result<Entity, StoreError> {
        let segment = entity_segment(&summary.kind)
            .ok_or_else(|| StoreError::UnsupportedEntity(summary.kind.clone()))?;
        let path = format!("/workspaces/{workspace}/{segment}/{}", summary.id);
        let data: Value = self.get_json(&path, &[]).await?;
        Entity::from_value(data).map_err(|err| StoreError::Decode {
            path,
            message: err.to_string(),
        })
    }

    async fn get_metadata(
        &self,
        workspace: &str,
        record: &RecordRef,
    ) -> Result<Metadata, StoreError> {
        let path = metadata_path(workspace, record);
        let by_id: Metadata = self.get_json(&path, &[]).await?;
        let metrics = self.custom_metrics(false).await?;
        Ok(metadata_by_name(by_id, &metrics))
    }

    async fn save_metadata(
        &self,
        workspace: &str,
        record: &RecordRef,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let path = metadata_path(workspace, record);
        let metrics = self.custom_metrics(false).await?;
        let body = serde_json::to_value(metadata_by_id(metadata, &metrics)).map_err(|err| {
            StoreError::Decode {
                path: path.clone(),
                message: err.to_string(),
            }
        })?;
        self.send(Method::PUT, &path, &[], Some(&body)).await?;
        Ok(())
    }

    async fn find_collection(
        &self,
        workspace: &str,
        name: &str,
    ) -> Result<Collection, StoreError> {
        let collections: Vec<Collection> = self
            .get_json("/collections", &[("workspace", workspace)])
            .await?;
        collections
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| StoreError::not_found(format!("collection {name}")))
    }

    async fn collection_patients(
        &self,
        workspace: &str,
        collection: &Collection,
    ) -> Result<Vec<CollectionPatient>, StoreError> {
        let path = format!(
            "/collections/{}/workspaces/{workspace}/patients",
            collection.id
        );
        self.get_json(&path, &[]).await
    }

    async fn plan_delivery(&self, workspace: &str, plan_id: &str) -> Result<Value, StoreError> {
        let path = format!("/workspaces/{workspace}/plans/{plan_id}/delivery");
        self.get_json(&path, &[]).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusAction {
    Success,
    NotFound,
    Denied,
    Retry,
    Fail,
}

/// What `send` does with a response status on attempt `attempt` of `attempts`.
fn classify(status: StatusCode, attempt: u32, attempts: u32) -> StatusAction {
    if status.is_success() {
        return StatusAction::Success;
    }
    match status {
        StatusCode::NOT_FOUND => StatusAction::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StatusAction::Denied,
        _ if is_retryable_status(status) && attempt < attempts => StatusAction::Retry,
        _ => StatusAction::Fail,
    }
}

fn api_base_url(base_url: &str) -> String {
    format!("{}/api", base_url.trim().trim_end_matches('/'))
}

fn entity_segment(kind: &str) -> Option<&'static str> {
    match kind {
        "image_set" => Some("imagesets"),
        "structure_set" => Some("structuresets"),
        "plan" => Some("plans"),
        "dose" => Some("doses"),
        _ => None,
    }
}

fn metadata_path(workspace: &str, record: &RecordRef) -> String {
    format!(
        "/workspaces/{workspace}/{}/{}/metadata",
        record.collection_segment(),
        record.id()
    )
}

fn decode<T: DeserializeOwned>(path: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::Decode {
        path: path.to_string(),
        message: err.to_string(),
    })
}

// Ids with no known metric keep their raw key so a full-bag write preserves them.
fn metadata_by_name(by_id: Metadata, metrics: &[CustomMetric]) -> Metadata {
    by_id
        .into_iter()
        .map(|(key, value)| {
            let name = metrics
                .iter()
                .find(|m| m.id == key)
                .map(|m| m.name.clone())
                .unwrap_or(key);
            (name, value)
        })
        .collect()
}

fn metadata_by_id(by_name: &Metadata, metrics: &[CustomMetric]) -> Metadata {
    by_name
        .iter()
        .map(|(key, value)| {
            let id = metrics
                .iter()
                .find(|m| &m.name == key)
                .map(|m| m.id.clone())
                .unwrap_or_else(|| key.clone());
            (id, value.clone())
        })
        .collect()
}
