use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to the ProKnow API.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{what} not found")]
    NotFound { what: String },

    #[error("permission denied for {path} ({status})")]
    PermissionDenied { path: String, status: StatusCode },

    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned {status}: {body}")]
    Status {
        path: String,
        status: StatusCode,
        body: String,
    },

    #[error("invalid response from {path}: {message}")]
    Decode { path: String, message: String },

    #[error("entity type '{0}' is not supported")]
    UnsupportedEntity(String),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Row-level failures. These are logged and the batch moves on.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("PatientID: {patient_id} not found.")]
    PatientNotFound { patient_id: String },

    #[error("PatientID: {patient_id} not unique.")]
    PatientIdNotUnique { patient_id: String },

    #[error("{patient_id} No {context} with description: {description}")]
    EntityNotFound {
        patient_id: String,
        context: String,
        description: String,
    },

    #[error("{patient_id} {context} with description: {description} is not unique!")]
    EntityNotUnique {
        patient_id: String,
        context: String,
        description: String,
    },

    #[error("{patient_id} value: {value} is not a number for {metric}")]
    InvalidValue {
        patient_id: String,
        metric: String,
        value: String,
    },

    #[error("{patient_id} {source}")]
    Store {
        patient_id: String,
        #[source]
        source: StoreError,
    },
}

impl RowError {
    pub fn store(patient_id: &str, source: StoreError) -> Self {
        Self::Store {
            patient_id: patient_id.to_string(),
            source,
        }
    }

    /// Whether the failure happened before a single patient was pinned down.
    pub fn is_patient_level(&self) -> bool {
        matches!(
            self,
            Self::PatientNotFound { .. } | Self::PatientIdNotUnique { .. }
        )
    }
}

/// Startup failures. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No API key provided (credentials file: {path})")]
    NoApiKey { path: PathBuf },

    #[error("CSV file not found: {path}")]
    CsvNotFound { path: PathBuf },

    #[error("workspace '{0}' not found")]
    WorkspaceNotFound(String),
}
