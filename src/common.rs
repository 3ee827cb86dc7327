use anyhow::{Context, Result};
use chrono::Local;
use reqwest::StatusCode;
use serde::Serialize;
use std::{
    fs::{self, File},
    io::Write,
    path::Path,
    time::Duration,
};

pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let value = value?.to_str().ok()?.trim();
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

pub fn next_backoff(backoff: Duration) -> Duration {
    (backoff + backoff).min(Duration::from_secs(60))
}

pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_len = 300usize;
    if trimmed.len() <= max_len {
        trimmed.to_string()
    } else {
        let mut cut = max_len;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &trimmed[..cut])
    }
}

/// Local wall-clock stamp used in output file names.
pub fn file_timestamp() -> String {
    Local::now().format("%Y-%m-%d-%H-%M-%S").to_string()
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating directory {}", parent.display()))?;
    }
    Ok(())
}

/// Writes `value` as JSON indented with four spaces.
pub fn write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent_dir(path)?;
    let mut file =
        File::create(path).with_context(|| format!("Failed creating {}", path.display()))?;
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut file, formatter);
    value
        .serialize(&mut serializer)
        .with_context(|| format!("Failed serializing JSON to {}", path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("Failed writing {}", path.display()))?;
    Ok(())
}
