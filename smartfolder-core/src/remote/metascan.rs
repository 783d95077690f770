use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{RemoteError, ScanService};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, ScanError};
use crate::types::{RemoteId, ScanResult};

pub const DEFAULT_BASE_URL: &str = "https://api.metascan-online.com/v1/file";

/// Public page showing the per-engine report for an uploaded file.
pub const RESULT_PAGE_BASE: &str = "https://www.metascan-online.com/en/scanresult/file";

const API_KEY_HEADER: &str = "apikey";
const FILE_NAME_HEADER: &str = "filename";

/// HTTP client for the Metascan Online v1 file API.
pub struct MetascanClient {
    http: reqwest::Client,
    base_url: String,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for MetascanClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetascanClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl MetascanClient {
    /// Build a client. `timeout` bounds every request; `None` leaves the
    /// transport defaults in place.
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ScanError::InvalidConfig(
                "remote base url must not be empty".to_string(),
            ));
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|err| ScanError::Internal(format!("failed to build http client: {err}")))?;

        Ok(Self {
            http,
            base_url,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Link to the human-readable report for `remote_id`.
    pub fn result_url(remote_id: &RemoteId) -> String {
        format!("{RESULT_PAGE_BASE}/{}", remote_id.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    data_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    scan_results: Option<ScanResultsPayload>,
}

#[derive(Debug, Deserialize)]
struct ScanResultsPayload {
    in_queue: Option<Value>,
    progress_percentage: Option<Value>,
    scan_all_result_i: Option<Value>,
    scan_all_result_a: Option<Value>,
}

/// Status classification shared by both calls: 200 passes, 401 is a
/// credential rejection, everything else is transient.
fn check_status(status: StatusCode) -> std::result::Result<(), RemoteError> {
    match status {
        StatusCode::OK => Ok(()),
        StatusCode::UNAUTHORIZED => Err(RemoteError::Unauthorized),
        other => Err(RemoteError::Status(other.as_u16())),
    }
}

/// The service has been seen returning numbers both as JSON numbers and as
/// numeric strings.
fn int_field(value: Option<&Value>, name: &str) -> std::result::Result<i64, RemoteError> {
    let parsed = match value {
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| RemoteError::Malformed(format!("missing or non-numeric `{name}`")))
}

fn text_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn parse_submit(body: &str) -> std::result::Result<RemoteId, RemoteError> {
    let response: SubmitResponse = serde_json::from_str(body)
        .map_err(|err| RemoteError::Malformed(format!("submit response: {err}")))?;
    let raw = match response.data_id {
        Some(Value::String(id)) => id,
        Some(Value::Number(id)) => id.to_string(),
        _ => String::new(),
    };
    RemoteId::new(raw).ok_or_else(|| RemoteError::Malformed("empty data_id".to_string()))
}

fn parse_poll(
    body: &str,
    observed_at: chrono::DateTime<chrono::Utc>,
) -> std::result::Result<ScanResult, RemoteError> {
    let response: PollResponse = serde_json::from_str(body)
        .map_err(|err| RemoteError::Malformed(format!("poll response: {err}")))?;
    let payload = response
        .scan_results
        .ok_or_else(|| RemoteError::Malformed("missing `scan_results`".to_string()))?;

    Ok(ScanResult {
        queue_position: int_field(payload.in_queue.as_ref(), "in_queue")?,
        progress_percent: int_field(payload.progress_percentage.as_ref(), "progress_percentage")?,
        result_code: int_field(payload.scan_all_result_i.as_ref(), "scan_all_result_i")?,
        result_label: text_field(payload.scan_all_result_a.as_ref()),
        observed_at,
    })
}

#[async_trait]
impl ScanService for MetascanClient {
    async fn submit(
        &self,
        contents: Vec<u8>,
        file_name: &str,
        credential: &str,
    ) -> std::result::Result<RemoteId, RemoteError> {
        let size = contents.len();
        let response = self
            .http
            .post(&self.base_url)
            .header(API_KEY_HEADER, credential)
            .header(FILE_NAME_HEADER, file_name)
            .body(contents)
            .send()
            .await?;

        check_status(response.status())?;
        let body = response.text().await?;
        let remote_id = parse_submit(&body)?;
        debug!(target: "smartfolder::upload", file_name, size, remote_id = %remote_id, "upload accepted");
        Ok(remote_id)
    }

    async fn poll(
        &self,
        remote_id: &RemoteId,
        credential: &str,
    ) -> std::result::Result<ScanResult, RemoteError> {
        let url = format!("{}/{}", self.base_url, remote_id.as_str());
        let response = self
            .http
            .get(url)
            .header(API_KEY_HEADER, credential)
            .send()
            .await?;

        check_status(response.status())?;
        let body = response.text().await?;
        parse_poll(&body, self.clock.now())
    }
}
