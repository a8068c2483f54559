//! HTTP client for the control-plane queue API.
//!
//! Thin wrapper over `/api/queue`: claim, heartbeat, terminal transitions,
//! structured events, and multipart artifact upload. Errors carry the
//! request path for context but never response bodies, which may contain
//! secret material.

use moonmind_core::artifacts::sha256_file;
use moonmind_core::types::{ClaimedJob, EventLevel};
use moonmind_core::ArtifactUpload;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub const WORKER_TOKEN_HEADER: &str = "X-MoonMind-Worker-Token";
pub const AFFINITY_KEY_HEADER: &str = "X-MoonMind-Affinity-Key";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue API unreachable at {addr}")]
    ConnectionFailed { addr: String },
    #[error("queue API request failed: {path}: HTTP {status}")]
    Http { path: String, status: u16 },
    #[error("queue API request failed: {path}: {detail}")]
    Transport { path: String, detail: String },
    #[error("invalid queue API response for {path}: {detail}")]
    InvalidResponse { path: String, detail: String },
    #[error("artifact file does not exist: {0}")]
    ArtifactMissing(String),
    #[error("artifact read failed: {0}")]
    ArtifactRead(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimRequest<'a> {
    worker_id: &'a str,
    lease_seconds: u64,
    allowed_types: &'a [String],
    worker_capabilities: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ClaimResponse {
    job: Option<ClaimedJob>,
}

/// Server response to a heartbeat; may request cooperative cancellation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub cancel_requested_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Ephemeral live-session record (optional control-plane feature).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSession {
    pub status: String,
    pub provider: String,
    #[serde(default)]
    pub read_only_endpoints: Vec<String>,
    #[serde(default)]
    pub read_write_endpoints: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Client for queue and artifact endpoints.
#[derive(Debug, Clone)]
pub struct QueueClient {
    base_url: String,
    worker_token: Option<String>,
    http: reqwest::Client,
}

impl QueueClient {
    pub fn new(base_url: &str, worker_token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            worker_token: worker_token.map(String::from),
            http: reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.worker_token {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert(WORKER_TOKEN_HEADER, value);
            }
        }
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn map_send_error(path: &str, error: &reqwest::Error) -> QueueError {
        if error.is_connect() {
            QueueError::ConnectionFailed {
                addr: error
                    .url()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| path.to_string()),
            }
        } else {
            QueueError::Transport {
                path: path.to_string(),
                detail: if error.is_timeout() {
                    "timed out".to_string()
                } else {
                    "request failed".to_string()
                },
            }
        }
    }

    async fn post_json(&self, path: &str, body: &impl Serialize) -> Result<Value> {
        let response = self
            .http
            .post(self.url(path))
            .headers(self.headers())
            .json(body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(path, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueueError::Http {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().await.map_err(|_| QueueError::InvalidResponse {
            path: path.to_string(),
            detail: "body read failed".to_string(),
        })?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| QueueError::InvalidResponse {
            path: path.to_string(),
            detail: e.to_string(),
        })
    }

    /// Claim at most one job under a lease.
    ///
    /// The caller owns the returned job until a terminal transition or lease
    /// expiry. An optional affinity key is forwarded as a header so the
    /// server can bind related jobs to one auth volume.
    pub async fn claim(
        &self,
        worker_id: &str,
        lease_seconds: u64,
        allowed_types: &[String],
        worker_capabilities: &[String],
        affinity_key: Option<&str>,
    ) -> Result<Option<ClaimedJob>> {
        let path = "/api/queue/jobs/claim";
        let body = ClaimRequest {
            worker_id,
            lease_seconds,
            allowed_types,
            worker_capabilities,
        };

        let mut request = self
            .http
            .post(self.url(path))
            .headers(self.headers())
            .json(&body);
        if let Some(key) = affinity_key {
            request = request.header(AFFINITY_KEY_HEADER, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Self::map_send_error(path, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(QueueError::Http {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        let parsed: ClaimResponse =
            response.json().await.map_err(|e| QueueError::InvalidResponse {
                path: path.to_string(),
                detail: e.to_string(),
            })?;
        Ok(parsed.job)
    }

    /// Renew the lease; the server may set `cancelRequestedAt`.
    pub async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_seconds: u64,
    ) -> Result<HeartbeatResponse> {
        let path = format!("/api/queue/jobs/{job_id}/heartbeat");
        let value = self
            .post_json(
                &path,
                &serde_json::json!({"workerId": worker_id, "leaseSeconds": lease_seconds}),
            )
            .await?;
        if value.is_null() {
            return Ok(HeartbeatResponse::default());
        }
        serde_json::from_value(value).map_err(|e| QueueError::InvalidResponse {
            path,
            detail: e.to_string(),
        })
    }

    /// Terminal: confirm cancellation acceptance.
    pub async fn ack_cancel(
        &self,
        job_id: Uuid,
        worker_id: &str,
        message: Option<&str>,
    ) -> Result<()> {
        let path = format!("/api/queue/jobs/{job_id}/ack-cancel");
        let mut body = serde_json::json!({"workerId": worker_id});
        if let Some(message) = message {
            body["message"] = Value::String(message.to_string());
        }
        self.post_json(&path, &body).await.map(|_| ())
    }

    /// Terminal: success.
    pub async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result_summary: Option<&str>,
    ) -> Result<()> {
        let path = format!("/api/queue/jobs/{job_id}/complete");
        let mut body = serde_json::json!({"workerId": worker_id});
        if let Some(summary) = result_summary {
            body["resultSummary"] = Value::String(summary.to_string());
        }
        self.post_json(&path, &body).await.map(|_| ())
    }

    /// Terminal: failure. The caller redacts `error_message` first.
    pub async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error_message: &str,
        retryable: bool,
    ) -> Result<()> {
        let path = format!("/api/queue/jobs/{job_id}/fail");
        self.post_json(
            &path,
            &serde_json::json!({
                "workerId": worker_id,
                "errorMessage": error_message,
                "retryable": retryable,
            }),
        )
        .await
        .map(|_| ())
    }

    /// Append a structured log event. Callers treat failures as best-effort.
    pub async fn append_event(
        &self,
        job_id: Uuid,
        worker_id: &str,
        level: EventLevel,
        message: &str,
        payload: Option<&Value>,
    ) -> Result<()> {
        let path = format!("/api/queue/jobs/{job_id}/events");
        let mut body = serde_json::json!({
            "workerId": worker_id,
            "level": level.as_str(),
            "message": message,
        });
        if let Some(payload) = payload {
            body["payload"] = payload.clone();
        }
        self.post_json(&path, &body).await.map(|_| ())
    }

    /// Multipart upload of a staged artifact with a SHA-256 digest.
    pub async fn upload_artifact(
        &self,
        job_id: Uuid,
        worker_id: &str,
        artifact: &ArtifactUpload,
    ) -> Result<()> {
        if !artifact.path.exists() {
            return Err(QueueError::ArtifactMissing(
                artifact.path.display().to_string(),
            ));
        }

        let digest = match &artifact.digest {
            Some(digest) => digest.clone(),
            None => sha256_file(&artifact.path)
                .map_err(|e| QueueError::ArtifactRead(e.to_string()))?,
        };
        let bytes = tokio::fs::read(&artifact.path)
            .await
            .map_err(|e| QueueError::ArtifactRead(e.to_string()))?;

        let file_name = artifact
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let content_type = artifact
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(&content_type)
            .map_err(|e| QueueError::ArtifactRead(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .text("name", artifact.name.clone())
            .text("workerId", worker_id.to_string())
            .text("digest", digest);
        if artifact.content_type.is_some() {
            form = form.text("contentType", content_type);
        }
        form = form.part("file", part);

        let path = format!("/api/queue/jobs/{job_id}/artifacts/upload");
        let response = self
            .http
            .post(self.url(&path))
            .headers(self.headers())
            .multipart(form)
            .send()
            .await
            .map_err(|e| Self::map_send_error(&path, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(QueueError::Http {
                path,
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Report a live session attached to a running job.
    pub async fn report_live_session(&self, job_id: Uuid, session: &LiveSession) -> Result<()> {
        let path = format!("/api/queue/jobs/{job_id}/live-session");
        self.post_json(&path, session).await.map(|_| ())
    }

    /// Keep a reported live session alive.
    pub async fn heartbeat_live_session(&self, job_id: Uuid) -> Result<()> {
        let path = format!("/api/queue/jobs/{job_id}/live-session/heartbeat");
        self.post_json(&path, &serde_json::json!({})).await.map(|_| ())
    }

    /// Fetch the current live session, if any.
    pub async fn get_live_session(&self, job_id: Uuid) -> Result<Option<LiveSession>> {
        let path = format!("/api/queue/jobs/{job_id}/live-session");
        let response = self
            .http
            .get(self.url(&path))
            .headers(self.headers())
            .send()
            .await
            .map_err(|e| Self::map_send_error(&path, &e))?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            return Err(QueueError::Http {
                path,
                status: status.as_u16(),
            });
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| QueueError::InvalidResponse {
                path,
                detail: e.to_string(),
            })
    }

    /// Submit a follow-up task proposal derived from a finished job.
    pub async fn create_task_proposal(&self, proposal: &Value) -> Result<Value> {
        self.post_json("/api/queue/task-proposals", proposal).await
    }
}
