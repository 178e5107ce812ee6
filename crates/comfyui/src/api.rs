//! HTTP side of the ComfyUI protocol.
//!
//! Three endpoints are used: `POST /prompt` to queue a workflow,
//! `GET /history/{prompt_id}` to inspect a finished prompt, and `GET /`
//! as the readiness probe.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP client for one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    http: reqwest::Client,
    base_url: String,
}

/// Body of `POST /prompt`.
#[derive(Debug, Serialize)]
struct PromptRequest<'a> {
    prompt: &'a Value,
    client_id: &'a str,
}

/// What `/prompt` answers once a workflow has been queued.
#[derive(Debug, Deserialize)]
pub struct QueuedPrompt {
    pub prompt_id: String,
    /// Queue number; older servers omit it.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation problems that did not prevent queueing.
    #[serde(default)]
    pub node_errors: Value,
}

/// Errors from the HTTP endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Transport failure, timeout, or an undecodable body.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with an unexpected status.
    #[error("ComfyUI returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl ComfyUIApiError {
    /// Whether the server could not be reached at all, as opposed to
    /// answering with something unusable.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Request(e) => e.is_connect() || e.is_timeout(),
            Self::Status { .. } => false,
        }
    }
}

impl ComfyUIApi {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:8000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Share an existing connection pool.
    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn api_url(&self) -> &str {
        &self.base_url
    }

    /// Queue `workflow` under `client_id`. Progress events for it are
    /// then delivered to the WebSocket session with that id.
    pub async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<QueuedPrompt, ComfyUIApiError> {
        let response = self
            .http
            .post(self.endpoint("prompt"))
            .json(&PromptRequest {
                prompt: workflow,
                client_id,
            })
            .send()
            .await?;

        let queued: QueuedPrompt = read_json(response).await?;
        if queued.node_errors.as_object().is_some_and(|errors| !errors.is_empty()) {
            tracing::warn!(
                prompt_id = %queued.prompt_id,
                node_errors = %queued.node_errors,
                "Workflow queued with node errors",
            );
        }
        Ok(queued)
    }

    /// History entry for `prompt_id`: outputs, status messages and
    /// per-node timing, keyed by prompt id.
    pub async fn get_history(&self, prompt_id: &str) -> Result<Value, ComfyUIApiError> {
        let response = self
            .http
            .get(self.endpoint(&format!("history/{prompt_id}")))
            .send()
            .await?;
        read_json(response).await
    }

    /// One readiness probe. Only `200 OK` counts as ready.
    pub async fn check_health(&self, timeout: Duration) -> Result<(), ComfyUIApiError> {
        let response = self.http.get(&self.base_url).timeout(timeout).send().await?;
        match response.status() {
            reqwest::StatusCode::OK => Ok(()),
            status => Err(ComfyUIApiError::Status {
                status: status.as_u16(),
                body: String::new(),
            }),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

/// Decode a 2xx JSON body; anything else becomes [`ComfyUIApiError::Status`]
/// carrying the body text for diagnostics.
async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ComfyUIApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(ComfyUIApiError::Status {
        status: status.as_u16(),
        body,
    })
}
