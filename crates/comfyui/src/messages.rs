//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`ComfyUIMessage`] enum.
//!
//! Message types this crate does not know about decode to
//! [`ComfyUIMessage::Unknown`] rather than failing, so newer server
//! versions that add message types keep working.

use comfybench_core::tracking::ExecutionEvent;
use serde::Deserialize;

/// A decoded WebSocket text frame.
#[derive(Debug, Clone)]
pub enum ComfyUIMessage {
    /// Queue depth broadcast, sent on connect and whenever the queue changes.
    Status(StatusData),
    ExecutionStart(PromptRef),
    /// Nodes whose outputs were reused from the server's cache.
    ExecutionCached(ExecutionCachedData),
    /// `node: None` marks the end of the prompt.
    Executing(ExecutingData),
    /// Sampler step counter; carries no prompt id on older servers.
    Progress(ProgressData),
    Executed(ExecutedData),
    ExecutionError(ErrorData),
    /// A `type` this crate does not model.
    Unknown { kind: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: u32,
}

/// Payload that only names a prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: u32,
    pub max: u32,
}

/// A node finished and produced output. Only the ids are kept.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    pub prompt_id: String,
}

/// Failure report. Only `prompt_id` is required; the rest of the payload
/// is kept as-is in `raw`, which the tracker stores as the failure detail.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(skip)]
    pub raw: serde_json::Value,
}

impl ErrorData {
    pub fn node_id(&self) -> Option<&str> {
        self.text_field("node_id")
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.text_field("exception_type")
    }

    pub fn exception_message(&self) -> Option<&str> {
        self.text_field("exception_message")
    }

    fn text_field(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(serde_json::Value::as_str)
    }
}

/// Outer `{type, data}` frame.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ComfyUIMessage {
    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &str {
        match self {
            Self::Status(_) => "status",
            Self::ExecutionStart(_) => "execution_start",
            Self::ExecutionCached(_) => "execution_cached",
            Self::Executing(_) => "executing",
            Self::Progress(_) => "progress",
            Self::Executed(_) => "executed",
            Self::ExecutionError(_) => "execution_error",
            Self::Unknown { kind } => kind.as_str(),
        }
    }

    /// Reduce to the subset of events the execution tracker acts on.
    pub fn into_execution_event(self) -> ExecutionEvent {
        match self {
            Self::ExecutionStart(data) => ExecutionEvent::ExecutionStart {
                prompt_id: data.prompt_id,
            },
            Self::Executing(data) => ExecutionEvent::NodeExecuting {
                prompt_id: data.prompt_id,
                node: data.node,
            },
            Self::ExecutionError(data) => ExecutionEvent::ExecutionError {
                prompt_id: data.prompt_id,
                detail: data.raw,
            },
            other => ExecutionEvent::Unrecognized {
                kind: other.kind().to_string(),
            },
        }
    }
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON, or for a known `type` whose `data`
/// does not have the expected shape. Unknown types are `Ok(Unknown)`.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let Envelope { kind, data } = serde_json::from_str(text)?;

    let message = match kind.as_str() {
        "status" => ComfyUIMessage::Status(serde_json::from_value(data)?),
        "execution_start" => ComfyUIMessage::ExecutionStart(serde_json::from_value(data)?),
        "execution_cached" => ComfyUIMessage::ExecutionCached(serde_json::from_value(data)?),
        "executing" => ComfyUIMessage::Executing(serde_json::from_value(data)?),
        "progress" => ComfyUIMessage::Progress(serde_json::from_value(data)?),
        "executed" => ComfyUIMessage::Executed(serde_json::from_value(data)?),
        "execution_error" => {
            let mut error: ErrorData = serde_json::from_value(data.clone())?;
            error.raw = data;
            ComfyUIMessage::ExecutionError(error)
        }
        _ => ComfyUIMessage::Unknown { kind: kind.clone() },
    };

    Ok(message)
}
