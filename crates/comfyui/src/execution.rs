//! Submit one workflow and wait for it to finish.
//!
//! [`execute_workflow`] opens a fresh WebSocket session, submits the
//! workflow on it, and tracks the returned prompt to completion. The
//! socket is connected before the submission is sent, and frames that
//! arrive while the submission request is still in flight are buffered
//! with their arrival time, so a prompt that finishes before `/prompt`
//! returns is still observed correctly.

use std::time::Instant;

use comfybench_core::tracking::{ExecutionTiming, ExecutionTracker, FailureCause, TrackOutcome};
use comfybench_core::workflow::WorkflowDocument;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::{ComfyUIClient, ComfyUIClientError, ComfyUIConnection};
use crate::tracker::{apply_frame, stream_ended, track_execution};

/// A completed execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Session the prompt was submitted under.
    pub client_id: String,
    /// Server-assigned prompt id.
    pub prompt_id: String,
    pub timing: ExecutionTiming,
}

/// Errors from a single workflow execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The event channel could not be opened.
    #[error("Failed to open event channel: {0}")]
    Connection(#[from] ComfyUIClientError),

    /// `/prompt` rejected the workflow or returned an unusable response.
    #[error("Failed to submit workflow: {0}")]
    Submission(#[source] ComfyUIApiError),

    /// The prompt was accepted but did not complete.
    #[error("Prompt {prompt_id} failed: {cause}")]
    Failed {
        prompt_id: String,
        cause: FailureCause,
    },
}

/// Execute `workflow` on the server behind `client`/`api` and measure it.
///
/// The end-to-end duration runs from just before the submission request
/// is sent until the completion message is received.
pub async fn execute_workflow(
    client: &ComfyUIClient,
    api: &ComfyUIApi,
    workflow: &WorkflowDocument,
) -> Result<ExecutionReport, ExecutionError> {
    let ComfyUIConnection {
        client_id,
        mut ws_stream,
    } = client.connect().await?;

    let submitted_at = Instant::now();
    let mut backlog: Vec<(Instant, Result<Message, WsError>)> = Vec::new();
    let mut channel_open = true;

    let submission = {
        let submit = api.submit_workflow(workflow.as_value(), &client_id);
        tokio::pin!(submit);
        loop {
            tokio::select! {
                result = &mut submit => break result,
                frame = ws_stream.next(), if channel_open => match frame {
                    Some(frame) => backlog.push((Instant::now(), frame)),
                    None => channel_open = false,
                },
            }
        }
    };

    let response = match submission {
        Ok(response) => response,
        Err(e) => {
            let _ = ws_stream.close(None).await;
            return Err(ExecutionError::Submission(e));
        }
    };

    tracing::info!(
        prompt_id = %response.prompt_id,
        client_id = %client_id,
        queue_position = response.number,
        "Workflow submitted",
    );

    let mut tracker = ExecutionTracker::new(response.prompt_id.clone(), submitted_at);

    let mut outcome = None;
    for (received_at, frame) in backlog {
        outcome = apply_frame(&mut tracker, frame, received_at);
        if outcome.is_some() {
            break;
        }
    }
    let outcome = match outcome {
        Some(outcome) => outcome,
        None if !channel_open => stream_ended(&mut tracker),
        None => track_execution(&mut ws_stream, &mut tracker).await,
    };

    let _ = ws_stream.close(None).await;

    match outcome {
        TrackOutcome::Completed(timing) => {
            if !timing.start_observed {
                tracing::warn!(
                    prompt_id = %response.prompt_id,
                    "Completion observed without a preceding start signal",
                );
            }
            tracing::info!(
                prompt_id = %response.prompt_id,
                elapsed_secs = timing.end_to_end_secs(),
                execution_secs = timing.execution_secs(),
                "Execution finished",
            );
            Ok(ExecutionReport {
                client_id,
                prompt_id: response.prompt_id,
                timing,
            })
        }
        TrackOutcome::Failed(cause) => {
            if matches!(cause, FailureCause::Reported { .. }) {
                log_history(api, &response.prompt_id).await;
            }
            Err(ExecutionError::Failed {
                prompt_id: response.prompt_id,
                cause,
            })
        }
    }
}

/// Dump the server's history entry for a failed prompt at debug level.
async fn log_history(api: &ComfyUIApi, prompt_id: &str) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    match api.get_history(prompt_id).await {
        Ok(history) => tracing::debug!(prompt_id, history = %history, "Execution history"),
        Err(e) => tracing::debug!(prompt_id, error = %e, "Failed to fetch execution history"),
    }
}
