//! WebSocket frame processing for one tracked prompt.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants, and feeds the events into an
//! [`ExecutionTracker`] until it reaches a terminal state.

use std::time::Instant;

use comfybench_core::tracking::{ExecutionTracker, FailureCause, TrackOutcome};
use futures::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::messages::{parse_message, ComfyUIMessage};

const STREAM_ENDED: &str = "WebSocket stream ended";

/// Drive `tracker` from `stream` until the prompt completes or fails.
///
/// Blocks for as long as the server keeps the connection open without
/// finishing the prompt; there is no timeout. A closed or erroring
/// stream fails the prompt.
///
/// `tracker` must not already be in a terminal state.
pub async fn track_execution<S>(stream: &mut S, tracker: &mut ExecutionTracker) -> TrackOutcome
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        if let Some(outcome) = apply_frame(tracker, frame, Instant::now()) {
            return outcome;
        }
    }
    stream_ended(tracker)
}

/// Apply a single received frame, stamped with its arrival time.
pub fn apply_frame(
    tracker: &mut ExecutionTracker,
    frame: Result<Message, WsError>,
    received_at: Instant,
) -> Option<TrackOutcome> {
    match frame {
        Ok(Message::Text(text)) => handle_text_message(tracker, &text, received_at),
        Ok(Message::Binary(_)) => {
            // Preview images.
            tracing::trace!("Ignoring binary message (preview image)");
            None
        }
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Ok(Message::Close(frame)) => {
            let reason = match frame {
                Some(frame) => format!(
                    "closed by server (code {}): {}",
                    u16::from(frame.code),
                    frame.reason
                ),
                None => "closed by server".to_string(),
            };
            tracing::info!(prompt_id = %tracker.prompt_id(), %reason, "ComfyUI WebSocket closed");
            tracker.observe_disconnect(reason)
        }
        Err(e) => {
            tracing::error!(prompt_id = %tracker.prompt_id(), error = %e, "WebSocket receive error");
            tracker.observe_disconnect(e.to_string())
        }
    }
}

/// Fail the tracker because the stream produced no more frames.
pub fn stream_ended(tracker: &mut ExecutionTracker) -> TrackOutcome {
    tracing::warn!(prompt_id = %tracker.prompt_id(), "{STREAM_ENDED} before the prompt finished");
    tracker
        .observe_disconnect(STREAM_ENDED)
        .unwrap_or_else(|| {
            TrackOutcome::Failed(FailureCause::Disconnected {
                reason: STREAM_ENDED.to_string(),
            })
        })
}

/// Parse one text frame, log it, and feed it to the tracker.
fn handle_text_message(
    tracker: &mut ExecutionTracker,
    text: &str,
    received_at: Instant,
) -> Option<TrackOutcome> {
    match parse_message(text) {
        Ok(msg) => {
            log_message(&msg, tracker.prompt_id());
            tracker.observe(&msg.into_execution_event(), received_at)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse ComfyUI message",
            );
            None
        }
    }
}

// ---- logging ----

fn log_message(msg: &ComfyUIMessage, tracked: &str) {
    match msg {
        ComfyUIMessage::Progress(data) => {
            let percent = if data.max > 0 {
                ((f64::from(data.value) / f64::from(data.max)) * 100.0) as i16
            } else {
                0
            };
            tracing::debug!(value = data.value, max = data.max, percent, "Generation progress");
        }
        ComfyUIMessage::ExecutionStart(data) if data.prompt_id == tracked => {
            tracing::debug!(prompt_id = %data.prompt_id, "Execution started");
        }
        ComfyUIMessage::Executing(data) if data.prompt_id == tracked => match &data.node {
            Some(node) => tracing::debug!(prompt_id = %data.prompt_id, node = %node, "Executing node"),
            None => tracing::debug!(prompt_id = %data.prompt_id, "Execution completed (all nodes done)"),
        },
        ComfyUIMessage::Executed(data) if data.prompt_id == tracked => {
            tracing::debug!(prompt_id = %data.prompt_id, node = %data.node, "Node executed with output");
        }
        ComfyUIMessage::ExecutionCached(data) if data.prompt_id == tracked => {
            tracing::debug!(prompt_id = %data.prompt_id, cached = data.nodes.len(), "Execution used cache");
        }
        ComfyUIMessage::ExecutionError(data) if data.prompt_id == tracked => {
            tracing::error!(
                prompt_id = %data.prompt_id,
                node_id = data.node_id().unwrap_or("?"),
                error_type = data.exception_type().unwrap_or("?"),
                error_message = data.exception_message().unwrap_or("?"),
                "Execution error",
            );
        }
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
        }
        ComfyUIMessage::Unknown { kind } => {
            tracing::trace!(kind = %kind, "Ignoring unrecognized message type");
        }
        other => {
            tracing::trace!(kind = other.kind(), "Ignoring message for another prompt");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use comfybench_core::tracking::TrackerState;
    use futures::stream;

    use super::*;

    fn text(json: &str) -> Result<Message, WsError> {
        Ok(Message::Text(json.to_string()))
    }

    #[tokio::test]
    async fn completes_on_null_node_for_tracked_prompt() {
        let mut frames = stream::iter(vec![
            text(r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":1}}}}"#),
            text(r#"{"type":"execution_start","data":{"prompt_id":"mine"}}"#),
            Ok(Message::Binary(vec![0, 1, 2])),
            text(r#"{"type":"executing","data":{"node":null,"prompt_id":"other"}}"#),
            text(r#"{"type":"executing","data":{"node":"3","prompt_id":"mine"}}"#),
            text(r#"{"type":"progress","data":{"value":10,"max":20}}"#),
            text(r#"{"type":"executing","data":{"node":null,"prompt_id":"mine"}}"#),
            text(r#"{"type":"execution_error","data":{"prompt_id":"mine"}}"#),
        ]);
        let mut tracker = ExecutionTracker::new("mine", Instant::now());

        let outcome = track_execution(&mut frames, &mut tracker).await;

        let timing = assert_matches!(outcome, TrackOutcome::Completed(t) => t);
        assert!(timing.start_observed);
        assert!(timing.end_to_end >= timing.execution);
        assert_eq!(tracker.state(), TrackerState::Done);
    }

    #[tokio::test]
    async fn fails_on_execution_error() {
        let mut frames = stream::iter(vec![
            text(r#"{"type":"execution_start","data":{"prompt_id":"mine"}}"#),
            text(r#"{"type":"execution_error","data":{"prompt_id":"mine","node_id":"8","exception_message":"bad vae","exception_type":"ValueError"}}"#),
        ]);
        let mut tracker = ExecutionTracker::new("mine", Instant::now());

        let outcome = track_execution(&mut frames, &mut tracker).await;

        let cause = assert_matches!(outcome, TrackOutcome::Failed(c) => c);
        assert_eq!(cause.to_string(), "server reported error: bad vae");
    }

    #[tokio::test]
    async fn execution_error_with_null_fields_still_fails_the_run() {
        let mut frames = stream::iter(vec![
            text(r#"{"type":"execution_error","data":{"prompt_id":"mine","node_id":null,"exception_message":"boom"}}"#),
            // Ignored once the run has failed.
            text(r#"{"type":"executing","data":{"node":null,"prompt_id":"mine"}}"#),
        ]);
        let mut tracker = ExecutionTracker::new("mine", Instant::now());

        let outcome = track_execution(&mut frames, &mut tracker).await;

        let cause = assert_matches!(outcome, TrackOutcome::Failed(c) => c);
        assert_matches!(cause, FailureCause::Reported { ref detail } if detail["node_id"].is_null());
        assert_eq!(cause.to_string(), "server reported error: boom");
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let mut frames = stream::iter(vec![
            text("garbage"),
            text(r#"{"type":"executing","data":{"node":"1"}}"#),
            text(r#"{"type":"brand_new_event","data":{"prompt_id":"mine"}}"#),
            text(r#"{"type":"executing","data":{"node":null,"prompt_id":"mine"}}"#),
        ]);
        let mut tracker = ExecutionTracker::new("mine", Instant::now());

        let outcome = track_execution(&mut frames, &mut tracker).await;

        let timing = assert_matches!(outcome, TrackOutcome::Completed(t) => t);
        assert!(!timing.start_observed);
        assert_eq!(timing.execution, Duration::ZERO);
    }

    #[tokio::test]
    async fn stream_end_fails_the_prompt() {
        let mut frames = stream::iter(vec![text(
            r#"{"type":"execution_start","data":{"prompt_id":"mine"}}"#,
        )]);
        let mut tracker = ExecutionTracker::new("mine", Instant::now());

        let outcome = track_execution(&mut frames, &mut tracker).await;

        assert_matches!(outcome, TrackOutcome::Failed(FailureCause::Disconnected { .. }));
        assert_eq!(tracker.state(), TrackerState::Failed);
    }

    #[tokio::test]
    async fn close_frame_fails_the_prompt() {
        let mut frames = stream::iter(vec![
            Ok(Message::Close(None)),
            text(r#"{"type":"executing","data":{"node":null,"prompt_id":"mine"}}"#),
        ]);
        let mut tracker = ExecutionTracker::new("mine", Instant::now());

        let outcome = track_execution(&mut frames, &mut tracker).await;

        assert_matches!(
            outcome,
            TrackOutcome::Failed(FailureCause::Disconnected { ref reason }) if reason == "closed by server"
        );
    }

    #[test]
    fn backlogged_frames_keep_their_arrival_time() {
        let t0 = Instant::now();
        let mut tracker = ExecutionTracker::new("mine", t0);

        let start = text(r#"{"type":"execution_start","data":{"prompt_id":"mine"}}"#);
        let done = text(r#"{"type":"executing","data":{"node":null,"prompt_id":"mine"}}"#);

        assert!(apply_frame(&mut tracker, start, t0 + Duration::from_millis(100)).is_none());
        let outcome = apply_frame(&mut tracker, done, t0 + Duration::from_millis(400));

        let timing = assert_matches!(outcome, Some(TrackOutcome::Completed(t)) => t);
        assert_eq!(timing.end_to_end, Duration::from_millis(400));
        assert_eq!(timing.execution, Duration::from_millis(300));
    }
}
