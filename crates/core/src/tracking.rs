//! Execution tracking state machine.
//!
//! ComfyUI multiplexes progress notifications for every prompt onto the
//! same WebSocket. [`ExecutionTracker`] watches one prompt id, ignores
//! everything else, and turns the loosely ordered event stream into a
//! single [`TrackOutcome`].
//!
//! The tracker is transport-independent: callers decode frames into
//! [`ExecutionEvent`]s and pass in the instant each one was received.
//!
//! ```text
//!  NotStarted --start signal--> Running --executing(node=null)--> Done
//!      |                           |
//!      +------executing(node=null)-+----------------------------> Done
//!      +------ error / disconnect -+----------------------------> Failed
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use serde_json::Value;

/// A notification relevant to execution tracking.
///
/// Decoded defensively from the raw channel: anything the tracker does not
/// act on becomes [`ExecutionEvent::Unrecognized`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// The server began executing a prompt.
    ExecutionStart { prompt_id: String },

    /// A node started executing. `node == None` means the prompt finished.
    NodeExecuting {
        prompt_id: String,
        node: Option<String>,
    },

    /// Execution failed; `detail` is the raw error payload.
    ExecutionError { prompt_id: String, detail: Value },

    /// Any other message type. Always ignored.
    Unrecognized { kind: String },
}

impl ExecutionEvent {
    /// The prompt this event refers to, if it carries one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::ExecutionStart { prompt_id }
            | Self::NodeExecuting { prompt_id, .. }
            | Self::ExecutionError { prompt_id, .. } => Some(prompt_id),
            Self::Unrecognized { .. } => None,
        }
    }
}

/// Lifecycle of a tracked prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    NotStarted,
    Running,
    Done,
    Failed,
}

impl TrackerState {
    /// `Done` and `Failed` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Durations measured for a completed prompt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionTiming {
    /// From the moment submission was initiated until completion was
    /// observed. Includes queueing and model loading. This is the
    /// benchmark's reported metric.
    pub end_to_end: Duration,

    /// From the first start signal until completion. Zero when no start
    /// signal was seen.
    pub execution: Duration,

    /// Whether a start signal was observed before completion.
    pub start_observed: bool,
}

impl ExecutionTiming {
    pub fn end_to_end_secs(&self) -> f64 {
        self.end_to_end.as_secs_f64()
    }

    pub fn execution_secs(&self) -> f64 {
        self.execution.as_secs_f64()
    }
}

/// Why a tracked prompt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// The server sent `execution_error` for the prompt.
    Reported { detail: Value },

    /// The channel closed or errored before completion.
    Disconnected { reason: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reported { detail } => {
                let message = detail
                    .get("exception_message")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|m| !m.is_empty());
                match message {
                    Some(message) => write!(f, "server reported error: {message}"),
                    None => write!(f, "server reported error: {detail}"),
                }
            }
            Self::Disconnected { reason } => write!(f, "channel disconnected: {reason}"),
        }
    }
}

/// Terminal result of tracking one prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackOutcome {
    Completed(ExecutionTiming),
    Failed(FailureCause),
}

/// Tracks a single prompt on a single channel connection.
///
/// One tracker per submission: submitting a second prompt on the same
/// client session before this one reaches a terminal state is not
/// supported, since completion of either would be indistinguishable to
/// code that only holds one tracker.
#[derive(Debug, Clone)]
pub struct ExecutionTracker {
    prompt_id: String,
    state: TrackerState,
    submitted_at: Instant,
    started_at: Option<Instant>,
}

impl ExecutionTracker {
    /// Create a tracker for `prompt_id`.
    ///
    /// `submitted_at` is the instant the submission request was initiated;
    /// the end-to-end duration is measured from it.
    pub fn new(prompt_id: impl Into<String>, submitted_at: Instant) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            state: TrackerState::NotStarted,
            submitted_at,
            started_at: None,
        }
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// Instant of the first start signal, if any.
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Feed one event received at `at`.
    ///
    /// Returns the outcome on the transition into `Done` or `Failed`, and
    /// `None` otherwise. Once terminal, further events are ignored.
    pub fn observe(&mut self, event: &ExecutionEvent, at: Instant) -> Option<TrackOutcome> {
        if self.state.is_terminal() || event.prompt_id() != Some(self.prompt_id.as_str()) {
            return None;
        }

        match event {
            ExecutionEvent::ExecutionStart { .. }
            | ExecutionEvent::NodeExecuting { node: Some(_), .. } => {
                if self.state == TrackerState::NotStarted {
                    self.state = TrackerState::Running;
                    self.started_at = Some(at);
                }
                None
            }
            ExecutionEvent::NodeExecuting { node: None, .. } => {
                self.state = TrackerState::Done;
                Some(TrackOutcome::Completed(self.timing(at)))
            }
            ExecutionEvent::ExecutionError { detail, .. } => {
                self.state = TrackerState::Failed;
                Some(TrackOutcome::Failed(FailureCause::Reported {
                    detail: detail.clone(),
                }))
            }
            ExecutionEvent::Unrecognized { .. } => None,
        }
    }

    /// Record that the channel closed or errored.
    ///
    /// Fails the prompt unless it already reached a terminal state.
    pub fn observe_disconnect(&mut self, reason: impl Into<String>) -> Option<TrackOutcome> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = TrackerState::Failed;
        Some(TrackOutcome::Failed(FailureCause::Disconnected {
            reason: reason.into(),
        }))
    }

    fn timing(&self, finished_at: Instant) -> ExecutionTiming {
        let execution = self
            .started_at
            .map(|started| finished_at.saturating_duration_since(started))
            .unwrap_or_default();
        ExecutionTiming {
            end_to_end: finished_at.saturating_duration_since(self.submitted_at),
            execution,
            start_observed: self.started_at.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    const TRACKED: &str = "prompt-a";
    const FOREIGN: &str = "prompt-b";

    fn start(id: &str) -> ExecutionEvent {
        ExecutionEvent::ExecutionStart {
            prompt_id: id.into(),
        }
    }

    fn node(id: &str, node: &str) -> ExecutionEvent {
        ExecutionEvent::NodeExecuting {
            prompt_id: id.into(),
            node: Some(node.into()),
        }
    }

    fn done(id: &str) -> ExecutionEvent {
        ExecutionEvent::NodeExecuting {
            prompt_id: id.into(),
            node: None,
        }
    }

    fn error(id: &str) -> ExecutionEvent {
        ExecutionEvent::ExecutionError {
            prompt_id: id.into(),
            detail: json!({"exception_message": "CUDA out of memory", "node_id": "3"}),
        }
    }

    fn other(kind: &str) -> ExecutionEvent {
        ExecutionEvent::Unrecognized { kind: kind.into() }
    }

    /// Feed events spaced one second apart, starting one second after
    /// submission. Returns the first terminal outcome.
    fn run(events: &[ExecutionEvent]) -> (ExecutionTracker, Option<TrackOutcome>) {
        let t0 = Instant::now();
        let mut tracker = ExecutionTracker::new(TRACKED, t0);
        let mut outcome = None;
        for (i, event) in events.iter().enumerate() {
            let at = t0 + Duration::from_secs(i as u64 + 1);
            if let Some(o) = tracker.observe(event, at) {
                outcome.get_or_insert(o);
            }
        }
        (tracker, outcome)
    }

    #[test]
    fn completes_with_end_to_end_and_execution_durations() {
        let (tracker, outcome) = run(&[start(TRACKED), node(TRACKED, "3"), done(TRACKED)]);

        assert_eq!(tracker.state(), TrackerState::Done);
        let timing = assert_matches!(outcome, Some(TrackOutcome::Completed(t)) => t);
        assert_eq!(timing.end_to_end, Duration::from_secs(3));
        assert_eq!(timing.execution, Duration::from_secs(2));
        assert!(timing.start_observed);
    }

    #[test]
    fn node_executing_counts_as_start_signal() {
        let (tracker, outcome) = run(&[other("status"), node(TRACKED, "4"), done(TRACKED)]);

        assert_eq!(tracker.state(), TrackerState::Done);
        let timing = assert_matches!(outcome, Some(TrackOutcome::Completed(t)) => t);
        assert_eq!(timing.execution, Duration::from_secs(1));
    }

    #[test]
    fn first_start_signal_wins() {
        let t0 = Instant::now();
        let mut tracker = ExecutionTracker::new(TRACKED, t0);

        tracker.observe(&node(TRACKED, "1"), t0 + Duration::from_secs(2));
        tracker.observe(&start(TRACKED), t0 + Duration::from_secs(5));
        tracker.observe(&node(TRACKED, "2"), t0 + Duration::from_secs(6));

        assert_eq!(tracker.started_at(), Some(t0 + Duration::from_secs(2)));
        assert_eq!(tracker.state(), TrackerState::Running);
    }

    #[test]
    fn completion_without_start_reports_zero_execution_time() {
        let (_, outcome) = run(&[done(TRACKED)]);

        let timing = assert_matches!(outcome, Some(TrackOutcome::Completed(t)) => t);
        assert_eq!(timing.end_to_end, Duration::from_secs(1));
        assert_eq!(timing.execution, Duration::ZERO);
        assert!(!timing.start_observed);
    }

    #[test]
    fn error_for_tracked_prompt_fails() {
        let (tracker, outcome) = run(&[start(TRACKED), error(TRACKED), done(TRACKED)]);

        assert_eq!(tracker.state(), TrackerState::Failed);
        let cause = assert_matches!(outcome, Some(TrackOutcome::Failed(c)) => c);
        assert_matches!(cause, FailureCause::Reported { ref detail } if detail["node_id"] == "3");
        assert_eq!(cause.to_string(), "server reported error: CUDA out of memory");
    }

    #[test]
    fn error_before_any_start_fails() {
        let (tracker, outcome) = run(&[error(TRACKED)]);
        assert_eq!(tracker.state(), TrackerState::Failed);
        assert_matches!(outcome, Some(TrackOutcome::Failed(FailureCause::Reported { .. })));
    }

    #[test]
    fn foreign_events_never_change_state() {
        let foreign = [
            start(FOREIGN),
            node(FOREIGN, "7"),
            error(FOREIGN),
            done(FOREIGN),
            other("progress"),
            other("status"),
        ];

        let t0 = Instant::now();
        for initial in [vec![], vec![start(TRACKED)]] {
            let mut tracker = ExecutionTracker::new(TRACKED, t0);
            for event in &initial {
                tracker.observe(event, t0);
            }
            let before = (tracker.state(), tracker.started_at());

            for round in 0..5u64 {
                for event in foreign.iter().rev().chain(foreign.iter()) {
                    let at = t0 + Duration::from_millis(round * 10);
                    assert_eq!(tracker.observe(event, at), None);
                }
            }

            assert_eq!((tracker.state(), tracker.started_at()), before);
        }
    }

    #[test]
    fn done_appears_after_arbitrary_noise() {
        // Every prefix of noise followed by the completion signal must end in Done.
        let noise = [
            other("status"),
            start(FOREIGN),
            node(TRACKED, "1"),
            start(TRACKED),
            error(FOREIGN),
            node(TRACKED, "2"),
            done(FOREIGN),
        ];

        for len in 0..=noise.len() {
            let mut events = noise[..len].to_vec();
            events.push(done(TRACKED));
            let (tracker, outcome) = run(&events);
            assert_eq!(tracker.state(), TrackerState::Done, "prefix {len}");
            let timing = assert_matches!(outcome, Some(TrackOutcome::Completed(t)) => t);
            assert!(timing.end_to_end >= timing.execution);
        }
    }

    #[test]
    fn terminal_state_ignores_later_events() {
        let t0 = Instant::now();
        let mut tracker = ExecutionTracker::new(TRACKED, t0);
        assert!(tracker.observe(&done(TRACKED), t0).is_some());

        assert_eq!(tracker.observe(&error(TRACKED), t0), None);
        assert_eq!(tracker.observe(&done(TRACKED), t0), None);
        assert_eq!(tracker.observe_disconnect("closed"), None);
        assert_eq!(tracker.state(), TrackerState::Done);
    }

    #[test]
    fn disconnect_fails_running_prompt() {
        let t0 = Instant::now();
        let mut tracker = ExecutionTracker::new(TRACKED, t0);
        tracker.observe(&start(TRACKED), t0);

        let outcome = tracker.observe_disconnect("connection reset");
        assert_matches!(
            outcome,
            Some(TrackOutcome::Failed(FailureCause::Disconnected { ref reason })) if reason == "connection reset"
        );
        assert_eq!(tracker.state(), TrackerState::Failed);
    }

    #[test]
    fn event_received_before_submission_instant_saturates() {
        let t0 = Instant::now() + Duration::from_secs(10);
        let mut tracker = ExecutionTracker::new(TRACKED, t0);
        let outcome = tracker.observe(&done(TRACKED), t0 - Duration::from_secs(1));

        let timing = assert_matches!(outcome, Some(TrackOutcome::Completed(t)) => t);
        assert_eq!(timing.end_to_end, Duration::ZERO);
    }

    #[test]
    fn failure_cause_display_falls_back_to_raw_detail() {
        let cause = FailureCause::Reported {
            detail: json!({"node_id": "5"}),
        };
        assert_eq!(cause.to_string(), r#"server reported error: {"node_id":"5"}"#);
    }
}
