use std::path::PathBuf;
use std::time::Duration;

use comfybench_comfyui::execution::ExecutionError;

/// Errors that end a single (workflow, config) measurement round.
///
/// The orchestrator turns the run failures ([`is_run_failure`]) into a
/// failed result record; everything else either skips the round or
/// aborts the batch, depending on the skip-errors policy.
///
/// [`is_run_failure`]: BenchError::is_run_failure
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    /// The server's HTTP or WebSocket endpoint could not be reached.
    #[error("Server unreachable: {0}")]
    Connection(String),

    /// The server rejected the submission or answered with garbage.
    #[error("Submission failed: {0}")]
    Submission(String),

    /// The prompt was accepted but reported an error or lost its channel.
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// The health check never succeeded.
    #[error("Server did not become ready within {}s", .0.as_secs())]
    ServerStartupTimeout(Duration),

    /// The server process could not be spawned.
    #[error("Failed to start server: {0}")]
    ServerLaunch(#[source] std::io::Error),

    /// A workflow file is unreadable or not a workflow document.
    #[error("Invalid workflow {}: {reason}", .path.display())]
    Workflow { path: PathBuf, reason: String },

    /// Ctrl+C was received.
    #[error("Interrupted")]
    Interrupted,
}

impl BenchError {
    /// Whether this error means the measurement itself failed, as opposed
    /// to the round never getting to measure.
    pub fn is_run_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Submission(_) | Self::ExecutionFailure(_)
        )
    }
}

impl From<ExecutionError> for BenchError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Connection(e) => Self::Connection(e.to_string()),
            ExecutionError::Submission(e) if e.is_unreachable() => Self::Connection(e.to_string()),
            ExecutionError::Submission(e) => Self::Submission(e.to_string()),
            failed @ ExecutionError::Failed { .. } => Self::ExecutionFailure(failed.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use comfybench_core::tracking::FailureCause;

    use super::*;

    #[test]
    fn run_failures_are_classified() {
        assert!(BenchError::Connection("refused".into()).is_run_failure());
        assert!(BenchError::ExecutionFailure("oom".into()).is_run_failure());
        assert!(!BenchError::ServerStartupTimeout(Duration::from_secs(60)).is_run_failure());
        assert!(!BenchError::Interrupted.is_run_failure());
    }

    #[test]
    fn failed_execution_maps_to_execution_failure() {
        let err = BenchError::from(ExecutionError::Failed {
            prompt_id: "p-1".into(),
            cause: FailureCause::Disconnected {
                reason: "reset".into(),
            },
        });
        assert_eq!(
            err.to_string(),
            "Execution failed: Prompt p-1 failed: channel disconnected: reset"
        );
    }

    #[test]
    fn startup_timeout_message_in_seconds() {
        assert_eq!(
            BenchError::ServerStartupTimeout(Duration::from_secs(60)).to_string(),
            "Server did not become ready within 60s"
        );
    }
}
