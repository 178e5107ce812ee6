//! Performance-log collection.
//!
//! Runs each workflow once on a server started with MIOpen and hipBLASLt
//! logging enabled, then moves the produced logs into a per-workflow set
//! of files and writes a frequency summary of the hipBLASLt log.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use comfybench_core::variants::ConfigVariant;
use tokio_util::sync::CancellationToken;

use crate::error::BenchError;
use crate::executor::WorkflowExecutor;
use crate::orchestrator::clear_cache_dirs;
use crate::server::ServerLauncher;
use crate::workflows::WorkflowEntry;

/// hipBLASLt log written by the server, relative to the ComfyUI dir.
pub const HIPBLASLT_LOG_NAME: &str = "benchmark_hipblaslt_log.txt";

/// Server console capture while collecting.
pub const CONSOLE_LOG_NAME: &str = "miopen_output_logs.txt";

/// Variant name the logging server is launched under.
const COLLECTION_VARIANT: &str = "perf-logs";

/// Environment enabling kernel and GEMM logging.
pub fn logging_env(hipblaslt_log: &Path) -> BTreeMap<String, String> {
    [
        ("MIOPEN_ENABLE_LOGGING", "1".to_string()),
        ("MIOPEN_ENABLE_LOGGING_CMD", "1".to_string()),
        ("HIPBLASLT_LOG_MASK", "32".to_string()),
        ("TORCH_BLAS_PREFER_HIPBLASLT", "1".to_string()),
        ("COMFYUI_ENABLE_MIOPEN", "1".to_string()),
        ("HIPBLASLT_LOG_FILE", hipblaslt_log.display().to_string()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect()
}

/// Where logs are produced and where they are harvested to.
#[derive(Debug, Clone)]
pub struct LogPaths {
    pub hipblaslt_log: PathBuf,
    pub console_log: PathBuf,
    pub logs_dir: PathBuf,
}

/// Files harvested for one workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Harvest {
    pub summary: Option<PathBuf>,
    pub hipblaslt_log: Option<PathBuf>,
    pub console_log: Option<PathBuf>,
}

/// Counters for a finished collection batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionSummary {
    pub executed: usize,
    pub failed: usize,
    pub not_ready: usize,
}

/// A log-collection batch.
pub struct LogCollection<'a> {
    launcher: &'a dyn ServerLauncher,
    executor: &'a dyn WorkflowExecutor,
    paths: LogPaths,
    ready_timeout: Duration,
    cache_dirs: Vec<PathBuf>,
    cancel: CancellationToken,
}

impl<'a> LogCollection<'a> {
    pub fn new(
        launcher: &'a dyn ServerLauncher,
        executor: &'a dyn WorkflowExecutor,
        paths: LogPaths,
        ready_timeout: Duration,
        cache_dirs: Vec<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            launcher,
            executor,
            paths,
            ready_timeout,
            cache_dirs,
            cancel,
        }
    }

    /// Collect logs for every workflow. `paths.logs_dir` must exist.
    pub async fn run(&self, workflows: &[WorkflowEntry]) -> Result<CollectionSummary, BenchError> {
        let variant = ConfigVariant::new(COLLECTION_VARIANT);
        let mut summary = CollectionSummary::default();

        for (idx, workflow) in workflows.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(BenchError::Interrupted);
            }
            tracing::info!(
                workflow = %workflow.name,
                progress = %format!("{}/{}", idx + 1, workflows.len()),
                "Collecting logs",
            );

            let document = match workflow.load().await {
                Ok(document) => document,
                Err(e) => {
                    tracing::error!(workflow = %workflow.name, error = %e, "Skipping workflow");
                    summary.failed += 1;
                    continue;
                }
            };

            clear_cache_dirs(&self.cache_dirs).await;
            remove_stale(&self.paths.console_log).await;
            remove_stale(&self.paths.hipblaslt_log).await;

            let mut server = self.launcher.launch(&variant).await?;
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(BenchError::Interrupted),
                result = async {
                    if !server.await_ready(self.ready_timeout).await {
                        return Err(BenchError::ServerStartupTimeout(self.ready_timeout));
                    }
                    self.executor.execute(&document).await
                } => result,
            };
            server.stop().await;

            match result {
                Ok(timing) => {
                    tracing::info!(
                        workflow = %workflow.name,
                        elapsed_secs = timing.end_to_end_secs(),
                        "Workflow executed",
                    );
                    summary.executed += 1;
                }
                Err(BenchError::Interrupted) => return Err(BenchError::Interrupted),
                Err(e @ BenchError::ServerStartupTimeout(_)) => {
                    tracing::error!(workflow = %workflow.name, error = %e, "Skipping workflow");
                    summary.not_ready += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(workflow = %workflow.name, error = %e, "Workflow failed, harvesting logs anyway");
                    summary.failed += 1;
                }
            }

            harvest(&self.paths, workflow.stem()).await;
        }

        tracing::info!(
            executed = summary.executed,
            failed = summary.failed,
            not_ready = summary.not_ready,
            logs_dir = %self.paths.logs_dir.display(),
            "Log collection complete",
        );
        Ok(summary)
    }
}

/// Move the produced logs for workflow `stem` into the logs directory.
pub async fn harvest(paths: &LogPaths, stem: &str) -> Harvest {
    let mut harvest = Harvest::default();

    match tokio::fs::read(&paths.hipblaslt_log).await {
        Ok(raw) => {
            let summary_path = paths.logs_dir.join(format!("{stem}_sorted_hipblaslt_log.txt"));
            let text = String::from_utf8_lossy(&raw);
            match tokio::fs::write(&summary_path, summarize_lines(&text)).await {
                Ok(()) => harvest.summary = Some(summary_path),
                Err(e) => tracing::warn!(path = %summary_path.display(), error = %e, "Failed to write log summary"),
            }

            let dest = paths.logs_dir.join(format!("{stem}_hipblaslt_log.txt"));
            harvest.hipblaslt_log = move_file(&paths.hipblaslt_log, &dest).await;
        }
        Err(e) => tracing::warn!(
            path = %paths.hipblaslt_log.display(),
            error = %e,
            "hipBLASLt log not found",
        ),
    }

    if tokio::fs::try_exists(&paths.console_log).await.unwrap_or(false) {
        let dest = paths.logs_dir.join(format!("{stem}_miopen_output_logs.txt"));
        harvest.console_log = move_file(&paths.console_log, &dest).await;
    } else {
        tracing::warn!(path = %paths.console_log.display(), "Console log not found");
    }

    harvest
}

/// Each distinct line with its count, most frequent first, formatted like
/// `sort | uniq -c | sort -nr`.
pub fn summarize_lines(text: &str) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for line in text.lines() {
        *counts.entry(line).or_default() += 1;
    }

    let mut rows: Vec<(&str, usize)> = counts.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(a.0)));

    rows.into_iter()
        .map(|(line, count)| format!("{count:>7} {line}\n"))
        .collect()
}

/// Rename, falling back to copy + delete across file systems.
async fn move_file(from: &Path, to: &Path) -> Option<PathBuf> {
    let moved = match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => match tokio::fs::copy(from, to).await {
            Ok(_) => tokio::fs::remove_file(from).await,
            Err(e) => Err(e),
        },
    };
    match moved {
        Ok(()) => {
            tracing::info!(from = %from.display(), to = %to.display(), "Saved log");
            Some(to.to_path_buf())
        }
        Err(e) => {
            tracing::warn!(from = %from.display(), to = %to.display(), error = %e, "Failed to move log");
            None
        }
    }
}

async fn remove_stale(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed stale log"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale log"),
    }
}
