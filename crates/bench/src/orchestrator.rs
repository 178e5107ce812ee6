//! Resumable benchmark orchestrator.
//!
//! Iterates configuration variants (outer) and workflows (inner). Every
//! (workflow, config) pair not already in the result store gets a fresh
//! server: caches are wiped, the server is started with the variant's
//! environment, a cold run (and optionally a warm run) is measured, the
//! record is persisted, and the server is torn down, whatever happened in
//! between.
//!
//! Error policy per pair:
//! - a failed run (connection, submission or execution) is recorded as a
//!   `failure` row and the batch moves on;
//! - a server that never becomes ready, cannot be spawned, or a workflow
//!   file that cannot be loaded aborts the batch, or with `skip_errors`
//!   is logged and skipped without a record;
//! - an interrupt stops the batch after teardown.

use std::path::PathBuf;
use std::time::Duration;

use comfybench_core::results::{ResultRecord, RunStatus};
use comfybench_core::tracking::ExecutionTiming;
use comfybench_core::variants::ConfigVariant;
use comfybench_core::workflow::WorkflowDocument;
use tokio_util::sync::CancellationToken;

use crate::error::BenchError;
use crate::executor::WorkflowExecutor;
use crate::server::{ServerHandle, ServerLauncher};
use crate::store::ResultStore;
use crate::workflows::WorkflowEntry;

/// Knobs for a benchmark batch.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub ready_timeout: Duration,
    /// Log and skip rounds that could not measure instead of aborting.
    pub skip_errors: bool,
    /// Measure a second run on the same server after the cold run.
    pub warm_start: bool,
    pub cache_dirs: Vec<PathBuf>,
}

/// Counters for a finished batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Pairs already present in the store.
    pub already_done: usize,
    /// Pairs skipped without a record under `skip_errors`.
    pub skipped: usize,
}

/// One benchmark batch over a launcher and an executor.
pub struct BenchmarkRun<'a> {
    launcher: &'a dyn ServerLauncher,
    executor: &'a dyn WorkflowExecutor,
    options: RunOptions,
    cancel: CancellationToken,
}

impl<'a> BenchmarkRun<'a> {
    pub fn new(
        launcher: &'a dyn ServerLauncher,
        executor: &'a dyn WorkflowExecutor,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            launcher,
            executor,
            options,
            cancel,
        }
    }

    /// Measure every missing (workflow, variant) pair, appending to
    /// `store` as results come in.
    pub async fn run(
        &self,
        workflows: &[WorkflowEntry],
        variants: &[ConfigVariant],
        store: &mut ResultStore,
    ) -> Result<RunSummary, BenchError> {
        let mut summary = RunSummary::default();
        let total = workflows.len();

        for variant in variants {
            tracing::info!(config = %variant.name, env = ?variant.env, "Starting configuration");

            for (idx, workflow) in workflows.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Err(BenchError::Interrupted);
                }

                if store.contains(&workflow.name, &variant.name) {
                    tracing::info!(
                        workflow = %workflow.name,
                        config = %variant.name,
                        "Skipping, already recorded",
                    );
                    summary.already_done += 1;
                    continue;
                }

                tracing::info!(
                    workflow = %workflow.name,
                    config = %variant.name,
                    progress = %format!("{}/{}", idx + 1, total),
                    "Benchmarking workflow",
                );

                match self.run_pair(workflow, variant).await {
                    Ok(record) => {
                        match record.status {
                            RunStatus::Success => summary.succeeded += 1,
                            RunStatus::Failure => summary.failed += 1,
                        }
                        save(store, record);
                    }
                    Err(BenchError::Interrupted) => {
                        tracing::warn!(workflow = %workflow.name, "Interrupted, stopping batch");
                        return Err(BenchError::Interrupted);
                    }
                    Err(e) if self.options.skip_errors => {
                        tracing::error!(
                            workflow = %workflow.name,
                            config = %variant.name,
                            error = %e,
                            "Skipping workflow",
                        );
                        summary.skipped += 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            workflow = %workflow.name,
                            config = %variant.name,
                            error = %e,
                            "Aborting batch",
                        );
                        return Err(e);
                    }
                }
            }
        }

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            already_done = summary.already_done,
            skipped = summary.skipped,
            results = %store.path().display(),
            "Benchmark complete",
        );
        Ok(summary)
    }

    /// One measurement round on a fresh server. The server is stopped
    /// before this returns, on every path.
    async fn run_pair(
        &self,
        workflow: &WorkflowEntry,
        variant: &ConfigVariant,
    ) -> Result<ResultRecord, BenchError> {
        let document = workflow.load().await?;

        clear_cache_dirs(&self.options.cache_dirs).await;
        let mut server = self.launcher.launch(variant).await?;

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BenchError::Interrupted),
            result = self.measure(server.as_mut(), &workflow.name, variant, &document) => result,
        };

        server.stop().await;
        result
    }

    async fn measure(
        &self,
        server: &mut dyn ServerHandle,
        name: &str,
        variant: &ConfigVariant,
        document: &WorkflowDocument,
    ) -> Result<ResultRecord, BenchError> {
        if !server.await_ready(self.options.ready_timeout).await {
            return Err(BenchError::ServerStartupTimeout(self.options.ready_timeout));
        }

        tracing::info!(workflow = %name, "Cold run");
        let cold = match self.timed_run(document).await {
            Ok(timing) => timing,
            Err(e) if e.is_run_failure() => {
                tracing::error!(workflow = %name, config = %variant.name, error = %e, "Cold run failed");
                return Ok(ResultRecord::failure(name, variant));
            }
            Err(e) => return Err(e),
        };
        tracing::info!(workflow = %name, elapsed_secs = cold.end_to_end_secs(), "Cold run finished");

        let warm = if self.options.warm_start {
            tracing::info!(workflow = %name, "Warm run");
            match self.timed_run(document).await {
                Ok(timing) => {
                    tracing::info!(
                        workflow = %name,
                        elapsed_secs = timing.end_to_end_secs(),
                        "Warm run finished",
                    );
                    Some(timing)
                }
                Err(e) if e.is_run_failure() => {
                    tracing::warn!(workflow = %name, error = %e, "Warm run failed, keeping cold result");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(ResultRecord::success(name, variant, &cold, warm.as_ref()))
    }

    /// Execute a copy of `document` with fresh seeds.
    async fn timed_run(&self, document: &WorkflowDocument) -> Result<ExecutionTiming, BenchError> {
        let mut run = document.clone();
        let reseeded = run.randomize_seeds(&mut rand::rng());
        tracing::debug!(reseeded, "Randomized seeds");
        self.executor.execute(&run).await
    }
}

fn save(store: &mut ResultStore, record: ResultRecord) {
    let workflow = record.workflow.clone();
    match store.append_and_persist(record) {
        Ok(()) => tracing::info!(workflow = %workflow, path = %store.path().display(), "Result saved"),
        Err(e) => tracing::error!(
            workflow = %workflow,
            path = %store.path().display(),
            error = %e,
            "Failed to write results, keeping record in memory",
        ),
    }
}

/// Delete each existing cache directory. Failures are logged, not fatal.
pub(crate) async fn clear_cache_dirs(dirs: &[PathBuf]) {
    for dir in dirs {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => tracing::info!(path = %dir.display(), "Cleared cache"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %dir.display(), error = %e, "Failed to clear cache"),
        }
    }
}
