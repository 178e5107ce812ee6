//! `comfybench` -- ComfyUI workflow benchmarking harness.
//!
//! Starts a ComfyUI server per (workflow, configuration) pair, submits the
//! workflow over HTTP, times it via the WebSocket event stream, and
//! appends results to a resumable JSON file. See `comfybench --help`.
//!
//! Logging is controlled by `RUST_LOG` (default `comfybench=info`, or
//! `debug` with `--verbose`). A `.env` file in the working directory is
//! loaded before flags are parsed.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comfybench::cli::{Cli, CollectLogsArgs, Command, ModelsAction, ModelsArgs, RunArgs};
use comfybench::collector::{self, LogCollection, LogPaths};
use comfybench::config::{cache_dirs_or_default, ServerSettings};
use comfybench::error::BenchError;
use comfybench::executor::ComfyUIExecutor;
use comfybench::fetch;
use comfybench::orchestrator::{BenchmarkRun, RunOptions};
use comfybench::server::ComfyUILauncher;
use comfybench::store::ResultStore;
use comfybench::workflows::{self, WorkflowEntry};
use comfybench_core::models::plan_downloads;

/// Exit code after an interrupt, as a shell would report it.
const INTERRUPTED_EXIT_CODE: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "comfybench=debug,comfybench_core=debug,comfybench_comfyui=debug"
    } else {
        "comfybench=info,comfybench_core=info,comfybench_comfyui=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let shutdown = Shutdown::default();
    if let Err(e) = spawn_signal_handler(shutdown.clone()) {
        tracing::error!(error = %e, "Failed to install signal handlers");
        return ExitCode::FAILURE;
    }

    match dispatch(cli, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if matches!(e.downcast_ref::<BenchError>(), Some(BenchError::Interrupted)) => {
            tracing::warn!("Interrupted, results so far are saved");
            ExitCode::from(INTERRUPTED_EXIT_CODE)
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "comfybench failed");
            ExitCode::FAILURE
        }
    }
}

/// Cancellation state driven by SIGINT, SIGTERM and SIGHUP.
#[derive(Debug, Clone, Default)]
struct Shutdown {
    /// Cancelled by the first signal: the batch stops after server teardown.
    cancel: CancellationToken,
    /// Cancelled by the second signal: teardown skips the grace period.
    force: CancellationToken,
}

/// The server lives in its own process group, so it never sees the
/// signals sent to us. Every exit path below goes through its teardown.
fn spawn_signal_handler(shutdown: Shutdown) -> std::io::Result<()> {
    let mut signals = ShutdownSignals::install()?;
    tokio::spawn(async move {
        let name = signals.recv().await;
        tracing::warn!(signal = name, "Stopping after server shutdown (signal again to force)");
        shutdown.cancel.cancel();

        let name = signals.recv().await;
        tracing::warn!(signal = name, "Forcing server shutdown");
        shutdown.force.cancel();
    });
    Ok(())
}

struct ShutdownSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    #[cfg(not(unix))]
    fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next shutdown signal and return its name.
    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => "SIGINT",
            Some(()) = self.terminate.recv() => "SIGTERM",
            Some(()) = self.hangup.recv() => "SIGHUP",
            else => std::future::pending().await,
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "Ctrl+C",
            Err(_) => std::future::pending().await,
        }
    }
}

async fn dispatch(cli: Cli, shutdown: Shutdown) -> anyhow::Result<()> {
    let server = cli.server_settings()?;
    match cli.command {
        Command::Run(args) => run_benchmark(&server, cli.workflow_dir, args, shutdown).await,
        Command::CollectLogs(args) => {
            collect_logs(&server, cli.workflow_dir, args, shutdown).await
        }
        Command::Models(args) => models(cli.workflow_dir, args).await,
    }
}

async fn run_benchmark(
    server: &ServerSettings,
    workflow_dir: PathBuf,
    args: RunArgs,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let settings = args.settings(workflow_dir)?;
    let workflows = discover(&settings.workflow_dir)?;
    if workflows.is_empty() {
        tracing::info!(dir = %settings.workflow_dir.display(), "No workflows found, nothing to do");
        return Ok(());
    }

    let output = std::path::absolute(&settings.output).unwrap_or_else(|_| settings.output.clone());
    tracing::info!(
        workflows = workflows.len(),
        configs = settings.variants.len(),
        output = %output.display(),
        warm_start = settings.warm_start,
        skip_errors = settings.skip_errors,
        "Starting benchmark",
    );

    let executor = ComfyUIExecutor::for_address(&server.address);
    let launcher = ComfyUILauncher::new(
        server.clone(),
        executor.api().clone(),
        settings.server_log.clone(),
    )
    .with_force(shutdown.force);
    let options = RunOptions {
        ready_timeout: server.ready_timeout,
        skip_errors: settings.skip_errors,
        warm_start: settings.warm_start,
        cache_dirs: settings.cache_dirs.clone(),
    };

    let mut store = ResultStore::load(output);
    BenchmarkRun::new(&launcher, &executor, options, shutdown.cancel)
        .run(&workflows, &settings.variants, &mut store)
        .await?;
    Ok(())
}

async fn collect_logs(
    server: &ServerSettings,
    workflow_dir: PathBuf,
    args: CollectLogsArgs,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let workflows = discover(&workflow_dir)?;
    if workflows.is_empty() {
        tracing::info!(dir = %workflow_dir.display(), "No workflows found, nothing to do");
        return Ok(());
    }

    let paths = LogPaths {
        hipblaslt_log: server.comfy_dir.join(collector::HIPBLASLT_LOG_NAME),
        console_log: PathBuf::from(collector::CONSOLE_LOG_NAME),
        logs_dir: args.logs_dir,
    };
    std::fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("Failed to create {}", paths.logs_dir.display()))?;

    let executor = ComfyUIExecutor::for_address(&server.address);
    let launcher = ComfyUILauncher::new(
        server.clone(),
        executor.api().clone(),
        paths.console_log.clone(),
    )
    .with_base_env(collector::logging_env(&paths.hipblaslt_log))
    .with_force(shutdown.force);

    LogCollection::new(
        &launcher,
        &executor,
        paths,
        server.ready_timeout,
        cache_dirs_or_default(args.cache_dirs),
        shutdown.cancel,
    )
    .run(&workflows)
    .await?;
    Ok(())
}

async fn models(workflow_dir: PathBuf, args: ModelsArgs) -> anyhow::Result<()> {
    let workflows = discover(&workflow_dir)?;
    let planned = plan_downloads(workflows.iter().map(|w| w.name.clone()));

    match args.action {
        ModelsAction::List => {
            for (idx, entry) in planned.iter().enumerate() {
                println!("{:>3}. {:<40} {}", idx + 1, entry.label(), entry.file);
            }
            Ok(())
        }
        ModelsAction::Fetch { workflow } => {
            let entry = match workflow.parse::<usize>() {
                Ok(n) if n >= 1 && n <= planned.len() => &planned[n - 1],
                _ => planned.iter().find(|p| p.file == workflow).with_context(|| {
                    format!("No workflow named '{workflow}' in {}", workflow_dir.display())
                })?,
            };
            let Some(family) = entry.family else {
                bail!("No download action known for {}", entry.file);
            };
            fetch::fetch_family(family, &args.script_dir).await?;
            tracing::info!(family = family.name, "Models downloaded");
            Ok(())
        }
    }
}

fn discover(dir: &Path) -> anyhow::Result<Vec<WorkflowEntry>> {
    workflows::discover(dir)
        .with_context(|| format!("Failed to read workflow directory {}", dir.display()))
}
