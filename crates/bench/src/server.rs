//! ComfyUI server lifecycle.
//!
//! [`ServerProcess`] owns one child process: it is started detached in its
//! own process group with its console redirected to a log file, probed
//! for readiness over HTTP, and stopped with SIGTERM followed by a forced
//! kill once the grace period expires. A `force` token cuts the grace
//! period short. Dropping a process that was never stopped kills its
//! whole process group.
//!
//! The orchestrators only see the [`ServerLauncher`] / [`ServerHandle`]
//! traits so tests can substitute fakes.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use comfybench_comfyui::api::ComfyUIApi;
use comfybench_core::variants::ConfigVariant;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ServerSettings;
use crate::error::BenchError;

/// Interval between readiness probes.
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout of a single readiness probe.
pub const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// How to start a server process.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Applied on top of the inherited environment; these win.
    pub env: BTreeMap<String, String>,
    /// Receives stdout and stderr. Truncated on start.
    pub log_path: PathBuf,
}

/// How a [`ServerProcess::stop`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had already exited on its own.
    Exited(ExitStatus),
    /// The process exited within the grace period after SIGTERM.
    Terminated(ExitStatus),
    /// The grace period expired, or was cut short, and the process was
    /// killed.
    Killed,
    /// `stop` had already been called.
    AlreadyStopped,
}

/// A running server child process.
#[derive(Debug)]
pub struct ServerProcess {
    child: Option<Child>,
    pid: Option<u32>,
}

impl ServerProcess {
    /// Spawn the server described by `spec`.
    ///
    /// Returns as soon as the process exists; readiness is checked
    /// separately with [`await_ready`](Self::await_ready).
    pub fn start(spec: &ServerSpec) -> std::io::Result<Self> {
        let stdout = File::create(&spec.log_path)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        // Own process group: terminal Ctrl+C reaches only us, and shutdown
        // signals reach the server's own children too.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child.id();

        tracing::info!(
            pid = ?pid,
            program = %spec.program.display(),
            working_dir = %spec.working_dir.display(),
            log = %spec.log_path.display(),
            overrides = spec.env.len(),
            "Server process started",
        );

        Ok(Self {
            child: Some(child),
            pid,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Poll the health endpoint once per [`READY_POLL_INTERVAL`] until it
    /// answers 200 or `timeout` elapses.
    ///
    /// Returns `false` early if the process exits while starting up.
    pub async fn await_ready(&mut self, health: &ComfyUIApi, timeout: Duration) -> bool {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match health.check_health(READY_PROBE_TIMEOUT).await {
                Ok(()) => {
                    tracing::info!(
                        attempts,
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        "Server ready",
                    );
                    return true;
                }
                Err(e) => tracing::trace!(attempts, error = %e, "Server not ready yet"),
            }

            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    tracing::error!(%status, "Server exited during startup");
                    return false;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::error!(
                    attempts,
                    timeout_secs = timeout.as_secs(),
                    url = %health.api_url(),
                    "Server did not become ready",
                );
                return false;
            }
            tokio::time::sleep(READY_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Stop the server: SIGTERM to its process group, wait up to `grace`,
    /// then kill. Safe to call more than once.
    pub async fn stop(&mut self, grace: Duration) -> StopOutcome {
        self.stop_or_force(grace, &CancellationToken::new()).await
    }

    /// Like [`stop`](Self::stop), but kills the process group as soon as
    /// `force` is cancelled, including when it already is.
    pub async fn stop_or_force(
        &mut self,
        grace: Duration,
        force: &CancellationToken,
    ) -> StopOutcome {
        let Some(mut child) = self.child.take() else {
            return StopOutcome::AlreadyStopped;
        };

        if let Ok(Some(status)) = child.try_wait() {
            tracing::info!(%status, "Server had already exited");
            return StopOutcome::Exited(status);
        }

        if force.is_cancelled() {
            tracing::warn!(pid = ?self.pid, "Killing server without grace period");
            force_kill(self.pid, &mut child).await;
            return StopOutcome::Killed;
        }

        tracing::info!(pid = ?self.pid, "Stopping server");
        if let Err(e) = signal_group(self.pid, Signal::Terminate, &mut child) {
            tracing::warn!(error = %e, "Failed to send SIGTERM");
        }

        let waited = tokio::select! {
            waited = tokio::time::timeout(grace, child.wait()) => Some(waited),
            () = force.cancelled() => None,
        };
        let Some(waited) = waited else {
            tracing::warn!(pid = ?self.pid, "Shutdown forced, killing server");
            force_kill(self.pid, &mut child).await;
            return StopOutcome::Killed;
        };

        match waited {
            Ok(Ok(status)) => {
                tracing::info!(%status, "Server stopped");
                StopOutcome::Terminated(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to wait for server, killing");
                force_kill(self.pid, &mut child).await;
                StopOutcome::Killed
            }
            Err(_) => {
                tracing::warn!(
                    grace_secs = grace.as_secs(),
                    "Server did not exit within grace period, killing",
                );
                force_kill(self.pid, &mut child).await;
                StopOutcome::Killed
            }
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            tracing::warn!(pid = ?self.pid, "Server dropped without stop, killing");
            if let Err(e) = signal_group(self.pid, Signal::Kill, child) {
                tracing::warn!(error = %e, "Failed to kill server process group");
            }
            let _ = child.start_kill();
        }
    }
}

async fn force_kill(pid: Option<u32>, child: &mut Child) {
    if let Err(e) = signal_group(pid, Signal::Kill, child) {
        tracing::warn!(error = %e, "Failed to kill server process group");
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill server process");
    }
}

/// Send `signal` to the process group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal, _child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = pid else {
        return Ok(());
    };
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions. A negative pid
    // addresses the process group created in `start`.
    let rc = unsafe { libc::kill(-pgid, signo) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal, child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

// ---------------------------------------------------------------------------
// Orchestrator seams
// ---------------------------------------------------------------------------

/// A started server, as seen by the orchestrators.
#[async_trait]
pub trait ServerHandle: Send {
    /// Wait until the server answers health checks, up to `timeout`.
    async fn await_ready(&mut self, timeout: Duration) -> bool;

    /// Stop the server. Must be idempotent.
    async fn stop(&mut self);
}

/// Starts one server per configuration variant.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, variant: &ConfigVariant) -> Result<Box<dyn ServerHandle>, BenchError>;
}

/// Launches real ComfyUI servers.
#[derive(Debug, Clone)]
pub struct ComfyUILauncher {
    settings: ServerSettings,
    health: ComfyUIApi,
    log_path: PathBuf,
    /// Applied before the variant's own overrides.
    base_env: BTreeMap<String, String>,
    /// Cancelled to skip the grace period of a stop in progress.
    force: CancellationToken,
}

impl ComfyUILauncher {
    pub fn new(settings: ServerSettings, health: ComfyUIApi, log_path: PathBuf) -> Self {
        Self {
            settings,
            health,
            log_path,
            base_env: BTreeMap::new(),
            force: CancellationToken::new(),
        }
    }

    /// Add overrides that every launched server gets.
    pub fn with_base_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    /// Token that, once cancelled, turns every stop into an immediate kill.
    pub fn with_force(mut self, force: CancellationToken) -> Self {
        self.force = force;
        self
    }
}

#[async_trait]
impl ServerLauncher for ComfyUILauncher {
    async fn launch(&self, variant: &ConfigVariant) -> Result<Box<dyn ServerHandle>, BenchError> {
        let mut env = self.base_env.clone();
        env.extend(variant.env.clone());

        let spec = self.settings.server_spec(env, &self.log_path);
        tracing::info!(config = %variant.name, address = %self.settings.address, "Starting ComfyUI");
        let process = ServerProcess::start(&spec).map_err(BenchError::ServerLaunch)?;

        Ok(Box::new(ManagedServer {
            process,
            health: self.health.clone(),
            grace: self.settings.grace_period,
            force: self.force.clone(),
        }))
    }
}

/// A [`ServerProcess`] paired with its health endpoint and grace period.
#[derive(Debug)]
pub struct ManagedServer {
    process: ServerProcess,
    health: ComfyUIApi,
    grace: Duration,
    force: CancellationToken,
}

#[async_trait]
impl ServerHandle for ManagedServer {
    async fn await_ready(&mut self, timeout: Duration) -> bool {
        self.process.await_ready(&self.health, timeout).await
    }

    async fn stop(&mut self) {
        self.process.stop_or_force(self.grace, &self.force).await;
    }
}
