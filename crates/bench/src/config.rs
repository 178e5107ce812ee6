//! Resolved runtime settings.
//!
//! The CLI layer (`cli.rs`) handles flags, env fallbacks and defaults;
//! this module turns those raw values into typed settings and builds the
//! ComfyUI server command line from them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use comfybench_core::variants::{parse_variants, ConfigVariant, VariantError};

use crate::server::ServerSpec;

/// Default server address (`host:port`).
pub const DEFAULT_SERVER: &str = "127.0.0.1:8000";
pub const DEFAULT_COMFY_DIR: &str = "/opt/ComfyUI";
pub const DEFAULT_WORKFLOW_DIR: &str = "/opt/comfy-workflows";
pub const DEFAULT_PYTHON: &str = "python3";
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;
pub const DEFAULT_RESULTS_FILE: &str = "benchmark_results.json";
pub const DEFAULT_SERVER_LOG: &str = "server.log";
pub const DEFAULT_LOGS_DIR: &str = "perf_logs";
pub const DEFAULT_SCRIPT_DIR: &str = "/opt";

/// Errors from resolving settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address '{0}': expected host:port")]
    InvalidAddress(String),

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration variants in {}: {source}", .path.display())]
    Variants {
        path: PathBuf,
        #[source]
        source: VariantError,
    },
}

/// Everything needed to start, probe and stop one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// `host:port` the server listens on.
    pub address: String,
    /// Port part of `address`.
    pub port: u16,
    /// ComfyUI checkout; `main.py` is started from here.
    pub comfy_dir: PathBuf,
    pub python: PathBuf,
    /// Where ComfyUI writes generated outputs.
    pub output_dir: PathBuf,
    pub ready_timeout: Duration,
    pub grace_period: Duration,
}

impl ServerSettings {
    /// Validate the address and fill in derived fields.
    pub fn new(
        address: impl Into<String>,
        comfy_dir: PathBuf,
        python: PathBuf,
        ready_timeout: Duration,
        grace_period: Duration,
    ) -> Result<Self, ConfigError> {
        let address = address.into();
        let port = address
            .rsplit_once(':')
            .and_then(|(host, port)| (!host.is_empty()).then_some(port))
            .and_then(|port| port.parse::<u16>().ok())
            .ok_or_else(|| ConfigError::InvalidAddress(address.clone()))?;

        Ok(Self {
            address,
            port,
            comfy_dir,
            python,
            output_dir: default_output_dir(),
            ready_timeout,
            grace_period,
        })
    }

    /// Command line for a server with `env` applied on top of the
    /// inherited environment and its console written to `log_path`.
    pub fn server_spec(&self, env: BTreeMap<String, String>, log_path: &Path) -> ServerSpec {
        ServerSpec {
            program: self.python.clone(),
            args: vec![
                "main.py".to_string(),
                "--port".to_string(),
                self.port.to_string(),
                "--output-directory".to_string(),
                self.output_dir.display().to_string(),
                "--disable-mmap".to_string(),
                "--bf16-vae".to_string(),
                "--gpu-only".to_string(),
            ],
            working_dir: self.comfy_dir.clone(),
            env,
            log_path: log_path.to_path_buf(),
        }
    }
}

/// Settings for the `run` subcommand.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub workflow_dir: PathBuf,
    pub output: PathBuf,
    pub server_log: PathBuf,
    pub skip_errors: bool,
    pub warm_start: bool,
    pub variants: Vec<ConfigVariant>,
    /// Kernel/compilation caches wiped before every server start.
    pub cache_dirs: Vec<PathBuf>,
}

/// Load variants from `path`, or the single `default` variant when no
/// file is given.
pub fn load_variants(path: Option<&Path>) -> Result<Vec<ConfigVariant>, ConfigError> {
    let Some(path) = path else {
        return Ok(vec![ConfigVariant::default()]);
    };
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_variants(&json).map_err(|source| ConfigError::Variants {
        path: path.to_path_buf(),
        source,
    })
}

/// `given`, or `~/.miopen` when no cache directory was configured.
pub fn cache_dirs_or_default(given: Vec<PathBuf>) -> Vec<PathBuf> {
    if !given.is_empty() {
        return given;
    }
    dirs::home_dir()
        .map(|home| vec![home.join(".miopen")])
        .unwrap_or_default()
}

/// `~/comfy-outputs`, falling back to a relative path without a home dir.
pub fn default_output_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("comfy-outputs"))
        .unwrap_or_else(|| PathBuf::from("comfy-outputs"))
}
