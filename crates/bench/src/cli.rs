//! Command-line interface.
//!
//! Every flag can also come from the environment (or a `.env` file loaded
//! before parsing); the flag wins.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    cache_dirs_or_default, load_variants, ConfigError, RunSettings, ServerSettings,
    DEFAULT_COMFY_DIR, DEFAULT_GRACE_PERIOD_SECS, DEFAULT_LOGS_DIR, DEFAULT_PYTHON,
    DEFAULT_READY_TIMEOUT_SECS, DEFAULT_RESULTS_FILE, DEFAULT_SCRIPT_DIR, DEFAULT_SERVER,
    DEFAULT_SERVER_LOG, DEFAULT_WORKFLOW_DIR,
};

/// Benchmark ComfyUI workflows across server configurations.
///
/// Each (workflow, configuration) pair runs on a freshly started server
/// with cleared caches. Results are appended to a JSON file after every
/// measurement, and pairs already in the file are skipped, so an
/// interrupted batch resumes where it stopped.
#[derive(Parser, Debug)]
#[command(name = "comfybench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// ComfyUI address as host:port.
    #[arg(long, global = true, env = "COMFYBENCH_SERVER", default_value = DEFAULT_SERVER)]
    pub server: String,

    /// ComfyUI checkout containing main.py.
    #[arg(long, global = true, env = "COMFYBENCH_COMFY_DIR", default_value = DEFAULT_COMFY_DIR)]
    pub comfy_dir: PathBuf,

    /// Directory of API-format workflow JSON files.
    #[arg(long, global = true, env = "COMFYBENCH_WORKFLOW_DIR", default_value = DEFAULT_WORKFLOW_DIR)]
    pub workflow_dir: PathBuf,

    /// Python interpreter used to start ComfyUI.
    #[arg(long, global = true, env = "COMFYBENCH_PYTHON", default_value = DEFAULT_PYTHON)]
    pub python: PathBuf,

    /// Seconds to wait for the server to answer health checks.
    #[arg(
        long,
        global = true,
        env = "COMFYBENCH_READY_TIMEOUT_SECS",
        default_value_t = DEFAULT_READY_TIMEOUT_SECS
    )]
    pub ready_timeout_secs: u64,

    /// Seconds between SIGTERM and a forced kill on shutdown.
    #[arg(
        long,
        global = true,
        env = "COMFYBENCH_GRACE_PERIOD_SECS",
        default_value_t = DEFAULT_GRACE_PERIOD_SECS
    )]
    pub grace_period_secs: u64,

    /// Debug-level logging (RUST_LOG still takes precedence).
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the benchmark batch.
    Run(RunArgs),

    /// Run each workflow once with MIOpen/hipBLASLt logging and harvest
    /// the logs.
    CollectLogs(CollectLogsArgs),

    /// Inspect or download the models workflows need.
    Models(ModelsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Result file (JSON array), created if missing.
    #[arg(short = 'o', long, env = "COMFYBENCH_OUTPUT", default_value = DEFAULT_RESULTS_FILE)]
    pub output: PathBuf,

    /// Continue with the next workflow when a server fails to start or a
    /// workflow file is invalid.
    #[arg(long)]
    pub skip_errors: bool,

    /// Measure a second (warm) run on the same server.
    #[arg(long)]
    pub warm_start: bool,

    /// JSON array of {"name", "env"} configuration variants.
    #[arg(long, env = "COMFYBENCH_CONFIGS", value_name = "PATH")]
    pub configs: Option<PathBuf>,

    /// Server console log, truncated at every server start.
    #[arg(long, default_value = DEFAULT_SERVER_LOG)]
    pub server_log: PathBuf,

    /// Cache directory to delete before each server start (repeatable).
    /// Defaults to ~/.miopen.
    #[arg(long = "cache-dir", value_name = "DIR")]
    pub cache_dirs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CollectLogsArgs {
    /// Directory receiving the harvested logs.
    #[arg(long, default_value = DEFAULT_LOGS_DIR)]
    pub logs_dir: PathBuf,

    /// Cache directory to delete before each server start (repeatable).
    /// Defaults to ~/.miopen.
    #[arg(long = "cache-dir", value_name = "DIR")]
    pub cache_dirs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ModelsArgs {
    /// Directory holding the download scripts.
    #[arg(long, env = "COMFYBENCH_SCRIPT_DIR", default_value = DEFAULT_SCRIPT_DIR)]
    pub script_dir: PathBuf,

    #[command(subcommand)]
    pub action: ModelsAction,
}

#[derive(Subcommand, Debug)]
pub enum ModelsAction {
    /// List workflows with their download action.
    List,

    /// Download the models for one workflow, by file name or list index.
    Fetch {
        #[arg(value_name = "WORKFLOW")]
        workflow: String,
    },
}

impl Cli {
    pub fn server_settings(&self) -> Result<ServerSettings, ConfigError> {
        ServerSettings::new(
            self.server.clone(),
            self.comfy_dir.clone(),
            self.python.clone(),
            Duration::from_secs(self.ready_timeout_secs),
            Duration::from_secs(self.grace_period_secs),
        )
    }
}

impl RunArgs {
    pub fn settings(&self, workflow_dir: PathBuf) -> Result<RunSettings, ConfigError> {
        Ok(RunSettings {
            workflow_dir,
            output: self.output.clone(),
            server_log: self.server_log.clone(),
            skip_errors: self.skip_errors,
            warm_start: self.warm_start,
            variants: load_variants(self.configs.as_deref())?,
            cache_dirs: cache_dirs_or_default(self.cache_dirs.clone()),
        })
    }
}
