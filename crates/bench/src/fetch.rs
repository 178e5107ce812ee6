//! Model download runner.
//!
//! Each catalog family names a download script and one argument per
//! model set. [`run_downloads`] invokes `bash <script> <arg>` once per
//! argument, in order, and stops at the first failing invocation. The
//! script's output is passed straight through to the terminal.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use comfybench_core::models::ModelFamily;
use tokio::process::Command;

/// Errors from running a download script.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Download script '{0}' not found")]
    ScriptNotFound(String),

    #[error("Failed to run {}: {source}", .script.display())]
    Spawn {
        script: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} {arg} exited with {}", .script.display(), .code.map_or("a signal".to_string(), |c| format!("code {c}")))]
    ScriptFailed {
        script: PathBuf,
        arg: String,
        code: Option<i32>,
    },
}

/// Locate `script` in `script_dir`, falling back to the bare name
/// relative to the current directory.
pub fn resolve_script(script_dir: &Path, script: &str) -> Result<PathBuf, FetchError> {
    let candidate = script_dir.join(script);
    if candidate.is_file() {
        return Ok(candidate);
    }
    let bare = PathBuf::from(script);
    if bare.is_file() {
        return Ok(bare);
    }
    Err(FetchError::ScriptNotFound(script.to_string()))
}

/// Shell rendering of the invocations, for display.
pub fn command_line(script: &Path, args: &[&str]) -> String {
    args.iter()
        .map(|arg| format!("bash {} {arg}", script.display()))
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Run `bash <script> <arg>` for each argument, stopping at the first
/// failure.
pub async fn run_downloads(script: &Path, args: &[&str]) -> Result<(), FetchError> {
    for arg in args {
        tracing::info!(script = %script.display(), arg, "Running download script");
        let status = Command::new("bash")
            .arg(script)
            .arg(arg)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|source| FetchError::Spawn {
                script: script.to_path_buf(),
                source,
            })?;

        if !status.success() {
            return Err(FetchError::ScriptFailed {
                script: script.to_path_buf(),
                arg: arg.to_string(),
                code: status.code(),
            });
        }
    }
    Ok(())
}

/// Resolve and run the download action of `family`.
pub async fn fetch_family(family: &ModelFamily, script_dir: &Path) -> Result<(), FetchError> {
    let script = resolve_script(script_dir, family.script)?;
    tracing::info!(
        family = family.name,
        command = %command_line(&script, family.args),
        "Downloading models",
    );
    run_downloads(&script, family.args).await
}
