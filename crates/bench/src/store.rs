//! Persistent, resumable result store.
//!
//! Results live in a single JSON array file that is rewritten in full
//! after every appended record (temp file + rename), so an interrupted
//! run loses at most the measurement in progress. Loading is tolerant:
//! a missing file is an empty store, and an unparseable one is copied
//! aside before starting empty.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use comfybench_core::results::ResultRecord;

/// Errors from writing the result file.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Permission denied writing {}", .path.display())]
    PermissionDenied { path: PathBuf },

    #[error("Failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize results: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl PersistenceError {
    fn from_io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == ErrorKind::PermissionDenied {
            Self::PermissionDenied {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Ordered result records backed by a JSON file.
#[derive(Debug)]
pub struct ResultStore {
    path: PathBuf,
    records: Vec<ResultRecord>,
}

impl ResultStore {
    /// Load existing records from `path`. Never fails.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<ResultRecord>>(&bytes) {
                Ok(records) => {
                    tracing::info!(
                        path = %path.display(),
                        count = records.len(),
                        "Loaded existing results",
                    );
                    records
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Result file is not valid, starting fresh",
                    );
                    preserve_corrupt(&path);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Could not read result file, starting fresh",
                );
                Vec::new()
            }
        };
        Self { path, records }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether a record for this (workflow, config) pair exists.
    pub fn contains(&self, workflow: &str, config: &str) -> bool {
        self.records.iter().any(|r| r.is_for(workflow, config))
    }

    /// Append `record` and rewrite the file.
    ///
    /// The record stays in memory even if the write fails, so a later
    /// successful write still includes it. A record for a pair that is
    /// already present is dropped.
    pub fn append_and_persist(&mut self, record: ResultRecord) -> Result<(), PersistenceError> {
        if self.contains(&record.workflow, &record.config) {
            tracing::warn!(
                workflow = %record.workflow,
                config = %record.config,
                "Result already recorded, keeping the existing one",
            );
            return Ok(());
        }
        self.records.push(record);
        self.persist()
    }

    /// Rewrite the whole file from memory.
    pub fn persist(&self) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(&self.records)?;
        let tmp = sibling(&self.path, "tmp");

        std::fs::write(&tmp, json).map_err(|e| PersistenceError::from_io(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(PersistenceError::from_io(&self.path, e));
        }
        Ok(())
    }
}

/// `<path>.<suffix>` next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn preserve_corrupt(path: &Path) {
    let backup = sibling(path, "corrupt");
    match std::fs::copy(path, &backup) {
        Ok(_) => tracing::warn!(backup = %backup.display(), "Saved unreadable result file"),
        Err(e) => tracing::warn!(
            backup = %backup.display(),
            error = %e,
            "Failed to save unreadable result file",
        ),
    }
}
