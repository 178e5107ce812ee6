//! Workflow discovery and loading.

use std::path::{Path, PathBuf};

use comfybench_core::workflow::WorkflowDocument;

use crate::error::BenchError;

/// A workflow file found in the workflow directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowEntry {
    /// File name, used as the record key (`flux_schnell.json`).
    pub name: String,
    pub path: PathBuf,
}

impl WorkflowEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { name, path }
    }

    /// File name without the `.json` extension.
    pub fn stem(&self) -> &str {
        self.name.strip_suffix(".json").unwrap_or(&self.name)
    }

    /// Read and parse the workflow document.
    pub async fn load(&self) -> Result<WorkflowDocument, BenchError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| self.invalid(e.to_string()))?;
        WorkflowDocument::from_slice(&bytes).map_err(|e| self.invalid(e.to_string()))
    }

    fn invalid(&self, reason: String) -> BenchError {
        BenchError::Workflow {
            path: self.path.clone(),
            reason,
        }
    }
}

/// The `*.json` files directly inside `dir`, sorted by file name.
pub fn discover(dir: &Path) -> std::io::Result<Vec<WorkflowEntry>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            entries.push(WorkflowEntry::new(path));
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
