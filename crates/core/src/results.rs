//! Benchmark result records.
//!
//! The persisted result file is a JSON array of [`ResultRecord`]s. Older
//! files may lack fields added later; every optional field has a serde
//! default so those files keep loading.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tracking::ExecutionTiming;
use crate::variants::{ConfigVariant, DEFAULT_VARIANT_NAME};

/// Outcome of a (workflow, config) measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

/// One row of the result file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Workflow file name, e.g. `flux_schnell.json`.
    pub workflow: String,

    /// Configuration variant name. Missing in early files, meaning `default`.
    #[serde(default = "default_config_name")]
    pub config: String,

    pub status: RunStatus,

    /// Same as `cold_run_seconds`, kept for readers of the first file format.
    #[serde(default)]
    pub duration_seconds: f64,

    #[serde(default)]
    pub cold_run_seconds: f64,

    /// Zero when no warm run was measured.
    #[serde(default)]
    pub warm_run_seconds: f64,

    /// Cold-run time between the first start signal and completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cold_execution_seconds: Option<f64>,

    /// Unix epoch seconds when the record was appended.
    #[serde(default)]
    pub timestamp: f64,

    /// Environment overrides the server ran with.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_config_name() -> String {
    DEFAULT_VARIANT_NAME.to_string()
}

impl ResultRecord {
    /// A successful measurement. `warm` is `None` when no warm run completed.
    pub fn success(
        workflow: impl Into<String>,
        variant: &ConfigVariant,
        cold: &ExecutionTiming,
        warm: Option<&ExecutionTiming>,
    ) -> Self {
        let cold_secs = cold.end_to_end_secs();
        Self {
            workflow: workflow.into(),
            config: variant.name.clone(),
            status: RunStatus::Success,
            duration_seconds: cold_secs,
            cold_run_seconds: cold_secs,
            warm_run_seconds: warm.map_or(0.0, ExecutionTiming::end_to_end_secs),
            cold_execution_seconds: Some(cold.execution_secs()),
            timestamp: now_epoch_secs(),
            env: variant.env.clone(),
        }
    }

    /// A measurement whose cold run did not complete. All durations are zero.
    pub fn failure(workflow: impl Into<String>, variant: &ConfigVariant) -> Self {
        Self {
            workflow: workflow.into(),
            config: variant.name.clone(),
            status: RunStatus::Failure,
            duration_seconds: 0.0,
            cold_run_seconds: 0.0,
            warm_run_seconds: 0.0,
            cold_execution_seconds: None,
            timestamp: now_epoch_secs(),
            env: variant.env.clone(),
        }
    }

    /// Whether this record occupies the (workflow, config) slot.
    pub fn is_for(&self, workflow: &str, config: &str) -> bool {
        self.workflow == workflow && self.config == config
    }
}

fn now_epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
