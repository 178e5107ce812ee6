//! Shared fakes for orchestrator integration tests.
//!
//! The fake executor decides each run's outcome from a `Bench` node in the
//! workflow itself: `{"class_type": "Bench", "inputs": {"outcome": ...}}`
//! where `outcome` is a number of seconds, `"error"`, or `"hang"`.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use comfybench::error::BenchError;
use comfybench::executor::WorkflowExecutor;
use comfybench::server::{ServerHandle, ServerLauncher};
use comfybench::workflows::WorkflowEntry;
use comfybench_core::tracking::ExecutionTiming;
use comfybench_core::variants::ConfigVariant;
use comfybench_core::workflow::WorkflowDocument;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Everything the fakes observed.
#[derive(Clone, Default)]
pub struct Journal {
    pub launches: Arc<Mutex<Vec<ConfigVariant>>>,
    pub stops: Arc<AtomicUsize>,
    pub executions: Arc<Mutex<Vec<Value>>>,
}

impl Journal {
    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<Value> {
        self.executions.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Server fakes
// ---------------------------------------------------------------------------

pub struct FakeLauncher {
    pub journal: Journal,
    pub ready: bool,
    /// Called on every launch, e.g. to create log files.
    pub on_launch: Option<Box<dyn Fn() + Send + Sync>>,
}

impl FakeLauncher {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            ready: true,
            on_launch: None,
        }
    }

    pub fn never_ready(journal: &Journal) -> Self {
        Self {
            ready: false,
            ..Self::new(journal)
        }
    }
}

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(&self, variant: &ConfigVariant) -> Result<Box<dyn ServerHandle>, BenchError> {
        self.journal.launches.lock().unwrap().push(variant.clone());
        if let Some(hook) = &self.on_launch {
            hook();
        }
        Ok(Box::new(FakeServer {
            journal: self.journal.clone(),
            ready: self.ready,
            stopped: false,
        }))
    }
}

struct FakeServer {
    journal: Journal,
    ready: bool,
    stopped: bool,
}

#[async_trait]
impl ServerHandle for FakeServer {
    async fn await_ready(&mut self, _timeout: Duration) -> bool {
        self.ready
    }

    async fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.journal.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// Executor fake
// ---------------------------------------------------------------------------

pub struct ScriptedExecutor {
    pub journal: Journal,
    /// Cancelled when a `"hang"` workflow starts, to simulate Ctrl+C.
    pub cancel_on_hang: Option<CancellationToken>,
    /// Called on every execution, e.g. to create log files.
    pub on_execute: Option<Box<dyn Fn() + Send + Sync>>,
}

impl ScriptedExecutor {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            cancel_on_hang: None,
            on_execute: None,
        }
    }
}

#[async_trait]
impl WorkflowExecutor for ScriptedExecutor {
    async fn execute(&self, workflow: &WorkflowDocument) -> Result<ExecutionTiming, BenchError> {
        let value = workflow.as_value().clone();
        self.journal.executions.lock().unwrap().push(value.clone());
        if let Some(hook) = &self.on_execute {
            hook();
        }

        match &value["bench"]["inputs"]["outcome"] {
            Value::Number(secs) => {
                let secs = secs.as_f64().unwrap();
                Ok(ExecutionTiming {
                    end_to_end: Duration::from_secs_f64(secs),
                    execution: Duration::from_secs_f64(secs - 0.5),
                    start_observed: true,
                })
            }
            Value::String(s) if s == "hang" => {
                if let Some(cancel) = &self.cancel_on_hang {
                    cancel.cancel();
                }
                std::future::pending().await
            }
            _ => Err(BenchError::ExecutionFailure(
                "server reported error: HIP out of memory".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow fixtures
// ---------------------------------------------------------------------------

/// Write a workflow whose fake outcome is `outcome`.
pub fn write_workflow(dir: &Path, name: &str, outcome: Value) -> WorkflowEntry {
    let path = dir.join(name);
    let doc = json!({
        "3": {"class_type": "KSampler", "inputs": {"seed": 42, "steps": 20}},
        "bench": {"class_type": "Bench", "inputs": {"outcome": outcome}}
    });
    std::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
    WorkflowEntry::new(path)
}

pub fn results_path(dir: &Path) -> PathBuf {
    dir.join("benchmark_results.json")
}
