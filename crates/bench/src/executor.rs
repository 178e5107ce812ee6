//! Workflow execution seam used by the orchestrators.

use async_trait::async_trait;
use comfybench_comfyui::api::ComfyUIApi;
use comfybench_comfyui::client::ComfyUIClient;
use comfybench_comfyui::execution::execute_workflow;
use comfybench_core::tracking::ExecutionTiming;
use comfybench_core::workflow::WorkflowDocument;

use crate::error::BenchError;

/// Runs one workflow to completion on the current server.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    async fn execute(&self, workflow: &WorkflowDocument) -> Result<ExecutionTiming, BenchError>;
}

/// Executes workflows against a live ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyUIExecutor {
    client: ComfyUIClient,
    api: ComfyUIApi,
}

impl ComfyUIExecutor {
    pub fn new(client: ComfyUIClient, api: ComfyUIApi) -> Self {
        Self { client, api }
    }

    /// Executor for the server at `host:port`.
    pub fn for_address(address: &str) -> Self {
        let client = ComfyUIClient::from_address(address);
        let api = ComfyUIApi::new(client.api_url().to_string());
        Self { client, api }
    }

    /// HTTP API of the target server, shared with readiness probing.
    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }
}

#[async_trait]
impl WorkflowExecutor for ComfyUIExecutor {
    async fn execute(&self, workflow: &WorkflowDocument) -> Result<ExecutionTiming, BenchError> {
        let report = execute_workflow(&self.client, &self.api, workflow).await?;
        Ok(report.timing)
    }
}
