//! Narrow interfaces to the out-of-scope external collaborators: the LLM
//! client, the tool-execution client, the agent controllers, and the
//! runbook resolver. The core never interprets LLM output or drives a
//! ReAct loop itself — it only calls through these traits and maps the
//! result.
//!
//! Shaped after a `ClientWrapper` (LLM client) / `ToolProtocol` (tool
//! execution) trait split: both are `#[async_trait]`, `Send + Sync`, and
//! most methods have a sensible default so a minimal implementation is
//! cheap to write.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AgentConfig, LlmProviderConfig, OrchestratorGuardrails};
use crate::ctx::TaskContext;
use crate::error::BoxError;
use crate::event::EventPublisher;
use crate::model::Status;

/// One turn of conversation handed to/returned from the LLM client.
#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: &'static str,
    pub content: Arc<str>,
}

/// The out-of-scope LLM client. The core depends on this only to let
/// agent controllers drive it; the core itself never parses a response.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn send_message(&self, messages: &[LlmMessage]) -> Result<LlmMessage, BoxError>;
    fn model_name(&self) -> &str;
}

/// The out-of-scope tool-execution client (MCP or otherwise).
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: &serde_json::Value) -> Result<String, BoxError>;
    fn list_tools(&self) -> Vec<String>;
    /// Must be called on every exit path (§4.5 step 5).
    async fn close(&self) {}
}

/// A tool executor that performs no calls; used as the fallback when no
/// servers are needed or the factory fails to open one.
pub struct NoopToolExecutor;

#[async_trait]
impl ToolExecutor for NoopToolExecutor {
    async fn call_tool(&self, name: &str, _arguments: &serde_json::Value) -> Result<String, BoxError> {
        Err(format!("no tool executor available to call '{}'", name).into())
    }

    fn list_tools(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Opens a tool executor from a resolved server list + per-server filter.
#[async_trait]
pub trait ToolExecutorFactory: Send + Sync {
    async fn open(
        &self,
        servers: &[String],
        tool_filter: &HashMap<String, Vec<String>>,
    ) -> Result<Arc<dyn ToolExecutor>, BoxError>;
}

/// Resolves a runbook URL to its content. `None` or any error falls back
/// to the configured default runbook content (§4.4 step 2).
#[async_trait]
pub trait RunbookResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<String, BoxError>;
}

/// The final, terminal outcome of one agent invocation, as reported by
/// its controller. The core still applies its own terminal-status mapping
/// on top of this (§4.5 step 9) — a controller is not trusted to report
/// cancellation/timeout accurately under racing cancellation.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub status: Status,
    pub final_analysis: Option<String>,
    pub error_message: Option<String>,
}

impl AgentResult {
    pub fn completed(final_analysis: impl Into<String>) -> Self {
        AgentResult {
            status: Status::Completed,
            final_analysis: Some(final_analysis.into()),
            error_message: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        AgentResult {
            status: Status::Failed,
            final_analysis: None,
            error_message: Some(error_message.into()),
        }
    }
}

/// Everything an agent controller needs to run one invocation, assembled
/// by agent invocation (§4.5 step 7). Bundles identifiers, the alert
/// payload, runbook content, the resolved config, and the collaborators;
/// the controller reads from this but never owns its lifetime.
pub struct AgentExecutionContext {
    pub session_id: String,
    pub stage_id: String,
    pub execution_id: String,
    pub agent_name: String,
    pub alert_payload: Vec<u8>,
    pub runbook_content: String,
    pub resolved_config: AgentConfig,
    pub resolved_provider: LlmProviderConfig,
    pub llm_client: Arc<dyn LlmClient>,
    pub tool_executor: Arc<dyn ToolExecutor>,
    pub event_publisher: Arc<dyn EventPublisher>,
    /// Per-server names that failed to open, kept for audit metadata even
    /// though the executor fell back to a no-op for them.
    pub failed_servers: Vec<String>,
    /// Present only when the resolved agent is an orchestrator (§4.5 step 6).
    pub orchestrator: Option<OrchestratorBundle>,
}

/// Sub-agent registry + guardrails wired in only for orchestrator-typed
/// agents.
pub struct OrchestratorBundle {
    pub sub_agents: HashMap<String, AgentConfig>,
    pub guardrails: OrchestratorGuardrails,
}

/// The core treats every controller (ReAct / native / synthesis /
/// orchestrator) as this single polymorphic capability (§9 Design Notes):
/// dynamic dispatch of controllers is a tagged implementation behind one
/// trait method, not a direct branch in the core.
#[async_trait]
pub trait AgentController: Send + Sync {
    async fn execute(
        &self,
        ctx: &TaskContext,
        exec_ctx: &AgentExecutionContext,
        prior_context: &str,
    ) -> Result<AgentResult, BoxError>;
}

/// Builds the controller instance for a resolved agent config. Dynamic
/// dispatch happens here, once, rather than scattered through the
/// invocation path.
pub trait ControllerFactory: Send + Sync {
    fn controller_for(&self, config: &AgentConfig) -> Arc<dyn AgentController>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_tool_executor_refuses_every_call() {
        let exec = NoopToolExecutor;
        let result = exec.call_tool("grep_logs", &serde_json::json!({})).await;
        assert!(result.is_err());
        assert!(exec.list_tools().is_empty());
    }

    #[test]
    fn agent_result_helpers_set_expected_fields() {
        let ok = AgentResult::completed("Healthy.");
        assert_eq!(ok.status, Status::Completed);
        assert_eq!(ok.final_analysis.as_deref(), Some("Healthy."));

        let err = AgentResult::failed("upstream 500");
        assert_eq!(err.status, Status::Failed);
        assert_eq!(err.error_message.as_deref(), Some("upstream 500"));
    }
}
