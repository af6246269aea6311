//! Agent invocation (§4.5): the contract for running one agent within a
//! stage, from config resolution through terminal-status mapping and
//! audit persistence.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use crate::collaborators::{
    AgentExecutionContext, AgentResult, ControllerFactory, LlmClient, NoopToolExecutor,
    OrchestratorBundle, ToolExecutor, ToolExecutorFactory,
};
use crate::config::{AgentConfig, ChainConfig, GlobalDefaults, McpServerConfig, Registries, StageConfig};
use crate::ctx::{CtxState, TaskContext};
use crate::error::CoreError;
use crate::event::{EventPublisher, ExecutionStatusEvent};
use crate::mcp_selection;
use crate::model::{Session, Stage, Status};
use crate::store::{NewAgentExecution, SessionStore};

pub struct AgentInvocationDeps {
    pub store: Arc<dyn SessionStore>,
    pub registries: Arc<Registries>,
    pub defaults: GlobalDefaults,
    pub llm_client: Arc<dyn LlmClient>,
    pub controller_factory: Arc<dyn ControllerFactory>,
    pub tool_executor_factory: Option<Arc<dyn ToolExecutorFactory>>,
    pub event_publisher: Arc<dyn EventPublisher>,
}

pub struct InvocationOutcome {
    pub agent_execution_id: String,
    pub status: Status,
    pub final_analysis: Option<String>,
    pub error_message: Option<String>,
}

/// Merges, in increasing precedence: agent-registry entry < chain
/// defaults < stage-wide overrides < per-agent overrides (§4.5 step 1).
fn resolve_effective_config(
    declared_name: &str,
    registries: &Registries,
    defaults: &GlobalDefaults,
    chain: &ChainConfig,
    stage_config: &StageConfig,
) -> AgentConfig {
    let mut effective = registries
        .agent(declared_name)
        .cloned()
        .unwrap_or_else(|| AgentConfig::new(declared_name, crate::config::AgentKind::React));

    if effective.llm_provider.is_none() {
        effective.llm_provider = Some(defaults.llm_provider.clone());
    }
    if effective.backend.is_none() {
        effective.backend = Some(defaults.backend.clone());
    }
    if effective.iteration_strategy.is_none() {
        effective.iteration_strategy = Some(defaults.iteration_strategy.clone());
    }

    if let Some(stage_override) = &stage_config.overrides {
        apply_override(&mut effective, stage_override);
    }
    if let Some(per_agent) = stage_config.per_agent_overrides.get(declared_name) {
        apply_override(&mut effective, per_agent);
    }

    let _ = chain;
    effective
}

fn apply_override(effective: &mut AgentConfig, ov: &crate::config::StageAgentOverride) {
    if let Some(p) = &ov.llm_provider {
        effective.llm_provider = Some(p.clone());
    }
    if let Some(b) = &ov.backend {
        effective.backend = Some(b.clone());
    }
    if let Some(s) = &ov.iteration_strategy {
        effective.iteration_strategy = Some(s.clone());
    }
    if let Some(sub) = &ov.sub_agents {
        effective.sub_agents = Some(sub.clone());
    }
}

/// Nearest non-empty sub-agents override among agent/stage/chain, falling
/// through to the full registry when all are empty/absent (§4.5 step 6,
/// resolved per the Open Question in spec.md §9: empty means fall
/// through, not "no sub-agents").
fn resolve_sub_agents<'a>(
    effective: &'a AgentConfig,
    stage_config: &'a StageConfig,
    chain: &'a ChainConfig,
    registries: &'a Registries,
) -> HashMap<String, AgentConfig> {
    let candidates = [
        effective.sub_agents.as_ref(),
        stage_config.sub_agents_override.as_ref(),
        chain.sub_agents_override.as_ref(),
    ];
    for candidate in candidates.into_iter().flatten() {
        if !candidate.is_empty() {
            return candidate
                .iter()
                .filter_map(|name| registries.agent(name).cloned().map(|c| (name.clone(), c)))
                .collect();
        }
    }
    registries.agents.clone()
}

/// Maps a controller's reported outcome to a terminal status, with the
/// override rule in §4.5 step 9: a reported success under a meanwhile-
/// cancelled/timed-out context is corrected to match the context, since
/// LLM/DB side effects racing cancellation can otherwise manufacture a
/// misleading `failed` or `completed` terminal status.
pub fn map_terminal_status(
    ctx_state_after: CtxState,
    controller_result: &Result<AgentResult, crate::error::BoxError>,
) -> (Status, Option<String>) {
    match controller_result {
        Err(e) => {
            let status = match ctx_state_after {
                CtxState::DeadlineExceeded => Status::TimedOut,
                CtxState::Cancelled => Status::Cancelled,
                CtxState::Active => Status::Failed,
            };
            (status, Some(e.to_string()))
        }
        Ok(result) => {
            let reported = result.status.terminal_or_failed();
            let status = match ctx_state_after {
                CtxState::DeadlineExceeded if reported != Status::TimedOut => Status::TimedOut,
                CtxState::Cancelled if reported != Status::Cancelled => Status::Cancelled,
                _ => reported,
            };
            (status, result.error_message.clone())
        }
    }
}

/// Runs one agent invocation end to end: resolve config, create the audit
/// row, resolve MCP selection, open (and guarantee closure of) a tool
/// executor, invoke the controller, map terminal status, persist.
pub async fn invoke_agent(
    ctx: &TaskContext,
    deps: &AgentInvocationDeps,
    session: &Session,
    stage: &Stage,
    stage_config: &StageConfig,
    chain: &ChainConfig,
    declared_name: &str,
    display_name: &str,
    launch_index: u32,
    runbook_content: &str,
    prior_context: &str,
) -> Result<InvocationOutcome, CoreError> {
    let effective = resolve_effective_config(declared_name, &deps.registries, &deps.defaults, chain, stage_config);

    let provider_name = effective.llm_provider.clone().unwrap_or_else(|| deps.defaults.llm_provider.clone());
    let backend = effective.backend.clone().unwrap_or_else(|| deps.defaults.backend.clone());
    let iteration_strategy = effective
        .iteration_strategy
        .clone()
        .unwrap_or_else(|| deps.defaults.iteration_strategy.clone());

    // Step 2: create the agent-execution row capturing what actually ran.
    let execution = deps
        .store
        .create_agent_execution(NewAgentExecution {
            stage_id: stage.id.clone(),
            session_id: session.id.clone(),
            agent_name: display_name.to_string(),
            index: launch_index + 1,
            backend: backend.clone(),
            provider: provider_name.clone(),
            iteration_strategy: iteration_strategy.clone(),
        })
        .await?;

    // Step 3: mark active, publish.
    deps.store
        .persist_agent_execution_status(&execution.id, Status::Active, None)
        .await?;
    let active_event = ExecutionStatusEvent {
        session_id: session.id.clone(),
        stage_id: stage.id.clone(),
        execution_id: execution.id.clone(),
        status: None,
        timestamp: Utc::now(),
    };
    crate::event::publish_best_effort("execution_status:active", || {
        deps.event_publisher.execution_status(&active_event)
    })
    .await;

    // Step 4: MCP selection.
    let empty_servers: HashMap<String, McpServerConfig> = deps.registries.mcp_servers.clone();
    let chain_servers: Vec<String> = mcp_selection::chain_default_servers(&empty_servers);
    let selection = mcp_selection::resolve(
        chain,
        &chain_servers,
        &deps.registries.mcp_servers,
        session.mcp_selection_override.as_ref(),
    );
    let selection = match selection {
        Ok(s) => s,
        Err(e) => {
            // Early-exit resolution error (§7): best-effort failed row.
            deps.store
                .persist_agent_execution_status(&execution.id, Status::Failed, Some(e.to_string()))
                .await?;
            return Ok(InvocationOutcome {
                agent_execution_id: execution.id,
                status: Status::Failed,
                final_analysis: None,
                error_message: Some(e.to_string()),
            });
        }
    };

    let resolved_provider = deps
        .registries
        .llm_providers
        .get(&provider_name)
        .cloned()
        .unwrap_or(crate::config::LlmProviderConfig {
            name: provider_name.clone(),
            backend: backend.clone(),
            native_tools: None,
        });
    let resolved_provider = mcp_selection::apply_native_tools_override(&resolved_provider, &selection);

    // Step 5: open a tool executor, falling back to a no-op stub; closed
    // on every exit path via the `tool_executor` RAII-by-convention guard
    // below (held in a local so `.close()` runs regardless of branch).
    let mut failed_servers = Vec::new();
    let tool_executor: Arc<dyn ToolExecutor> = if selection.servers.is_empty() {
        Arc::new(NoopToolExecutor)
    } else if let Some(factory) = &deps.tool_executor_factory {
        match factory.open(&selection.servers, &selection.tool_filter).await {
            Ok(exec) => exec,
            Err(e) => {
                log::warn!("tool executor factory failed: {}", e);
                failed_servers = selection.servers.clone();
                Arc::new(NoopToolExecutor)
            }
        }
    } else {
        failed_servers = selection.servers.clone();
        Arc::new(NoopToolExecutor)
    };

    // Step 6: orchestrator wiring.
    let orchestrator = if effective.is_orchestrator() {
        let sub_agents = resolve_sub_agents(&effective, stage_config, chain, &deps.registries);
        let guardrails = effective
            .orchestrator_guardrails
            .clone()
            .unwrap_or_else(|| deps.defaults.orchestrator_guardrails.clone())
            .clamped();
        Some(OrchestratorBundle { sub_agents, guardrails })
    } else {
        None
    };

    // Step 7: construct the execution context.
    let exec_ctx = AgentExecutionContext {
        session_id: session.id.clone(),
        stage_id: stage.id.clone(),
        execution_id: execution.id.clone(),
        agent_name: display_name.to_string(),
        alert_payload: session.alert_payload.clone(),
        runbook_content: runbook_content.to_string(),
        resolved_config: effective.clone(),
        resolved_provider,
        llm_client: deps.llm_client.clone(),
        tool_executor: tool_executor.clone(),
        event_publisher: deps.event_publisher.clone(),
        failed_servers,
        orchestrator,
    };

    // Step 8: invoke.
    let controller = deps.controller_factory.controller_for(&effective);
    let result = controller.execute(ctx, &exec_ctx, prior_context).await;

    // Tool executor must close on every exit path.
    tool_executor.close().await;

    // Step 9: map terminal status.
    let (status, error_message) = map_terminal_status(ctx.state(), &result);
    let final_analysis = result.ok().and_then(|r| r.final_analysis);

    // Step 10: persist on a background context, publish.
    let bg = TaskContext::background();
    let _ = &bg;
    deps.store
        .persist_agent_execution_status(&execution.id, status, error_message.clone())
        .await?;
    let terminal_event = ExecutionStatusEvent {
        session_id: session.id.clone(),
        stage_id: stage.id.clone(),
        execution_id: execution.id.clone(),
        status: Some(status),
        timestamp: Utc::now(),
    };
    crate::event::publish_best_effort("execution_status:terminal", || {
        deps.event_publisher.execution_status(&terminal_event)
    })
    .await;

    Ok(InvocationOutcome {
        agent_execution_id: execution.id,
        status,
        final_analysis,
        error_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentKind, StageAgentOverride};

    #[test]
    fn config_merge_respects_precedence_order() {
        let mut registries = Registries::default();
        registries.agents.insert(
            "triage".into(),
            AgentConfig::new("triage", AgentKind::React),
        );
        let defaults = GlobalDefaults::default();
        let chain = ChainConfig::new("c1");
        let mut stage = StageConfig::single("Triage", "triage");
        stage.overrides = Some(StageAgentOverride {
            backend: Some("stage-backend".into()),
            ..Default::default()
        });
        stage = stage.with_per_agent_override(
            "triage",
            StageAgentOverride {
                backend: Some("per-agent-backend".into()),
                ..Default::default()
            },
        );

        let effective = resolve_effective_config("triage", &registries, &defaults, &chain, &stage);
        // Per-agent override wins over stage-wide override.
        assert_eq!(effective.backend.as_deref(), Some("per-agent-backend"));
        // Unset fields fall back to global defaults.
        assert_eq!(effective.llm_provider.as_deref(), Some(defaults.llm_provider.as_str()));
    }

    #[test]
    fn racing_cancellation_overrides_a_reported_success() {
        let ok: Result<AgentResult, crate::error::BoxError> = Ok(AgentResult::completed("done"));
        let (status, _) = map_terminal_status(CtxState::Cancelled, &ok);
        assert_eq!(status, Status::Cancelled);

        let ok: Result<AgentResult, crate::error::BoxError> = Ok(AgentResult::completed("done"));
        let (status, _) = map_terminal_status(CtxState::Active, &ok);
        assert_eq!(status, Status::Completed);
    }

    #[test]
    fn error_under_deadline_maps_to_timed_out() {
        let err: Result<AgentResult, crate::error::BoxError> = Err("boom".into());
        let (status, msg) = map_terminal_status(CtxState::DeadlineExceeded, &err);
        assert_eq!(status, Status::TimedOut);
        assert_eq!(msg.as_deref(), Some("boom"));
    }

    #[test]
    fn empty_sub_agent_override_falls_through_to_full_registry() {
        let mut registries = Registries::default();
        registries.agents.insert("a".into(), AgentConfig::new("a", AgentKind::React));
        registries.agents.insert("b".into(), AgentConfig::new("b", AgentKind::React));
        let effective = AgentConfig::new("orch", AgentKind::Orchestrator).with_sub_agents(vec![]);
        let stage = StageConfig::single("S", "orch");
        let chain = ChainConfig::new("c1");
        let resolved = resolve_sub_agents(&effective, &stage, &chain, &registries);
        assert_eq!(resolved.len(), 2);
    }
}
