//! Session executor (§4.4): drives one session through its configured
//! chain — fail-fast, fan-out per stage, synthesis, executive summary.

use std::sync::Arc;

use crate::agent_invocation::AgentInvocationDeps;
use crate::collaborators::RunbookResolver;
use crate::config::{ChainConfig, Registries};
use crate::ctx::{CtxState, TaskContext};
use crate::error::CoreError;
use crate::model::{Session, Status};
use crate::stage::run_stage;
use crate::synthesis::{generate_executive_summary, run_synthesis};

pub struct ExecutorDeps {
    pub invocation: AgentInvocationDeps,
    pub registries: Arc<Registries>,
    pub runbook_resolver: Option<Arc<dyn RunbookResolver>>,
    pub default_runbook_content: String,
}

pub struct ExecutionOutcome {
    pub status: Status,
    pub error_message: Option<String>,
}

/// Resolves the session's runbook URL, falling back to the configured
/// default on any error or absent resolver (§4.4 step 2).
async fn resolve_runbook(deps: &ExecutorDeps, session: &Session) -> String {
    let url = match &session.runbook_url {
        Some(u) => u,
        None => return deps.default_runbook_content.clone(),
    };
    match &deps.runbook_resolver {
        None => deps.default_runbook_content.clone(),
        Some(resolver) => match resolver.resolve(url).await {
            Ok(content) => content,
            Err(e) => {
                log::warn!("runbook resolution failed, falling back to default: {}", e);
                deps.default_runbook_content.clone()
            }
        },
    }
}

/// Runs the full chain for one session.
pub async fn run_session(
    ctx: &TaskContext,
    deps: &ExecutorDeps,
    session: &Session,
) -> Result<ExecutionOutcome, CoreError> {
    let chain: ChainConfig = match deps.registries.chain(&session.chain_id) {
        None => {
            return Ok(ExecutionOutcome {
                status: Status::Failed,
                error_message: Some(format!("chain not found: {}", session.chain_id)),
            })
        }
        Some(c) if !c.has_stages() => {
            return Ok(ExecutionOutcome {
                status: Status::Failed,
                error_message: Some("no stages".to_string()),
            })
        }
        Some(c) => c.clone(),
    };

    let runbook_content = resolve_runbook(deps, session).await;
    let total_expected_steps = chain.total_expected_steps();

    let mut prior_context = String::new();
    let mut db_stage_index = 0u32;
    let mut final_analysis: Option<String> = None;

    for stage_config in &chain.stages {
        // Check for cancellation/deadline between stages (§4.4 step 4a).
        match ctx.state() {
            CtxState::Cancelled => {
                return Ok(ExecutionOutcome {
                    status: Status::Cancelled,
                    error_message: None,
                })
            }
            CtxState::DeadlineExceeded => {
                return Ok(ExecutionOutcome {
                    status: Status::TimedOut,
                    error_message: None,
                })
            }
            CtxState::Active => {}
        }

        db_stage_index += 1;
        let stage_outcome = run_stage(
            ctx,
            &deps.invocation,
            session,
            &chain,
            stage_config,
            db_stage_index,
            &prior_context,
            total_expected_steps,
            &runbook_content,
        )
        .await?;

        if stage_outcome.status != Status::Completed {
            // Fail-fast: no further stage rows are created.
            return Ok(ExecutionOutcome {
                status: stage_outcome.status,
                error_message: stage_outcome.error_message,
            });
        }

        let mut stage_final_analysis = stage_outcome.final_analysis.clone();
        let mut stage_name_for_context = stage_config.name.clone();

        if stage_outcome.stage.expected_agent_count > 1 {
            db_stage_index += 1;
            let (synthesis_stage, synthesis_status, synthesis_error) = run_synthesis(
                ctx,
                &deps.invocation,
                session,
                &chain,
                stage_config,
                &stage_outcome,
                db_stage_index,
                total_expected_steps,
            )
            .await?;

            if synthesis_status != Status::Completed {
                return Ok(ExecutionOutcome {
                    status: synthesis_status,
                    error_message: synthesis_error,
                });
            }
            stage_name_for_context = synthesis_stage.name.clone();
            // The synthesis result replaces the parallel-stage result for
            // downstream context — re-fetch its agent's final analysis.
            let execs = deps.invocation.store.list_agent_executions(&synthesis_stage.id).await?;
            if let Some(exec) = execs.first() {
                let events = deps
                    .invocation
                    .store
                    .list_timeline_events_for_execution(&exec.id)
                    .await?;
                stage_final_analysis = events
                    .iter()
                    .rev()
                    .find(|e| e.kind == crate::model::TimelineEventKind::FinalAnalysis)
                    .map(|e| e.content.clone())
                    .or(stage_final_analysis);
            }
        }

        if let Some(text) = &stage_final_analysis {
            final_analysis = Some(text.clone());
        }

        prior_context = build_cumulative_context(&prior_context, &stage_name_for_context, stage_final_analysis.as_deref());
    }

    if let Some(text) = &final_analysis {
        deps.invocation.store.set_final_analysis(&session.id, text).await?;
    }

    let mut session_for_summary = session.clone();
    session_for_summary.final_analysis = final_analysis;
    generate_executive_summary(
        deps.invocation.store.as_ref(),
        &deps.invocation.llm_client,
        Some(deps.invocation.event_publisher.as_ref()),
        &session_for_summary,
    )
    .await;

    Ok(ExecutionOutcome {
        status: Status::Completed,
        error_message: None,
    })
}

/// Builds the cumulative prior-stage context string handed to the next
/// stage (§4.4 step 4e). Uses a delimiter plus the stage name so a
/// downstream agent can recover provenance (exercised by scenario 2 in
/// §8, which checks for either the delimiter or the stage name).
fn build_cumulative_context(prior: &str, stage_name: &str, final_analysis: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str(prior);
    if !prior.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str("--- ");
    out.push_str(stage_name);
    out.push_str(" ---\n");
    out.push_str(final_analysis.unwrap_or(""));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        AgentController, AgentExecutionContext, AgentResult, ControllerFactory, LlmClient, LlmMessage,
    };
    use crate::config::{AgentConfig, AgentKind, ChainConfig, GlobalDefaults, StageConfig};
    use crate::error::BoxError;
    use crate::event::noop_publisher;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct ScriptedController {
        analysis: String,
        fail: bool,
    }

    #[async_trait]
    impl AgentController for ScriptedController {
        async fn execute(
            &self,
            _ctx: &TaskContext,
            _exec_ctx: &AgentExecutionContext,
            _prior_context: &str,
        ) -> Result<AgentResult, BoxError> {
            if self.fail {
                Err("LLM returned an error".into())
            } else {
                Ok(AgentResult::completed(self.analysis.clone()))
            }
        }
    }

    struct ScriptedFactory {
        fail: bool,
    }

    impl ControllerFactory for ScriptedFactory {
        fn controller_for(&self, _config: &AgentConfig) -> Arc<dyn AgentController> {
            Arc::new(ScriptedController {
                analysis: "Healthy.".to_string(),
                fail: self.fail,
            })
        }
    }

    struct StubLlm;
    #[async_trait]
    impl LlmClient for StubLlm {
        async fn send_message(&self, _messages: &[LlmMessage]) -> Result<LlmMessage, BoxError> {
            Ok(LlmMessage { role: "assistant", content: Arc::from("Summary.") })
        }
        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn deps(registries: Registries, fail: bool) -> (ExecutorDeps, Arc<MemoryStore>) {
        let registries = Arc::new(registries);
        let store = MemoryStore::new();
        let executor_deps = ExecutorDeps {
            invocation: AgentInvocationDeps {
                store: store.clone(),
                registries: registries.clone(),
                defaults: GlobalDefaults::default(),
                llm_client: Arc::new(StubLlm),
                controller_factory: Arc::new(ScriptedFactory { fail }),
                tool_executor_factory: None,
                event_publisher: noop_publisher(),
            },
            registries,
            runbook_resolver: None,
            default_runbook_content: String::new(),
        };
        (executor_deps, store)
    }

    #[tokio::test]
    async fn single_stage_success_completes_the_session() {
        let mut registries = Registries::default();
        registries.agents.insert("triage".into(), AgentConfig::new("triage", AgentKind::React));
        registries.chains.insert(
            "c1".into(),
            ChainConfig::new("c1").stage(StageConfig::single("Triage", "triage")),
        );
        let (deps, store) = deps(registries, false);
        let session = Session::new("s1", "c1", "PodOOM");
        store.insert_session(session.clone()).await;

        let ctx = TaskContext::with_timeout(std::time::Duration::from_secs(30));
        let outcome = run_session(&ctx, &deps, &session).await.unwrap();
        assert_eq!(outcome.status, Status::Completed);

        let stages = deps.invocation.store.list_stages("s1").await.unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].status, Status::Completed);
    }

    #[tokio::test]
    async fn zero_stage_chain_fails_immediately() {
        let mut registries = Registries::default();
        registries.chains.insert("empty".into(), ChainConfig::new("empty"));
        let (deps, store) = deps(registries, false);
        let session = Session::new("s1", "empty", "PodOOM");
        store.insert_session(session.clone()).await;

        let ctx = TaskContext::with_timeout(std::time::Duration::from_secs(30));
        let outcome = run_session(&ctx, &deps, &session).await.unwrap();
        assert_eq!(outcome.status, Status::Failed);
        assert_eq!(outcome.error_message.as_deref(), Some("no stages"));
    }

    #[tokio::test]
    async fn fail_fast_stops_after_first_failing_stage() {
        let mut registries = Registries::default();
        registries.agents.insert("triage".into(), AgentConfig::new("triage", AgentKind::React));
        registries.chains.insert(
            "c1".into(),
            ChainConfig::new("c1")
                .stage(StageConfig::single("Triage", "triage"))
                .stage(StageConfig::single("Diagnose", "triage")),
        );
        let (deps, store) = deps(registries, true);
        let session = Session::new("s1", "c1", "PodOOM");
        store.insert_session(session.clone()).await;

        let ctx = TaskContext::with_timeout(std::time::Duration::from_secs(30));
        let outcome = run_session(&ctx, &deps, &session).await.unwrap();
        assert_eq!(outcome.status, Status::Failed);

        let stages = deps.invocation.store.list_stages("s1").await.unwrap();
        assert_eq!(stages.len(), 1, "no stage row should exist for stage two");
    }

    #[tokio::test]
    async fn multi_stage_context_carries_prior_final_analysis() {
        let mut registries = Registries::default();
        registries.agents.insert("a".into(), AgentConfig::new("a", AgentKind::React));
        registries.chains.insert(
            "c1".into(),
            ChainConfig::new("c1")
                .stage(StageConfig::single("StageA", "a"))
                .stage(StageConfig::single("StageB", "a")),
        );
        let (deps, store) = deps(registries, false);
        let session = Session::new("s1", "c1", "PodOOM");
        store.insert_session(session.clone()).await;

        let ctx = TaskContext::with_timeout(std::time::Duration::from_secs(30));
        let outcome = run_session(&ctx, &deps, &session).await.unwrap();
        assert_eq!(outcome.status, Status::Completed);

        let ctx_str = build_cumulative_context("", "StageA", Some("Healthy."));
        assert!(ctx_str.contains("StageA"));
        assert!(ctx_str.contains("Healthy."));
    }
}
