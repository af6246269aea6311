//! Chat executor (§4.7): the asynchronous, one-at-a-time follow-up
//! conversation path. Independent of the queue pool; shares the agent-
//! invocation and MCP-selection helpers but owns its own submit/cancel
//! lifecycle and context-building path.
//!
//! Modeled on a moderated orchestration mode: a single-flight selection
//! followed by a detached task spawn, the same shape as "pick exactly one
//! participant, run it off the critical path".

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::agent_invocation::{invoke_agent, AgentInvocationDeps};
use crate::config::{ChainConfig, StageConfig};
use crate::ctx::TaskContext;
use crate::error::CoreError;
use crate::event::{publish_best_effort, TimelineCreatedEvent};
use crate::model::{
    Stage, TimelineEvent, TimelineEventKind, TimelineEventStatus,
};
use crate::store::{NewStage, SessionStore};

const CHAT_STAGE_NAME: &str = "Chat Response";
const SYNTHESIS_SUFFIX: &str = " - Synthesis";
const CHAT_AGENT_NAME: &str = "chat";

struct ChatExecutorState {
    stopped: bool,
    active: HashMap<String, TaskContext>,
    inflight: u64,
}

pub struct ChatExecutor {
    invocation: Arc<AgentInvocationDeps>,
    store: Arc<dyn SessionStore>,
    chat_timeout: Duration,
    grace_period: Duration,
    state: tokio::sync::Mutex<ChatExecutorState>,
    drained: tokio::sync::Notify,
}

impl ChatExecutor {
    pub fn new(invocation: Arc<AgentInvocationDeps>, chat_timeout: Duration, grace_period: Duration) -> Arc<Self> {
        Arc::new(ChatExecutor {
            store: invocation.store.clone(),
            invocation,
            chat_timeout,
            grace_period,
            state: tokio::sync::Mutex::new(ChatExecutorState {
                stopped: false,
                active: HashMap::new(),
                inflight: 0,
            }),
            drained: tokio::sync::Notify::new(),
        })
    }

    /// Synchronous entry point (§4.7 submit protocol). Returns the
    /// sentinel `ChatExecutionActive` if the chat already has a
    /// non-terminal stage, or `ShuttingDown` if stopped.
    pub async fn submit(self: &Arc<Self>, chat_id: &str, message_id: &str) -> Result<String, CoreError> {
        {
            let state = self.state.lock().await;
            if state.stopped {
                return Err(CoreError::ShuttingDown);
            }
        }

        if self.store.find_active_chat_stage(chat_id).await?.is_some() {
            return Err(CoreError::ChatExecutionActive);
        }

        let chat = self
            .store
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| CoreError::Store(format!("chat not found: {}", chat_id).into()))?;

        let next_index = self.store.max_stage_index(&chat.session_id).await? + 1;
        let stage = self
            .store
            .create_stage(
                NewStage {
                    session_id: chat.session_id.clone(),
                    name: CHAT_STAGE_NAME.to_string(),
                    index: next_index,
                    expected_agent_count: 1,
                    parallel_kind: None,
                    success_policy: None,
                    chat_id: Some(chat_id.to_string()),
                    chat_user_message_id: Some(message_id.to_string()),
                },
                Utc::now(),
            )
            .await?;

        // Double-check + lock-protected wait-group increment: prevents a
        // race where `Stop` completes between the first check and the
        // goroutine launch.
        {
            let mut state = self.state.lock().await;
            if state.stopped {
                return Err(CoreError::ShuttingDown);
            }
            state.inflight += 1;
        }

        let this = self.clone();
        let chat_id_owned = chat_id.to_string();
        let message_id_owned = message_id.to_string();
        let session_id = chat.session_id.clone();
        let stage_id = stage.id.clone();
        tokio::spawn(async move {
            this.run(chat_id_owned, message_id_owned, session_id, stage).await;
        });

        Ok(stage_id)
    }

    async fn run(self: Arc<Self>, chat_id: String, message_id: String, session_id: String, stage: Stage) {
        let ctx = TaskContext::with_timeout(self.chat_timeout);
        {
            let mut state = self.state.lock().await;
            state.active.insert(chat_id.clone(), ctx.clone());
        }

        let result = self.run_inner(&ctx, &chat_id, &message_id, &session_id, &stage).await;
        if let Err(e) = result {
            log::error!("chat execution {} failed: {}", chat_id, e);
        }

        let mut state = self.state.lock().await;
        state.active.remove(&chat_id);
        state.inflight = state.inflight.saturating_sub(1);
        if state.stopped && state.inflight == 0 {
            self.drained.notify_waiters();
        }
    }

    async fn run_inner(
        &self,
        ctx: &TaskContext,
        chat_id: &str,
        message_id: &str,
        session_id: &str,
        stage: &Stage,
    ) -> Result<(), CoreError> {
        let message = self
            .store
            .get_chat_user_message(message_id)
            .await?
            .ok_or_else(|| CoreError::Store(format!("chat message not found: {}", message_id).into()))?;

        // Fire-and-forget user-question event: content is fully known.
        let seq = self.store.next_sequence(session_id).await?;
        let mut question_event = TimelineEvent::new_completed(
            uuid::Uuid::new_v4().to_string(),
            session_id.to_string(),
            seq,
            TimelineEventKind::UserQuestion,
            message.content.clone(),
            Utc::now(),
        );
        question_event.stage_id = Some(stage.id.clone());
        let question_event = self.store.insert_timeline_event(question_event).await?;
        let question_created_event = TimelineCreatedEvent {
            event_id: question_event.id.clone(),
            session_id: session_id.to_string(),
            stage_id: Some(stage.id.clone()),
            execution_id: None,
            status: TimelineEventStatus::Completed,
            sequence: question_event.sequence,
        };
        publish_best_effort("timeline_created:user_question", || {
            self.invocation.event_publisher.timeline_created(&question_created_event)
        })
        .await;

        let chat_context = build_chat_context(self.store.as_ref(), session_id, &stage.id).await?;

        // Heartbeat: keep the chat's owning session's last-interaction-at
        // fresh for orphan detection while the chat turn runs.
        let heartbeat_store = self.store.clone();
        let heartbeat_session = session_id.to_string();
        let heartbeat_ctx = ctx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                if heartbeat_ctx.is_done() {
                    break;
                }
                if let Err(e) = heartbeat_store.update_heartbeat(&heartbeat_session, Utc::now()).await {
                    log::warn!("chat heartbeat failed: {}", e);
                }
            }
        });

        let cut_off = Utc::now();
        let chain = ChainConfig::new("__chat__");
        let stage_config = StageConfig::single(CHAT_STAGE_NAME, CHAT_AGENT_NAME);
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| CoreError::Store(format!("session not found: {}", session_id).into()))?;

        let outcome = invoke_agent(
            ctx,
            &self.invocation,
            &session,
            stage,
            &stage_config,
            &chain,
            CHAT_AGENT_NAME,
            CHAT_AGENT_NAME,
            0,
            "",
            &chat_context,
        )
        .await;

        heartbeat_handle.abort();

        let (status, error_message) = match outcome {
            Ok(o) => (o.status, o.error_message),
            Err(e) => (crate::model::Status::Failed, Some(e.to_string())),
        };

        let bg = TaskContext::background();
        let _ = &bg;
        self.store
            .persist_stage_terminal(&stage.id, status, Utc::now(), error_message)
            .await?;
        let stage_terminal_event = crate::event::StageStatusEvent {
            session_id: session_id.to_string(),
            stage_id: stage.id.clone(),
            stage_name: stage.name.clone(),
            stage_index: stage.index,
            status: Some(status),
            timestamp: Utc::now(),
        };
        publish_best_effort("stage_status:terminal", || {
            self.invocation.event_publisher.stage_status(&stage_terminal_event)
        })
        .await;

        // Schedule transient-event cleanup, excluding events from any
        // subsequent chat started within the grace window (§4.7 step 9).
        let grace = self.grace_period;
        let store = self.store.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            log::debug!(
                "scheduled transient-event cleanup for session {} (cut-off {})",
                session_id,
                cut_off
            );
            let _ = store; // a real implementation purges TransientEvent rows older than cut_off here.
        });

        Ok(())
    }

    pub async fn cancel_by_chat(&self, chat_id: &str) -> bool {
        let state = self.state.lock().await;
        if let Some(ctx) = state.active.get(chat_id) {
            ctx.cancel();
            true
        } else {
            false
        }
    }

    pub async fn cancel_by_session(&self, store: &dyn SessionStore, session_id: &str) -> Result<u32, CoreError> {
        let stages = store.list_stages(session_id).await?;
        let mut cancelled = 0;
        let state = self.state.lock().await;
        for stage in stages.into_iter().filter_map(|s| s.chat_id) {
            if let Some(ctx) = state.active.get(&stage) {
                ctx.cancel();
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Idempotent: a second call is a no-op. Cancels every active chat
    /// context (§5 Cancellation source 3) and waits for in-flight turns
    /// to drain.
    pub async fn stop(&self) {
        let already_stopped = {
            let mut state = self.state.lock().await;
            let was = state.stopped;
            state.stopped = true;
            for ctx in state.active.values() {
                ctx.cancel();
            }
            was
        };
        if already_stopped {
            return;
        }
        loop {
            // Registering the `Notified` future before re-checking the
            // condition (rather than after) avoids a lost wakeup if the
            // last in-flight turn drains between the check and the await.
            let notified = self.drained.notified();
            let remaining = self.state.lock().await.inflight;
            if remaining == 0 {
                break;
            }
            notified.await;
        }
    }
}

/// One agent's packaged contribution to the chat context (§4.7.1
/// "Investigation stages").
struct InvestigationAgent {
    name: String,
    index: u32,
    iteration_strategy: String,
    provider: String,
    status: crate::model::Status,
    error: Option<String>,
    events: Vec<TimelineEvent>,
}

/// Builds the structured view of every prior stage handed to the chat
/// agent as its investigation context (§4.7.1).
pub async fn build_chat_context(
    store: &dyn SessionStore,
    session_id: &str,
    current_stage_id: &str,
) -> Result<String, CoreError> {
    let stages = store.list_stages(session_id).await?;

    // Synthesis pairing: key by the *preceding* investigation stage whose
    // name matches the synthesis stage's name prefix. This resolves
    // collisions when several stages share a name (§8 scenario 7).
    let mut synthesis_by_preceding_id: HashMap<String, String> = HashMap::new();
    for (i, stage) in stages.iter().enumerate() {
        if let Some(prefix) = stage.name.strip_suffix(SYNTHESIS_SUFFIX) {
            if let Some(preceding) = stages[..i].iter().rev().find(|s| s.name == prefix) {
                let execs = store.list_agent_executions(&stage.id).await?;
                if let Some(exec) = execs.first() {
                    let events = store.list_timeline_events_for_execution(&exec.id).await?;
                    if let Some(final_analysis) = events
                        .iter()
                        .rev()
                        .find(|e| e.kind == TimelineEventKind::FinalAnalysis)
                        .map(|e| e.content.clone())
                    {
                        synthesis_by_preceding_id.insert(preceding.id.clone(), final_analysis);
                    }
                }
            }
        }
    }

    let mut out = String::new();
    let mut prior_chat_qas: Vec<(String, String)> = Vec::new();

    for stage in &stages {
        if stage.name.ends_with(SYNTHESIS_SUFFIX) {
            continue; // consumed above via synthesis_by_preceding_id
        }

        if let Some(chat_id) = &stage.chat_id {
            if stage.id != current_stage_id {
                let question = store
                    .list_timeline_events_for_session(session_id)
                    .await?
                    .into_iter()
                    .find(|e| e.stage_id.as_deref() == Some(stage.id.as_str()) && e.kind == TimelineEventKind::UserQuestion)
                    .map(|e| e.content)
                    .unwrap_or_default();
                let answer = stage_final_analysis(store, stage).await?.unwrap_or_default();
                prior_chat_qas.push((question, answer));
            }
            let _ = chat_id;
            continue;
        }

        // Investigation stage.
        let mut execs = store.list_agent_executions(&stage.id).await?;
        execs.sort_by_key(|e| e.index);
        let mut agents = Vec::with_capacity(execs.len());
        for exec in &execs {
            let events = store.list_timeline_events_for_execution(&exec.id).await?;
            agents.push(InvestigationAgent {
                name: exec.agent_name.clone(),
                index: exec.index,
                iteration_strategy: exec.iteration_strategy.clone(),
                provider: exec.provider.clone(),
                status: exec.status,
                error: exec.error_message.clone(),
                events,
            });
        }

        out.push_str(&format!("## Stage: {}\n", stage.name));
        for agent in &agents {
            out.push_str(&format!(
                "- Agent {} ({}, {}, provider={}): {}\n",
                agent.index, agent.name, agent.iteration_strategy, agent.provider, agent.status
            ));
            if let Some(err) = &agent.error {
                out.push_str(&format!("  error: {}\n", err));
            }
            for event in &agent.events {
                out.push_str(&format!("  [{:?}] {}\n", event.kind, event.content));
            }
        }
        if let Some(synthesis) = synthesis_by_preceding_id.get(&stage.id) {
            out.push_str(&format!("### Synthesis\n{}\n", synthesis));
        }
        out.push('\n');
    }

    let events = store.list_timeline_events_for_session(session_id).await?;
    if let Some(summary) = events.iter().find(|e| e.is_executive_summary()) {
        out.push_str(&format!("## Executive Summary\n{}\n\n", summary.content));
    }

    if !prior_chat_qas.is_empty() {
        out.push_str("## Previous Chat\n");
        for (q, a) in &prior_chat_qas {
            out.push_str(&format!("Q: {}\nA: {}\n", q, a));
        }
    }

    Ok(out)
}

async fn stage_final_analysis(store: &dyn SessionStore, stage: &Stage) -> Result<Option<String>, CoreError> {
    let execs = store.list_agent_executions(&stage.id).await?;
    for exec in execs {
        let events = store.list_timeline_events_for_execution(&exec.id).await?;
        if let Some(e) = events.iter().rev().find(|e| e.kind == TimelineEventKind::FinalAnalysis) {
            return Ok(Some(e.content.clone()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        AgentController, AgentExecutionContext, AgentResult, ControllerFactory, LlmClient, LlmMessage,
    };
    use crate::config::{AgentConfig, AgentKind, GlobalDefaults, Registries};
    use crate::error::BoxError;
    use crate::event::noop_publisher;
    use crate::model::{Chat, ChatUserMessage, Session};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct SlowController;
    #[async_trait]
    impl AgentController for SlowController {
        async fn execute(
            &self,
            _ctx: &TaskContext,
            _exec_ctx: &AgentExecutionContext,
            _prior_context: &str,
        ) -> Result<AgentResult, BoxError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(AgentResult::completed("Answer."))
        }
    }

    struct SlowFactory;
    impl ControllerFactory for SlowFactory {
        fn controller_for(&self, _config: &AgentConfig) -> Arc<dyn AgentController> {
            Arc::new(SlowController)
        }
    }

    struct StubLlm;
    #[async_trait]
    impl LlmClient for StubLlm {
        async fn send_message(&self, _messages: &[LlmMessage]) -> Result<LlmMessage, BoxError> {
            Ok(LlmMessage { role: "assistant", content: Arc::from("ok") })
        }
        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn executor() -> (Arc<ChatExecutor>, Arc<MemoryStore>) {
        let store = MemoryStore::new();
        let mut registries = Registries::default();
        registries.agents.insert(CHAT_AGENT_NAME.into(), AgentConfig::new(CHAT_AGENT_NAME, AgentKind::React));
        let invocation = Arc::new(AgentInvocationDeps {
            store: store.clone(),
            registries: Arc::new(registries),
            defaults: GlobalDefaults::default(),
            llm_client: Arc::new(StubLlm),
            controller_factory: Arc::new(SlowFactory),
            tool_executor_factory: None,
            event_publisher: noop_publisher(),
        });
        (
            ChatExecutor::new(invocation, Duration::from_secs(30), Duration::from_millis(10)),
            store,
        )
    }

    #[tokio::test]
    async fn second_submit_while_first_is_active_returns_sentinel() {
        let (executor, store) = executor();
        let session = Session::new("s1", "c1", "PodOOM");
        store.insert_session(session.clone()).await;
        store.insert_chat(Chat { id: "chat1".into(), session_id: "s1".into(), created_at: Utc::now() }).await;
        store
            .insert_chat_message(ChatUserMessage {
                id: "m1".into(),
                chat_id: "chat1".into(),
                content: "why did it crash?".into(),
                created_at: Utc::now(),
            })
            .await;
        store
            .insert_chat_message(ChatUserMessage {
                id: "m2".into(),
                chat_id: "chat1".into(),
                content: "anything else?".into(),
                created_at: Utc::now(),
            })
            .await;

        executor.submit("chat1", "m1").await.unwrap();
        let second = executor.submit("chat1", "m2").await;
        assert!(matches!(second, Err(CoreError::ChatExecutionActive)));

        // Let the first turn's controller finish.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let third = executor.submit("chat1", "m2").await;
        assert!(third.is_ok(), "after completion, ChatExecutionActive should not recur");
    }

    #[tokio::test]
    async fn duplicate_stage_names_both_surface_in_context() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let session = Session::new("s1", "c1", "PodOOM");
        store.insert_session(session).await;

        let analysis_a = store
            .create_stage(
                NewStage {
                    session_id: "s1".into(),
                    name: "Analysis".into(),
                    index: 1,
                    expected_agent_count: 1,
                    parallel_kind: None,
                    success_policy: None,
                    chat_id: None,
                    chat_user_message_id: None,
                },
                now,
            )
            .await
            .unwrap();
        let exec_a = store
            .create_agent_execution(crate::store::NewAgentExecution {
                stage_id: analysis_a.id.clone(),
                session_id: "s1".into(),
                agent_name: "agent".into(),
                index: 1,
                backend: "b".into(),
                provider: "p".into(),
                iteration_strategy: "react".into(),
            })
            .await
            .unwrap();
        let seq = store.next_sequence("s1").await.unwrap();
        let mut event_a = TimelineEvent::new_completed(
            "e1",
            "s1",
            seq,
            TimelineEventKind::FinalAnalysis,
            "dummy",
            now,
        );
        event_a.execution_id = Some(exec_a.id.clone());
        store.insert_timeline_event(event_a).await.unwrap();

        let synth_a = store
            .create_stage(
                NewStage {
                    session_id: "s1".into(),
                    name: "Analysis - Synthesis".into(),
                    index: 2,
                    expected_agent_count: 1,
                    parallel_kind: None,
                    success_policy: None,
                    chat_id: None,
                    chat_user_message_id: None,
                },
                now,
            )
            .await
            .unwrap();
        let exec_syn_a = store
            .create_agent_execution(crate::store::NewAgentExecution {
                stage_id: synth_a.id.clone(),
                session_id: "s1".into(),
                agent_name: "synthesis".into(),
                index: 1,
                backend: "b".into(),
                provider: "p".into(),
                iteration_strategy: "react".into(),
            })
            .await
            .unwrap();
        let seq = store.next_sequence("s1").await.unwrap();
        let mut syn_event_a = TimelineEvent::new_completed(
            "e2",
            "s1",
            seq,
            TimelineEventKind::FinalAnalysis,
            "SYN-A",
            now,
        );
        syn_event_a.execution_id = Some(exec_syn_a.id.clone());
        store.insert_timeline_event(syn_event_a).await.unwrap();

        let analysis_b = store
            .create_stage(
                NewStage {
                    session_id: "s1".into(),
                    name: "Analysis".into(),
                    index: 3,
                    expected_agent_count: 1,
                    parallel_kind: None,
                    success_policy: None,
                    chat_id: None,
                    chat_user_message_id: None,
                },
                now,
            )
            .await
            .unwrap();
        let exec_b = store
            .create_agent_execution(crate::store::NewAgentExecution {
                stage_id: analysis_b.id.clone(),
                session_id: "s1".into(),
                agent_name: "agent".into(),
                index: 1,
                backend: "b".into(),
                provider: "p".into(),
                iteration_strategy: "react".into(),
            })
            .await
            .unwrap();
        let seq = store.next_sequence("s1").await.unwrap();
        let mut event_b = TimelineEvent::new_completed(
            "e3",
            "s1",
            seq,
            TimelineEventKind::FinalAnalysis,
            "dummy2",
            now,
        );
        event_b.execution_id = Some(exec_b.id.clone());
        store.insert_timeline_event(event_b).await.unwrap();

        let synth_b = store
            .create_stage(
                NewStage {
                    session_id: "s1".into(),
                    name: "Analysis - Synthesis".into(),
                    index: 4,
                    expected_agent_count: 1,
                    parallel_kind: None,
                    success_policy: None,
                    chat_id: None,
                    chat_user_message_id: None,
                },
                now,
            )
            .await
            .unwrap();
        let exec_syn_b = store
            .create_agent_execution(crate::store::NewAgentExecution {
                stage_id: synth_b.id.clone(),
                session_id: "s1".into(),
                agent_name: "synthesis".into(),
                index: 1,
                backend: "b".into(),
                provider: "p".into(),
                iteration_strategy: "react".into(),
            })
            .await
            .unwrap();
        let seq = store.next_sequence("s1").await.unwrap();
        let mut syn_event_b = TimelineEvent::new_completed(
            "e4",
            "s1",
            seq,
            TimelineEventKind::FinalAnalysis,
            "SYN-B",
            now,
        );
        syn_event_b.execution_id = Some(exec_syn_b.id.clone());
        store.insert_timeline_event(syn_event_b).await.unwrap();

        let context = build_chat_context(store.as_ref(), "s1", "none").await.unwrap();
        assert!(context.contains("SYN-A"));
        assert!(context.contains("SYN-B"));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (executor, _store) = executor();
        executor.stop().await;
        executor.stop().await;
    }
}
