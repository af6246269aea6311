//! Synthesis (§4.4.2) and executive summary (§4.4.3).
//!
//! Synthesis consolidates a multi-agent stage's parallel results into a
//! single structured investigation, then runs one more agent over it.
//! Shaped after a hierarchical-layer synthesis step, where a final layer
//! folds many participants' outputs into one synthesizer turn.

use chrono::Utc;
use std::sync::Arc;

use crate::agent_invocation::{invoke_agent, AgentInvocationDeps};
use crate::collaborators::LlmClient;
use crate::config::{ChainConfig, StageConfig};
use crate::ctx::TaskContext;
use crate::error::CoreError;
use crate::event::{publish_best_effort, InteractionCreatedEvent};
use crate::model::{
    Session, Stage, Status, TimelineEvent, TimelineEventKind, EXECUTIVE_SUMMARY_SEQUENCE,
};
use crate::stage::{clamp_progress, StageOutcome};
use crate::store::{NewStage, SessionStore};

const SYNTHESIS_AGENT_NAME: &str = "synthesis";

/// Formats the parallel investigation that the synthesis agent reads in
/// place of a normal "previous stage" context string (§4.4.2).
pub async fn format_investigation(
    store: &dyn SessionStore,
    parent: &StageOutcome,
) -> Result<String, CoreError> {
    let mut out = String::new();
    for (config, outcome) in &parent.per_agent {
        out.push_str(&format!(
            "### Agent {} ({}): {}\n",
            config.launch_index + 1,
            config.display_name,
            outcome.status
        ));
        if let Some(err) = &outcome.error_message {
            out.push_str(&format!("Error: {}\n", err));
        }
        let events = store.list_timeline_events_for_execution(&outcome.agent_execution_id).await?;
        for event in events {
            out.push_str(&format!("- [{:?}] {}\n", event.kind, event.content));
        }
        out.push('\n');
    }
    Ok(out)
}

/// Runs the synthesis stage following a completed multi-agent stage
/// (§4.4.2). Returns a `StageOutcome`-shaped result whose `final_analysis`
/// replaces the parent stage's for onward propagation.
pub async fn run_synthesis(
    ctx: &TaskContext,
    deps: &AgentInvocationDeps,
    session: &Session,
    chain: &ChainConfig,
    parent_stage_config: &StageConfig,
    parent: &StageOutcome,
    db_stage_index: u32,
    total_expected_steps: u32,
) -> Result<(Stage, Status, Option<String>), CoreError> {
    let investigation = format_investigation(deps.store.as_ref(), parent).await?;

    let stage = deps
        .store
        .create_stage(
            NewStage {
                session_id: session.id.clone(),
                name: format!("{} - Synthesis", parent.stage.name),
                index: db_stage_index,
                expected_agent_count: 1,
                parallel_kind: None,
                success_policy: None,
                chat_id: None,
                chat_user_message_id: None,
            },
            Utc::now(),
        )
        .await?;

    deps.store
        .update_session_progress(&session.id, clamp_progress(db_stage_index, total_expected_steps), &stage.id)
        .await?;

    let outcome = invoke_agent(
        ctx,
        deps,
        session,
        &stage,
        parent_stage_config,
        chain,
        SYNTHESIS_AGENT_NAME,
        "Synthesis",
        0,
        "",
        &investigation,
    )
    .await?;

    deps.store
        .persist_stage_terminal(&stage.id, outcome.status, Utc::now(), outcome.error_message.clone())
        .await?;

    Ok((stage, outcome.status, outcome.error_message))
}

/// Generates the executive summary fail-open (§4.4.3): any error is
/// captured on the session without failing it. On success, inserts a
/// timeline event carrying the sentinel sequence number. This event is
/// never published over the event bus — clients read it from the
/// session's detail endpoint, not the live stream.
pub async fn generate_executive_summary(
    store: &dyn SessionStore,
    llm_client: &Arc<dyn LlmClient>,
    event_publisher_for_interaction: Option<&dyn crate::event::EventPublisher>,
    session: &Session,
) {
    let final_analysis = match &session.final_analysis {
        Some(text) => text.clone(),
        None => return,
    };

    let started = std::time::Instant::now();
    let messages = [
        crate::collaborators::LlmMessage {
            role: "system",
            content: Arc::from("Summarize this investigation for an on-call engineer in two sentences."),
        },
        crate::collaborators::LlmMessage {
            role: "user",
            content: Arc::from(final_analysis.as_str()),
        },
    ];

    match llm_client.send_message(&messages).await {
        Ok(response) => {
            let seq = EXECUTIVE_SUMMARY_SEQUENCE;
            let event = TimelineEvent::new_completed(
                uuid::Uuid::new_v4().to_string(),
                session.id.clone(),
                seq,
                TimelineEventKind::ExecutiveSummary,
                response.content.to_string(),
                Utc::now(),
            );
            if let Err(e) = store.insert_timeline_event(event).await {
                log::error!("failed to persist executive summary event: {}", e);
            }
            if let Err(e) = store
                .set_executive_summary(&session.id, Some(response.content.to_string()), None)
                .await
            {
                log::error!("failed to persist executive summary: {}", e);
            }
            if let Some(publisher) = event_publisher_for_interaction {
                let interaction_event = InteractionCreatedEvent {
                    session_id: session.id.clone(),
                    execution_id: None,
                    conversation: response.content.to_string(),
                    input_tokens: 0,
                    output_tokens: 0,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                publish_best_effort("interaction_created:executive_summary", || {
                    publisher.interaction_created(&interaction_event)
                })
                .await;
            }
        }
        Err(e) => {
            log::warn!("executive summary generation failed: {}", e);
            if let Err(store_err) = store.set_executive_summary(&session.id, None, Some(e.to_string())).await {
                log::error!("failed to persist executive summary error: {}", store_err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LlmMessage;
    use crate::error::BoxError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct OkClient;
    #[async_trait]
    impl LlmClient for OkClient {
        async fn send_message(&self, _messages: &[LlmMessage]) -> Result<LlmMessage, BoxError> {
            Ok(LlmMessage { role: "assistant", content: Arc::from("Looks healthy overall.") })
        }
        fn model_name(&self) -> &str {
            "test-model"
        }
    }

    struct FailingClient;
    #[async_trait]
    impl LlmClient for FailingClient {
        async fn send_message(&self, _messages: &[LlmMessage]) -> Result<LlmMessage, BoxError> {
            Err("upstream unavailable".into())
        }
        fn model_name(&self) -> &str {
            "test-model"
        }
    }

    #[tokio::test]
    async fn success_records_timeline_event_and_summary() {
        let store = MemoryStore::new();
        let mut session = crate::model::Session::new("s1", "c1", "PodCrash");
        session.final_analysis = Some("Pod crashed due to OOM.".into());
        store.insert_session(session.clone()).await;

        let client: Arc<dyn LlmClient> = Arc::new(OkClient);
        generate_executive_summary(store.as_ref(), &client, None, &session).await;

        let updated = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(updated.executive_summary.as_deref(), Some("Looks healthy overall."));
        assert!(updated.executive_summary_error.is_none());

        let events = store.list_timeline_events_for_session("s1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, EXECUTIVE_SUMMARY_SEQUENCE);
    }

    #[tokio::test]
    async fn failure_is_captured_without_failing_the_session() {
        let store = MemoryStore::new();
        let mut session = crate::model::Session::new("s1", "c1", "PodCrash");
        session.final_analysis = Some("Pod crashed due to OOM.".into());
        store.insert_session(session.clone()).await;

        let client: Arc<dyn LlmClient> = Arc::new(FailingClient);
        generate_executive_summary(store.as_ref(), &client, None, &session).await;

        let updated = store.get_session("s1").await.unwrap().unwrap();
        assert!(updated.executive_summary.is_none());
        assert_eq!(updated.executive_summary_error.as_deref(), Some("upstream unavailable"));
        // Status is untouched by this helper; the caller (executor) decides
        // the session's overall status independent of summary failure.
        assert_eq!(updated.status, crate::model::Status::Pending);
    }
}
