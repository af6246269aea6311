//! Persistence contract + two implementations: a real Postgres-backed
//! store using `sqlx`'s skip-locked claim query, and an in-memory fake for
//! tests that exercises the exact same trait.
//!
//! The trait is deliberately the seam: §6 calls persistence "semantic, not
//! bit-exact", so every other module in this crate talks to `SessionStore`
//! and never to `sqlx` directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{BoxError, CoreError};
use crate::model::{
    AgentExecution, Chat, ChatUserMessage, Session, Stage, Status, TimelineEvent,
};

#[derive(Debug, Clone)]
pub struct NewStage {
    pub session_id: String,
    pub name: String,
    pub index: u32,
    pub expected_agent_count: u32,
    pub parallel_kind: Option<crate::model::ParallelKind>,
    pub success_policy: Option<crate::model::SuccessPolicy>,
    pub chat_id: Option<String>,
    pub chat_user_message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAgentExecution {
    pub stage_id: String,
    pub session_id: String,
    pub agent_name: String,
    pub index: u32,
    pub backend: String,
    pub provider: String,
    pub iteration_strategy: String,
}

/// Persistence operations the session execution core depends on. All
/// methods are expressed in terms of the entities in [`crate::model`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Atomically claims the oldest pending, not-soft-deleted session
    /// using row-level exclusive locks that skip rows already locked by
    /// other claimers (§4.1). Returns `None` rather than an error when
    /// there is genuinely nothing to claim — callers map that to
    /// [`CoreError::NoSessionsAvailable`].
    async fn claim_next_pending(&self, pod_id: &str, now: DateTime<Utc>) -> Result<Option<Session>, CoreError>;

    async fn count_in_progress(&self) -> Result<u32, CoreError>;

    async fn update_heartbeat(&self, session_id: &str, now: DateTime<Utc>) -> Result<(), CoreError>;

    async fn persist_session_terminal(
        &self,
        session_id: &str,
        status: Status,
        completed_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<(), CoreError>;

    async fn update_session_progress(
        &self,
        session_id: &str,
        stage_index: u32,
        stage_id: &str,
    ) -> Result<(), CoreError>;

    async fn set_final_analysis(&self, session_id: &str, final_analysis: &str) -> Result<(), CoreError>;

    async fn set_executive_summary(
        &self,
        session_id: &str,
        summary: Option<String>,
        error: Option<String>,
    ) -> Result<(), CoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, CoreError>;

    async fn create_stage(&self, stage: NewStage, now: DateTime<Utc>) -> Result<Stage, CoreError>;

    async fn persist_stage_terminal(
        &self,
        stage_id: &str,
        status: Status,
        completed_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<(), CoreError>;

    async fn list_stages(&self, session_id: &str) -> Result<Vec<Stage>, CoreError>;

    async fn create_agent_execution(&self, exec: NewAgentExecution) -> Result<AgentExecution, CoreError>;

    async fn persist_agent_execution_status(
        &self,
        execution_id: &str,
        status: Status,
        error_message: Option<String>,
    ) -> Result<(), CoreError>;

    async fn list_agent_executions(&self, stage_id: &str) -> Result<Vec<AgentExecution>, CoreError>;

    async fn next_sequence(&self, session_id: &str) -> Result<i64, CoreError>;

    async fn insert_timeline_event(&self, event: TimelineEvent) -> Result<TimelineEvent, CoreError>;

    async fn update_timeline_event_content(
        &self,
        event_id: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn complete_timeline_event(&self, event_id: &str, now: DateTime<Utc>) -> Result<(), CoreError>;

    async fn list_timeline_events_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<TimelineEvent>, CoreError>;

    async fn list_timeline_events_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<TimelineEvent>, CoreError>;

    /// Orphan recovery (§4.3): sessions `in-progress`, not soft-deleted,
    /// whose `last_interaction_at` is older than `threshold`.
    async fn list_stale_in_progress(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<Session>, CoreError>;

    /// Sessions still `in-progress` and owned by `pod_id` (startup sweep).
    async fn list_owned_in_progress(&self, pod_id: &str) -> Result<Vec<Session>, CoreError>;

    /// The shared "mark timed-out" transaction helper: terminal-
    /// transitions the session and marks its still-streaming timeline
    /// events `timed-out`, atomically.
    async fn mark_session_orphaned(
        &self,
        session_id: &str,
        pod_id: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    // -- Chat --

    async fn find_active_chat_stage(&self, chat_id: &str) -> Result<Option<Stage>, CoreError>;

    async fn max_stage_index(&self, session_id: &str) -> Result<u32, CoreError>;

    async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>, CoreError>;

    async fn get_chat_user_message(&self, message_id: &str) -> Result<Option<ChatUserMessage>, CoreError>;
}

// ---------------------------------------------------------------------
// In-memory fake, used by tests throughout this crate in place of a live
// Postgres instance.
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, Session>,
    stages: HashMap<String, Stage>,
    stage_order: Vec<String>,
    executions: HashMap<String, AgentExecution>,
    events: HashMap<String, TimelineEvent>,
    seq: HashMap<String, i64>,
    chats: HashMap<String, Chat>,
    chat_messages: HashMap<String, ChatUserMessage>,
    next_id: u64,
}

pub struct MemoryStore(Mutex<MemoryState>);

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryStore(Mutex::new(MemoryState::default())))
    }

    pub async fn insert_session(&self, session: Session) {
        self.0.lock().await.sessions.insert(session.id.clone(), session);
    }

    pub async fn insert_chat(&self, chat: Chat) {
        self.0.lock().await.chats.insert(chat.id.clone(), chat);
    }

    pub async fn insert_chat_message(&self, msg: ChatUserMessage) {
        self.0.lock().await.chat_messages.insert(msg.id.clone(), msg);
    }

    async fn fresh_id(&self, prefix: &str) -> String {
        let mut state = self.0.lock().await;
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }
}

fn not_found(what: &str, id: &str) -> CoreError {
    CoreError::Store(format!("{} not found: {}", what, id).into())
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn claim_next_pending(&self, pod_id: &str, now: DateTime<Utc>) -> Result<Option<Session>, CoreError> {
        let mut state = self.0.lock().await;
        let candidate = state
            .sessions
            .values()
            .filter(|s| s.status == Status::Pending && !s.is_soft_deleted())
            .min_by_key(|s| s.started_at.unwrap_or(s.last_interaction_at.unwrap_or(now)))
            .map(|s| s.id.clone());
        match candidate {
            None => Ok(None),
            Some(id) => {
                let s = state.sessions.get_mut(&id).unwrap();
                s.status = Status::Active;
                s.owning_pod_id = Some(pod_id.to_string());
                s.started_at = Some(now);
                s.last_interaction_at = Some(now);
                Ok(Some(s.clone()))
            }
        }
    }

    async fn count_in_progress(&self) -> Result<u32, CoreError> {
        let state = self.0.lock().await;
        Ok(state.sessions.values().filter(|s| s.status == Status::Active).count() as u32)
    }

    async fn update_heartbeat(&self, session_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut state = self.0.lock().await;
        let s = state.sessions.get_mut(session_id).ok_or_else(|| not_found("session", session_id))?;
        // Monotonicity invariant (§3): never move last_interaction_at backwards.
        if s.last_interaction_at.map(|t| now >= t).unwrap_or(true) {
            s.last_interaction_at = Some(now);
        }
        Ok(())
    }

    async fn persist_session_terminal(
        &self,
        session_id: &str,
        status: Status,
        completed_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<(), CoreError> {
        let mut state = self.0.lock().await;
        let s = state.sessions.get_mut(session_id).ok_or_else(|| not_found("session", session_id))?;
        s.status = status.terminal_or_failed();
        s.completed_at = Some(completed_at);
        if error_message.is_some() {
            s.error_message = error_message;
        }
        Ok(())
    }

    async fn update_session_progress(
        &self,
        session_id: &str,
        stage_index: u32,
        stage_id: &str,
    ) -> Result<(), CoreError> {
        let mut state = self.0.lock().await;
        let s = state.sessions.get_mut(session_id).ok_or_else(|| not_found("session", session_id))?;
        s.current_stage_index = Some(stage_index);
        s.current_stage_id = Some(stage_id.to_string());
        Ok(())
    }

    async fn set_final_analysis(&self, session_id: &str, final_analysis: &str) -> Result<(), CoreError> {
        let mut state = self.0.lock().await;
        let s = state.sessions.get_mut(session_id).ok_or_else(|| not_found("session", session_id))?;
        s.final_analysis = Some(final_analysis.to_string());
        Ok(())
    }

    async fn set_executive_summary(
        &self,
        session_id: &str,
        summary: Option<String>,
        error: Option<String>,
    ) -> Result<(), CoreError> {
        let mut state = self.0.lock().await;
        let s = state.sessions.get_mut(session_id).ok_or_else(|| not_found("session", session_id))?;
        s.executive_summary = summary;
        s.executive_summary_error = error;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, CoreError> {
        Ok(self.0.lock().await.sessions.get(session_id).cloned())
    }

    async fn create_stage(&self, stage: NewStage, now: DateTime<Utc>) -> Result<Stage, CoreError> {
        let id = self.fresh_id("stage").await;
        let record = Stage {
            id: id.clone(),
            session_id: stage.session_id,
            name: stage.name,
            index: stage.index,
            expected_agent_count: stage.expected_agent_count,
            parallel_kind: stage.parallel_kind,
            success_policy: stage.success_policy,
            chat_id: stage.chat_id,
            chat_user_message_id: stage.chat_user_message_id,
            status: Status::Active,
            created_at: now,
            completed_at: None,
            error_message: None,
        };
        let mut state = self.0.lock().await;
        state.stage_order.push(id.clone());
        state.stages.insert(id, record.clone());
        Ok(record)
    }

    async fn persist_stage_terminal(
        &self,
        stage_id: &str,
        status: Status,
        completed_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<(), CoreError> {
        let mut state = self.0.lock().await;
        let s = state.stages.get_mut(stage_id).ok_or_else(|| not_found("stage", stage_id))?;
        s.status = status.terminal_or_failed();
        s.completed_at = Some(completed_at);
        s.error_message = error_message;
        Ok(())
    }

    async fn list_stages(&self, session_id: &str) -> Result<Vec<Stage>, CoreError> {
        let state = self.0.lock().await;
        let mut out: Vec<Stage> = state
            .stage_order
            .iter()
            .filter_map(|id| state.stages.get(id))
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.index);
        Ok(out)
    }

    async fn create_agent_execution(&self, exec: NewAgentExecution) -> Result<AgentExecution, CoreError> {
        let id = self.fresh_id("exec").await;
        let record = AgentExecution {
            id: id.clone(),
            stage_id: exec.stage_id,
            session_id: exec.session_id,
            agent_name: exec.agent_name,
            index: exec.index,
            backend: exec.backend,
            provider: exec.provider,
            iteration_strategy: exec.iteration_strategy,
            status: Status::Pending,
            error_message: None,
        };
        self.0.lock().await.executions.insert(id, record.clone());
        Ok(record)
    }

    async fn persist_agent_execution_status(
        &self,
        execution_id: &str,
        status: Status,
        error_message: Option<String>,
    ) -> Result<(), CoreError> {
        let mut state = self.0.lock().await;
        let e = state
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| not_found("agent_execution", execution_id))?;
        e.status = status;
        e.error_message = error_message;
        Ok(())
    }

    async fn list_agent_executions(&self, stage_id: &str) -> Result<Vec<AgentExecution>, CoreError> {
        let state = self.0.lock().await;
        let mut out: Vec<AgentExecution> = state
            .executions
            .values()
            .filter(|e| e.stage_id == stage_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.index);
        Ok(out)
    }

    async fn next_sequence(&self, session_id: &str) -> Result<i64, CoreError> {
        let mut state = self.0.lock().await;
        let entry = state.seq.entry(session_id.to_string()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn insert_timeline_event(&self, event: TimelineEvent) -> Result<TimelineEvent, CoreError> {
        self.0.lock().await.events.insert(event.id.clone(), event.clone());
        Ok(event)
    }

    async fn update_timeline_event_content(
        &self,
        event_id: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut state = self.0.lock().await;
        let e = state.events.get_mut(event_id).ok_or_else(|| not_found("timeline_event", event_id))?;
        e.content.push_str(content);
        e.updated_at = now;
        Ok(())
    }

    async fn complete_timeline_event(&self, event_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut state = self.0.lock().await;
        let e = state.events.get_mut(event_id).ok_or_else(|| not_found("timeline_event", event_id))?;
        e.status = crate::model::TimelineEventStatus::Completed;
        e.updated_at = now;
        Ok(())
    }

    async fn list_timeline_events_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<TimelineEvent>, CoreError> {
        let state = self.0.lock().await;
        let mut out: Vec<TimelineEvent> = state
            .events
            .values()
            .filter(|e| e.execution_id.as_deref() == Some(execution_id))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.sequence);
        Ok(out)
    }

    async fn list_timeline_events_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<TimelineEvent>, CoreError> {
        let state = self.0.lock().await;
        let mut out: Vec<TimelineEvent> = state
            .events
            .values()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.sequence);
        Ok(out)
    }

    async fn list_stale_in_progress(&self, threshold: DateTime<Utc>) -> Result<Vec<Session>, CoreError> {
        let state = self.0.lock().await;
        Ok(state
            .sessions
            .values()
            .filter(|s| {
                s.status == Status::Active
                    && !s.is_soft_deleted()
                    && s.last_interaction_at.map(|t| t < threshold).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn list_owned_in_progress(&self, pod_id: &str) -> Result<Vec<Session>, CoreError> {
        let state = self.0.lock().await;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.status == Status::Active && s.owning_pod_id.as_deref() == Some(pod_id))
            .cloned()
            .collect())
    }

    async fn mark_session_orphaned(
        &self,
        session_id: &str,
        pod_id: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut state = self.0.lock().await;
        let s = state.sessions.get_mut(session_id).ok_or_else(|| not_found("session", session_id))?;
        // Idempotent: only in-progress rows match, so a second run finds nothing.
        if s.status != Status::Active {
            return Ok(());
        }
        s.status = Status::TimedOut;
        s.completed_at = Some(now);
        s.error_message = Some(crate::model::orphan_message(pod_id, since));
        for e in state.events.values_mut() {
            if e.session_id == session_id && e.status == crate::model::TimelineEventStatus::Streaming {
                e.status = crate::model::TimelineEventStatus::TimedOut;
                e.updated_at = now;
            }
        }
        Ok(())
    }

    async fn find_active_chat_stage(&self, chat_id: &str) -> Result<Option<Stage>, CoreError> {
        let state = self.0.lock().await;
        Ok(state
            .stages
            .values()
            .find(|s| s.chat_id.as_deref() == Some(chat_id) && !s.status.is_terminal())
            .cloned())
    }

    async fn max_stage_index(&self, session_id: &str) -> Result<u32, CoreError> {
        let state = self.0.lock().await;
        Ok(state
            .stages
            .values()
            .filter(|s| s.session_id == session_id)
            .map(|s| s.index)
            .max()
            .unwrap_or(0))
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>, CoreError> {
        Ok(self.0.lock().await.chats.get(chat_id).cloned())
    }

    async fn get_chat_user_message(&self, message_id: &str) -> Result<Option<ChatUserMessage>, CoreError> {
        Ok(self.0.lock().await.chat_messages.get(message_id).cloned())
    }
}

/// Wraps any collaborator error into [`CoreError::Store`].
pub fn store_err(e: impl Into<BoxError>) -> CoreError {
    CoreError::Store(e.into())
}
