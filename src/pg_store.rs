//! Postgres-backed [`SessionStore`], built on `sqlx`'s raw query support so
//! the skip-locked claim query and the orphan transaction are expressed
//! exactly, rather than through an ORM's lowest-common-denominator locking
//! primitives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::CoreError;
use crate::model::{
    AgentExecution, Chat, ChatUserMessage, ParallelKind, Session, Stage, Status, SuccessPolicy,
    TimelineEvent, TimelineEventKind, TimelineEventStatus,
};
use crate::store::{store_err, NewAgentExecution, NewStage, SessionStore};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, CoreError> {
        let pool = PgPool::connect(database_url).await.map_err(store_err)?;
        Ok(PgStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

fn status_str(s: Status) -> &'static str {
    match s {
        Status::Pending => "pending",
        Status::Active => "in_progress",
        Status::Completed => "completed",
        Status::Failed => "failed",
        Status::TimedOut => "timed_out",
        Status::Cancelled => "cancelled",
    }
}

fn parse_status(s: &str) -> Status {
    match s {
        "pending" => Status::Pending,
        "in_progress" => Status::Active,
        "completed" => Status::Completed,
        "failed" => Status::Failed,
        "timed_out" => Status::TimedOut,
        "cancelled" => Status::Cancelled,
        _ => Status::Failed,
    }
}

fn parallel_kind_str(k: Option<ParallelKind>) -> Option<&'static str> {
    match k {
        Some(ParallelKind::MultiAgent) => Some("multi_agent"),
        Some(ParallelKind::Replica) => Some("replica"),
        None => None,
    }
}

fn policy_str(p: Option<SuccessPolicy>) -> Option<&'static str> {
    match p {
        Some(SuccessPolicy::All) => Some("all"),
        Some(SuccessPolicy::Any) => Some("any"),
        None => None,
    }
}

fn row_to_session(row: &sqlx::postgres::PgRow) -> Session {
    Session {
        id: row.get("id"),
        chain_id: row.get("chain_id"),
        alert_payload: row.get::<Vec<u8>, _>("alert_payload"),
        alert_type: row.get("alert_type"),
        runbook_url: row.get("runbook_url"),
        mcp_selection_override: row.get("mcp_selection_override"),
        status: parse_status(row.get::<String, _>("status").as_str()),
        owning_pod_id: row.get("owning_pod_id"),
        started_at: row.get("started_at"),
        last_interaction_at: row.get("last_interaction_at"),
        completed_at: row.get("completed_at"),
        current_stage_index: row.get::<Option<i32>, _>("current_stage_index").map(|v| v as u32),
        current_stage_id: row.get("current_stage_id"),
        final_analysis: row.get("final_analysis"),
        executive_summary: row.get("executive_summary"),
        executive_summary_error: row.get("executive_summary_error"),
        deleted_at: row.get("deleted_at"),
        error_message: row.get("error_message"),
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn claim_next_pending(&self, pod_id: &str, now: DateTime<Utc>) -> Result<Option<Session>, CoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let row = sqlx::query(
            r#"
            SELECT * FROM sessions
            WHERE status = 'pending' AND deleted_at IS NULL
            ORDER BY started_at NULLS FIRST, id
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        let row = match row {
            None => {
                tx.rollback().await.map_err(store_err)?;
                return Ok(None);
            }
            Some(r) => r,
        };

        let id: String = row.get("id");
        sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'in_progress', owning_pod_id = $1, started_at = $2, last_interaction_at = $2
            WHERE id = $3
            "#,
        )
        .bind(pod_id)
        .bind(now)
        .bind(&id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;

        self.get_session(&id).await
    }

    async fn count_in_progress(&self) -> Result<u32, CoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sessions WHERE status = 'in_progress'")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        let n: i64 = row.get("n");
        Ok(n as u32)
    }

    async fn update_heartbeat(&self, session_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE sessions SET last_interaction_at = $1 WHERE id = $2 AND (last_interaction_at IS NULL OR last_interaction_at <= $1)",
        )
        .bind(now)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn persist_session_terminal(
        &self,
        session_id: &str,
        status: Status,
        completed_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE sessions SET status = $1, completed_at = $2, error_message = COALESCE($3, error_message) WHERE id = $4",
        )
        .bind(status_str(status.terminal_or_failed()))
        .bind(completed_at)
        .bind(error_message)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update_session_progress(
        &self,
        session_id: &str,
        stage_index: u32,
        stage_id: &str,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE sessions SET current_stage_index = $1, current_stage_id = $2 WHERE id = $3")
            .bind(stage_index as i32)
            .bind(stage_id)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_final_analysis(&self, session_id: &str, final_analysis: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE sessions SET final_analysis = $1 WHERE id = $2")
            .bind(final_analysis)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_executive_summary(
        &self,
        session_id: &str,
        summary: Option<String>,
        error: Option<String>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE sessions SET executive_summary = $1, executive_summary_error = $2 WHERE id = $3")
            .bind(summary)
            .bind(error)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, CoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.as_ref().map(row_to_session))
    }

    async fn create_stage(&self, stage: NewStage, now: DateTime<Utc>) -> Result<Stage, CoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO stages
                (id, session_id, name, index, expected_agent_count, parallel_kind,
                 success_policy, chat_id, chat_user_message_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'in_progress', $10)
            "#,
        )
        .bind(&id)
        .bind(&stage.session_id)
        .bind(&stage.name)
        .bind(stage.index as i32)
        .bind(stage.expected_agent_count as i32)
        .bind(parallel_kind_str(stage.parallel_kind))
        .bind(policy_str(stage.success_policy))
        .bind(&stage.chat_id)
        .bind(&stage.chat_user_message_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(Stage {
            id,
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
        })
    }

    async fn persist_stage_terminal(
        &self,
        stage_id: &str,
        status: Status,
        completed_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE stages SET status = $1, completed_at = $2, error_message = $3 WHERE id = $4")
            .bind(status_str(status.terminal_or_failed()))
            .bind(completed_at)
            .bind(error_message)
            .bind(stage_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_stages(&self, session_id: &str) -> Result<Vec<Stage>, CoreError> {
        let rows = sqlx::query("SELECT * FROM stages WHERE session_id = $1 ORDER BY index ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows
            .iter()
            .map(|row| Stage {
                id: row.get("id"),
                session_id: row.get("session_id"),
                name: row.get("name"),
                index: row.get::<i32, _>("index") as u32,
                expected_agent_count: row.get::<i32, _>("expected_agent_count") as u32,
                parallel_kind: match row.get::<Option<String>, _>("parallel_kind").as_deref() {
                    Some("multi_agent") => Some(ParallelKind::MultiAgent),
                    Some("replica") => Some(ParallelKind::Replica),
                    _ => None,
                },
                success_policy: match row.get::<Option<String>, _>("success_policy").as_deref() {
                    Some("all") => Some(SuccessPolicy::All),
                    Some("any") => Some(SuccessPolicy::Any),
                    _ => None,
                },
                chat_id: row.get("chat_id"),
                chat_user_message_id: row.get("chat_user_message_id"),
                status: parse_status(row.get::<String, _>("status").as_str()),
                created_at: row.get("created_at"),
                completed_at: row.get("completed_at"),
                error_message: row.get("error_message"),
            })
            .collect())
    }

    async fn create_agent_execution(&self, exec: NewAgentExecution) -> Result<AgentExecution, CoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO agent_executions
                (id, stage_id, session_id, agent_name, index, backend, provider, iteration_strategy, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending')
            "#,
        )
        .bind(&id)
        .bind(&exec.stage_id)
        .bind(&exec.session_id)
        .bind(&exec.agent_name)
        .bind(exec.index as i32)
        .bind(&exec.backend)
        .bind(&exec.provider)
        .bind(&exec.iteration_strategy)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(AgentExecution {
            id,
            stage_id: exec.stage_id,
            session_id: exec.session_id,
            agent_name: exec.agent_name,
            index: exec.index,
            backend: exec.backend,
            provider: exec.provider,
            iteration_strategy: exec.iteration_strategy,
            status: Status::Pending,
            error_message: None,
        })
    }

    async fn persist_agent_execution_status(
        &self,
        execution_id: &str,
        status: Status,
        error_message: Option<String>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE agent_executions SET status = $1, error_message = $2 WHERE id = $3")
            .bind(status_str(status))
            .bind(error_message)
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_agent_executions(&self, stage_id: &str) -> Result<Vec<AgentExecution>, CoreError> {
        let rows = sqlx::query("SELECT * FROM agent_executions WHERE stage_id = $1 ORDER BY index ASC")
            .bind(stage_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows
            .iter()
            .map(|row| AgentExecution {
                id: row.get("id"),
                stage_id: row.get("stage_id"),
                session_id: row.get("session_id"),
                agent_name: row.get("agent_name"),
                index: row.get::<i32, _>("index") as u32,
                backend: row.get("backend"),
                provider: row.get("provider"),
                iteration_strategy: row.get("iteration_strategy"),
                status: parse_status(row.get::<String, _>("status").as_str()),
                error_message: row.get("error_message"),
            })
            .collect())
    }

    async fn next_sequence(&self, session_id: &str) -> Result<i64, CoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) + 1 AS next FROM timeline_events WHERE session_id = $1 AND sequence < $2",
        )
        .bind(session_id)
        .bind(crate::model::EXECUTIVE_SUMMARY_SEQUENCE)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.get("next"))
    }

    async fn insert_timeline_event(&self, event: TimelineEvent) -> Result<TimelineEvent, CoreError> {
        sqlx::query(
            r#"
            INSERT INTO timeline_events
                (id, session_id, stage_id, execution_id, sequence, kind, status, content, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&event.id)
        .bind(&event.session_id)
        .bind(&event.stage_id)
        .bind(&event.execution_id)
        .bind(event.sequence)
        .bind(kind_str(event.kind))
        .bind(status_evt_str(event.status))
        .bind(&event.content)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(event)
    }

    async fn update_timeline_event_content(
        &self,
        event_id: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE timeline_events SET content = content || $1, updated_at = $2 WHERE id = $3")
            .bind(content)
            .bind(now)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn complete_timeline_event(&self, event_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query("UPDATE timeline_events SET status = 'completed', updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn list_timeline_events_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<TimelineEvent>, CoreError> {
        self.list_timeline_events_where("execution_id = $1", execution_id).await
    }

    async fn list_timeline_events_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<TimelineEvent>, CoreError> {
        self.list_timeline_events_where("session_id = $1", session_id).await
    }

    async fn list_stale_in_progress(&self, threshold: DateTime<Utc>) -> Result<Vec<Session>, CoreError> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE status = 'in_progress' AND deleted_at IS NULL AND last_interaction_at IS NOT NULL AND last_interaction_at < $1",
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.iter().map(row_to_session).collect())
    }

    async fn list_owned_in_progress(&self, pod_id: &str) -> Result<Vec<Session>, CoreError> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE status = 'in_progress' AND owning_pod_id = $1")
            .bind(pod_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(row_to_session).collect())
    }

    async fn mark_session_orphaned(
        &self,
        session_id: &str,
        pod_id: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let message = crate::model::orphan_message(pod_id, since);
        sqlx::query(
            "UPDATE sessions SET status = 'timed_out', completed_at = $1, error_message = $2 WHERE id = $3 AND status = 'in_progress'",
        )
        .bind(now)
        .bind(&message)
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "UPDATE timeline_events SET status = 'timed_out', updated_at = $1 WHERE session_id = $2 AND status = 'streaming'",
        )
        .bind(now)
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn find_active_chat_stage(&self, chat_id: &str) -> Result<Option<Stage>, CoreError> {
        let row = sqlx::query(
            "SELECT * FROM stages WHERE chat_id = $1 AND status NOT IN ('completed','failed','timed_out','cancelled') LIMIT 1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(row.map(|row| Stage {
            id: row.get("id"),
            session_id: row.get("session_id"),
            name: row.get("name"),
            index: row.get::<i32, _>("index") as u32,
            expected_agent_count: row.get::<i32, _>("expected_agent_count") as u32,
            parallel_kind: None,
            success_policy: None,
            chat_id: row.get("chat_id"),
            chat_user_message_id: row.get("chat_user_message_id"),
            status: parse_status(row.get::<String, _>("status").as_str()),
            created_at: row.get("created_at"),
            completed_at: row.get("completed_at"),
            error_message: row.get("error_message"),
        }))
    }

    async fn max_stage_index(&self, session_id: &str) -> Result<u32, CoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(index), 0) AS m FROM stages WHERE session_id = $1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.get::<i32, _>("m") as u32)
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>, CoreError> {
        let row = sqlx::query("SELECT * FROM chats WHERE id = $1")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(|row| Chat {
            id: row.get("id"),
            session_id: row.get("session_id"),
            created_at: row.get("created_at"),
        }))
    }

    async fn get_chat_user_message(&self, message_id: &str) -> Result<Option<ChatUserMessage>, CoreError> {
        let row = sqlx::query("SELECT * FROM chat_user_messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(|row| ChatUserMessage {
            id: row.get("id"),
            chat_id: row.get("chat_id"),
            content: row.get("content"),
            created_at: row.get("created_at"),
        }))
    }
}

impl PgStore {
    async fn list_timeline_events_where(
        &self,
        clause: &str,
        bind: &str,
    ) -> Result<Vec<TimelineEvent>, CoreError> {
        let sql = format!(
            "SELECT * FROM timeline_events WHERE {} ORDER BY sequence ASC",
            clause
        );
        let rows = sqlx::query(&sql)
            .bind(bind)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(rows
            .iter()
            .map(|row| TimelineEvent {
                id: row.get("id"),
                session_id: row.get("session_id"),
                stage_id: row.get("stage_id"),
                execution_id: row.get("execution_id"),
                sequence: row.get("sequence"),
                kind: parse_kind(row.get::<String, _>("kind").as_str()),
                status: parse_evt_status(row.get::<String, _>("status").as_str()),
                content: row.get("content"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }
}

fn kind_str(k: TimelineEventKind) -> &'static str {
    match k {
        TimelineEventKind::UserQuestion => "user_question",
        TimelineEventKind::LlmThinking => "llm_thinking",
        TimelineEventKind::LlmResponse => "llm_response",
        TimelineEventKind::LlmToolCall => "llm_tool_call",
        TimelineEventKind::McpToolSummary => "mcp_tool_summary",
        TimelineEventKind::FinalAnalysis => "final_analysis",
        TimelineEventKind::ExecutiveSummary => "executive_summary",
        TimelineEventKind::Error => "error",
    }
}

fn parse_kind(s: &str) -> TimelineEventKind {
    match s {
        "user_question" => TimelineEventKind::UserQuestion,
        "llm_thinking" => TimelineEventKind::LlmThinking,
        "llm_response" => TimelineEventKind::LlmResponse,
        "llm_tool_call" => TimelineEventKind::LlmToolCall,
        "mcp_tool_summary" => TimelineEventKind::McpToolSummary,
        "final_analysis" => TimelineEventKind::FinalAnalysis,
        "executive_summary" => TimelineEventKind::ExecutiveSummary,
        _ => TimelineEventKind::Error,
    }
}

fn status_evt_str(s: TimelineEventStatus) -> &'static str {
    match s {
        TimelineEventStatus::Streaming => "streaming",
        TimelineEventStatus::Completed => "completed",
        TimelineEventStatus::TimedOut => "timed_out",
    }
}

fn parse_evt_status(s: &str) -> TimelineEventStatus {
    match s {
        "streaming" => TimelineEventStatus::Streaming,
        "timed_out" => TimelineEventStatus::TimedOut,
        _ => TimelineEventStatus::Completed,
    }
}
