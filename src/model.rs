//! Entity shapes for the session execution core.
//!
//! These model entity responsibilities, not a storage layout: every
//! entity is identified by an opaque string id, and timestamps are
//! absolute instants. Storage is owned by [`crate::store`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shared lifecycle used by sessions, stages, and agent executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Active,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::TimedOut | Status::Cancelled
        )
    }

    /// Safety floor required by the data-model invariant: a terminal
    /// mapper must never produce `pending`/`active`.
    pub fn terminal_or_failed(self) -> Status {
        if self.is_terminal() {
            self
        } else {
            Status::Failed
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Active => "active",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::TimedOut => "timed_out",
            Status::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Optional parallel-execution tag carried by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelKind {
    MultiAgent,
    Replica,
}

/// `all` requires every agent to succeed; `any` (the default) requires one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuccessPolicy {
    All,
    Any,
}

impl Default for SuccessPolicy {
    fn default() -> Self {
        SuccessPolicy::Any
    }
}

impl std::fmt::Display for SuccessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuccessPolicy::All => write!(f, "all"),
            SuccessPolicy::Any => write!(f, "any"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub chain_id: String,
    pub alert_payload: Vec<u8>,
    pub alert_type: String,
    pub runbook_url: Option<String>,
    pub mcp_selection_override: Option<serde_json::Value>,
    pub status: Status,
    pub owning_pod_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_interaction_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_stage_index: Option<u32>,
    pub current_stage_id: Option<String>,
    pub final_analysis: Option<String>,
    pub executive_summary: Option<String>,
    pub executive_summary_error: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Populated on non-`completed` terminal transitions (fail-fast,
    /// orphan recovery, cancellation) with a human-readable cause.
    pub error_message: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, chain_id: impl Into<String>, alert_type: impl Into<String>) -> Self {
        Session {
            id: id.into(),
            chain_id: chain_id.into(),
            alert_payload: Vec::new(),
            alert_type: alert_type.into(),
            runbook_url: None,
            mcp_selection_override: None,
            status: Status::Pending,
            owning_pod_id: None,
            started_at: None,
            last_interaction_at: None,
            completed_at: None,
            current_stage_index: None,
            current_stage_id: None,
            final_analysis: None,
            executive_summary: None,
            executive_summary_error: None,
            deleted_at: None,
            error_message: None,
        }
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Shared orphan-recovery message format, used by both the store's
/// "mark timed-out" helper and the periodic reaper / startup sweep so the
/// literal text stays in exactly one place (§8 scenario 5 pins the prefix).
pub fn orphan_message(pod_id: &str, since: DateTime<Utc>) -> String {
    format!(
        "Orphaned: no heartbeat from pod {} since {}",
        pod_id,
        since.to_rfc3339()
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub session_id: String,
    pub name: String,
    /// 1-based index, dense in creation order.
    pub index: u32,
    pub expected_agent_count: u32,
    pub parallel_kind: Option<ParallelKind>,
    pub success_policy: Option<SuccessPolicy>,
    pub chat_id: Option<String>,
    pub chat_user_message_id: Option<String>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub id: String,
    pub stage_id: String,
    pub session_id: String,
    pub agent_name: String,
    /// 1-based index within the stage.
    pub index: u32,
    pub backend: String,
    pub provider: String,
    pub iteration_strategy: String,
    pub status: Status,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    UserQuestion,
    LlmThinking,
    LlmResponse,
    LlmToolCall,
    McpToolSummary,
    FinalAnalysis,
    ExecutiveSummary,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventStatus {
    Streaming,
    Completed,
    TimedOut,
}

/// Sentinel sequence number for executive-summary events: guaranteed
/// greater than any session's regular event count could reach.
pub const EXECUTIVE_SUMMARY_SEQUENCE: i64 = i64::MAX;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    pub session_id: String,
    pub stage_id: Option<String>,
    pub execution_id: Option<String>,
    pub sequence: i64,
    pub kind: TimelineEventKind,
    pub status: TimelineEventStatus,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TimelineEvent {
    /// A streaming-lifecycle event: created empty, mutated, later completed.
    pub fn new_streaming(
        id: impl Into<String>,
        session_id: impl Into<String>,
        sequence: i64,
        kind: TimelineEventKind,
        now: DateTime<Utc>,
    ) -> Self {
        TimelineEvent {
            id: id.into(),
            session_id: session_id.into(),
            stage_id: None,
            execution_id: None,
            sequence,
            kind,
            status: TimelineEventStatus::Streaming,
            content: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A fire-and-forget event: all content known up front.
    pub fn new_completed(
        id: impl Into<String>,
        session_id: impl Into<String>,
        sequence: i64,
        kind: TimelineEventKind,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        TimelineEvent {
            id: id.into(),
            session_id: session_id.into(),
            stage_id: None,
            execution_id: None,
            sequence,
            kind,
            status: TimelineEventStatus::Completed,
            content: content.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_executive_summary(&self) -> bool {
        self.kind == TimelineEventKind::ExecutiveSummary
    }
}

/// A short-lived marker used only to notify listeners who missed the
/// real-time signal. Purged after a grace period following the owning
/// session's terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransientEvent {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUserMessage {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_or_failed_is_a_safety_floor() {
        assert_eq!(Status::Pending.terminal_or_failed(), Status::Failed);
        assert_eq!(Status::Active.terminal_or_failed(), Status::Failed);
        assert_eq!(Status::Completed.terminal_or_failed(), Status::Completed);
        assert_eq!(Status::Cancelled.terminal_or_failed(), Status::Cancelled);
    }

    #[test]
    fn success_policy_defaults_to_any() {
        assert_eq!(SuccessPolicy::default(), SuccessPolicy::Any);
    }

    #[test]
    fn new_session_starts_pending_and_unowned() {
        let s = Session::new("sess-1", "chain-1", "PodOOM");
        assert_eq!(s.status, Status::Pending);
        assert!(s.owning_pod_id.is_none());
        assert!(!s.is_soft_deleted());
    }
}
