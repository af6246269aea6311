//! The event & progress publisher contract.
//!
//! A narrow, nil-safe outward interface: every method defaults to a no-op
//! so a caller that doesn't care about observability can pass `None`, and
//! every method returns a `Result` so the few publishers that do care can
//! fail without taking the caller down with them. Modeled on an
//! `EventHandler` trait whose methods are all default-no-op `async fn`s
//! dispatched through `Arc<dyn EventHandler>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::BoxError;
use crate::model::{Status, TimelineEventStatus};

#[derive(Debug, Clone)]
pub struct SessionStatusEvent {
    pub session_id: String,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StageStatusEvent {
    pub session_id: String,
    pub stage_id: String,
    pub stage_name: String,
    /// 1-based.
    pub stage_index: u32,
    /// `None` represents the "started" pseudo-status; terminal otherwise.
    pub status: Option<Status>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExecutionStatusEvent {
    pub session_id: String,
    pub stage_id: String,
    pub execution_id: String,
    pub status: Option<Status>,
    pub timestamp: DateTime<Utc>,
}

/// `current`/`total` are already clamped so `current <= total` by the
/// caller (see [`crate::stage::clamp_progress`]).
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub session_id: String,
    pub current: u32,
    pub total: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TimelineCreatedEvent {
    pub event_id: String,
    pub session_id: String,
    pub stage_id: Option<String>,
    pub execution_id: Option<String>,
    pub status: TimelineEventStatus,
    pub sequence: i64,
}

#[derive(Debug, Clone)]
pub struct TimelineCompletedEvent {
    pub event_id: String,
    pub session_id: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct StreamChunkEvent {
    pub event_id: String,
    pub session_id: String,
    pub chunk: String,
}

#[derive(Debug, Clone)]
pub struct InteractionCreatedEvent {
    pub session_id: String,
    pub execution_id: Option<String>,
    pub conversation: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
}

/// Implementors must never block the caller for long, and every method
/// defaults to a no-op so partial implementations are safe to hand in.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn session_status(&self, _e: &SessionStatusEvent) -> Result<(), BoxError> {
        Ok(())
    }
    async fn stage_status(&self, _e: &StageStatusEvent) -> Result<(), BoxError> {
        Ok(())
    }
    async fn execution_status(&self, _e: &ExecutionStatusEvent) -> Result<(), BoxError> {
        Ok(())
    }
    async fn session_progress(&self, _e: &ProgressEvent) -> Result<(), BoxError> {
        Ok(())
    }
    async fn execution_progress(&self, _e: &ProgressEvent) -> Result<(), BoxError> {
        Ok(())
    }
    async fn timeline_created(&self, _e: &TimelineCreatedEvent) -> Result<(), BoxError> {
        Ok(())
    }
    async fn timeline_completed(&self, _e: &TimelineCompletedEvent) -> Result<(), BoxError> {
        Ok(())
    }
    async fn stream_chunk(&self, _e: &StreamChunkEvent) -> Result<(), BoxError> {
        Ok(())
    }
    async fn interaction_created(&self, _e: &InteractionCreatedEvent) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Publishes best-effort: logs and swallows every error, per §4.8. This is
/// the only place in the crate allowed to turn a publisher error into
/// nothing; every call site in `executor`/`stage`/`worker` goes through it
/// instead of calling the trait directly.
pub async fn publish_best_effort<F, Fut>(what: &str, f: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), BoxError>>,
{
    if let Err(e) = f().await {
        log::warn!("event publish failed ({}): {}", what, e);
    }
}

pub fn noop_publisher() -> Arc<dyn EventPublisher> {
    Arc::new(NoopPublisher)
}

struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingPublisher;

    #[async_trait]
    impl EventPublisher for FailingPublisher {
        async fn session_status(&self, _e: &SessionStatusEvent) -> Result<(), BoxError> {
            Err("transport flake".into())
        }
    }

    #[tokio::test]
    async fn publisher_errors_never_propagate() {
        let p = FailingPublisher;
        let e = SessionStatusEvent {
            session_id: "s1".into(),
            status: Status::Completed,
            timestamp: Utc::now(),
        };
        // Must not panic or return an error to the caller.
        publish_best_effort("session_status", || p.session_status(&e)).await;
    }

    #[tokio::test]
    async fn noop_publisher_accepts_every_call() {
        let p = noop_publisher();
        let counter = AtomicUsize::new(0);
        let e = SessionStatusEvent {
            session_id: "s1".into(),
            status: Status::Completed,
            timestamp: Utc::now(),
        };
        p.session_status(&e).await.unwrap();
        counter.fetch_add(1, Ordering::SeqCst);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
