//! Worker (§4.1): a single claim-loop unit that polls, claims atomically,
//! heartbeats, invokes the session executor, persists terminal state, and
//! schedules event cleanup.

use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::config::QueueConfig;
use crate::ctx::{CancelRegistry, CtxState, TaskContext};
use crate::error::CoreError;
use crate::event::{publish_best_effort, EventPublisher, SessionStatusEvent};
use crate::executor::{run_session, ExecutorDeps};
use crate::model::{Session, Status};
use crate::store::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Running,
    Stopped,
}

pub struct Worker {
    pub id: String,
    pod_id: String,
    store: Arc<dyn SessionStore>,
    executor_deps: Arc<ExecutorDeps>,
    event_publisher: Arc<dyn EventPublisher>,
    queue_config: QueueConfig,
    cancel_registry: CancelRegistry,
    state: tokio::sync::RwLock<WorkerState>,
    stop_requested: AtomicBool,
    stopped_notify: Notify,
}

/// Classifies the executor's outcome against the context's state, per the
/// truth table in §4.1.
fn classify_outcome(
    result: Option<(Status, Option<String>)>,
    ctx_state: CtxState,
) -> (Status, Option<String>) {
    match (result, ctx_state) {
        (Some((status, err)), _) => (status, err),
        (None, CtxState::DeadlineExceeded) => (Status::TimedOut, None),
        (None, CtxState::Cancelled) => (Status::Cancelled, None),
        (None, CtxState::Active) => (Status::Failed, Some("executor returned nil result".to_string())),
    }
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        pod_id: impl Into<String>,
        store: Arc<dyn SessionStore>,
        executor_deps: Arc<ExecutorDeps>,
        event_publisher: Arc<dyn EventPublisher>,
        queue_config: QueueConfig,
        cancel_registry: CancelRegistry,
    ) -> Self {
        Worker {
            id: id.into(),
            pod_id: pod_id.into(),
            store,
            executor_deps,
            event_publisher,
            queue_config,
            cancel_registry,
            state: tokio::sync::RwLock::new(WorkerState::Idle),
            stop_requested: AtomicBool::new(false),
            stopped_notify: Notify::new(),
        }
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Idempotent: a second call is a no-op (§8 round-trip properties).
    pub fn stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            self.stopped_notify.notify_waiters();
        }
    }

    fn is_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Sleeps for the configured poll interval plus symmetric jitter in
    /// `[-j, +j]`. `jitter <= 0` degenerates to exactly the base interval
    /// (§4.1, §8 boundary behavior). Cut short by `stop()`.
    async fn poll_sleep(&self) {
        let base = self.queue_config.poll_interval_ms as i64;
        let jitter = self.queue_config.poll_interval_jitter_ms;
        let delay_ms = if jitter <= 0 {
            base
        } else {
            base + rand::thread_rng().gen_range(-jitter..=jitter)
        };
        self.interruptible_sleep(Duration::from_millis(delay_ms.max(0) as u64)).await;
    }

    async fn backoff_sleep(&self) {
        self.interruptible_sleep(Duration::from_millis(200)).await;
    }

    /// Sleeps for `dur`, waking early if `stop()` is called, so shutdown
    /// doesn't have to wait out a full poll interval.
    async fn interruptible_sleep(&self, dur: Duration) {
        let notified = self.stopped_notify.notified();
        tokio::select! {
            _ = tokio::time::sleep(dur) => {}
            _ = notified => {}
        }
    }

    /// One iteration of claim-and-drive. Returns `Ok(true)` if a session
    /// was claimed and driven, `Ok(false)` if the iteration just slept.
    async fn tick(&self) -> Result<bool, CoreError> {
        *self.state.write().await = WorkerState::Claiming;

        let in_progress = self.store.count_in_progress().await?;
        if in_progress >= self.queue_config.max_concurrent_sessions {
            *self.state.write().await = WorkerState::Idle;
            self.poll_sleep().await;
            return Ok(false);
        }

        let claimed = self.store.claim_next_pending(&self.pod_id, Utc::now()).await?;
        let session = match claimed {
            None => {
                *self.state.write().await = WorkerState::Idle;
                self.poll_sleep().await;
                return Ok(false);
            }
            Some(s) => s,
        };

        self.drive(session).await?;
        Ok(true)
    }

    async fn drive(&self, session: Session) -> Result<(), CoreError> {
        *self.state.write().await = WorkerState::Running;

        let ctx = TaskContext::with_timeout(Duration::from_secs(self.queue_config.session_timeout_secs));
        self.cancel_registry.register(session.id.clone(), ctx.clone()).await;

        let heartbeat_store = self.store.clone();
        let heartbeat_session_id = session.id.clone();
        let heartbeat_interval = Duration::from_secs(self.queue_config.heartbeat_interval_secs);
        let heartbeat_ctx = ctx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                if heartbeat_ctx.is_done() {
                    break;
                }
                if let Err(e) = heartbeat_store.update_heartbeat(&heartbeat_session_id, Utc::now()).await {
                    log::warn!("heartbeat update failed for {}: {}", heartbeat_session_id, e);
                }
            }
        });

        let executor_result = run_session(&ctx, &self.executor_deps, &session).await;
        heartbeat_handle.abort();
        self.cancel_registry.unregister(&session.id).await;

        let result_pair = match executor_result {
            Ok(outcome) => Some((outcome.status, outcome.error_message)),
            Err(e) => {
                log::error!("session {} executor error: {}", session.id, e);
                None
            }
        };
        let (status, error_message) = classify_outcome(result_pair, ctx.state());

        let bg = TaskContext::background();
        let _ = &bg;
        self.store
            .persist_session_terminal(&session.id, status, Utc::now(), error_message)
            .await?;

        let session_terminal_event = SessionStatusEvent {
            session_id: session.id.clone(),
            status,
            timestamp: Utc::now(),
        };
        publish_best_effort("session_status:terminal", || {
            self.event_publisher.session_status(&session_terminal_event)
        })
        .await;

        *self.state.write().await = WorkerState::Idle;
        Ok(())
    }

    /// Runs the poll loop until `stop()` is called. Finishes the session
    /// currently in flight before returning.
    pub async fn run(&self) {
        while !self.is_stopping() {
            match self.tick().await {
                Ok(_) => {}
                Err(e) if e.is_sentinel() => {
                    // NoSessionsAvailable / AtCapacity already slept inside tick().
                    let _ = e;
                }
                Err(e) => {
                    log::warn!("worker {} tick error: {}", self.id, e);
                    self.backoff_sleep().await;
                }
            }
        }
        *self.state.write().await = WorkerState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_outcome_prefers_result_status() {
        let (status, _) = classify_outcome(Some((Status::Completed, None)), CtxState::Active);
        assert_eq!(status, Status::Completed);
    }

    #[test]
    fn classify_outcome_maps_nil_result_by_context() {
        assert_eq!(
            classify_outcome(None, CtxState::DeadlineExceeded).0,
            Status::TimedOut
        );
        assert_eq!(classify_outcome(None, CtxState::Cancelled).0, Status::Cancelled);
        let (status, msg) = classify_outcome(None, CtxState::Active);
        assert_eq!(status, Status::Failed);
        assert_eq!(msg.as_deref(), Some("executor returned nil result"));
    }
}
