//! Orphan recovery (§4.3): the periodic reaper and the startup sweep,
//! sharing a single "mark timed-out" transaction helper owned by the
//! store (`SessionStore::mark_session_orphaned`).

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::CoreError;
use crate::store::SessionStore;

/// Runs one reaper tick: terminal-transitions every `in-progress` session
/// whose heartbeat is older than `threshold`. A failure on one row does
/// not abort the batch — it is logged and counted; the caller continues
/// with the rest. Returns the number successfully recovered.
pub async fn run_periodic_reaper(store: &dyn SessionStore, threshold: Duration) -> Result<u32, CoreError> {
    let now = Utc::now();
    let cutoff = now - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero());
    let stale = store.list_stale_in_progress(cutoff).await?;

    let mut recovered = 0u32;
    let mut failures = 0u32;
    for session in stale {
        let pod_id = session.owning_pod_id.clone().unwrap_or_else(|| "unknown".to_string());
        let since = session.last_interaction_at.unwrap_or(now);
        match store.mark_session_orphaned(&session.id, &pod_id, since, now).await {
            Ok(()) => recovered += 1,
            Err(e) => {
                failures += 1;
                log::error!("orphan recovery failed for session {}: {}", session.id, e);
            }
        }
    }
    if failures > 0 {
        log::warn!("orphan reaper: {} recovered, {} failed", recovered, failures);
    }
    Ok(recovered)
}

/// Sweeps sessions owned by `pod_id` that are still `in-progress` — they
/// were claimed by a previous life of this replica — before the pool
/// starts serving (§4.3 startup sweep). Shares the same transactional
/// terminal transition as the periodic reaper.
pub async fn run_startup_sweep(store: &dyn SessionStore, pod_id: &str) -> Result<u32, CoreError> {
    let now = Utc::now();
    let owned = store.list_owned_in_progress(pod_id).await?;
    let mut recovered = 0u32;
    for session in owned {
        let since = session.last_interaction_at.unwrap_or(now);
        if let Err(e) = store.mark_session_orphaned(&session.id, pod_id, since, now).await {
            log::error!("startup sweep failed for session {}: {}", session.id, e);
        } else {
            recovered += 1;
        }
    }
    Ok(recovered)
}

/// Convenience wrapper taking an absolute "now" for deterministic tests.
pub async fn run_periodic_reaper_at(
    store: &dyn SessionStore,
    threshold: Duration,
    now: DateTime<Utc>,
) -> Result<u32, CoreError> {
    let cutoff = now - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero());
    let stale = store.list_stale_in_progress(cutoff).await?;
    let mut recovered = 0u32;
    for session in stale {
        let pod_id = session.owning_pod_id.clone().unwrap_or_else(|| "unknown".to_string());
        let since = session.last_interaction_at.unwrap_or(now);
        if store.mark_session_orphaned(&session.id, &pod_id, since, now).await.is_ok() {
            recovered += 1;
        }
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Session, Status};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn stale_session_is_marked_timed_out_with_orphan_message() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut session = Session::new("s1", "c1", "PodOOM");
        session.status = Status::Active;
        session.owning_pod_id = Some("crashed".to_string());
        session.last_interaction_at = Some(now - chrono::Duration::minutes(10));
        store.insert_session(session).await;

        let recovered = run_periodic_reaper_at(store.as_ref(), Duration::from_secs(1), now).await.unwrap();
        assert_eq!(recovered, 1);

        let updated = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(updated.status, Status::TimedOut);
        assert!(updated.completed_at.is_some());
        assert!(updated
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("Orphaned: no heartbeat from pod crashed since "));
    }

    #[tokio::test]
    async fn second_reaper_pass_is_idempotent() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut session = Session::new("s1", "c1", "PodOOM");
        session.status = Status::Active;
        session.owning_pod_id = Some("crashed".into());
        session.last_interaction_at = Some(now - chrono::Duration::minutes(10));
        store.insert_session(session).await;

        let first = run_periodic_reaper_at(store.as_ref(), Duration::from_secs(1), now).await.unwrap();
        let second = run_periodic_reaper_at(store.as_ref(), Duration::from_secs(1), now).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0, "only in-progress rows match, so the second pass finds nothing");
    }

    #[tokio::test]
    async fn healthy_sessions_are_left_alone() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut session = Session::new("s1", "c1", "PodOOM");
        session.status = Status::Active;
        session.owning_pod_id = Some("alive".into());
        session.last_interaction_at = Some(now);
        store.insert_session(session).await;

        let recovered = run_periodic_reaper_at(store.as_ref(), Duration::from_secs(300), now).await.unwrap();
        assert_eq!(recovered, 0);
    }
}
