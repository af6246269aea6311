//! Worker pool (§4.2): owns N workers, the session cancel registry, and
//! the orphan reaper.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::QueueConfig;
use crate::ctx::CancelRegistry;
use crate::error::CoreError;
use crate::event::EventPublisher;
use crate::executor::ExecutorDeps;
use crate::orphan::{run_periodic_reaper, run_startup_sweep};
use crate::store::SessionStore;
use crate::worker::{Worker, WorkerState};

#[derive(Debug, Clone)]
pub struct WorkerHealth {
    pub id: String,
    pub state: WorkerState,
}

#[derive(Debug, Clone)]
pub struct PoolHealth {
    pub is_healthy: bool,
    pub worker_count: u32,
    pub max_concurrent_sessions: u32,
    pub in_progress_count: u32,
    pub workers: Vec<WorkerHealth>,
    pub last_orphan_scan_at: Option<DateTime<Utc>>,
    pub cumulative_recoveries: u64,
}

pub struct WorkerPool {
    pod_id: String,
    workers: Vec<Arc<Worker>>,
    store: Arc<dyn SessionStore>,
    queue_config: QueueConfig,
    cancel_registry: CancelRegistry,
    orphan_stop: AtomicBool,
    last_orphan_scan_at: tokio::sync::RwLock<Option<DateTime<Utc>>>,
    cumulative_recoveries: AtomicU64,
    /// Join handles from the most recent `start()`, owned so `stop()` can
    /// await them itself rather than leaving that to the caller.
    handles: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerPool {
    pub async fn new(
        pod_id: impl Into<String>,
        store: Arc<dyn SessionStore>,
        executor_deps: Arc<ExecutorDeps>,
        event_publisher: Arc<dyn EventPublisher>,
        queue_config: QueueConfig,
    ) -> Arc<Self> {
        let pod_id = pod_id.into();
        let cancel_registry = CancelRegistry::new();
        let mut workers = Vec::with_capacity(queue_config.worker_count as usize);
        for i in 0..queue_config.worker_count {
            workers.push(Arc::new(Worker::new(
                format!("worker-{}", i),
                pod_id.clone(),
                store.clone(),
                executor_deps.clone(),
                event_publisher.clone(),
                queue_config.clone(),
                cancel_registry.clone(),
            )));
        }
        Arc::new(WorkerPool {
            pod_id,
            workers,
            store,
            queue_config,
            cancel_registry,
            orphan_stop: AtomicBool::new(false),
            last_orphan_scan_at: tokio::sync::RwLock::new(None),
            cumulative_recoveries: AtomicU64::new(0),
            handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Sweeps sessions owned by this pod that are still `in-progress` —
    /// claimed by a previous life of this replica — before the pool
    /// starts serving (§4.3 startup sweep).
    pub async fn startup_sweep(&self) -> Result<u32, CoreError> {
        run_startup_sweep(self.store.as_ref(), &self.pod_id).await
    }

    /// Spawns every worker's poll loop plus the periodic orphan reaper,
    /// retaining the join handles so `stop()` can await them.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = Vec::with_capacity(self.workers.len() + 1);
        for worker in &self.workers {
            let worker = worker.clone();
            handles.push(tokio::spawn(async move {
                worker.run().await;
            }));
        }

        let pool = self.clone();
        handles.push(tokio::spawn(async move {
            let interval = Duration::from_secs(pool.queue_config.orphan_detection_interval_secs);
            let threshold = Duration::from_secs(pool.queue_config.orphan_threshold_secs);
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if pool.orphan_stop.load(Ordering::SeqCst) {
                    break;
                }
                match run_periodic_reaper(pool.store.as_ref(), threshold).await {
                    Ok(recovered) => {
                        *pool.last_orphan_scan_at.write().await = Some(Utc::now());
                        pool.cumulative_recoveries.fetch_add(recovered as u64, Ordering::SeqCst);
                    }
                    Err(e) => log::error!("orphan reaper tick failed: {}", e),
                }
            }
        }));

        self.handles.lock().await.extend(handles);
    }

    pub async fn cancel_session(&self, session_id: &str) -> bool {
        self.cancel_registry.cancel_by_id(session_id).await
    }

    pub async fn list_active_sessions(&self) -> Vec<String> {
        self.cancel_registry.list_active().await
    }

    /// Idempotent: a second call to stop the orphan reaper is a no-op.
    pub fn stop_orphan_reaper(&self) {
        self.orphan_stop.store(true, Ordering::SeqCst);
    }

    /// Signals every worker and the orphan reaper to stop, then waits for
    /// their tasks to exit, bounded by `graceful_shutdown_timeout_secs`
    /// (§4.2). Tasks still running past the bound are aborted rather than
    /// left to finish on their own.
    pub async fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
        self.stop_orphan_reaper();

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let timeout = Duration::from_secs(self.queue_config.graceful_shutdown_timeout_secs);
        if tokio::time::timeout(timeout, futures_util::future::join_all(handles)).await.is_err() {
            log::warn!(
                "graceful shutdown timed out after {:?}; aborting remaining worker tasks",
                timeout
            );
            for abort_handle in abort_handles {
                abort_handle.abort();
            }
        }
    }

    pub async fn health(&self) -> PoolHealth {
        let in_progress_count = self.store.count_in_progress().await.unwrap_or_else(|e| {
            log::warn!("health check: count_in_progress failed: {}", e);
            u32::MAX
        });
        let is_healthy = in_progress_count != u32::MAX;
        let mut workers = Vec::with_capacity(self.workers.len());
        for w in &self.workers {
            workers.push(WorkerHealth { id: w.id.clone(), state: w.state().await });
        }
        PoolHealth {
            is_healthy,
            worker_count: self.workers.len() as u32,
            max_concurrent_sessions: self.queue_config.max_concurrent_sessions,
            in_progress_count: if is_healthy { in_progress_count } else { 0 },
            workers,
            last_orphan_scan_at: *self.last_orphan_scan_at.read().await,
            cumulative_recoveries: self.cumulative_recoveries.load(Ordering::SeqCst),
        }
    }
}
