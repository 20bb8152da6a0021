//! Bounded-concurrency download scheduler.
//!
//! A fixed pool of `max_concurrent_downloads` workers consumes a priority
//! queue; retries re-enter the queue through a single delay-ordered timer
//! task. The concurrency invariant is structural: at most one task per
//! worker is ever `Downloading`.

mod queue;
mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::CacheStore;
use crate::fetch::{AssetFetcher, FetchError};
use crate::models::{Priority, Task, TaskId, TaskStatus};
use queue::ReadyQueue;

/// Download task failures surfaced through a [`DownloadHandle`].
///
/// Clone because one fetch can fan out to many attached handles.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// Fetch failed or returned a non-success status; retried with backoff
    /// before being surfaced.
    #[error("network error{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Network {
        status: Option<u16>,
        message: String,
    },
    /// An attempt exceeded the fetch timeout; retried like a network error.
    #[error("fetch timed out after {seconds}s")]
    TimedOut { seconds: u64 },
    /// Insufficient cache quota; never retried.
    #[error("cache quota exceeded: need {needed} bytes, {available} available")]
    Quota { needed: u64, available: u64 },
    /// Cache persistence failed; never retried.
    #[error("storage error: {0}")]
    Storage(String),
    /// Rejected at submission time.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("scheduler shut down")]
    Shutdown,
}

impl DownloadError {
    fn retryable(&self) -> bool {
        matches!(self, DownloadError::Network { .. } | DownloadError::TimedOut { .. })
    }
}

impl From<FetchError> for DownloadError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Network { status, message } => DownloadError::Network { status, message },
            FetchError::TimedOut { seconds } => DownloadError::TimedOut { seconds },
            FetchError::Aborted => DownloadError::Cancelled,
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Priority,
    pub project_id: Option<String>,
    /// Defaults to the scheduler's `default_max_retries`.
    pub max_retries: Option<u32>,
    /// Caller metadata stored on the cached asset.
    pub metadata: Option<serde_json::Value>,
}

/// One asset to fetch and cache.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub file_name: String,
    /// Optional size estimate; progress fallback when the response carries
    /// no Content-Length. Must be positive when given.
    pub expected_size: Option<u64>,
    pub mime_type: String,
    pub opts: SubmitOptions,
}

/// Future side of a submission: resolves to the cached asset's local path.
#[derive(Debug)]
pub struct DownloadHandle {
    task_id: TaskId,
    rx: oneshot::Receiver<Result<PathBuf, DownloadError>>,
}

impl DownloadHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the task to reach a terminal state.
    pub async fn wait(self) -> Result<PathBuf, DownloadError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Shutdown),
        }
    }
}

/// Status/progress event feed. Lossy under receiver lag (broadcast channel);
/// progress for a given task is delivered in non-decreasing order.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Queued {
        task_id: TaskId,
        url: String,
    },
    Started {
        task_id: TaskId,
        url: String,
    },
    Progress {
        task_id: TaskId,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        percent: u8,
    },
    Retrying {
        task_id: TaskId,
        retry_count: u32,
        delay: Duration,
    },
    Paused {
        task_id: TaskId,
    },
    Resumed {
        task_id: TaskId,
    },
    Completed {
        task_id: TaskId,
        local_path: PathBuf,
        deduplicated: bool,
    },
    Failed {
        task_id: TaskId,
        error: String,
    },
    Cancelled {
        task_id: TaskId,
    },
}

/// Aggregate progress over all tracked tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub total: usize,
    pub queued: usize,
    pub downloading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    /// Mean task progress, 0-100.
    pub overall_percent: u8,
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker pool size; upper bound on simultaneous downloads.
    pub max_concurrent_downloads: usize,
    /// Base retry delay, doubled per retry.
    pub retry_base_delay: Duration,
    /// Retry limit for tasks that don't specify one.
    pub default_max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: crate::config::DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            retry_base_delay: Duration::from_secs(1),
            default_max_retries: crate::config::DEFAULT_MAX_RETRIES,
        }
    }
}

/// Mutable scheduler state. The mutex is never held across an await.
#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<TaskId, Task>,
    ready: ReadyQueue,
    /// URL -> non-terminal task, so a second submit attaches instead of
    /// fetching twice.
    in_flight: HashMap<String, TaskId>,
    waiters: HashMap<TaskId, Vec<oneshot::Sender<Result<PathBuf, DownloadError>>>>,
    /// Cancellation token of the running attempt, per downloading task.
    attempts: HashMap<TaskId, CancellationToken>,
    /// Caller metadata to attach on persist.
    metadata: HashMap<TaskId, serde_json::Value>,
    next_seq: u64,
}

struct Shared {
    state: Mutex<SchedulerState>,
    work_available: Notify,
    events: broadcast::Sender<TaskEvent>,
    retry_tx: mpsc::UnboundedSender<(Instant, TaskId)>,
    store: Arc<CacheStore>,
    fetcher: Arc<dyn AssetFetcher>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bounded-concurrency, priority-ordered download scheduler.
pub struct DownloadScheduler {
    shared: Arc<Shared>,
}

impl DownloadScheduler {
    /// Create a scheduler and start its worker pool and retry timer.
    pub fn new(
        store: Arc<CacheStore>,
        fetcher: Arc<dyn AssetFetcher>,
        config: SchedulerConfig,
    ) -> Self {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);

        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            work_available: Notify::new(),
            events,
            retry_tx,
            store,
            fetcher,
            config,
            shutdown: CancellationToken::new(),
        });

        for worker_id in 0..shared.config.max_concurrent_downloads.max(1) {
            tokio::spawn(worker::run_worker(shared.clone(), worker_id));
        }
        tokio::spawn(worker::run_retry_timer(shared.clone(), retry_rx));

        Self { shared }
    }

    /// Enqueue a fetch-and-cache task.
    ///
    /// A submit for a URL that already has a non-terminal task attaches to
    /// that task's result rather than starting a second fetch.
    pub fn submit(&self, request: DownloadRequest) -> Result<DownloadHandle, DownloadError> {
        if request.url.trim().is_empty() {
            return Err(DownloadError::InvalidRequest("url must not be empty".into()));
        }
        if request.file_name.trim().is_empty() {
            return Err(DownloadError::InvalidRequest(
                "file_name must not be empty".into(),
            ));
        }
        if request.expected_size == Some(0) {
            return Err(DownloadError::InvalidRequest(
                "expected_size must be a positive estimate".into(),
            ));
        }
        if self.shared.shutdown.is_cancelled() {
            return Err(DownloadError::Shutdown);
        }

        let (tx, rx) = oneshot::channel();
        let mut state = self.shared.lock();

        if let Some(existing_id) = state.in_flight.get(&request.url).cloned() {
            state.waiters.entry(existing_id.clone()).or_default().push(tx);
            return Ok(DownloadHandle {
                task_id: existing_id,
                rx,
            });
        }

        let id: TaskId = uuid::Uuid::new_v4().to_string();
        let task = Task {
            id: id.clone(),
            url: request.url.clone(),
            file_name: request.file_name,
            expected_size: request.expected_size,
            mime_type: request.mime_type,
            project_id: request.opts.project_id,
            priority: request.opts.priority,
            status: TaskStatus::Queued,
            progress: 0,
            downloaded_bytes: 0,
            total_bytes: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: request
                .opts
                .max_retries
                .unwrap_or(self.shared.config.default_max_retries),
            error: None,
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        state.ready.push(task.priority, seq, id.clone());
        state.in_flight.insert(request.url.clone(), id.clone());
        state.waiters.insert(id.clone(), vec![tx]);
        if let Some(metadata) = request.opts.metadata {
            state.metadata.insert(id.clone(), metadata);
        }
        state.tasks.insert(id.clone(), task);
        drop(state);

        let _ = self.shared.events.send(TaskEvent::Queued {
            task_id: id.clone(),
            url: request.url,
        });
        self.shared.work_available.notify_one();

        Ok(DownloadHandle { task_id: id, rx })
    }

    /// Move a queued or downloading task to `Paused`.
    ///
    /// An in-flight fetch is aborted cooperatively at the next chunk
    /// boundary; no partial asset is written. Attached handles survive a
    /// pause.
    pub fn pause(&self, task_id: &str) -> bool {
        let mut state = self.shared.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return false;
        };
        match task.status {
            TaskStatus::Queued | TaskStatus::Downloading => {
                task.status = TaskStatus::Paused;
            }
            _ => return false,
        }
        if let Some(token) = state.attempts.remove(task_id) {
            token.cancel();
        }
        drop(state);

        let _ = self.shared.events.send(TaskEvent::Paused {
            task_id: task_id.to_string(),
        });
        true
    }

    /// Move a paused task back to `Queued`, eligible for re-dispatch.
    pub fn resume(&self, task_id: &str) -> bool {
        let mut state = self.shared.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return false;
        };
        if task.status != TaskStatus::Paused {
            return false;
        }
        task.status = TaskStatus::Queued;
        let priority = task.priority;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.ready.push(priority, seq, task_id.to_string());
        drop(state);

        let _ = self.shared.events.send(TaskEvent::Resumed {
            task_id: task_id.to_string(),
        });
        self.shared.work_available.notify_one();
        true
    }

    /// Remove a non-terminal task entirely.
    ///
    /// Aborts an in-flight fetch; no cached asset is produced and all
    /// attached handles reject with [`DownloadError::Cancelled`].
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.shared.lock();
        match state.tasks.get(task_id) {
            Some(task) if !task.status.is_terminal() => {}
            _ => return false,
        }
        let Some(task) = state.tasks.remove(task_id) else {
            return false;
        };
        if let Some(token) = state.attempts.remove(task_id) {
            token.cancel();
        }
        state.in_flight.remove(&task.url);
        state.metadata.remove(task_id);
        let waiters = state.waiters.remove(task_id).unwrap_or_default();
        drop(state);

        for waiter in waiters {
            let _ = waiter.send(Err(DownloadError::Cancelled));
        }
        let _ = self.shared.events.send(TaskEvent::Cancelled {
            task_id: task_id.to_string(),
        });
        true
    }

    /// Drop terminal tasks from the tracked set. Never touches the cache.
    pub fn clear_completed(&self) -> usize {
        let mut state = self.shared.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, task| !task.status.is_terminal());
        before - state.tasks.len()
    }

    /// Snapshot of one tracked task.
    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.shared.lock().tasks.get(task_id).cloned()
    }

    /// Snapshot of all tracked tasks.
    pub fn tasks(&self) -> Vec<Task> {
        self.shared.lock().tasks.values().cloned().collect()
    }

    /// Aggregate progress across tracked tasks.
    pub fn progress_summary(&self) -> ProgressSummary {
        let state = self.shared.lock();
        let mut summary = ProgressSummary::default();
        let mut percent_sum: u64 = 0;
        for task in state.tasks.values() {
            summary.total += 1;
            percent_sum += u64::from(task.progress);
            match task.status {
                TaskStatus::Queued => summary.queued += 1,
                TaskStatus::Downloading => summary.downloading += 1,
                TaskStatus::Paused => summary.paused += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
            }
        }
        if summary.total > 0 {
            summary.overall_percent = (percent_sum / summary.total as u64) as u8;
        }
        summary
    }

    /// Subscribe to the task event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }

    /// Stop the worker pool and retry timer, aborting in-flight fetches.
    /// Pending handles reject with [`DownloadError::Shutdown`].
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let mut state = self.shared.lock();
        let waiters: Vec<_> = state.waiters.drain().flat_map(|(_, w)| w).collect();
        drop(state);
        for waiter in waiters {
            let _ = waiter.send(Err(DownloadError::Shutdown));
        }
        info!("Download scheduler shut down");
    }
}
