//! Scheduler behavior tests against a fake fetch backend.
//!
//! All tests run on the current-thread runtime so that submissions land
//! before any worker claims, making dispatch order deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use fieldcache::cache::{CacheConfig, CacheError, CacheStore};
use fieldcache::fetch::{AssetFetcher, FetchError, ProgressFn};
use fieldcache::models::{NewAsset, Priority, TaskStatus};
use fieldcache::scheduler::{
    DownloadError, DownloadRequest, DownloadScheduler, SchedulerConfig, SubmitOptions, TaskEvent,
};

/// Fake backend: serves fixed bytes, optionally gated on a semaphore and
/// optionally always failing. Records started URLs and peak concurrency.
struct FakeFetcher {
    bytes: Vec<u8>,
    gate: Option<Arc<Semaphore>>,
    fail: bool,
    fail_first: AtomicUsize,
    started: Mutex<Vec<String>>,
    fetches: AtomicUsize,
    concurrent: AtomicUsize,
    peak_concurrent: AtomicUsize,
}

impl FakeFetcher {
    fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            gate: None,
            fail: false,
            fail_first: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            peak_concurrent: AtomicUsize::new(0),
        }
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn failing_first(self, attempts: usize) -> Self {
        self.fail_first.store(attempts, Ordering::SeqCst);
        self
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        on_progress: &ProgressFn,
    ) -> Result<Vec<u8>, FetchError> {
        if let Some(gate) = &self.gate {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Aborted),
                permit = gate.acquire() => permit.unwrap().forget(),
            }
        }
        if cancel.is_cancelled() {
            return Err(FetchError::Aborted);
        }
        if self.fail
            || self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(FetchError::Network {
                status: Some(503),
                message: "HTTP 503 Service Unavailable".to_string(),
            });
        }
        let total = self.bytes.len() as u64;
        on_progress(total, Some(total));
        Ok(self.bytes.clone())
    }
}

#[async_trait]
impl AssetFetcher for FakeFetcher {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
        on_progress: &ProgressFn,
    ) -> Result<Vec<u8>, FetchError> {
        self.started.lock().unwrap().push(url.to_string());
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent.fetch_max(now, Ordering::SeqCst);
        let result = self.run(cancel, on_progress).await;
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<CacheStore>,
    fetcher: Arc<FakeFetcher>,
    scheduler: DownloadScheduler,
}

fn harness(fetcher: FakeFetcher, config: SchedulerConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CacheStore::open(dir.path(), CacheConfig::default()).unwrap());
    let fetcher = Arc::new(fetcher);
    let scheduler = DownloadScheduler::new(store.clone(), fetcher.clone(), config);
    Harness {
        _dir: dir,
        store,
        fetcher,
        scheduler,
    }
}

fn request(url: &str, priority: Priority) -> DownloadRequest {
    DownloadRequest {
        url: url.to_string(),
        file_name: url.rsplit('/').next().unwrap().to_string(),
        expected_size: Some(100),
        mime_type: "application/pdf".to_string(),
        opts: SubmitOptions {
            priority,
            ..Default::default()
        },
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_pool_size() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        FakeFetcher::new(b"bytes").gated(gate.clone()),
        SchedulerConfig {
            max_concurrent_downloads: 2,
            ..Default::default()
        },
    );

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(
            h.scheduler
                .submit(request(&format!("https://origin.test/f{i}.pdf"), Priority::Medium))
                .unwrap(),
        );
    }

    gate.add_permits(5);
    for handle in handles {
        handle.wait().await.unwrap();
    }

    assert!(h.fetcher.peak_concurrent.load(Ordering::SeqCst) <= 2);
    assert_eq!(h.fetcher.fetch_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn high_priority_tasks_dispatch_first_in_submission_order() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        FakeFetcher::new(b"bytes").gated(gate.clone()),
        SchedulerConfig {
            max_concurrent_downloads: 2,
            ..Default::default()
        },
    );

    let priorities = [
        Priority::Low,
        Priority::High,
        Priority::Medium,
        Priority::High,
        Priority::Low,
    ];
    let handles: Vec<_> = priorities
        .iter()
        .enumerate()
        .map(|(i, &priority)| {
            h.scheduler
                .submit(request(&format!("https://origin.test/f{i}.pdf"), priority))
                .unwrap()
        })
        .collect();

    let fetcher = h.fetcher.clone();
    wait_until(move || fetcher.started().len() == 2).await;
    assert_eq!(
        h.fetcher.started(),
        ["https://origin.test/f1.pdf", "https://origin.test/f3.pdf"]
    );

    // The rest are still queued behind the pool
    let summary = h.scheduler.progress_summary();
    assert_eq!(summary.downloading, 2);
    assert_eq!(summary.queued, 3);

    gate.add_permits(5);
    for handle in handles {
        handle.wait().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_submit_attaches_to_in_flight_task() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        FakeFetcher::new(b"photo").gated(gate.clone()),
        SchedulerConfig::default(),
    );

    let url = "https://origin.test/site.jpg";
    let first = h.scheduler.submit(request(url, Priority::Medium)).unwrap();
    let second = h.scheduler.submit(request(url, Priority::Medium)).unwrap();
    assert_eq!(first.task_id(), second.task_id());

    gate.add_permits(5);
    let path_a = first.wait().await.unwrap();
    let path_b = second.wait().await.unwrap();

    assert_eq!(path_a, path_b);
    assert_eq!(h.fetcher.fetch_count(), 1);
    assert_eq!(h.store.list_all().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_task_retries_with_exponential_backoff() {
    let h = harness(
        FakeFetcher::new(b"").failing(),
        SchedulerConfig {
            max_concurrent_downloads: 1,
            retry_base_delay: Duration::from_secs(1),
            default_max_retries: 3,
        },
    );

    let started = tokio::time::Instant::now();
    let handle = h
        .scheduler
        .submit(request("https://origin.test/flaky.pdf", Priority::Medium))
        .unwrap();
    let task_id = handle.task_id().to_string();

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, DownloadError::Network { status: Some(503), .. }));

    // Backoff 1s + 2s + 4s between the four attempts
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(7), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(9), "elapsed {:?}", elapsed);

    let task = h.scheduler.task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, task.max_retries);
    assert_eq!(h.fetcher.fetch_count(), 4);
    assert!(task.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_download_leaves_no_cache_entry() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        FakeFetcher::new(b"partial").gated(gate.clone()),
        SchedulerConfig::default(),
    );

    let url = "https://origin.test/cancelled.jpg";
    let handle = h.scheduler.submit(request(url, Priority::Medium)).unwrap();
    let task_id = handle.task_id().to_string();

    let fetcher = h.fetcher.clone();
    wait_until(move || fetcher.started().len() == 1).await;

    assert!(h.scheduler.cancel(&task_id));
    assert!(matches!(
        handle.wait().await.unwrap_err(),
        DownloadError::Cancelled
    ));

    assert!(h.scheduler.task(&task_id).is_none());
    assert!(matches!(h.store.read(url), Err(CacheError::NotFound)));

    // A cancelled task is no longer in flight; a fresh submit fetches anew
    gate.add_permits(5);
    let handle = h.scheduler.submit(request(url, Priority::Medium)).unwrap();
    handle.wait().await.unwrap();
    assert_eq!(h.fetcher.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn pause_aborts_attempt_and_resume_restarts_it() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        FakeFetcher::new(b"resumable").gated(gate.clone()),
        SchedulerConfig::default(),
    );

    let url = "https://origin.test/paused.pdf";
    let handle = h.scheduler.submit(request(url, Priority::Medium)).unwrap();
    let task_id = handle.task_id().to_string();

    let fetcher = h.fetcher.clone();
    wait_until(move || fetcher.started().len() == 1).await;

    assert!(h.scheduler.pause(&task_id));
    assert_eq!(
        h.scheduler.task(&task_id).unwrap().status,
        TaskStatus::Paused
    );
    // Pausing twice is a no-op
    assert!(!h.scheduler.pause(&task_id));

    gate.add_permits(10);
    assert!(h.scheduler.resume(&task_id));

    let path = handle.wait().await.unwrap();
    assert!(path.exists());
    // Second attempt after the aborted one
    assert_eq!(h.fetcher.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn resume_during_retry_delay_skips_remaining_backoff() {
    let h = harness(
        FakeFetcher::new(b"eventually").failing_first(1),
        SchedulerConfig {
            max_concurrent_downloads: 1,
            retry_base_delay: Duration::from_secs(60),
            default_max_retries: 3,
        },
    );

    let handle = h
        .scheduler
        .submit(request("https://origin.test/flaky.pdf", Priority::Medium))
        .unwrap();
    let task_id = handle.task_id().to_string();

    // First attempt fails; the task waits out a 60s backoff
    let scheduler = &h.scheduler;
    let id = task_id.clone();
    wait_until(move || scheduler.task(&id).map(|t| t.retry_count) == Some(1)).await;
    assert!(h.scheduler.pause(&task_id));

    // The retry deadline passes while paused; the task must stay put
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(
        h.scheduler.task(&task_id).unwrap().status,
        TaskStatus::Paused
    );
    assert_eq!(h.fetcher.fetch_count(), 1);

    // Resume dispatches immediately instead of waiting out a fresh delay
    let resumed_at = tokio::time::Instant::now();
    assert!(h.scheduler.resume(&task_id));
    let path = handle.wait().await.unwrap();
    assert!(path.exists());
    assert_eq!(h.fetcher.fetch_count(), 2);
    assert!(resumed_at.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn quota_failure_is_terminal_without_retries() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        CacheStore::open(dir.path(), CacheConfig { max_cache_bytes: 4 }).unwrap(),
    );
    let fetcher = Arc::new(FakeFetcher::new(b"way too many bytes"));
    let scheduler = DownloadScheduler::new(
        store,
        fetcher.clone(),
        SchedulerConfig {
            retry_base_delay: Duration::from_secs(1),
            default_max_retries: 3,
            ..Default::default()
        },
    );

    let handle = scheduler
        .submit(request("https://origin.test/huge.pdf", Priority::Medium))
        .unwrap();
    let task_id = handle.task_id().to_string();

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, DownloadError::Quota { .. }));

    let task = scheduler.task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    assert_eq!(fetcher.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cached_url_completes_without_network_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CacheStore::open(dir.path(), CacheConfig::default()).unwrap());

    let url = "https://origin.test/already-there.pdf";
    let existing = store
        .write(
            &NewAsset {
                original_url: url.to_string(),
                file_name: "already-there.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                project_id: None,
                metadata: serde_json::json!({}),
            },
            b"cached bytes",
        )
        .unwrap()
        .asset;
    let accessed_before = existing.last_accessed;

    let fetcher = Arc::new(FakeFetcher::new(b"fresh bytes"));
    let scheduler =
        DownloadScheduler::new(store.clone(), fetcher.clone(), SchedulerConfig::default());
    let mut events = scheduler.subscribe();

    let handle = scheduler.submit(request(url, Priority::Medium)).unwrap();
    let path = handle.wait().await.unwrap();

    assert_eq!(path, existing.local_path);
    assert_eq!(fetcher.fetch_count(), 0);
    assert!(store.read(url).unwrap().last_accessed > accessed_before);

    let mut saw_dedup_completion = false;
    while let Ok(event) = events.try_recv() {
        if let TaskEvent::Completed { deduplicated, .. } = event {
            saw_dedup_completion = deduplicated;
        }
    }
    assert!(saw_dedup_completion);
}

#[tokio::test(start_paused = true)]
async fn clear_completed_drops_terminal_tasks_only() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        FakeFetcher::new(b"bytes").gated(gate.clone()),
        SchedulerConfig {
            max_concurrent_downloads: 1,
            ..Default::default()
        },
    );

    let done = h
        .scheduler
        .submit(request("https://origin.test/done.pdf", Priority::High))
        .unwrap();
    let pending = h
        .scheduler
        .submit(request("https://origin.test/pending.pdf", Priority::Low))
        .unwrap();

    gate.add_permits(1);
    done.wait().await.unwrap();

    assert_eq!(h.scheduler.clear_completed(), 1);
    let remaining = h.scheduler.tasks();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].url, "https://origin.test/pending.pdf");

    gate.add_permits(1);
    pending.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn submit_validation_rejects_bad_requests() {
    let h = harness(FakeFetcher::new(b"bytes"), SchedulerConfig::default());

    let mut bad = request("https://origin.test/x.pdf", Priority::Medium);
    bad.expected_size = Some(0);
    assert!(matches!(
        h.scheduler.submit(bad),
        Err(DownloadError::InvalidRequest(_))
    ));

    assert!(matches!(
        h.scheduler.submit(request("", Priority::Medium)),
        Err(DownloadError::InvalidRequest(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_pending_and_new_work() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        FakeFetcher::new(b"bytes").gated(gate.clone()),
        SchedulerConfig::default(),
    );

    let handle = h
        .scheduler
        .submit(request("https://origin.test/stuck.pdf", Priority::Medium))
        .unwrap();

    h.scheduler.shutdown();
    assert!(matches!(
        handle.wait().await.unwrap_err(),
        DownloadError::Shutdown
    ));
    assert!(matches!(
        h.scheduler
            .submit(request("https://origin.test/late.pdf", Priority::Medium)),
        Err(DownloadError::Shutdown)
    ));
}
