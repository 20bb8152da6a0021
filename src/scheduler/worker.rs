//! Worker pool and retry timer loops.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::queue::RetryQueue;
use super::{DownloadError, Shared, TaskEvent};
use crate::cache::CacheError;
use crate::fetch::FetchError;
use crate::models::{NewAsset, TaskId, TaskStatus};

/// Everything a worker needs for one attempt, snapshotted at claim time.
struct Claimed {
    id: TaskId,
    url: String,
    file_name: String,
    mime_type: String,
    project_id: Option<String>,
    metadata: serde_json::Value,
    token: CancellationToken,
}

pub(super) async fn run_worker(shared: Arc<Shared>, worker_id: usize) {
    debug!("Download worker {} started", worker_id);
    loop {
        match claim(&shared) {
            Some(claimed) => {
                // Chain the wakeup in case more work is queued behind this one
                shared.work_available.notify_one();
                process(&shared, claimed).await;
                if shared.shutdown.is_cancelled() {
                    return;
                }
            }
            None => {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => return,
                    _ = shared.work_available.notified() => {}
                }
            }
        }
    }
}

/// Claim the highest-priority queued task, marking it `Downloading`.
///
/// Skips stale ready-queue entries for tasks that were paused or cancelled
/// after being enqueued.
fn claim(shared: &Shared) -> Option<Claimed> {
    let mut state = shared.lock();
    loop {
        let id = state.ready.pop()?;
        let metadata = state
            .metadata
            .get(&id)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        let Some(task) = state.tasks.get_mut(&id) else {
            continue;
        };
        if task.status != TaskStatus::Queued {
            continue;
        }
        task.status = TaskStatus::Downloading;
        task.started_at = Some(Utc::now());
        task.downloaded_bytes = 0;
        task.progress = 0;
        task.total_bytes = None;
        let claimed = Claimed {
            id: id.clone(),
            url: task.url.clone(),
            file_name: task.file_name.clone(),
            mime_type: task.mime_type.clone(),
            project_id: task.project_id.clone(),
            metadata,
            token: shared.shutdown.child_token(),
        };
        state.attempts.insert(id, claimed.token.clone());
        return Some(claimed);
    }
}

async fn process(shared: &Arc<Shared>, claimed: Claimed) {
    let _ = shared.events.send(TaskEvent::Started {
        task_id: claimed.id.clone(),
        url: claimed.url.clone(),
    });

    // Dedup before fetching: a URL already cached completes without any
    // network I/O.
    let store = shared.store.clone();
    let url = claimed.url.clone();
    match tokio::task::spawn_blocking(move || store.read(&url)).await {
        Ok(Ok(asset)) => {
            complete(shared, &claimed.id, asset.local_path.clone(), true);
            return;
        }
        Ok(Err(CacheError::NotFound)) => {}
        Ok(Err(e)) => {
            fail_or_retry(shared, &claimed.id, DownloadError::Storage(e.to_string()));
            return;
        }
        Err(e) => {
            fail_or_retry(shared, &claimed.id, DownloadError::Storage(e.to_string()));
            return;
        }
    }

    let progress_shared = shared.clone();
    let progress_id = claimed.id.clone();
    let on_progress = move |downloaded: u64, total: Option<u64>| {
        let mut event = None;
        {
            let mut state = progress_shared.lock();
            if let Some(task) = state.tasks.get_mut(&progress_id) {
                if task.status == TaskStatus::Downloading {
                    task.downloaded_bytes = downloaded;
                    if total.is_some() {
                        task.total_bytes = total;
                    }
                    task.update_progress();
                    event = Some(TaskEvent::Progress {
                        task_id: progress_id.clone(),
                        downloaded_bytes: downloaded,
                        total_bytes: task.total_bytes,
                        percent: task.progress,
                    });
                }
            }
        }
        if let Some(event) = event {
            let _ = progress_shared.events.send(event);
        }
    };

    let result = shared
        .fetcher
        .fetch(&claimed.url, &claimed.token, &on_progress)
        .await;

    match result {
        Ok(bytes) => {
            // Cancel or pause may have raced the final chunk
            let still_downloading = {
                let mut state = shared.lock();
                match state.tasks.get(&claimed.id) {
                    Some(task) if task.status == TaskStatus::Downloading => true,
                    _ => {
                        state.attempts.remove(&claimed.id);
                        false
                    }
                }
            };
            if !still_downloading {
                return;
            }

            let store = shared.store.clone();
            let meta = NewAsset {
                original_url: claimed.url.clone(),
                file_name: claimed.file_name.clone(),
                mime_type: claimed.mime_type.clone(),
                project_id: claimed.project_id.clone(),
                metadata: claimed.metadata.clone(),
            };
            match tokio::task::spawn_blocking(move || store.write(&meta, &bytes)).await {
                Ok(Ok(outcome)) => complete(
                    shared,
                    &claimed.id,
                    outcome.asset.local_path.clone(),
                    outcome.deduplicated,
                ),
                Ok(Err(CacheError::QuotaExceeded { needed, available })) => fail_or_retry(
                    shared,
                    &claimed.id,
                    DownloadError::Quota { needed, available },
                ),
                Ok(Err(e)) => {
                    fail_or_retry(shared, &claimed.id, DownloadError::Storage(e.to_string()))
                }
                Err(e) => {
                    fail_or_retry(shared, &claimed.id, DownloadError::Storage(e.to_string()))
                }
            }
        }
        Err(FetchError::Aborted) => {
            // Pause, cancel, or shutdown already did the state bookkeeping
            shared.lock().attempts.remove(&claimed.id);
        }
        Err(e) => fail_or_retry(shared, &claimed.id, e.into()),
    }
}

fn complete(shared: &Shared, id: &TaskId, local_path: std::path::PathBuf, deduplicated: bool) {
    let mut state = shared.lock();
    state.attempts.remove(id);
    let Some(task) = state.tasks.get_mut(id) else {
        return;
    };
    task.status = TaskStatus::Completed;
    task.progress = 100;
    task.completed_at = Some(Utc::now());
    let url = task.url.clone();
    state.in_flight.remove(&url);
    state.metadata.remove(id);
    let waiters = state.waiters.remove(id).unwrap_or_default();
    drop(state);

    for waiter in waiters {
        let _ = waiter.send(Ok(local_path.clone()));
    }
    debug!("Task {} completed: {}", id, local_path.display());
    let _ = shared.events.send(TaskEvent::Completed {
        task_id: id.clone(),
        local_path,
        deduplicated,
    });
}

/// Re-queue a failed attempt with exponential backoff, or fail terminally
/// when retries are exhausted or the error is not retryable.
fn fail_or_retry(shared: &Shared, id: &TaskId, error: DownloadError) {
    let mut state = shared.lock();
    state.attempts.remove(id);
    let Some(task) = state.tasks.get_mut(id) else {
        return;
    };
    if task.status != TaskStatus::Downloading {
        // Paused or cancelled while the failure was in flight
        return;
    }

    if error.retryable() && task.retry_count < task.max_retries {
        let exponent = task.retry_count.min(16);
        task.retry_count += 1;
        task.status = TaskStatus::Queued;
        let retry_count = task.retry_count;
        let max_retries = task.max_retries;
        let delay = shared.config.retry_base_delay.saturating_mul(1u32 << exponent);
        drop(state);

        warn!(
            "Task {} attempt failed ({}), retry {}/{} in {:?}",
            id, error, retry_count, max_retries, delay
        );
        let _ = shared.events.send(TaskEvent::Retrying {
            task_id: id.clone(),
            retry_count,
            delay,
        });
        let _ = shared.retry_tx.send((Instant::now() + delay, id.clone()));
    } else {
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        task.completed_at = Some(Utc::now());
        let url = task.url.clone();
        state.in_flight.remove(&url);
        state.metadata.remove(id);
        let waiters = state.waiters.remove(id).unwrap_or_default();
        drop(state);

        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        warn!("Task {} failed: {}", id, error);
        let _ = shared.events.send(TaskEvent::Failed {
            task_id: id.clone(),
            error: error.to_string(),
        });
    }
}

/// Single timer task draining the delay-ordered retry queue.
pub(super) async fn run_retry_timer(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<(Instant, TaskId)>,
) {
    let mut queue = RetryQueue::default();
    loop {
        let next = queue.next_deadline();
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            entry = rx.recv() => match entry {
                Some((deadline, id)) => queue.push(deadline, id),
                None => return,
            },
            _ = sleep_until_or_pending(next) => {
                if let Some((_, id)) = queue.pop() {
                    requeue(&shared, &id);
                }
            }
        }
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Put a retry-delayed task back on the ready queue, unless it was paused
/// or cancelled while waiting.
fn requeue(shared: &Shared, id: &TaskId) {
    let mut state = shared.lock();
    let Some(task) = state.tasks.get(id) else {
        return;
    };
    if task.status != TaskStatus::Queued {
        return;
    }
    let priority = task.priority;
    let seq = state.next_seq;
    state.next_seq += 1;
    state.ready.push(priority, seq, id.clone());
    drop(state);
    shared.work_available.notify_one();
}
