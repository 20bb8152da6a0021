//! In-memory download task tracked by the scheduler.

use chrono::{DateTime, Utc};

/// Opaque task identifier (UUID v4 string).
pub type TaskId = String;

/// Scheduling weight for queued tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Lifecycle state of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and Failed are terminal; everything else can still move.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// One requested fetch-and-cache operation.
///
/// Created on submit, removed from the scheduling set on reaching a terminal
/// state, dropped from the tracked set by `clear_completed` (or immediately
/// by cancel). Not retained as history.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub url: String,
    pub file_name: String,
    /// Caller-supplied size hint; progress fallback only, may be unreliable.
    pub expected_size: Option<u64>,
    pub mime_type: String,
    pub project_id: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    /// 0-100, non-decreasing within a single attempt.
    pub progress: u8,
    pub downloaded_bytes: u64,
    /// Server-reported Content-Length when known; preferred over the hint.
    pub total_bytes: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Terminal failure message, set when status becomes Failed.
    pub error: Option<String>,
}

impl Task {
    /// Recompute the progress percentage from downloaded bytes.
    ///
    /// Prefers the server-reported total; falls back to the caller's size
    /// hint. With neither, progress stays at 0 until completion. Capped at
    /// 99 until the task actually completes.
    pub fn update_progress(&mut self) {
        let Some(denominator) = self.total_bytes.or(self.expected_size).filter(|&d| d > 0)
        else {
            return;
        };
        let percent = (self.downloaded_bytes.saturating_mul(100) / denominator).min(99) as u8;
        if percent > self.progress {
            self.progress = percent;
        }
    }
}
