//! Background job management for ingest, sync and index rebuilds.
//!
//! Jobs are in-memory only: every persistent effect goes through the
//! store photo by photo, so losing the registry on restart costs nothing
//! but the progress display. At most one job per kind runs at a time;
//! submitting a second job of the same kind queues it.

pub mod runner;

use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub use runner::JobRunner;

/// Unique identifier for a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(pub u64);

impl JobId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        JobId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of background job. Jobs of the same kind are serialized; jobs of
/// different kinds run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Ingest,
    Sync,
    Rebuild,
}

impl JobKind {
    /// Full display name for status surfaces.
    pub fn display_name(&self) -> &'static str {
        match self {
            JobKind::Ingest => "Embedding Ingest",
            JobKind::Sync => "Cache Sync",
            JobKind::Rebuild => "Index Rebuild",
        }
    }
}

/// Progress information for a job. `total == 0` means unknown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobProgress {
    pub current: usize,
    pub total: usize,
    pub message: Option<String>,
}

impl JobProgress {
    pub fn new(current: usize, total: usize) -> Self {
        Self {
            current,
            total,
            message: None,
        }
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Calculate progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.current as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }
}

/// State of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Snapshot of a job, published to subscribers on every change. Late
/// subscribers receive the latest snapshot as their first event.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub progress: JobProgress,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Handed to the job body: the cancellation flag (checked at photo
/// boundaries) and a progress publisher.
pub struct JobContext {
    pub cancel: Arc<AtomicBool>,
    progress: Box<dyn Fn(JobProgress) + Send + Sync>,
}

impl JobContext {
    pub(crate) fn new(
        cancel: Arc<AtomicBool>,
        progress: Box<dyn Fn(JobProgress) + Send + Sync>,
    ) -> Self {
        Self { cancel, progress }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn publish(&self, progress: JobProgress) {
        (self.progress)(progress);
    }
}

/// What a job body returns: a JSON result payload on success, an error
/// string on unrecoverable setup failure.
pub type JobResult = std::result::Result<serde_json::Value, String>;

/// The job body. Per-photo errors are the body's business (logged and
/// counted); only setup failures surface as `Err`.
pub type JobFn = Box<dyn FnOnce(&JobContext) -> JobResult + Send + 'static>;
