//! Job registry and per-kind execution.
//!
//! Each kind gets a dedicated worker thread fed by a queue, which is what
//! serializes same-kind jobs while different kinds run side by side. The
//! registry itself is a small map behind one mutex; progress events fan
//! out to per-job subscriber channels and jobs keep running when the last
//! subscriber disappears.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use super::{JobContext, JobFn, JobId, JobKind, JobProgress, JobResult, JobState, JobStatus};

struct JobEntry {
    status: JobStatus,
    cancel_flag: Arc<AtomicBool>,
    subscribers: Vec<mpsc::Sender<JobStatus>>,
}

struct QueuedJob {
    id: JobId,
    body: JobFn,
}

#[derive(Default)]
struct RunnerInner {
    jobs: HashMap<JobId, JobEntry>,
    /// Submission order, for listing.
    order: Vec<JobId>,
    /// Lazily-started per-kind worker queues.
    workers: HashMap<JobKind, mpsc::Sender<QueuedJob>>,
}

pub struct JobRunner {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<RunnerInner>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, RunnerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a mutation to a job's status and fan the new snapshot out to
    /// its subscribers, dropping the ones that went away.
    fn publish(&self, id: JobId, mutate: impl FnOnce(&mut JobStatus)) {
        let mut inner = self.lock();
        if let Some(entry) = inner.jobs.get_mut(&id) {
            mutate(&mut entry.status);
            let snapshot = entry.status.clone();
            entry
                .subscribers
                .retain(|subscriber| subscriber.send(snapshot.clone()).is_ok());
        }
    }

    fn run_queued(self: &Arc<Self>, job: QueuedJob) {
        let cancel_flag = {
            let inner = self.lock();
            match inner.jobs.get(&job.id) {
                // Cancelled while still queued; never runs.
                Some(entry) if entry.status.state == JobState::Cancelled => return,
                Some(entry) => Arc::clone(&entry.cancel_flag),
                None => return,
            }
        };

        self.publish(job.id, |status| status.state = JobState::Running);

        let progress_shared = Arc::clone(self);
        let progress_id = job.id;
        let context = JobContext::new(
            Arc::clone(&cancel_flag),
            Box::new(move |progress: JobProgress| {
                progress_shared.publish(progress_id, |status| status.progress = progress.clone());
            }),
        );

        let result: JobResult = (job.body)(&context);
        let cancelled = cancel_flag.load(Ordering::SeqCst);

        self.publish(job.id, |status| match (&result, cancelled) {
            (Ok(value), false) => {
                status.state = JobState::Completed;
                status.result = Some(value.clone());
            }
            (Ok(value), true) => {
                // Cancellation leaves already-written rows in place; the
                // partial counters still matter to the caller.
                status.state = JobState::Cancelled;
                status.result = Some(value.clone());
            }
            (Err(error), true) => {
                status.state = JobState::Cancelled;
                status.error = Some(error.clone());
            }
            (Err(error), false) => {
                status.state = JobState::Failed;
                status.error = Some(error.clone());
            }
        });
    }
}

impl JobRunner {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(RunnerInner::default()),
            }),
        }
    }

    /// Register and enqueue a job. Same-kind jobs execute in submission
    /// order; the returned id is live immediately for status/subscribe.
    pub fn submit(&self, kind: JobKind, body: JobFn) -> JobId {
        let id = JobId::new();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let entry = JobEntry {
            status: JobStatus {
                id,
                kind,
                state: JobState::Pending,
                progress: JobProgress::default(),
                result: None,
                error: None,
            },
            cancel_flag,
            subscribers: Vec::new(),
        };

        let sender = {
            let mut inner = self.shared.lock();
            inner.jobs.insert(id, entry);
            inner.order.push(id);

            match inner.workers.get(&kind) {
                Some(sender) => sender.clone(),
                None => {
                    let (tx, rx) = mpsc::channel::<QueuedJob>();
                    let shared = Arc::clone(&self.shared);
                    std::thread::Builder::new()
                        .name(format!("jobs-{}", kind.display_name()))
                        .spawn(move || {
                            while let Ok(queued) = rx.recv() {
                                shared.run_queued(queued);
                            }
                        })
                        .ok();
                    inner.workers.insert(kind, tx.clone());
                    tx
                }
            }
        };

        if sender.send(QueuedJob { id, body }).is_err() {
            self.shared.publish(id, |status| {
                status.state = JobState::Failed;
                status.error = Some("job worker unavailable".to_string());
            });
        }
        id
    }

    /// Request cancellation. Pending jobs are cancelled outright; running
    /// jobs see the flag at their next photo boundary. Returns false for
    /// unknown or already-terminal jobs.
    pub fn cancel(&self, id: JobId) -> bool {
        let mut inner = self.shared.lock();
        let Some(entry) = inner.jobs.get_mut(&id) else {
            return false;
        };
        match entry.status.state {
            JobState::Pending => {
                entry.cancel_flag.store(true, Ordering::SeqCst);
                entry.status.state = JobState::Cancelled;
                let snapshot = entry.status.clone();
                entry
                    .subscribers
                    .retain(|subscriber| subscriber.send(snapshot.clone()).is_ok());
                true
            }
            JobState::Running => {
                entry.cancel_flag.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.shared.lock().jobs.get(&id).map(|e| e.status.clone())
    }

    /// Subscribe to a job's events. The latest snapshot arrives first,
    /// then live updates in publish order.
    pub fn subscribe(&self, id: JobId) -> Option<mpsc::Receiver<JobStatus>> {
        let mut inner = self.shared.lock();
        let entry = inner.jobs.get_mut(&id)?;
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(entry.status.clone());
        entry.subscribers.push(tx);
        Some(rx)
    }

    /// All known jobs in submission order.
    pub fn list(&self) -> Vec<JobStatus> {
        let inner = self.shared.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .map(|e| e.status.clone())
            .collect()
    }

    /// Whether a job of the given kind is currently running or queued.
    pub fn is_busy(&self, kind: JobKind) -> bool {
        let inner = self.shared.lock();
        inner.jobs.values().any(|e| {
            e.status.kind == kind
                && matches!(e.status.state, JobState::Pending | JobState::Running)
        })
    }
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn wait_terminal(runner: &JobRunner, id: JobId) -> JobStatus {
        for _ in 0..200 {
            if let Some(status) = runner.status(id) {
                if status.state.is_terminal() {
                    return status;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("job {id:?} never reached a terminal state");
    }

    #[test]
    fn test_job_completes_with_result() {
        let runner = JobRunner::new();
        let id = runner.submit(
            JobKind::Rebuild,
            Box::new(|ctx| {
                ctx.publish(JobProgress::new(1, 2));
                Ok(serde_json::json!({"rebuilt": 2}))
            }),
        );

        let status = wait_terminal(&runner, id);
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.result, Some(serde_json::json!({"rebuilt": 2})));
    }

    #[test]
    fn test_job_failure_surfaces_error() {
        let runner = JobRunner::new();
        let id = runner.submit(JobKind::Sync, Box::new(|_| Err("store unreachable".into())));

        let status = wait_terminal(&runner, id);
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error.as_deref(), Some("store unreachable"));
    }

    #[test]
    fn test_same_kind_jobs_serialize() {
        let runner = JobRunner::new();
        let marker = Arc::new(Mutex::new(Vec::<u32>::new()));

        let m1 = Arc::clone(&marker);
        let first = runner.submit(
            JobKind::Ingest,
            Box::new(move |_| {
                std::thread::sleep(Duration::from_millis(50));
                m1.lock().unwrap().push(1);
                Ok(serde_json::Value::Null)
            }),
        );
        let m2 = Arc::clone(&marker);
        let second = runner.submit(
            JobKind::Ingest,
            Box::new(move |_| {
                m2.lock().unwrap().push(2);
                Ok(serde_json::Value::Null)
            }),
        );

        wait_terminal(&runner, first);
        wait_terminal(&runner, second);
        assert_eq!(*marker.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_cancel_running_job() {
        let runner = JobRunner::new();
        let id = runner.submit(
            JobKind::Ingest,
            Box::new(|ctx| {
                for n in 0..100 {
                    if ctx.is_cancelled() {
                        return Ok(serde_json::json!({"processed": n}));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(serde_json::json!({"processed": 100}))
            }),
        );

        // Let it start, then cancel.
        std::thread::sleep(Duration::from_millis(30));
        assert!(runner.cancel(id));

        let status = wait_terminal(&runner, id);
        assert_eq!(status.state, JobState::Cancelled);
        // Partial counters survive cancellation.
        assert!(status.result.is_some());
    }

    #[test]
    fn test_cancel_pending_job_never_runs() {
        let runner = JobRunner::new();
        let ran = Arc::new(AtomicBool::new(false));

        let blocker = runner.submit(
            JobKind::Sync,
            Box::new(|_| {
                std::thread::sleep(Duration::from_millis(100));
                Ok(serde_json::Value::Null)
            }),
        );
        let flag = Arc::clone(&ran);
        let queued = runner.submit(
            JobKind::Sync,
            Box::new(move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }),
        );

        assert!(runner.cancel(queued));
        wait_terminal(&runner, blocker);
        let status = wait_terminal(&runner, queued);
        assert_eq!(status.state, JobState::Cancelled);

        std::thread::sleep(Duration::from_millis(50));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_late_subscriber_gets_latest_status_first() {
        let runner = JobRunner::new();
        let id = runner.submit(
            JobKind::Rebuild,
            Box::new(|_| Ok(serde_json::json!({"ok": true}))),
        );
        wait_terminal(&runner, id);

        let rx = runner.subscribe(id).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.state, JobState::Completed);
    }

    #[test]
    fn test_is_busy_tracks_kind() {
        let runner = JobRunner::new();
        assert!(!runner.is_busy(JobKind::Ingest));
        let id = runner.submit(
            JobKind::Ingest,
            Box::new(|_| {
                std::thread::sleep(Duration::from_millis(50));
                Ok(serde_json::Value::Null)
            }),
        );
        assert!(runner.is_busy(JobKind::Ingest));
        assert!(!runner.is_busy(JobKind::Sync));
        wait_terminal(&runner, id);
        assert!(!runner.is_busy(JobKind::Ingest));
    }
}
