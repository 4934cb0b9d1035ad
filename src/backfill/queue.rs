use super::job::{FillContext, FillHandle, FillJob, FillOutcome, JobLog, JobSource};
use super::BackfillError;
use crate::time::TimeRange;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub(crate) struct QueuedJob {
    job: FillJob,
    done: oneshot::Sender<FillOutcome>,
}

/// FIFO hand-off from the timers (and ad-hoc callers) to the single
/// worker.
///
/// The queue is open exactly while the engine is running. Opening and
/// closing take the same lock as [`submit`](Self::submit), so a submission
/// racing with a stop is either queued before the close or rejected.
pub struct JobQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    next_id: AtomicU64,
    pending: AtomicUsize,
    log: Arc<JobLog>,
}

impl JobQueue {
    pub fn new(log: Arc<JobLog>) -> Self {
        Self {
            sender: Mutex::new(None),
            next_id: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            log,
        }
    }

    pub(crate) fn open(&self) -> mpsc::UnboundedReceiver<QueuedJob> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    pub(crate) fn close(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_open(&self) -> bool {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Jobs accepted but not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn submit(&self, range: TimeRange, source: JobSource) -> Result<FillHandle, BackfillError> {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let tx = sender.as_ref().ok_or(BackfillError::NotRunning)?;

        let job = FillJob {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            range,
            source,
        };
        let (done_tx, done_rx) = oneshot::channel();
        let handle = FillHandle::new(job.id, range, done_rx);

        self.log.submitted(&job);
        self.pending.fetch_add(1, Ordering::AcqRel);
        debug!(job_id = job.id, source = %source, range = %range, "Fill job queued");

        if tx.send(QueuedJob { job, done: done_tx }).is_err() {
            // Worker gone; only happens while shutting down.
            self.pending.fetch_sub(1, Ordering::AcqRel);
            self.log.finished(handle.id, &FillOutcome::Cancelled);
            return Err(BackfillError::NotRunning);
        }
        Ok(handle)
    }

    fn picked(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Executes queued jobs one at a time, in submission order.
///
/// After `shutdown` is cancelled, jobs still in the queue resolve as
/// [`FillOutcome::Cancelled`] without running. Each job runs in its own
/// task so that a panicking deriver fails that job only.
pub(crate) async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<QueuedJob>,
    queue: Arc<JobQueue>,
    ctx: Arc<FillContext>,
    shutdown: CancellationToken,
) {
    info!("Backfill worker started");

    while let Some(QueuedJob { job, done }) = rx.recv().await {
        queue.picked();
        let id = job.id;

        if shutdown.is_cancelled() {
            debug!(job_id = id, range = %job.range, "Dropping queued fill job on shutdown");
            queue.log.finished(id, &FillOutcome::Cancelled);
            let _ = done.send(FillOutcome::Cancelled);
            continue;
        }

        queue.log.started(id);
        let task_ctx = Arc::clone(&ctx);
        let abort = shutdown.child_token();
        let outcome = match tokio::spawn(async move { job.execute(&task_ctx, abort).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = id, error = %e, "Archive filler task panicked");
                FillOutcome::Failed {
                    error: format!("filler task panicked: {}", e),
                }
            }
        };

        queue.log.finished(id, &outcome);
        let _ = done.send(outcome);
    }

    info!("Backfill worker stopped");
}
