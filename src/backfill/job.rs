use crate::derive::{DerivationRequest, Deriver};
use crate::time::{format_instant, TimePartitioner, TimeRange};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Number of finished and pending jobs kept for inspection.
pub const JOB_LOG_CAPACITY: usize = 256;

/// What caused a job to be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSource {
    Periodic { interval_secs: u64 },
    Anchored { run_count: i64 },
    StreamUpdate,
    Manual,
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobSource::Periodic { interval_secs } => write!(f, "periodic/{}s", interval_secs),
            JobSource::Anchored { run_count } => write!(f, "anchored#{}", run_count),
            JobSource::StreamUpdate => f.write_str("stream-update"),
            JobSource::Manual => f.write_str("manual"),
        }
    }
}

/// Terminal state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FillOutcome {
    Completed { processed: u64 },
    /// Stopped early on the abort flag; the archive holds whatever the
    /// deriver wrote so far.
    Aborted { processed: u64 },
    Failed { error: String },
    /// Dropped before it started because the engine stopped.
    Cancelled,
}

impl FillOutcome {
    pub fn state(&self) -> JobState {
        match self {
            FillOutcome::Completed { .. } => JobState::Completed,
            FillOutcome::Aborted { .. } => JobState::Aborted,
            FillOutcome::Failed { .. } => JobState::Failed,
            FillOutcome::Cancelled => JobState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Aborted,
    Failed,
    Cancelled,
}

/// Everything a job needs besides its range.
pub struct FillContext {
    pub deriver: Arc<dyn Deriver>,
    pub partitioner: TimePartitioner,
    pub warmup: Duration,
    pub max_segment_size: usize,
}

/// One derivation run over a bucket-aligned range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillJob {
    pub id: u64,
    pub range: TimeRange,
    pub source: JobSource,
}

impl FillJob {
    pub fn request(&self, ctx: &FillContext) -> DerivationRequest {
        let warmup_ms = i64::try_from(ctx.warmup.as_millis()).unwrap_or(i64::MAX);
        let partitions = match ctx.partitioner.partitions_between(self.range) {
            Ok(parts) => parts.into_iter().map(|p| p.dir).collect(),
            Err(e) => {
                warn!(job_id = self.id, error = %e, "Cannot compute partitions for job range");
                Vec::new()
            }
        };
        DerivationRequest {
            job_id: self.id,
            range: self.range,
            warmup_start: self.range.start.saturating_sub(warmup_ms),
            max_segment_size: ctx.max_segment_size,
            partitions,
        }
    }

    /// Runs the derivation to a terminal state. Never returns an error:
    /// failures are logged and reported in the outcome.
    pub async fn execute(&self, ctx: &FillContext, abort: CancellationToken) -> FillOutcome {
        let request = self.request(ctx);
        info!(
            job_id = self.id,
            source = %self.source,
            warmup_start = %format_instant(request.warmup_start),
            "Starting parameter archive fillup for interval {}",
            self.range
        );

        let report = match ctx.deriver.run(&request, abort).await {
            Ok(report) => report,
            Err(e) => {
                error!(job_id = self.id, range = %self.range, error = %e, "Error when running the archive filler task");
                return FillOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        if report.aborted {
            warn!(
                job_id = self.id,
                processed = report.processed,
                "Parameter archive fillup for interval {} aborted",
                self.range
            );
            return FillOutcome::Aborted {
                processed: report.processed,
            };
        }

        if let Err(e) = ctx.deriver.flush(&request).await {
            error!(job_id = self.id, range = %self.range, error = %e, "Failed to flush archive filler task");
            return FillOutcome::Failed {
                error: e.to_string(),
            };
        }

        info!(
            job_id = self.id,
            processed = report.processed,
            "Parameter archive fillup for interval {} finished",
            self.range
        );
        FillOutcome::Completed {
            processed: report.processed,
        }
    }
}

/// Returned by every submission; resolves when the job reaches a terminal
/// state. Dropping it does not affect the job.
#[derive(Debug)]
pub struct FillHandle {
    pub id: u64,
    pub range: TimeRange,
    done: oneshot::Receiver<FillOutcome>,
}

impl FillHandle {
    pub(crate) fn new(id: u64, range: TimeRange, done: oneshot::Receiver<FillOutcome>) -> Self {
        Self { id, range, done }
    }

    pub async fn wait(self) -> FillOutcome {
        self.done.await.unwrap_or(FillOutcome::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: u64,
    pub source: JobSource,
    pub range: TimeRange,
    pub state: JobState,
    pub processed: Option<u64>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Bounded history of jobs, oldest first.
#[derive(Debug)]
pub struct JobLog {
    capacity: usize,
    records: Mutex<VecDeque<JobRecord>>,
}

impl Default for JobLog {
    fn default() -> Self {
        Self::new(JOB_LOG_CAPACITY)
    }
}

impl JobLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn submitted(&self, job: &FillJob) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(JobRecord {
            id: job.id,
            source: job.source,
            range: job.range,
            state: JobState::Queued,
            processed: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        });
    }

    pub fn started(&self, id: u64) {
        self.update(id, |record| {
            record.state = JobState::Running;
            record.started_at = Some(Utc::now());
        });
    }

    pub fn finished(&self, id: u64, outcome: &FillOutcome) {
        self.update(id, |record| {
            record.state = outcome.state();
            record.finished_at = Some(Utc::now());
            match outcome {
                FillOutcome::Completed { processed } | FillOutcome::Aborted { processed } => {
                    record.processed = Some(*processed);
                }
                FillOutcome::Failed { error } => record.error = Some(error.clone()),
                FillOutcome::Cancelled => {}
            }
        });
    }

    pub fn get(&self, id: u64) -> Option<JobRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().find(|r| r.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<JobRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().cloned().collect()
    }

    fn update(&self, id: u64, apply: impl FnOnce(&mut JobRecord)) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        // Recent jobs sit at the back
        if let Some(record) = records.iter_mut().rev().find(|r| r.id == id) {
            apply(record);
        }
    }
}
