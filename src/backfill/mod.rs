//! Parameter archive backfilling.
//!
//! [`BackFiller`] keeps the archive consistent with the raw data: it runs
//! the configured schedules, collects the buckets touched by new stream
//! records and turns both into [`FillJob`]s executed one at a time.

pub mod dirty;
pub mod job;
pub mod merge;
pub mod queue;
pub mod schedule;

use crate::config::types::Config;
use crate::derive::Deriver;
use crate::stream::{StreamError, StreamRegistry, StreamSubscriber};
use crate::time::{Buckets, Instant, PartitionSchema, TimeError, TimePartitioner, TimeSource};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub use dirty::DirtySet;
pub use job::{FillContext, FillHandle, FillJob, FillOutcome, JobLog, JobRecord, JobSource, JobState};
pub use merge::merge_contiguous;
pub use queue::JobQueue;
pub use schedule::{Schedule, ScheduleError, ScheduleKind, ScheduleTable};

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("backfiller is not running")]
    NotRunning,

    #[error("backfiller already started")]
    AlreadyStarted,

    #[error("backfiller was stopped and cannot be restarted")]
    Stopped,

    #[error("backfiller must be started from within a Tokio runtime")]
    NoRuntime,

    #[error("invalid fill range: start {start} is after stop {stop}")]
    InvalidRange { start: Instant, stop: Instant },

    #[error("stream subscription failed: {0}")]
    Stream(#[from] StreamError),

    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Time(#[from] TimeError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Engine settings, usually built from the `archive` and `backfill`
/// sections of the config file.
#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub buckets: Buckets,
    pub partitioner: TimePartitioner,
    pub warmup: Duration,
    pub max_segment_size: usize,
    pub schedules: ScheduleTable,
    pub stream_update_period: Duration,
    pub monitor_streams: Vec<String>,
}

impl BackfillOptions {
    pub fn from_config(config: &Config) -> Result<Self, BackfillError> {
        let buckets = Buckets::new(config.archive.bucket_duration).ok_or_else(|| {
            BackfillError::Config(format!(
                "bucketDuration must be positive, got {}",
                config.archive.bucket_duration
            ))
        })?;
        Ok(Self {
            buckets,
            partitioner: TimePartitioner::from_name(&config.archive.partitioning)?,
            warmup: config.backfill.warmup(),
            max_segment_size: config.backfill.max_segment_size,
            schedules: ScheduleTable::new(&config.backfill.schedule)?,
            stream_update_period: config.backfill.stream_update_period(),
            monitor_streams: config.monitored_streams(),
        })
    }
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            buckets: Buckets::default(),
            partitioner: TimePartitioner::new(PartitionSchema::default()),
            warmup: Duration::from_secs(60),
            max_segment_size: crate::config::types::DEFAULT_MAX_SEGMENT_SIZE,
            schedules: ScheduleTable::default(),
            stream_update_period: Duration::from_secs(600),
            monitor_streams: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillStatus {
    pub state: Lifecycle,
    pub bucket_duration_ms: i64,
    pub t0: Option<Instant>,
    pub run_count: i64,
    pub dirty_buckets: usize,
    pub queued_jobs: usize,
    pub periodic_schedules: usize,
    pub anchored_schedules: usize,
    pub monitored_streams: Vec<String>,
}

/// Marks the bucket of every incoming record dirty.
struct DirtyMarker {
    dirty: Arc<DirtySet>,
    buckets: Buckets,
}

impl StreamSubscriber for DirtyMarker {
    fn on_record(&self, stream: &str, gentime: Instant) {
        let bucket = self.buckets.start(gentime);
        self.dirty.mark(bucket);
        trace!(stream = %stream, gentime, bucket, "Bucket marked dirty");
    }

    fn stream_closed(&self, stream: &str) {
        warn!(stream = %stream, "Monitored stream closed; no further invalidations from it");
    }
}

/// Tick state of the anchored schedules. Only the anchored timer task
/// writes it.
#[derive(Default)]
struct Anchor {
    t0: OnceLock<Instant>,
    run_count: AtomicI64,
}

struct Inner {
    options: BackfillOptions,
    clock: Arc<dyn TimeSource>,
    registry: Arc<dyn StreamRegistry>,
    marker: Arc<dyn StreamSubscriber>,
    dirty: Arc<DirtySet>,
    log: Arc<JobLog>,
    queue: Arc<JobQueue>,
    ctx: Arc<FillContext>,
    anchor: Anchor,
    shutdown: CancellationToken,
}

impl Inner {
    /// Submits the inclusive `[start, stop]` rounded outward to buckets.
    fn submit(&self, start: Instant, stop: Instant, source: JobSource) -> Result<FillHandle, BackfillError> {
        self.queue.submit(self.options.buckets.expand(start, stop), source)
    }

    /// Merge-and-submit pass over the dirty buckets.
    fn flush_dirty(&self) -> Result<Vec<FillHandle>, BackfillError> {
        if !self.queue.is_open() {
            return Err(BackfillError::NotRunning);
        }
        let dirty = self.dirty.drain_sorted();
        if dirty.is_empty() {
            trace!("No dirty buckets");
            return Ok(Vec::new());
        }

        let ranges = merge_contiguous(&dirty, &self.options.buckets);
        debug!(buckets = dirty.len(), jobs = ranges.len(), "Submitting fill jobs for updated buckets");
        ranges
            .into_iter()
            .map(|range| self.queue.submit(range, JobSource::StreamUpdate))
            .collect()
    }
}

struct Tasks {
    worker: JoinHandle<()>,
    timers: Vec<JoinHandle<()>>,
}

/// Schedules and runs parameter archive fill jobs.
///
/// Lifecycle is `Created -> Running -> Stopped`; a stopped backfiller
/// cannot be restarted. All jobs go through one worker, so at most one
/// derivation touches the archive at any time.
pub struct BackFiller {
    inner: Arc<Inner>,
    lifecycle: Mutex<Lifecycle>,
    tasks: Mutex<Option<Tasks>>,
}

impl BackFiller {
    pub fn new(
        options: BackfillOptions,
        clock: Arc<dyn TimeSource>,
        registry: Arc<dyn StreamRegistry>,
        deriver: Arc<dyn Deriver>,
    ) -> Result<Self, BackfillError> {
        if options.max_segment_size == 0 {
            return Err(BackfillError::Config("maxSegmentSize must be positive".to_string()));
        }
        if !options.monitor_streams.is_empty() && options.stream_update_period.is_zero() {
            return Err(BackfillError::Config(
                "streamUpdateFillFrequency must be positive".to_string(),
            ));
        }

        let dirty = Arc::new(DirtySet::new());
        let log = Arc::new(JobLog::default());
        let ctx = Arc::new(FillContext {
            deriver,
            partitioner: options.partitioner.clone(),
            warmup: options.warmup,
            max_segment_size: options.max_segment_size,
        });
        let marker: Arc<dyn StreamSubscriber> = Arc::new(DirtyMarker {
            dirty: Arc::clone(&dirty),
            buckets: options.buckets,
        });

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                clock,
                registry,
                marker,
                dirty,
                queue: Arc::new(JobQueue::new(Arc::clone(&log))),
                log,
                ctx,
                anchor: Anchor::default(),
                shutdown: CancellationToken::new(),
            }),
            lifecycle: Mutex::new(Lifecycle::Created),
            tasks: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &BackfillOptions {
        &self.inner.options
    }

    pub fn partitioner(&self) -> &TimePartitioner {
        &self.inner.options.partitioner
    }

    pub fn state(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribes to the monitored streams and starts the worker and
    /// timers. Must be called within a Tokio runtime.
    pub fn start(&self) -> Result<(), BackfillError> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running => return Err(BackfillError::AlreadyStarted),
            Lifecycle::Stopped => return Err(BackfillError::Stopped),
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BackfillError::NoRuntime)?;

        let inner = &self.inner;
        self.subscribe_all()?;

        let rx = inner.queue.open();
        let worker = runtime.spawn(queue::run_worker(
            rx,
            Arc::clone(&inner.queue),
            Arc::clone(&inner.ctx),
            inner.shutdown.clone(),
        ));

        let mut timers = Vec::new();
        for schedule in inner.options.schedules.periodic() {
            if let ScheduleKind::Periodic { interval } = schedule.kind {
                timers.push(runtime.spawn(run_periodic(Arc::clone(inner), *schedule, interval)));
            }
        }

        if !inner.options.schedules.anchored().is_empty() {
            let t0 = *inner
                .anchor
                .t0
                .get_or_init(|| inner.options.buckets.start(inner.clock.now()));
            info!(t0 = %crate::time::format_instant(t0), "Anchored schedules armed");
            timers.push(runtime.spawn(run_anchored(Arc::clone(inner), t0)));
        }

        if !inner.options.monitor_streams.is_empty() {
            timers.push(runtime.spawn(run_stream_updates(Arc::clone(inner))));
        }

        *self.tasks.lock().unwrap_or_else(|e| e.into_inner()) = Some(Tasks { worker, timers });
        *lifecycle = Lifecycle::Running;

        info!(
            periodic = inner.options.schedules.periodic().len(),
            anchored = inner.options.schedules.anchored().len(),
            streams = inner.options.monitor_streams.len(),
            bucket_ms = inner.options.buckets.duration(),
            "Parameter archive backfiller started"
        );
        Ok(())
    }

    fn subscribe_all(&self) -> Result<(), BackfillError> {
        let inner = &self.inner;
        for (i, stream) in inner.options.monitor_streams.iter().enumerate() {
            if let Err(e) = inner.registry.subscribe(stream, Arc::clone(&inner.marker)) {
                error!(stream = %stream, error = %e, "Cannot subscribe to stream");
                for subscribed in &inner.options.monitor_streams[..i] {
                    inner.registry.unsubscribe(subscribed, &inner.marker);
                }
                return Err(e.into());
            }
            debug!(stream = %stream, "Monitoring stream for archive updates");
        }
        Ok(())
    }

    /// Stops timers and subscriptions, drops queued jobs and waits for the
    /// worker. A running job is asked to abort and allowed to finish.
    pub async fn stop(&self) {
        let Some(Tasks { worker, timers }) = self.halt() else {
            return;
        };
        join_all(timers).await;
        if let Err(e) = worker.await {
            error!(error = %e, "Backfill worker task join error");
        }

        info!("Parameter archive backfiller stopped");
    }

    /// Moves to `Stopped` and signals every task to end. Returns the tasks
    /// when the backfiller was running.
    fn halt(&self) -> Option<Tasks> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            let was = *lifecycle;
            *lifecycle = Lifecycle::Stopped;
            if was != Lifecycle::Running {
                return None;
            }
            // Any submission after this point is rejected
            self.inner.queue.close();
        }

        let inner = &self.inner;
        inner.shutdown.cancel();
        for stream in &inner.options.monitor_streams {
            inner.registry.unsubscribe(stream, &inner.marker);
        }

        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tasks) = &tasks {
            for timer in &tasks.timers {
                timer.abort();
            }
        }
        tasks
    }

    /// Submits a fill for the inclusive range `[start, stop]`, rounded
    /// outward to whole buckets.
    pub fn schedule_filling_task(&self, start: Instant, stop: Instant) -> Result<FillHandle, BackfillError> {
        if start > stop {
            return Err(BackfillError::InvalidRange { start, stop });
        }
        let handle = self.inner.submit(start, stop, JobSource::Manual)?;
        info!(job_id = handle.id, range = %handle.range, "Ad-hoc parameter archive fill requested");
        Ok(handle)
    }

    /// Runs one merge-and-submit pass now instead of waiting for the timer.
    pub fn flush_dirty(&self) -> Result<Vec<FillHandle>, BackfillError> {
        self.inner.flush_dirty()
    }

    pub fn status(&self) -> BackfillStatus {
        let inner = &self.inner;
        BackfillStatus {
            state: self.state(),
            bucket_duration_ms: inner.options.buckets.duration(),
            t0: inner.anchor.t0.get().copied(),
            run_count: inner.anchor.run_count.load(Ordering::Acquire),
            dirty_buckets: inner.dirty.len(),
            queued_jobs: inner.queue.pending(),
            periodic_schedules: inner.options.schedules.periodic().len(),
            anchored_schedules: inner.options.schedules.anchored().len(),
            monitored_streams: inner.options.monitor_streams.clone(),
        }
    }

    /// Recent jobs, oldest first.
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.inner.log.snapshot()
    }

    pub fn job(&self, id: u64) -> Option<JobRecord> {
        self.inner.log.get(id)
    }
}

impl Drop for BackFiller {
    fn drop(&mut self) {
        // The worker drains the closed queue and exits on its own.
        if self.halt().is_some() {
            warn!("Backfiller dropped while running, background tasks stopped");
        }
    }
}

impl StreamSubscriber for BackFiller {
    fn on_record(&self, stream: &str, gentime: Instant) {
        self.inner.marker.on_record(stream, gentime);
    }
}

fn log_rejected(source: JobSource, e: &BackfillError) {
    match e {
        BackfillError::NotRunning => debug!(source = %source, "Backfiller stopping, fill job not submitted"),
        e => error!(source = %source, error = %e, "Cannot submit fill job"),
    }
}

async fn run_periodic(inner: Arc<Inner>, schedule: Schedule, interval: Duration) {
    let source = JobSource::Periodic {
        interval_secs: interval.as_secs(),
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let (start, stop) = schedule.periodic_window(inner.clock.now(), &inner.options.buckets);
        if let Err(e) = inner.submit(start, stop, source) {
            log_rejected(source, &e);
        }
    }
}

/// Fires at every bucket boundary after `t0`, measured on the mission
/// clock. Each tick advances the shared run count once and submits one job
/// per anchored schedule.
async fn run_anchored(inner: Arc<Inner>, t0: Instant) {
    let buckets = inner.options.buckets;
    loop {
        let run_count = inner.anchor.run_count.load(Ordering::Acquire) + 1;
        let due = t0.saturating_add(buckets.span(run_count));
        let wait = due.saturating_sub(inner.clock.now()).max(0);

        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(wait as u64)) => {}
        }
        if inner.clock.now() < due {
            continue;
        }

        inner.anchor.run_count.store(run_count, Ordering::Release);
        trace!(run_count, "Anchored tick");
        let source = JobSource::Anchored { run_count };
        for schedule in inner.options.schedules.anchored() {
            let (start, stop) = schedule.anchored_window(t0, run_count, &buckets);
            if let Err(e) = inner.submit(start, stop, source) {
                log_rejected(source, &e);
            }
        }
    }
}

async fn run_stream_updates(inner: Arc<Inner>) {
    let period = inner.options.stream_update_period;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = inner.flush_dirty() {
            log_rejected(JobSource::StreamUpdate, &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ScheduleConfig;
    use crate::derive::{DerivationReport, DerivationRequest, DeriveError};
    use crate::stream::StreamHub;
    use crate::time::{SimulatedClock, TimeRange};
    use async_trait::async_trait;

    const D: i64 = 3_600_000;

    #[derive(Default)]
    struct Recording {
        ranges: Mutex<Vec<TimeRange>>,
    }

    #[async_trait]
    impl Deriver for Recording {
        async fn run(
            &self,
            request: &DerivationRequest,
            _abort: CancellationToken,
        ) -> Result<DerivationReport, DeriveError> {
            self.ranges.lock().unwrap().push(request.range);
            Ok(DerivationReport::default())
        }
    }

    fn options(schedule: &[ScheduleConfig], streams: &[&str]) -> BackfillOptions {
        BackfillOptions {
            buckets: Buckets::new(D).unwrap(),
            warmup: Duration::ZERO,
            schedules: ScheduleTable::new(schedule).unwrap(),
            stream_update_period: Duration::from_secs(60),
            monitor_streams: streams.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn backfiller(options: BackfillOptions, hub: Arc<StreamHub>) -> (BackFiller, Arc<Recording>) {
        let deriver = Arc::new(Recording::default());
        let filler = BackFiller::new(
            options,
            Arc::new(SimulatedClock::new(0)),
            hub,
            deriver.clone(),
        )
        .unwrap();
        (filler, deriver)
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (filler, _) = backfiller(options(&[], &[]), Arc::new(StreamHub::new()));
        assert_eq!(filler.state(), Lifecycle::Created);
        assert!(matches!(
            filler.schedule_filling_task(0, D),
            Err(BackfillError::NotRunning)
        ));

        filler.start().unwrap();
        assert!(matches!(filler.start(), Err(BackfillError::AlreadyStarted)));
        assert_eq!(filler.state(), Lifecycle::Running);

        filler.stop().await;
        assert_eq!(filler.state(), Lifecycle::Stopped);
        assert!(matches!(filler.start(), Err(BackfillError::Stopped)));
        assert!(matches!(
            filler.schedule_filling_task(0, D),
            Err(BackfillError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_ad_hoc_range_is_rounded_outward() {
        let (filler, deriver) = backfiller(options(&[], &[]), Arc::new(StreamHub::new()));
        filler.start().unwrap();

        let handle = filler.schedule_filling_task(D + 5, 2 * D + 1).unwrap();
        assert_eq!(handle.range, TimeRange::new(D, 3 * D));
        assert_eq!(handle.wait().await, FillOutcome::Completed { processed: 0 });
        assert_eq!(*deriver.ranges.lock().unwrap(), vec![TimeRange::new(D, 3 * D)]);

        assert!(matches!(
            filler.schedule_filling_task(2 * D, D),
            Err(BackfillError::InvalidRange { .. })
        ));
        filler.stop().await;
    }

    #[tokio::test]
    async fn test_failed_subscription_rolls_back() {
        let hub = Arc::new(StreamHub::with_streams(["tm_realtime"]));
        let (filler, _) = backfiller(options(&[], &["tm_realtime", "missing"]), Arc::clone(&hub));

        let err = filler.start().unwrap_err();
        assert!(matches!(err, BackfillError::Stream(StreamError::NotFound(_))));
        assert_eq!(hub.subscriber_count("tm_realtime"), 0);
        assert_eq!(filler.state(), Lifecycle::Created);
    }

    #[tokio::test]
    async fn test_flush_dirty_merges_marked_buckets() {
        let (filler, deriver) = backfiller(options(&[], &[]), Arc::new(StreamHub::new()));
        filler.start().unwrap();

        for t in [10, D + 1, 2 * D + 7, 5 * D + 3, D + 2] {
            filler.on_record("tm_realtime", t);
        }
        assert_eq!(filler.status().dirty_buckets, 4);

        let handles = filler.flush_dirty().unwrap();
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.wait().await;
        }
        assert_eq!(
            *deriver.ranges.lock().unwrap(),
            vec![TimeRange::new(0, 3 * D), TimeRange::new(5 * D, 6 * D)]
        );
        assert!(filler.flush_dirty().unwrap().is_empty());
        filler.stop().await;
    }

    #[test]
    fn test_start_outside_runtime_is_an_error() {
        let (filler, _) = backfiller(options(&[], &[]), Arc::new(StreamHub::new()));
        assert!(matches!(filler.start(), Err(BackfillError::NoRuntime)));
        assert_eq!(filler.state(), Lifecycle::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_background_tasks() {
        let hub = Arc::new(StreamHub::with_streams(["tm_realtime"]));
        let periodic = ScheduleConfig {
            start_segment: 1,
            num_segments: 1,
            interval: Some(60),
        };
        let (filler, deriver) = backfiller(options(&[periodic], &["tm_realtime"]), Arc::clone(&hub));
        filler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(deriver.ranges.lock().unwrap().len(), 1);
        assert_eq!(hub.subscriber_count("tm_realtime"), 1);

        drop(filler);
        assert_eq!(hub.subscriber_count("tm_realtime"), 0);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(deriver.ranges.lock().unwrap().len(), 1);
        assert_eq!(Arc::strong_count(&deriver), 1);
    }

    #[test]
    fn test_rejects_zero_segment_size() {
        let opts = BackfillOptions {
            max_segment_size: 0,
            ..Default::default()
        };
        let result = BackFiller::new(
            opts,
            Arc::new(SimulatedClock::new(0)),
            Arc::new(StreamHub::new()),
            Arc::new(Recording::default()),
        );
        assert!(matches!(result, Err(BackfillError::Config(_))));
    }
}
