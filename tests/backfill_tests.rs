use async_trait::async_trait;
use parchive::backfill::{
    BackFiller, BackfillError, BackfillOptions, FillOutcome, JobSource, JobState, Lifecycle,
    ScheduleTable,
};
use parchive::config::types::ScheduleConfig;
use parchive::derive::{DerivationReport, DerivationRequest, DeriveError, Deriver};
use parchive::stream::{StreamError, StreamHub, StreamRegistry, StreamSubscriber};
use parchive::time::{Buckets, SimulatedClock, TimeRange};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const D: i64 = 3_600_000;

/// Records every request; optionally takes a while per job.
#[derive(Default)]
struct Recorder {
    requests: Mutex<Vec<DerivationRequest>>,
    events: Mutex<Vec<String>>,
    work: Duration,
}

impl Recorder {
    fn ranges(&self) -> Vec<TimeRange> {
        self.requests.lock().unwrap().iter().map(|r| r.range).collect()
    }
}

#[async_trait]
impl Deriver for Recorder {
    async fn run(
        &self,
        request: &DerivationRequest,
        _abort: CancellationToken,
    ) -> Result<DerivationReport, DeriveError> {
        self.requests.lock().unwrap().push(request.clone());
        self.events.lock().unwrap().push(format!("start {}", request.job_id));
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        self.events.lock().unwrap().push(format!("end {}", request.job_id));
        Ok(DerivationReport {
            processed: 10,
            aborted: false,
        })
    }
}

/// Runs until aborted.
struct UntilAborted;

#[async_trait]
impl Deriver for UntilAborted {
    async fn run(
        &self,
        _request: &DerivationRequest,
        abort: CancellationToken,
    ) -> Result<DerivationReport, DeriveError> {
        abort.cancelled().await;
        Ok(DerivationReport {
            processed: 3,
            aborted: true,
        })
    }
}

/// Fails job 1, panics on job 2, completes the rest.
struct Unreliable;

#[async_trait]
impl Deriver for Unreliable {
    async fn run(
        &self,
        request: &DerivationRequest,
        _abort: CancellationToken,
    ) -> Result<DerivationReport, DeriveError> {
        match request.job_id {
            1 => Err(DeriveError::Failed("replay server unreachable".to_string())),
            2 => panic!("corrupt segment"),
            _ => Ok(DerivationReport {
                processed: 1,
                aborted: false,
            }),
        }
    }
}

fn options(schedule: &[ScheduleConfig], monitor: &[&str]) -> BackfillOptions {
    BackfillOptions {
        buckets: Buckets::new(D).unwrap(),
        warmup: Duration::from_secs(60),
        schedules: ScheduleTable::new(schedule).unwrap(),
        stream_update_period: Duration::from_secs(60),
        monitor_streams: monitor.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn schedule(start_segment: i64, num_segments: i64, interval: Option<i64>) -> ScheduleConfig {
    ScheduleConfig {
        start_segment,
        num_segments,
        interval,
    }
}

fn backfiller(
    options: BackfillOptions,
    origin: i64,
    hub: Arc<StreamHub>,
    deriver: Arc<dyn Deriver>,
) -> BackFiller {
    BackFiller::new(options, Arc::new(SimulatedClock::new(origin)), hub, deriver).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_anchored_first_tick_fills_previous_bucket_once() {
    let recorder = Arc::new(Recorder::default());
    let filler = backfiller(
        options(&[schedule(1, 1, Some(-1))], &[]),
        0,
        Arc::new(StreamHub::new()),
        recorder.clone(),
    );
    filler.start().unwrap();
    assert_eq!(filler.status().t0, Some(0));

    // Nothing before the first bucket boundary
    tokio::time::sleep(Duration::from_millis((D - 1) as u64)).await;
    assert!(recorder.ranges().is_empty());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(recorder.ranges(), vec![TimeRange::new(0, D)]);
    assert_eq!(filler.status().run_count, 1);

    let request = recorder.requests.lock().unwrap()[0].clone();
    assert_eq!(request.warmup_start, -60_000);
    assert_eq!(request.partitions, vec!["1970/001".to_string()]);

    let jobs = filler.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].source, JobSource::Anchored { run_count: 1 });
    assert_eq!(jobs[0].state, JobState::Completed);
    assert_eq!(jobs[0].processed, Some(10));

    filler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_anchored_ticks_advance_one_bucket_each() {
    let recorder = Arc::new(Recorder::default());
    // Started mid-bucket: t0 is the start of the current bucket
    let filler = backfiller(
        options(&[schedule(2, 1, None), schedule(3, 2, None)], &[]),
        10 * D + 1234,
        Arc::new(StreamHub::new()),
        recorder.clone(),
    );
    filler.start().unwrap();
    assert_eq!(filler.status().t0, Some(10 * D));

    tokio::time::sleep(Duration::from_millis((3 * D) as u64)).await;
    assert_eq!(filler.status().run_count, 3);
    assert_eq!(
        recorder.ranges(),
        vec![
            TimeRange::new(9 * D, 10 * D),
            TimeRange::new(8 * D, 10 * D),
            TimeRange::new(10 * D, 11 * D),
            TimeRange::new(9 * D, 11 * D),
            TimeRange::new(11 * D, 12 * D),
            TimeRange::new(10 * D, 12 * D),
        ]
    );

    filler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_periodic_schedule_fires_immediately_then_every_interval() {
    let recorder = Arc::new(Recorder::default());
    let filler = backfiller(
        options(&[schedule(2, 1, Some(600))], &[]),
        10 * D,
        Arc::new(StreamHub::new()),
        recorder.clone(),
    );
    filler.start().unwrap();

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(recorder.ranges(), vec![TimeRange::new(8 * D, 9 * D)]);

    tokio::time::sleep(Duration::from_secs(600)).await;
    // now - 2D is no longer bucket aligned, so the window spans two buckets
    assert_eq!(
        recorder.ranges(),
        vec![TimeRange::new(8 * D, 9 * D), TimeRange::new(8 * D, 10 * D)]
    );
    assert!(filler
        .jobs()
        .iter()
        .all(|j| j.source == JobSource::Periodic { interval_secs: 600 }));

    filler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_records_are_merged_into_contiguous_jobs() {
    let hub = Arc::new(StreamHub::with_streams(["tm_realtime", "pp_realtime"]));
    let recorder = Arc::new(Recorder::default());
    let filler = backfiller(
        options(&[], &["tm_realtime", "pp_realtime"]),
        100 * D,
        Arc::clone(&hub),
        recorder.clone(),
    );
    filler.start().unwrap();
    assert_eq!(hub.subscriber_count("tm_realtime"), 1);

    for gentime in [10, D + 1, 5 * D + 7, D + 3] {
        hub.publish("tm_realtime", gentime).unwrap();
    }
    hub.publish("pp_realtime", 2 * D + 5).unwrap();
    assert_eq!(filler.status().dirty_buckets, 4);

    // First pass runs one period after start
    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(recorder.ranges().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        recorder.ranges(),
        vec![TimeRange::new(0, 3 * D), TimeRange::new(5 * D, 6 * D)]
    );
    assert_eq!(filler.status().dirty_buckets, 0);
    assert!(filler.jobs().iter().all(|j| j.source == JobSource::StreamUpdate));

    // Same bucket marked twice between passes yields one job
    hub.publish("tm_realtime", 7 * D).unwrap();
    hub.publish("tm_realtime", 7 * D + 99).unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(recorder.ranges().len(), 3);
    assert_eq!(recorder.ranges()[2], TimeRange::new(7 * D, 8 * D));

    filler.stop().await;
    assert_eq!(hub.subscriber_count("tm_realtime"), 0);
    assert_eq!(hub.subscriber_count("pp_realtime"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_jobs_run_one_at_a_time_in_submission_order() {
    let recorder = Arc::new(Recorder {
        work: Duration::from_secs(10),
        ..Default::default()
    });
    let filler = backfiller(
        options(&[], &[]),
        0,
        Arc::new(StreamHub::new()),
        recorder.clone(),
    );
    filler.start().unwrap();

    let a = filler.schedule_filling_task(0, D - 1).unwrap();
    let b = filler.schedule_filling_task(4 * D, 5 * D - 1).unwrap();
    let (a_id, b_id) = (a.id, b.id);
    assert!(a_id < b_id);

    assert_eq!(b.wait().await, FillOutcome::Completed { processed: 10 });
    assert_eq!(a.wait().await, FillOutcome::Completed { processed: 10 });

    assert_eq!(
        *recorder.events.lock().unwrap(),
        vec![
            format!("start {}", a_id),
            format!("end {}", a_id),
            format!("start {}", b_id),
            format!("end {}", b_id),
        ]
    );

    let first = filler.job(a_id).unwrap();
    let second = filler.job(b_id).unwrap();
    assert!(first.finished_at.unwrap() <= second.started_at.unwrap());

    filler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_jobs_do_not_stop_the_worker() {
    let filler = backfiller(
        options(&[], &[]),
        0,
        Arc::new(StreamHub::new()),
        Arc::new(Unreliable),
    );
    filler.start().unwrap();

    let failed = filler.schedule_filling_task(0, 1).unwrap();
    let panicked = filler.schedule_filling_task(D, D + 1).unwrap();
    let ok = filler.schedule_filling_task(2 * D, 2 * D + 1).unwrap();

    match failed.wait().await {
        FillOutcome::Failed { error } => assert!(error.contains("replay server unreachable")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(matches!(panicked.wait().await, FillOutcome::Failed { .. }));
    assert_eq!(ok.wait().await, FillOutcome::Completed { processed: 1 });
    assert_eq!(filler.state(), Lifecycle::Running);

    filler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_aborts_running_job_and_cancels_queued_ones() {
    let filler = backfiller(
        options(&[], &[]),
        0,
        Arc::new(StreamHub::new()),
        Arc::new(UntilAborted),
    );
    filler.start().unwrap();

    let running = filler.schedule_filling_task(0, 1).unwrap();
    let queued = filler.schedule_filling_task(D, D + 1).unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(filler.status().queued_jobs, 1);

    filler.stop().await;

    assert_eq!(running.wait().await, FillOutcome::Aborted { processed: 3 });
    assert_eq!(queued.wait().await, FillOutcome::Cancelled);
    assert!(matches!(
        filler.schedule_filling_task(0, 1),
        Err(BackfillError::NotRunning)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_no_jobs_after_stop() {
    let hub = Arc::new(StreamHub::with_streams(["tm_realtime"]));
    let recorder = Arc::new(Recorder::default());
    let filler = backfiller(
        options(
            &[schedule(1, 1, None), schedule(0, 1, Some(60))],
            &["tm_realtime"],
        ),
        0,
        Arc::clone(&hub),
        recorder.clone(),
    );
    filler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    let before = recorder.ranges().len();
    assert_eq!(before, 1);

    hub.publish("tm_realtime", 42).unwrap();
    filler.stop().await;
    assert_eq!(filler.state(), Lifecycle::Stopped);

    // Records after stop reach nobody
    assert_eq!(hub.publish("tm_realtime", 43).unwrap(), 0);

    tokio::time::sleep(Duration::from_millis((5 * D) as u64)).await;
    assert_eq!(recorder.ranges().len(), before);
    assert!(matches!(filler.start(), Err(BackfillError::Stopped)));
}

#[tokio::test]
async fn test_start_fails_on_unknown_stream() {
    let hub = Arc::new(StreamHub::with_streams(["tm_realtime"]));
    let filler = backfiller(
        options(&[], &["tm_realtime", "tm_dump"]),
        0,
        Arc::clone(&hub),
        Arc::new(Recorder::default()),
    );

    match filler.start() {
        Err(BackfillError::Stream(StreamError::NotFound(name))) => assert_eq!(name, "tm_dump"),
        other => panic!("unexpected result {:?}", other.err()),
    }
    assert_eq!(hub.subscriber_count("tm_realtime"), 0);
    assert_eq!(filler.state(), Lifecycle::Created);
}

#[tokio::test(start_paused = true)]
async fn test_backfiller_is_a_stream_subscriber() {
    let hub = Arc::new(StreamHub::with_streams(["tm_dump"]));
    let recorder = Arc::new(Recorder::default());
    let filler = Arc::new(backfiller(
        options(&[], &[]),
        0,
        Arc::new(StreamHub::new()),
        recorder.clone(),
    ));
    filler.start().unwrap();

    // Fed by a stream the engine itself does not monitor
    let subscriber: Arc<dyn StreamSubscriber> = filler.clone();
    hub.subscribe("tm_dump", subscriber).unwrap();
    hub.publish("tm_dump", 3 * D + 1).unwrap();

    let handles = filler.flush_dirty().unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].range, TimeRange::new(3 * D, 4 * D));

    filler.stop().await;
}
