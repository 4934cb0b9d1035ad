use super::run::{build_backfiller, require_config_path, RunError};
use crate::backfill::{BackfillOptions, FillOutcome, ScheduleTable};
use crate::config::parse::load_config;
use crate::time::parse_instant;
use std::path::PathBuf;
use tracing::info;

/// One-shot fill of `[start, stop]` with the configured derivation.
/// Schedules and stream monitoring are not started.
pub async fn fill(
    config_path: Option<PathBuf>,
    start: &str,
    stop: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = require_config_path(config_path)?;
    let start = parse_instant(start)?;
    let stop = parse_instant(stop)?;

    let config = load_config(&config_path).map_err(RunError::from)?;
    let options = BackfillOptions {
        schedules: ScheduleTable::default(),
        monitor_streams: Vec::new(),
        ..BackfillOptions::from_config(&config).map_err(RunError::from)?
    };

    let (backfiller, _streams) = build_backfiller(&config, options)?;
    backfiller.start().map_err(RunError::from)?;

    let handle = match backfiller.schedule_filling_task(start, stop) {
        Ok(handle) => handle,
        Err(e) => {
            backfiller.stop().await;
            return Err(RunError::from(e).into());
        }
    };
    info!(job_id = handle.id, range = %handle.range, "Waiting for fill job");

    let outcome = handle.wait().await;
    backfiller.stop().await;

    println!("{}", serde_json::to_string(&outcome)?);
    match outcome {
        FillOutcome::Completed { .. } => Ok(()),
        other => Err(RunError::Other(format!("fill job did not complete: {:?}", other.state())).into()),
    }
}
