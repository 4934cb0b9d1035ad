//! Replay/derivation engine interface.
//!
//! A [`Deriver`] recomputes archive content for one time range. It is the
//! only component that mutates the archive, and the backfill worker calls
//! it for one job at a time.

pub mod command;

use crate::time::{Instant, TimeRange};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use command::CommandDeriver;

#[derive(Debug, Error)]
pub enum DeriveError {
    #[error("failed to launch derivation: {0}")]
    Launch(#[from] std::io::Error),

    #[error("derivation exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("derivation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("derivation failed: {0}")]
    Failed(String),
}

/// What to recompute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivationRequest {
    pub job_id: u64,
    /// Bucket-aligned range whose archive content is rebuilt.
    pub range: TimeRange,
    /// Replay starts here, before `range.start`, so the derivation carries
    /// prior state into the range. Data before `range.start` is context only.
    pub warmup_start: Instant,
    pub max_segment_size: usize,
    /// Calendar partition directories touched by `range`.
    pub partitions: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DerivationReport {
    pub processed: u64,
    pub aborted: bool,
}

#[async_trait]
pub trait Deriver: Send + Sync {
    /// Replays `[warmup_start, range.stop)` and rebuilds the archive for
    /// `range`. Returns once the replay reached a terminal state.
    ///
    /// `abort` is the cooperative abort flag; implementations check it at
    /// their own step granularity and report `aborted: true` when they stop
    /// early because of it.
    async fn run(
        &self,
        request: &DerivationRequest,
        abort: CancellationToken,
    ) -> Result<DerivationReport, DeriveError>;

    /// Persists whatever the completed run still buffers. Not called for
    /// aborted runs.
    async fn flush(&self, _request: &DerivationRequest) -> Result<(), DeriveError> {
        Ok(())
    }
}
