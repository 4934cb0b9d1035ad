use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::time::DEFAULT_BUCKET_DURATION_MS;

/// Default number of samples per archive segment handed to the deriver.
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub streams: StreamsConfig,
    pub derivation: DerivationConfig,
    #[serde(default)]
    pub web: WebConfig,
}

impl Config {
    /// Streams whose records mark buckets dirty. Falls back to every
    /// declared telemetry and parameter stream.
    pub fn monitored_streams(&self) -> Vec<String> {
        match &self.backfill.monitor_streams {
            Some(names) => names.clone(),
            None => self
                .streams
                .tm
                .iter()
                .chain(self.streams.param.iter())
                .cloned()
                .collect(),
        }
    }

    pub fn declared_streams(&self) -> impl Iterator<Item = &String> {
        self.streams.tm.iter().chain(self.streams.param.iter())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveConfig {
    /// Bucket length in milliseconds.
    #[serde(default = "default_bucket_duration")]
    pub bucket_duration: i64,
    #[serde(default = "default_partitioning")]
    pub partitioning: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            bucket_duration: default_bucket_duration(),
            partitioning: default_partitioning(),
        }
    }
}

fn default_bucket_duration() -> i64 {
    DEFAULT_BUCKET_DURATION_MS
}

fn default_partitioning() -> String {
    "YYYY/DOY".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillConfig {
    /// Seconds of lead-in replayed before each job's range.
    #[serde(default = "default_warmup_time")]
    pub warmup_time: u64,
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: usize,
    #[serde(default)]
    pub schedule: Vec<ScheduleConfig>,
    /// Seconds between merge-and-submit passes over the dirty buckets.
    #[serde(default = "default_stream_update_fill_frequency")]
    pub stream_update_fill_frequency: u64,
    pub monitor_streams: Option<Vec<String>>,
}

impl BackfillConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_time)
    }

    pub fn stream_update_period(&self) -> Duration {
        Duration::from_secs(self.stream_update_fill_frequency)
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            warmup_time: default_warmup_time(),
            max_segment_size: default_max_segment_size(),
            schedule: Vec::new(),
            stream_update_fill_frequency: default_stream_update_fill_frequency(),
            monitor_streams: None,
        }
    }
}

fn default_warmup_time() -> u64 {
    60
}

fn default_max_segment_size() -> usize {
    DEFAULT_MAX_SEGMENT_SIZE
}

fn default_stream_update_fill_frequency() -> u64 {
    600
}

/// One backfill rule. `interval` in seconds; omitted or `-1` means the
/// rule is anchored to the bucket tick instead of the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub start_segment: i64,
    pub num_segments: i64,
    #[serde(default)]
    pub interval: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamsConfig {
    #[serde(default)]
    pub tm: Vec<String>,
    #[serde(default)]
    pub param: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivationConfig {
    pub command: Vec<String>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_enabled")]
    pub enabled: bool,
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: default_web_enabled(),
            listen: default_listen(),
        }
    }
}

fn default_web_enabled() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1:8090".to_string()
}
