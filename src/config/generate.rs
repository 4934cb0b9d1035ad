pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# PARCHIVE CONFIGURATION
# =============================================================================
# This file configures the parameter archive backfiller: the archive time
# addressing, the backfill schedules, the streams whose records invalidate
# archive buckets, and the derivation command that rebuilds a time range.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/parchive/config.yml
#   3. /etc/parchive/config.yml
#
# Values may reference environment variables with $env{VAR_NAME}.

# =============================================================================
# ARCHIVE
# =============================================================================

archive:
  # Bucket length in milliseconds. 8388608 (2^23) is about 2.33 hours.
  bucketDuration: 8388608
  # Calendar partition directories: YYYY, YYYY/MM or YYYY/DOY
  partitioning: YYYY/DOY

# =============================================================================
# BACKFILL
# =============================================================================

backfill:
  # Seconds of data replayed before each job's range as lead-in context
  warmupTime: 60
  # Samples per archive segment handed to the derivation
  maxSegmentSize: 5000
  # Each rule rebuilds numSegments buckets, starting startSegment buckets in
  # the past. With an interval (seconds) the rule runs periodically relative
  # to the current time; without one (or with -1) it runs once per bucket,
  # anchored to the bucket in which the backfiller started.
  schedule:
    - startSegment: 1
      numSegments: 1
    - startSegment: 12
      numSegments: 4
      interval: 86400
  # Seconds between passes that rebuild buckets touched by new data
  streamUpdateFillFrequency: 600
  # Streams whose records mark buckets for rebuild. Defaults to every stream
  # declared under 'streams'.
  # monitorStreams: [tm_realtime]

# =============================================================================
# STREAMS
# =============================================================================

streams:
  tm: [tm_realtime, tm_dump]
  param: [pp_realtime]

# =============================================================================
# DERIVATION
# =============================================================================
# Program run once per fill job. Placeholders in the arguments:
#   {start} {stop} {warmup_start}            ISO-8601 UTC
#   {start_ms} {stop_ms} {warmup_start_ms}   milliseconds since the epoch
#   {job_id} {max_segment_size}
# Partition directories are written to stdin, one per line; PARCHIVE_PARTITION_FIRST,
# PARCHIVE_PARTITION_LAST and PARCHIVE_PARTITION_COUNT summarise them.
# The last line printed on stdout, if numeric, is the processed sample count.

derivation:
  command: [/usr/local/bin/rebuild-parchive, --from, "{warmup_start}", --start, "{start}", --stop, "{stop}"]
  # Optional upper bound per job
  # timeout: 30m

# =============================================================================
# WEB SERVER SETTINGS
# =============================================================================

web:
  enabled: true
  listen: 127.0.0.1:8090
  # Set to 0.0.0.0:8090 to allow external connections
"#
    .to_string()
}
