use crate::backfill::{BackFiller, BackfillError, BackfillStatus, JobRecord};
use crate::stream::{StreamError, StreamHub};
use crate::time::{format_instant, parse_instant, PartitionInfo, TimeRange};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared state for the admin API
#[derive(Clone)]
pub struct AppState {
    pub backfiller: Arc<BackFiller>,
    pub streams: Arc<StreamHub>,
}

#[derive(Debug, Deserialize)]
pub struct FillRequest {
    pub start: String,
    pub stop: String,
}

#[derive(Debug, Serialize)]
pub struct FillResponse {
    pub id: u64,
    pub start: String,
    pub stop: String,
}

#[derive(Debug, Deserialize)]
pub struct RecordRequest {
    pub gentime: String,
}

#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub stream: String,
    pub subscribers: usize,
}

#[derive(Debug, Deserialize)]
pub struct PartitionsQuery {
    pub start: String,
    pub stop: String,
}

#[derive(Debug, Serialize)]
pub struct PartitionEntry {
    pub dir: String,
    pub start: String,
    pub end: String,
}

impl From<PartitionInfo> for PartitionEntry {
    fn from(info: PartitionInfo) -> Self {
        Self {
            start: format_instant(info.start),
            end: format_instant(info.end),
            dir: info.dir,
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<BackfillStatus> {
    Json(state.backfiller.status())
}

/// GET /api/jobs
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobRecord>> {
    Json(state.backfiller.jobs())
}

/// POST /api/fill
pub async fn request_fill(
    State(state): State<AppState>,
    Json(request): Json<FillRequest>,
) -> Result<(StatusCode, Json<FillResponse>), ApiError> {
    let start = parse_instant(&request.start).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let stop = parse_instant(&request.stop).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let handle = state.backfiller.schedule_filling_task(start, stop)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(FillResponse {
            id: handle.id,
            start: format_instant(handle.range.start),
            stop: format_instant(handle.range.stop),
        }),
    ))
}

/// POST /api/streams/:name/records
pub async fn publish_record(
    State(state): State<AppState>,
    Path(stream): Path<String>,
    Json(request): Json<RecordRequest>,
) -> Result<Json<RecordResponse>, ApiError> {
    let gentime = parse_instant(&request.gentime).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let subscribers = state.streams.publish(&stream, gentime).map_err(|e| match e {
        StreamError::NotFound(_) => ApiError::NotFound(e.to_string()),
        other => ApiError::BadRequest(other.to_string()),
    })?;
    Ok(Json(RecordResponse { stream, subscribers }))
}

/// Upper bound on entries returned by one partition listing.
pub const MAX_LISTED_PARTITIONS: usize = 10_000;

/// GET /api/partitions?start=..&stop=..
pub async fn list_partitions(
    State(state): State<AppState>,
    Query(query): Query<PartitionsQuery>,
) -> Result<Json<Vec<PartitionEntry>>, ApiError> {
    let start = parse_instant(&query.start).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let stop = parse_instant(&query.stop).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if start > stop {
        return Err(ApiError::BadRequest("start must not be after stop".to_string()));
    }

    let partitions = state
        .backfiller
        .partitioner()
        .partitions(TimeRange::new(start, stop))
        .take(MAX_LISTED_PARTITIONS + 1)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if partitions.len() > MAX_LISTED_PARTITIONS {
        return Err(ApiError::BadRequest(format!(
            "range covers more than {} partitions",
            MAX_LISTED_PARTITIONS
        )));
    }
    Ok(Json(partitions.into_iter().map(PartitionEntry::from).collect()))
}

// Error handling
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    InternalError(String),
}

impl From<BackfillError> for ApiError {
    fn from(e: BackfillError) -> Self {
        match e {
            BackfillError::InvalidRange { .. } => ApiError::BadRequest(e.to_string()),
            BackfillError::NotRunning | BackfillError::Stopped => ApiError::Unavailable(e.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
