use crate::audit::{AuditSummary, Auditor, RecordStats};
use crate::capture::{LocationCapture, MediaInput, RecordAssembler};
use crate::config::ApiConfig;
use crate::delivery::{DeliveryOutcome, DrainSummary, QueueEntry, SyncQueue, SyncSummary, Uploader};
use crate::document_store::Stores;
use crate::error::{CaptureError, StoreError};
use crate::models::{DeliveryStatus, Location, Record, SensorReading};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub assembler: Arc<RecordAssembler>,
    pub uploader: Arc<Uploader>,
    pub queue: Arc<SyncQueue>,
    pub auditor: Arc<Auditor>,
    /// Feeds the event detector
    pub readings: mpsc::Sender<SensorReading>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn store_error(e: StoreError, context: &str) -> ApiError {
    error!(error = %e, "{}", context);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, context, "STORE_ERROR")
}

fn not_found() -> ApiError {
    api_error(StatusCode::NOT_FOUND, "Record not found", "NOT_FOUND")
}

/// Query parameters for the record list
#[derive(Debug, Deserialize)]
pub struct RecordListQuery {
    /// Filter by delivery status
    pub status: Option<DeliveryStatus>,
    /// Maximum results
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// Record list response, newest first
#[derive(Debug, Serialize)]
pub struct RecordListResponse {
    pub records: Vec<Record>,
    pub total_count: usize,
    pub has_more: bool,
}

/// Result of a single delivery attempt
#[derive(Debug, Serialize, PartialEq)]
pub struct DeliveryResponse {
    pub record_id: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DeliveryResponse {
    fn new(record_id: String, outcome: DeliveryOutcome) -> Self {
        let mut response = Self {
            record_id,
            outcome: "",
            remote_id: None,
            error: None,
            reason: None,
        };
        match outcome {
            DeliveryOutcome::Delivered { remote_id } => {
                response.outcome = "delivered";
                response.remote_id = Some(remote_id);
            }
            DeliveryOutcome::Failed { error } => {
                response.outcome = "failed";
                response.error = Some(error.to_string());
            }
            DeliveryOutcome::Skipped { reason } => {
                response.outcome = "skipped";
                response.reason = Some(reason);
            }
        }
        response
    }
}

/// Capture request body. With `media` a media capture is made, otherwise a
/// manual one.
#[derive(Debug, Default, Deserialize)]
pub struct CaptureBody {
    #[serde(default)]
    pub media: Option<MediaInput>,
    /// Location reported by the client, used instead of the provider
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub approximate_address: Option<String>,
}

/// Accepted readings count
#[derive(Debug, Serialize)]
pub struct ReadingsAccepted {
    pub accepted: usize,
}

/// Statistics response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub records: RecordStats,
    pub queue_length: usize,
    pub collection_active: bool,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/records", get(list_records))
        .route("/api/v1/records/:record_id", get(get_record))
        .route("/api/v1/records/:record_id/deliver", post(deliver_record))
        .route("/api/v1/records/:record_id/enqueue", post(enqueue_record))
        .route("/api/v1/records/:record_id/archive", post(archive_record))
        .route("/api/v1/captures", post(create_capture))
        .route("/api/v1/collection/start", post(start_collection))
        .route("/api/v1/collection/stop", post(stop_collection))
        .route("/api/v1/readings", post(push_readings))
        .route("/api/v1/validate", post(validate_records))
        .route("/api/v1/sync", post(sync_pending))
        .route("/api/v1/queue/drain", post(drain_queue))
        .route("/api/v1/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "capture-sync-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.stores.records.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state))]
async fn list_records(
    State(state): State<AppState>,
    Query(params): Query<RecordListQuery>,
) -> Result<Json<RecordListResponse>, ApiError> {
    let mut records: Vec<Record> = state
        .stores
        .records
        .list_as()
        .await
        .map_err(|e| store_error(e, "Failed to list records"))?;

    if let Some(status) = params.status {
        records.retain(|r| r.delivery_status == status);
    }
    records.sort_by(|a, b| b.captured_at_millis.cmp(&a.captured_at_millis));

    let total_count = records.len();
    let records: Vec<Record> = records
        .into_iter()
        .skip(params.offset)
        .take(params.limit)
        .collect();
    let has_more = params.offset + records.len() < total_count;

    Ok(Json(RecordListResponse {
        records,
        total_count,
        has_more,
    }))
}

async fn load_record(state: &AppState, record_id: &str) -> Result<Record, ApiError> {
    state
        .stores
        .records
        .get_as::<Record>(record_id)
        .await
        .map_err(|e| store_error(e, "Failed to get record"))?
        .ok_or_else(not_found)
}

#[instrument(skip(state))]
async fn get_record(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
) -> Result<Json<Record>, ApiError> {
    load_record(&state, &record_id).await.map(Json)
}

#[instrument(skip(state))]
async fn deliver_record(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
) -> Result<Json<DeliveryResponse>, ApiError> {
    load_record(&state, &record_id).await?;

    let outcome = state
        .uploader
        .attempt_delivery(&record_id)
        .await
        .map_err(|e| store_error(e, "Delivery attempt aborted"))?;

    Ok(Json(DeliveryResponse::new(record_id, outcome)))
}

#[instrument(skip(state))]
async fn enqueue_record(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
) -> Result<(StatusCode, Json<QueueEntry>), ApiError> {
    let record = load_record(&state, &record_id).await?;

    let entry = state
        .queue
        .enqueue(&record)
        .await
        .map_err(|e| store_error(e, "Failed to enqueue record"))?;

    Ok((StatusCode::ACCEPTED, Json(entry)))
}

#[instrument(skip(state))]
async fn archive_record(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
) -> Result<Json<Record>, ApiError> {
    load_record(&state, &record_id).await?;

    let archived = state
        .uploader
        .archive(&record_id)
        .await
        .map_err(|e| store_error(e, "Failed to archive record"))?;
    if !archived {
        return Err(api_error(
            StatusCode::CONFLICT,
            "Only pending records can be archived",
            "NOT_PENDING",
        ));
    }

    load_record(&state, &record_id).await.map(Json)
}

fn capture_error(e: CaptureError) -> ApiError {
    match e {
        CaptureError::Media(message) => {
            api_error(StatusCode::UNPROCESSABLE_ENTITY, message, "MEDIA_ERROR")
        }
        CaptureError::ProofOfWork { .. } => api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            e.to_string(),
            "PROOF_OF_WORK_EXHAUSTED",
        ),
        other => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            other.to_string(),
            "CAPTURE_ERROR",
        ),
    }
}

#[instrument(skip(state, body))]
async fn create_capture(
    State(state): State<AppState>,
    Json(body): Json<CaptureBody>,
) -> Result<(StatusCode, Json<Record>), ApiError> {
    let record = match body.media {
        Some(media) => state.assembler.capture_media(media).await,
        None => {
            let location = body.location.map(|fix| {
                LocationCapture::from_fix(
                    fix,
                    body.approximate_address
                        .unwrap_or_else(|| "address unavailable".to_string()),
                )
            });
            state.assembler.capture_manual(location).await
        }
    }
    .map_err(capture_error)?;

    Ok((StatusCode::CREATED, Json(record)))
}

async fn start_collection(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    if state.assembler.start_collection() {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(api_error(
            StatusCode::CONFLICT,
            "Continuous collection already running",
            "ALREADY_RUNNING",
        ))
    }
}

async fn stop_collection(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Record>), ApiError> {
    match state.assembler.stop_collection().await {
        Ok(Some(record)) => Ok((StatusCode::CREATED, Json(record))),
        Ok(None) => Err(api_error(
            StatusCode::CONFLICT,
            "No continuous collection running",
            "NOT_RUNNING",
        )),
        Err(e) => Err(capture_error(e)),
    }
}

#[instrument(skip(state, readings), fields(count = readings.len()))]
async fn push_readings(
    State(state): State<AppState>,
    Json(readings): Json<Vec<SensorReading>>,
) -> Result<(StatusCode, Json<ReadingsAccepted>), ApiError> {
    let accepted = readings.len();
    for reading in readings {
        if state.readings.send(reading).await.is_err() {
            warn!("Sensor reading stream closed");
            return Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "Event detector is not running",
                "DETECTOR_STOPPED",
            ));
        }
    }

    Ok((StatusCode::ACCEPTED, Json(ReadingsAccepted { accepted })))
}

async fn validate_records(State(state): State<AppState>) -> Result<Json<AuditSummary>, ApiError> {
    state
        .auditor
        .validate_all()
        .await
        .map(Json)
        .map_err(|e| store_error(e, "Validation pass failed"))
}

async fn sync_pending(State(state): State<AppState>) -> Result<Json<SyncSummary>, ApiError> {
    state
        .uploader
        .sync_pending()
        .await
        .map(Json)
        .map_err(|e| store_error(e, "Synchronization failed"))
}

async fn drain_queue(State(state): State<AppState>) -> Result<Json<DrainSummary>, ApiError> {
    state
        .queue
        .drain()
        .await
        .map(Json)
        .map_err(|e| store_error(e, "Queue drain failed"))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let records = state
        .auditor
        .stats()
        .await
        .map_err(|e| store_error(e, "Failed to compute statistics"))?;
    let queue_length = state
        .queue
        .len()
        .await
        .map_err(|e| store_error(e, "Failed to read queue"))?;

    Ok(Json(StatsResponse {
        records,
        queue_length,
        collection_active: state.assembler.collection_active(),
    }))
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting capture sync API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
