//! HTTP API handlers

mod ws;

pub use ws::ws_handler;
use ws::RegistrationGuard;

use crate::bus::{BusMessage, Category, ChannelConnection, SharedBroadcaster};
use crate::catalog::TrackId;
use crate::player::{PlayerCommand, PlayerError, PlayerHandle, PlayerStatus};
use crate::upload::{ChunkedUploadTracker, UploadError};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

/// Largest request body accepted (one upload part)
pub const MAX_PART_BYTES: usize = 16 * 1024 * 1024;

/// Messages buffered per observer before it counts as dead
pub(crate) const OBSERVER_BACKLOG: usize = 128;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub player: PlayerHandle,
    pub uploads: Arc<ChunkedUploadTracker>,
    pub broadcaster: SharedBroadcaster,
    /// Stop playback once the last player connection closes
    pub stop_on_disconnect: bool,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        player: PlayerHandle,
        uploads: Arc<ChunkedUploadTracker>,
        broadcaster: SharedBroadcaster,
        stop_on_disconnect: bool,
    ) -> Self {
        Self {
            player,
            uploads,
            broadcaster,
            stop_on_disconnect,
            started_at: Instant::now(),
        }
    }
}

/// Build the full HTTP surface
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_handler))
        // Transport
        .route("/player/status", get(player_status_handler))
        .route("/player/play", post(play_handler))
        .route("/player/pause", post(pause_handler))
        .route("/player/resume", post(resume_handler))
        .route("/player/stop", post(stop_handler))
        .route("/player/skip", post(skip_handler))
        // Chunked uploads
        .route("/uploads", post(upload_init_handler))
        .route("/uploads/{upload_id}", get(upload_status_handler))
        .route("/uploads/{upload_id}/parts/{index}", post(upload_part_handler))
        // Operator alerts
        .route("/system/alert", post(alert_handler))
        // Observers
        .route("/events", get(events_handler))
        .route("/ws/{category}", get(ws_handler))
        // Middleware
        .layer(DefaultBodyLimit::max(MAX_PART_BYTES))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn player_error_status(e: &PlayerError) -> StatusCode {
    match e {
        PlayerError::AlreadyPlaying
        | PlayerError::NotPlaying
        | PlayerError::InvalidTransition { .. } => StatusCode::CONFLICT,
        PlayerError::TrackNotFound(_) => StatusCode::NOT_FOUND,
        PlayerError::SourceUnavailable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PlayerError::Catalog(_) => StatusCode::BAD_GATEWAY,
        PlayerError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        PlayerError::ControllerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        PlayerError::SpawnFailure { .. }
        | PlayerError::Signal { .. }
        | PlayerError::ProcessDied(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn upload_error_status(e: &UploadError) -> StatusCode {
    match e {
        UploadError::UnknownUpload(_) => StatusCode::NOT_FOUND,
        UploadError::InvalidPartCount
        | UploadError::PartOutOfRange { .. }
        | UploadError::InvalidFilename(_) => StatusCode::BAD_REQUEST,
        UploadError::UploadFailed(_) => StatusCode::CONFLICT,
        UploadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn player_response(result: Result<PlayerStatus, PlayerError>) -> Response {
    match result {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(player_error_status(&e), e),
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub player: PlayerStatus,
    pub observers: usize,
}

/// GET /health - Liveness plus a read-only view of playback
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "djamms-player",
        version: env!("DJAMMS_VERSION"),
        git_sha: env!("DJAMMS_GIT_SHA"),
        timestamp: Utc::now(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        player: state.player.status(),
        observers: state.broadcaster.total_connections(),
    })
}

// =============================================================================
// Player handlers
// =============================================================================

/// GET /player/status - Current session without queueing a command
pub async fn player_status_handler(State(state): State<AppState>) -> Json<PlayerStatus> {
    Json(state.player.status())
}

/// Play request body
#[derive(Deserialize)]
pub struct PlayRequest {
    #[serde(alias = "trackId")]
    pub track_id: TrackId,
}

/// POST /player/play
pub async fn play_handler(
    State(state): State<AppState>,
    Json(req): Json<PlayRequest>,
) -> Response {
    player_response(
        state
            .player
            .execute(PlayerCommand::Play {
                track_id: req.track_id,
            })
            .await,
    )
}

/// POST /player/pause
pub async fn pause_handler(State(state): State<AppState>) -> Response {
    player_response(state.player.pause().await)
}

/// POST /player/resume
pub async fn resume_handler(State(state): State<AppState>) -> Response {
    player_response(state.player.resume().await)
}

/// POST /player/stop
pub async fn stop_handler(State(state): State<AppState>) -> Response {
    player_response(state.player.stop().await)
}

/// POST /player/skip
pub async fn skip_handler(State(state): State<AppState>) -> Response {
    player_response(state.player.skip().await)
}

// =============================================================================
// Upload handlers
// =============================================================================

/// Upload init request body
#[derive(Deserialize)]
pub struct UploadInitRequest {
    pub filename: String,
    #[serde(alias = "totalParts", alias = "total_chunks", alias = "totalChunks")]
    pub total_parts: u32,
}

/// POST /uploads - Open a chunked upload
pub async fn upload_init_handler(
    State(state): State<AppState>,
    Json(req): Json<UploadInitRequest>,
) -> Response {
    match state.uploads.init(&req.filename, req.total_parts) {
        Ok(snapshot) => (StatusCode::CREATED, Json(snapshot)).into_response(),
        Err(e) => error_response(upload_error_status(&e), e),
    }
}

/// POST /uploads/{upload_id}/parts/{index} - Raw part bytes as the body
pub async fn upload_part_handler(
    State(state): State<AppState>,
    Path((upload_id, index)): Path<(String, u32)>,
    body: Bytes,
) -> Response {
    match state.uploads.submit_part(&upload_id, index, &body).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => {
            if matches!(e, UploadError::Io(_)) {
                warn!(upload_id = %upload_id, index, "Upload part failed: {}", e);
            }
            error_response(upload_error_status(&e), e)
        }
    }
}

/// GET /uploads/{upload_id}
pub async fn upload_status_handler(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Response {
    match state.uploads.status(&upload_id) {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => error_response(upload_error_status(&e), e),
    }
}

// =============================================================================
// System alerts
// =============================================================================

fn default_alert_level() -> String {
    "info".to_string()
}

#[derive(Deserialize)]
pub struct AlertRequest {
    pub message: String,
    #[serde(default = "default_alert_level")]
    pub level: String,
}

#[derive(Serialize)]
pub struct AlertResponse {
    pub delivered: usize,
}

/// POST /system/alert - Fan out to every observer category
pub async fn alert_handler(
    State(state): State<AppState>,
    Json(req): Json<AlertRequest>,
) -> Json<AlertResponse> {
    let delivered = state.broadcaster.send_all(&BusMessage::Alert {
        message: req.message,
        level: req.level,
    });
    Json(AlertResponse { delivered })
}

// =============================================================================
// SSE Events
// =============================================================================

/// GET /events - Server-Sent Events mirror of the `system` category
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (connection, rx) = ChannelConnection::new(OBSERVER_BACKLOG);
    let guard =
        RegistrationGuard::register(&state.broadcaster, Arc::new(connection), Category::System);

    // The stream owns the registration; a disconnected client unregisters
    let stream = ReceiverStream::new(rx).filter_map(move |message| {
        let _registered = &guard;
        match serde_json::to_string(&message) {
            Ok(json) => Some(Ok(Event::default().data(json))),
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
