//! Permission-gated REST API for companion clients.
//!
//! Every route except `hello` identifies the caller by the `client-id`
//! header. The caller must be connected over `/ws` and hold the route's
//! permission; otherwise the answer is 403. Failures carry an
//! [`ErrorResponse`] body.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use companion_proto::handshake::PROTOCOL_VERSION;
use companion_proto::message::ClientId;
use companion_proto::permission::Permission;
use companion_proto::rest::{
    CLIENT_ID_HEADER, ErrorResponse, GameConfig, HelloResponse, InputSimulationRequest,
    MicrophoneDataDto, PermissionsResponse, SongDto, SongQueueEntryDto,
};

use crate::backend::BackendError;
use crate::events::CompanionEvent;
use crate::registry::ClientSummary;
use crate::server::CompanionState;

/// A failed REST call.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The caller is unknown, not connected, or lacks a permission.
    #[error("{0}")]
    Forbidden(String),
    /// The request could not be understood.
    #[error("{0}")]
    BadRequest(String),
    /// The addressed resource does not exist.
    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    /// HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl From<BackendError> for ApiError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::UnknownSong(_) | BackendError::QueueIndexOutOfRange { .. } => {
                Self::NotFound(e.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::debug!(status = %self.status(), error = %self, "REST call failed");
        (self.status(), Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Routes mounted under the REST prefix.
pub fn routes() -> Router<Arc<CompanionState>> {
    Router::new()
        .route("/hello", get(hello))
        .route("/permissions", get(permissions))
        .route("/songs", get(songs))
        .route("/song-queue", get(song_queue).post(enqueue_song))
        .route("/song-queue/{index}", delete(remove_from_queue))
        .route("/config", get(config).put(update_config))
        .route("/microphone-data", get(microphone_data))
        .route("/input-simulation", post(simulate_input))
}

/// Resolves the calling client and checks it holds `required`.
async fn authorize(
    state: &CompanionState,
    headers: &HeaderMap,
    required: Option<Permission>,
) -> Result<ClientSummary, ApiError> {
    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ClientId::new)
        .ok_or_else(|| ApiError::Forbidden(format!("missing {CLIENT_ID_HEADER} header")))?;

    let client = state
        .registry()
        .get(&client_id)
        .await
        .ok_or_else(|| ApiError::Forbidden(format!("client {client_id} is not connected")))?;

    match required {
        Some(permission) if !client.permissions.contains(permission) => {
            tracing::warn!(client_id = %client_id, permission = %permission, "permission denied");
            Err(ApiError::Forbidden(format!(
                "client {client_id} lacks permission {permission}"
            )))
        }
        _ => Ok(client),
    }
}

async fn hello(State(state): State<Arc<CompanionState>>) -> Json<HelloResponse> {
    Json(HelloResponse {
        protocol_version: PROTOCOL_VERSION,
        http_server_port: state.http_server_port(),
    })
}

async fn permissions(
    State(state): State<Arc<CompanionState>>,
    headers: HeaderMap,
) -> ApiResult<PermissionsResponse> {
    let client = authorize(&state, &headers, None).await?;
    Ok(Json(PermissionsResponse {
        permissions: client.permissions.to_vec(),
    }))
}

async fn songs(
    State(state): State<Arc<CompanionState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<SongDto>> {
    authorize(&state, &headers, Some(Permission::ReadSongs)).await?;
    Ok(Json(state.backend().songs()))
}

async fn song_queue(
    State(state): State<Arc<CompanionState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<SongQueueEntryDto>> {
    authorize(&state, &headers, Some(Permission::ReadSongQueue)).await?;
    Ok(Json(state.backend().song_queue()))
}

async fn enqueue_song(
    State(state): State<Arc<CompanionState>>,
    headers: HeaderMap,
    body: Result<Json<SongQueueEntryDto>, JsonRejection>,
) -> Result<(StatusCode, Json<Vec<SongQueueEntryDto>>), ApiError> {
    let client = authorize(&state, &headers, Some(Permission::WriteSongQueue)).await?;
    let Json(entry) = body?;
    tracing::info!(client_id = %client.client_id, song_id = %entry.song_id, "enqueueing song");
    let queue = state.backend().enqueue_song(entry)?;
    Ok((StatusCode::CREATED, Json(queue)))
}

async fn remove_from_queue(
    State(state): State<Arc<CompanionState>>,
    headers: HeaderMap,
    index: Result<Path<usize>, PathRejection>,
) -> ApiResult<Vec<SongQueueEntryDto>> {
    let client = authorize(&state, &headers, Some(Permission::WriteSongQueue)).await?;
    let Path(index) = index?;
    tracing::info!(client_id = %client.client_id, index, "removing song queue entry");
    Ok(Json(state.backend().remove_from_queue(index)?))
}

async fn config(
    State(state): State<Arc<CompanionState>>,
    headers: HeaderMap,
) -> ApiResult<GameConfig> {
    authorize(&state, &headers, Some(Permission::ReadConfig)).await?;
    Ok(Json(state.backend().config()))
}

async fn update_config(
    State(state): State<Arc<CompanionState>>,
    headers: HeaderMap,
    body: Result<Json<GameConfig>, JsonRejection>,
) -> ApiResult<GameConfig> {
    let client = authorize(&state, &headers, Some(Permission::WriteConfig)).await?;
    let Json(patch) = body?;
    tracing::info!(client_id = %client.client_id, keys = patch.len(), "updating game config");
    Ok(Json(state.backend().update_config(patch)))
}

async fn microphone_data(
    State(state): State<Arc<CompanionState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<MicrophoneDataDto>> {
    authorize(&state, &headers, Some(Permission::ReadMicrophoneData)).await?;
    Ok(Json(state.backend().microphone_data()))
}

async fn simulate_input(
    State(state): State<Arc<CompanionState>>,
    headers: HeaderMap,
    body: Result<Json<InputSimulationRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let client = authorize(&state, &headers, Some(Permission::WriteInputSimulation)).await?;
    let Json(request) = body?;
    let key = request.key.trim();
    if key.is_empty() {
        return Err(ApiError::BadRequest("key must not be empty".to_string()));
    }
    tracing::debug!(client_id = %client.client_id, key, "simulating input");
    state.publish(CompanionEvent::InputSimulated {
        client_id: client.client_id,
        key: key.to_string(),
    });
    Ok(StatusCode::NO_CONTENT)
}
