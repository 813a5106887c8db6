#![forbid(unsafe_code)]

// HTTP handlers for room inspection and administration

use crate::media::types::MediaError;
use crate::room::RoomInfo;
use crate::server::ApiServer;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

const MAX_ROOM_ID_LEN: usize = 128;

/// Maps registry errors onto HTTP status codes
impl IntoResponse for MediaError {
    fn into_response(self) -> Response {
        let status = if self.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            match &self {
                MediaError::RoomAlreadyExists(_) => StatusCode::CONFLICT,
                MediaError::Engine(_) => StatusCode::BAD_GATEWAY,
                MediaError::NoWorkers(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        };
        if status.is_server_error() {
            warn!("Room API error: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// GET /api/rooms
pub async fn list_rooms(State(server): State<ApiServer>) -> Json<Vec<RoomInfo>> {
    Json(server.registry().get_all_rooms())
}

/// GET /api/rooms/{id}
pub async fn get_room(
    State(server): State<ApiServer>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomInfo>, MediaError> {
    server
        .registry()
        .get_room_info(&room_id)
        .map(Json)
        .ok_or(MediaError::RoomNotFound(room_id))
}

/// POST /api/rooms/{id}
pub async fn create_room(
    State(server): State<ApiServer>,
    Path(room_id): Path<String>,
) -> Result<Response, MediaError> {
    if room_id.len() > MAX_ROOM_ID_LEN {
        return Ok((StatusCode::BAD_REQUEST, Json(json!({ "error": "room id too long" }))).into_response());
    }
    let room = server.registry().create_room(&room_id).await?;
    Ok((StatusCode::CREATED, Json(room.info())).into_response())
}

/// DELETE /api/rooms/{id}
pub async fn delete_room(
    State(server): State<ApiServer>,
    Path(room_id): Path<String>,
) -> Result<StatusCode, MediaError> {
    if server.registry().get_room(&room_id).is_none() {
        return Err(MediaError::RoomNotFound(room_id));
    }
    server.registry().close_room(&room_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
