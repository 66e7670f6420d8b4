//! Room administration routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use drn_shared::{Room, RoomInput};

use crate::{
    error::ApiResult,
    realtime::{CreateRoomOptions, DebugInfo, RoomRemoval},
    state::AppState,
};

/// Create a room; `?noExpiration=true` keeps it and its presence forever
pub async fn create_room(
    State(state): State<AppState>,
    Query(options): Query<CreateRoomOptions>,
    Json(input): Json<RoomInput>,
) -> ApiResult<(StatusCode, Json<Room>)> {
    let room = state.realtime.create_room(input, options).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

pub async fn list_rooms(State(state): State<AppState>) -> ApiResult<Json<Vec<Room>>> {
    Ok(Json(state.realtime.get_rooms().await?))
}

pub async fn update_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(input): Json<RoomInput>,
) -> ApiResult<Json<Room>> {
    Ok(Json(state.realtime.update_room(&room_id, input).await?))
}

pub async fn remove_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> ApiResult<Json<RoomRemoval>> {
    Ok(Json(state.realtime.remove_room(&room_id).await?))
}

/// Every room with the profiles of its present members
pub async fn debug_info(State(state): State<AppState>) -> ApiResult<Json<DebugInfo>> {
    Ok(Json(state.realtime.debug_info().await?))
}
