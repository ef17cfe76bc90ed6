use crate::error::ApiError;
use crate::handlers::{events, user_id};
use crate::sync::SyncState;
use axum::{
    Router,
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
};
use patchsync_core::transport::PatchesBody;
use patchsync_core::{EntityKey, PatchResponse, PatchSyncError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub sync_state: Arc<SyncState>,
}

/// Server status response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub active_connections: usize,
    pub active_rooms: usize,
    pub started_at: String,
    pub entity_types: Vec<String>,
}

/// Entity snapshot response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityResponse {
    pub entity_type: String,
    pub entity_id: String,
    pub state: Value,
    pub change_number: u64,
}

/// Create API routes
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(state)
}

/// Create per-entity routes
pub fn entity_routes(state: ApiState) -> Router {
    Router::new()
        .route("/{entity_type}/{entity_id}", get(get_entity))
        .route("/{entity_type}/{entity_id}/patches", post(post_patches))
        .route("/{entity_type}/{entity_id}/events", get(events::entity_events))
        .with_state(state)
}

/// GET /api/status - Get server status
async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let stats = state.sync_state.get_stats().await;

    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_connections: stats.active_connections,
        active_rooms: stats.active_rooms,
        started_at: state.sync_state.started_at().to_rfc3339(),
        entity_types: state.sync_state.types().type_names(),
    })
}

/// GET /entities/{type}/{id} - Current authoritative state
async fn get_entity(
    State(state): State<ApiState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<EntityResponse>, ApiError> {
    let key = EntityKey::new(entity_type, entity_id);
    let room = state.sync_state.get_or_create_room(&key).await?;
    let (state, change_number) = room.snapshot();

    Ok(Json(EntityResponse {
        entity_type: key.entity_type,
        entity_id: key.entity_id,
        state,
        change_number,
    }))
}

/// POST /entities/{type}/{id}/patches - Propose patches
///
/// The server numbers the patches, applies them and relays them to every
/// observer, the sender included.
async fn post_patches(
    State(state): State<ApiState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<PatchResponse>, ApiError> {
    let body: PatchesBody = serde_json::from_str(&body)
        .map_err(|e| PatchSyncError::MalformedPayload(e.to_string()))?;
    let key = EntityKey::new(entity_type, entity_id);
    let room = state.sync_state.get_or_create_room(&key).await?;

    let batch = room.submit(body.patches, user_id(&headers).as_deref())?;
    debug!("Accepted {} patches for {} at change {}", batch.patches.len(), key, batch.change_number);
    Ok(Json(PatchResponse::success(vec![batch])))
}
