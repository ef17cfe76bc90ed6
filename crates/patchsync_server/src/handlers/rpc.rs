use crate::error::ApiError;
use crate::handlers::user_id;
use crate::sync::SyncState;
use axum::{
    Router,
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::post,
};
use patchsync_core::{EntityKey, PatchResponse, PatchSyncError};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

/// Shared state for RPC handlers
#[derive(Clone)]
pub struct RpcState {
    pub sync_state: Arc<SyncState>,
}

/// A method's return value plus the patches it committed
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub result: Value,
    #[serde(flatten)]
    pub response: PatchResponse,
}

/// Create RPC routes
pub fn rpc_routes(state: RpcState) -> Router {
    Router::new()
        .route("/{entity_type}/{entity_id}/{method}", post(call_method))
        .with_state(state)
}

/// POST /rpc/{type}/{id}/{method} - Run a method; the body is its arguments
async fn call_method(
    State(state): State<RpcState>,
    Path((entity_type, entity_id, method)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<RpcResponse>, ApiError> {
    let sync_state = &state.sync_state;
    sync_state.types().get(&entity_type)?;
    let spec = sync_state.methods().get(&entity_type, &method)?;

    let args = if body.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(&body).map_err(|e| PatchSyncError::MalformedPayload(e.to_string()))?
    };

    let key = EntityKey::new(entity_type, entity_id);
    let room = sync_state.get_or_create_room(&key).await?;
    let user = user_id(&headers);
    let (result, batch) = room.invoke(&method, spec, &args, user.as_deref())?;

    let response = match batch {
        Some(batch) => {
            info!(
                "{} on {} committed change {}{}",
                method,
                key,
                batch.change_number,
                if spec.broadcast { " (broadcast)" } else { "" }
            );
            PatchResponse::success(vec![batch])
        }
        None => PatchResponse {
            new_change_number: room.last_change_number(),
            ..PatchResponse::success(Vec::new())
        },
    };

    Ok(Json(RpcResponse { result, response }))
}
