#![doc = include_str!("../README.md")]

//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3030)
//! - `DATABASE_PATH`: Path to SQLite database (default: ./patchsync.db)
//! - `STORAGE_PREFIX`: Prefix for every stored entity name (default: empty)
//! - `BROADCAST_CAPACITY`: Per-room fan-out buffer (default: 1024)
//! - `CORS_ORIGINS`: Comma-separated list of allowed origins (default: `*`)

pub mod config;
pub mod error;
pub mod handlers;
pub mod rpc;
pub mod sync;

pub use config::Config;

use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header},
    routing::get,
};
use handlers::{api::ApiState, rpc::RpcState, ws::WsState};
use std::sync::Arc;
use sync::SyncState;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// Build the full router over a shared [`SyncState`].
pub fn app(sync_state: Arc<SyncState>, config: &Config) -> Router {
    let api_state = ApiState {
        sync_state: sync_state.clone(),
    };
    let rpc_state = RpcState {
        sync_state: sync_state.clone(),
    };
    let ws_state = WsState { sync_state };

    Router::new()
        // Health check
        .route("/", get(|| async { "patchsync server" }))
        .route("/health", get(|| async { "OK" }))
        // Socket transport
        .route("/ws", get(handlers::ws_handler).with_state(ws_state))
        .nest("/api", handlers::api_routes(api_state.clone()))
        // Snapshot, write path and server-push stream
        .nest("/entities", handlers::entity_routes(api_state))
        .nest("/rpc", handlers::rpc_routes(rpc_state))
        .layer(cors_layer(config))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static("x-user-id")]);

    if config.allows_any_origin() {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}
