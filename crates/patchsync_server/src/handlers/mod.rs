pub mod api;
pub mod events;
pub mod rpc;
pub mod ws;

pub use api::{api_routes, entity_routes};
pub use rpc::rpc_routes;
pub use ws::ws_handler;

use axum::http::HeaderMap;

/// Caller identity, taken from the `x-user-id` header when present
pub(crate) fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
