//! HTTP surface of a running session.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;

use crate::web::bridge::WsBridge;
use crate::web::origin;

/// State shared across routes.
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<WsBridge>,
    pub session_id: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route("/healthz", get(healthz))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

/// GET / — the embedded browser terminal page.
async fn serve_index() -> Html<&'static str> {
    Html(include_str!("../../web/index.html"))
}

/// GET /healthz — used by the supervisor before tunnel startup and by
/// anything that wants to know which session answers on this port.
async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "id": state.session_id }))
}

/// GET /ws — origin-checked upgrade into the bridge.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin_header = header_str(&headers, header::ORIGIN);
    let host_header = header_str(&headers, header::HOST);
    if !origin::is_origin_allowed(&origin_header, &host_header) {
        tracing::warn!(origin = %origin_header, host = %host_header, "rejected cross-origin upgrade");
        return StatusCode::FORBIDDEN.into_response();
    }
    let bridge = Arc::clone(&state.bridge);
    ws.on_upgrade(move |socket| bridge.handle_socket(socket))
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_string()
}
