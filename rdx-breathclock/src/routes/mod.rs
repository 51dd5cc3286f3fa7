//! The HTTP surface: one handler module per endpoint group.

pub mod events;
pub mod health;
pub mod state;
pub mod status;
pub mod stream;

use crate::broadcaster::Broadcaster;
use crate::tracker::StateTracker;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::time::Instant;

/// Shared state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub tracker: StateTracker,
    pub broadcaster: Broadcaster,
    pub start_time: Instant,
}

/// Build the complete axum router.
pub fn build_router(tracker: StateTracker, broadcaster: Broadcaster) -> Router {
    let state = AppState {
        tracker,
        broadcaster,
        start_time: Instant::now(),
    };

    Router::new()
        .route("/health", get(health::get_health))
        .route("/stream", get(stream::get_stream))
        .route("/status", get(status::get_status))
        .route("/state", get(state::get_state).post(state::post_state))
        .route("/state/reset", post(state::post_reset))
        .route("/events", post(events::post_event))
        .route("/test", get(events::get_test))
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .with_state(state)
}

/// `{"error": ..}` with the given status.
pub(crate) fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.to_string() })),
    )
        .into_response()
}
