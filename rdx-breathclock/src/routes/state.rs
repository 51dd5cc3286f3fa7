//! `/state`: read the tracker on demand and apply operator mutations.

use crate::error::TrackerError;
use crate::routes::{error_response, AppState};
use crate::state::{Snapshot, StateView};
use crate::tracker::StatePatch;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

fn view(result: Result<Snapshot, TrackerError>) -> Response {
    match result {
        Ok(snapshot) => (StatusCode::OK, Json(StateView::from(&snapshot))).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

pub async fn get_state(State(state): State<AppState>) -> Response {
    view(state.tracker.snapshot().await)
}

/// Applies `{usage?, climate?, drift?, caesura?}`. Out-of-range usage is
/// clamped and unknown climates are ignored, exactly as in-process callers
/// see it.
pub async fn post_state(
    State(state): State<AppState>,
    Json(patch): Json<StatePatch>,
) -> Response {
    view(state.tracker.apply(patch).await)
}

pub async fn post_reset(State(state): State<AppState>) -> Response {
    view(state.tracker.reset().await)
}
