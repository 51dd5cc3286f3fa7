//! External event injection and the smoke-test emitter.

use crate::events::{ExternalEnvelope, StreamEvent};
use crate::routes::{error_response, AppState};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    pub status: &'static str,
    pub listener_count: usize,
}

/// `POST /events`: relays `{event, timestamp, data}` verbatim. Bodies that
/// are not well-formed envelopes are refused and never reach subscribers.
pub async fn post_event(State(state): State<AppState>, body: Bytes) -> Response {
    let envelope = match ExternalEnvelope::parse(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(%e, "Dropping malformed envelope");
            return error_response(StatusCode::BAD_REQUEST, e);
        }
    };
    let name = envelope.event.clone();
    match state.broadcaster.relay(envelope).await {
        Ok(listener_count) => {
            info!(event = %name, listener_count, "Relayed external event");
            (
                StatusCode::OK,
                Json(RelayResponse {
                    status: "relayed",
                    listener_count,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

/// `GET /test`: broadcasts one sample event and returns it.
pub async fn get_test(State(state): State<AppState>) -> Response {
    let event = StreamEvent::relayed(ExternalEnvelope::now(
        "smoke_test",
        json!({ "message": "breathclock test event" }),
    ));
    match state.broadcaster.publish(event.clone()).await {
        Ok(_) => (StatusCode::OK, Json(event)).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}
