//! `GET /stream`: the long-lived subscriber feed.
//!
//! Each connection owns one [`Subscription`](crate::broadcaster::Subscription).
//! When the client goes away axum drops the response stream, which drops the
//! subscription and unsubscribes it.

use crate::events::StreamEvent;
use crate::routes::{error_response, AppState};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use std::convert::Infallible;
use tracing::warn;

pub async fn get_stream(State(state): State<AppState>) -> Response {
    match state.broadcaster.subscribe().await {
        Ok(subscription) => {
            let frames = subscription
                .into_stream()
                .map(|event| Ok::<_, Infallible>(to_sse_event(&event)));
            Sse::new(frames).into_response()
        }
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

/// `event: <kind>` with the whole event as JSON data.
fn to_sse_event(event: &StreamEvent) -> Event {
    let frame = Event::default().event(event.kind.as_str());
    match serde_json::to_string(event) {
        Ok(json) => frame.data(json),
        Err(e) => {
            warn!(%e, kind = %event.kind, "Failed to encode event");
            frame.data("{}")
        }
    }
}
