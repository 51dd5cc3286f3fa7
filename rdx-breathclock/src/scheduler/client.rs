//! The scheduler's long-lived connection to the broadcaster's stream.
//!
//! Reconnects forever with a fixed delay. A connection ends when the server
//! closes it, the read fails, or nothing (not even a keepalive) arrives
//! within the idle timeout.

use crate::config::SchedulerConfig;
use crate::error::StreamError;
use crate::events::{SseFrame, StreamEvent};
use crate::scheduler::{ActionRunner, ConnectionState, Scheduler};
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info, warn};

/// Three missed keepalives.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

fn find_frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

/// Removes and returns the next complete frame, without its terminator.
fn drain_next_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_frame_boundary(buffer)?;
    let frame = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(frame)
}

#[derive(Debug, Clone)]
pub struct StreamClient {
    http: reqwest::Client,
    url: String,
    reconnect_delay: Duration,
    idle_timeout: Duration,
}

impl StreamClient {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_url(config.stream_url.clone(), config.reconnect_delay())
    }

    pub fn with_url(url: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            reconnect_delay,
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Consumes the stream into `scheduler` until `shutdown` fires.
    pub async fn run<R: ActionRunner>(
        &self,
        scheduler: &mut Scheduler<R>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(url = %self.url, "Scheduler stream client started");
        loop {
            scheduler.set_connection(ConnectionState::Connecting);
            let result = tokio::select! {
                biased;
                _ = shutdown.recv() => None,
                result = self.stream_once(scheduler) => Some(result),
            };
            scheduler.set_connection(ConnectionState::Disconnected);
            match result {
                None => break,
                Some(Ok(())) => info!("Event stream closed by server"),
                Some(Err(e)) => warn!(%e, "Event stream failed"),
            }

            debug!(delay = ?self.reconnect_delay, "Reconnecting after delay");
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = time::sleep(self.reconnect_delay) => {}
            }
        }
        info!("Scheduler stream client stopped");
    }

    async fn stream_once<R: ActionRunner>(
        &self,
        scheduler: &mut Scheduler<R>,
    ) -> Result<(), StreamError> {
        let response = self
            .http
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;
        scheduler.set_connection(ConnectionState::Streaming);

        let mut body = response.bytes_stream();
        let mut buffer = Vec::new();
        loop {
            let chunk = match time::timeout(self.idle_timeout, body.next()).await {
                Err(_) => return Err(StreamError::Idle(self.idle_timeout)),
                Ok(None) => return Ok(()),
                Ok(Some(chunk)) => chunk?,
            };
            buffer.extend_from_slice(&chunk);
            while let Some(raw) = drain_next_frame(&mut buffer) {
                if let Some(event) = decode(&raw) {
                    scheduler.handle_event(&event).await;
                }
            }
        }
    }
}

/// Malformed frames are logged and dropped.
fn decode(raw: &[u8]) -> Option<StreamEvent> {
    let Ok(text) = std::str::from_utf8(raw) else {
        warn!(bytes = raw.len(), "Dropping non-UTF-8 frame");
        return None;
    };
    let frame = SseFrame::parse(text);
    if frame.is_empty() {
        return None;
    }
    match StreamEvent::from_frame(&frame) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(%e, event = ?frame.event, "Dropping malformed frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[test]
    fn frames_split_on_either_terminator() {
        let mut buffer = b"event: a\ndata: 1\n\nevent: b\r\ndata: 2\r\n\r\npartial".to_vec();
        assert_eq!(drain_next_frame(&mut buffer).unwrap(), b"event: a\ndata: 1");
        assert_eq!(drain_next_frame(&mut buffer).unwrap(), b"event: b\r\ndata: 2");
        assert!(drain_next_frame(&mut buffer).is_none());
        assert_eq!(buffer, b"partial");
    }

    #[test]
    fn decode_drops_bad_frames() {
        assert!(decode(b": comment only").is_none());
        assert!(decode(b"event: heartbeat\ndata: {not json").is_none());
        assert!(decode(b"event: mystery\ndata: {}").is_none());
        assert!(decode(&[0xff, 0xfe]).is_none());

        let event = decode(b"event: usage_update\ndata: {\"usage\":0.4}").unwrap();
        assert_eq!(event.kind, EventKind::UsageUpdate);
        assert_eq!(event.payload["usage"], 0.4);
    }
}
