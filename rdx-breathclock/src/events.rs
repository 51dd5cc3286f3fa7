//! Defines the events carried on the subscriber stream.
//!
//! This module is the wire contract between the broadcaster and everything
//! that listens to it, the scheduler included. An event is immutable once
//! built; the broadcaster stamps it at emission time.

use crate::error::EnvelopeError;
use crate::state::{Climate, Snapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PhaseUpdate,
    ClimateUpdate,
    UsageUpdate,
    Heartbeat,
    CaesuraDetected,
    DriftDetected,
    RelayedExternal,
    Keepalive,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::PhaseUpdate,
        EventKind::ClimateUpdate,
        EventKind::UsageUpdate,
        EventKind::Heartbeat,
        EventKind::CaesuraDetected,
        EventKind::DriftDetected,
        EventKind::RelayedExternal,
        EventKind::Keepalive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PhaseUpdate => "phase_update",
            EventKind::ClimateUpdate => "climate_update",
            EventKind::UsageUpdate => "usage_update",
            EventKind::Heartbeat => "heartbeat",
            EventKind::CaesuraDetected => "caesura_detected",
            EventKind::DriftDetected => "drift_detected",
            EventKind::RelayedExternal => "relayed_external",
            EventKind::Keepalive => "keepalive",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownKind(s.to_string()))
    }
}

/// Where a relayed event came from, copied from the injected envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    pub event: String,
    pub timestamp: Value,
}

/// One unit on the subscriber stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

fn context(snapshot: &Snapshot) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    map.insert("phase".into(), json!(snapshot.phase));
    map.insert("climate".into(), json!(snapshot.climate));
    map.insert("usage".into(), json!(snapshot.usage));
    map
}

impl StreamEvent {
    fn now(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            payload,
            origin: None,
        }
    }

    /// Full snapshot, sent every tick and to every new subscriber.
    pub fn heartbeat(snapshot: &Snapshot) -> Self {
        let payload =
            serde_json::to_value(snapshot).unwrap_or_else(|_| Value::Object(context(snapshot)));
        Self::now(EventKind::Heartbeat, payload)
    }

    /// A field changed. The payload carries the current phase, climate and
    /// usage plus the value the field held before.
    pub fn update(kind: EventKind, snapshot: &Snapshot, previous: Value) -> Self {
        let mut payload = context(snapshot);
        payload.insert("previous".into(), previous);
        Self::now(kind, Value::Object(payload))
    }

    pub fn phase_update(snapshot: &Snapshot, previous: &str) -> Self {
        Self::update(EventKind::PhaseUpdate, snapshot, json!(previous))
    }

    pub fn climate_update(snapshot: &Snapshot, previous: Climate) -> Self {
        Self::update(EventKind::ClimateUpdate, snapshot, json!(previous))
    }

    pub fn usage_update(snapshot: &Snapshot, previous: f64) -> Self {
        Self::update(EventKind::UsageUpdate, snapshot, json!(previous))
    }

    pub fn drift_detected(snapshot: &Snapshot) -> Self {
        let mut payload = context(snapshot);
        payload.insert("drift".into(), json!(true));
        Self::now(EventKind::DriftDetected, Value::Object(payload))
    }

    pub fn caesura_detected(snapshot: &Snapshot) -> Self {
        let mut payload = context(snapshot);
        payload.insert("caesura".into(), json!(true));
        Self::now(EventKind::CaesuraDetected, Value::Object(payload))
    }

    pub fn keepalive() -> Self {
        Self::now(EventKind::Keepalive, json!({}))
    }

    /// Wraps an injected envelope. The payload is the envelope's `data`,
    /// untouched.
    pub fn relayed(envelope: ExternalEnvelope) -> Self {
        Self {
            kind: EventKind::RelayedExternal,
            timestamp: Utc::now(),
            payload: envelope.data,
            origin: Some(Origin {
                event: envelope.event,
                timestamp: envelope.timestamp,
            }),
        }
    }

    /// Renders the event as a `event: <kind>\ndata: <json>\n\n` frame.
    pub fn to_frame(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.kind, data)
    }

    /// Rebuilds an event from a parsed frame.
    ///
    /// Frames whose data is a full event object are decoded as such. Frames
    /// that carry a bare payload take their kind from the `event:` line.
    pub fn from_frame(frame: &SseFrame) -> Result<Self, EnvelopeError> {
        let data = frame.data.as_deref().ok_or(EnvelopeError::MissingField("data"))?;
        let value: Value = serde_json::from_str(data)?;
        if value.get("kind").is_some() && value.get("payload").is_some() {
            return Ok(serde_json::from_value(value)?);
        }
        let kind = frame
            .event
            .as_deref()
            .ok_or(EnvelopeError::MissingField("event"))?
            .parse()?;
        Ok(Self::now(kind, value))
    }
}

/// An event authored outside the process, as accepted by the injection
/// endpoint: `{event, timestamp, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEnvelope {
    pub event: String,
    pub timestamp: Value,
    pub data: Value,
}

impl ExternalEnvelope {
    /// An envelope stamped with the current time.
    pub fn now(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            timestamp: json!(Utc::now().to_rfc3339()),
            data,
        }
    }

    /// Checks structure only: an object with a string `event`, a string or
    /// numeric `timestamp`, and a `data` field of any shape.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(mut map) = value else {
            return Err(EnvelopeError::WrongType("envelope"));
        };
        let event = match map.remove("event") {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(_) => return Err(EnvelopeError::WrongType("event")),
            None => return Err(EnvelopeError::MissingField("event")),
        };
        let timestamp = match map.remove("timestamp") {
            Some(ts @ (Value::String(_) | Value::Number(_))) => ts,
            Some(_) => return Err(EnvelopeError::WrongType("timestamp")),
            None => return Err(EnvelopeError::MissingField("timestamp")),
        };
        let data = map.remove("data").ok_or(EnvelopeError::MissingField("data"))?;
        Ok(Self {
            event,
            timestamp,
            data,
        })
    }

    pub fn parse(body: &[u8]) -> Result<Self, EnvelopeError> {
        Self::from_value(serde_json::from_slice(body)?)
    }
}

/// The `event:` and `data:` lines of one stream frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: Option<String>,
}

impl SseFrame {
    /// Parses a frame without its trailing blank line. Comment lines (`:`)
    /// and unknown fields are ignored; repeated `data:` lines are joined with
    /// newlines.
    pub fn parse(text: &str) -> Self {
        let mut frame = SseFrame::default();
        for line in text.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => frame.event = Some(value.to_string()),
                "data" => match frame.data.as_mut() {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => frame.data = Some(value.to_string()),
                },
                _ => {}
            }
        }
        frame
    }

    pub fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_none()
    }
}
