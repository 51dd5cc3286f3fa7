//! Error types for the Breathclock library.
//!
//! Each concern gets its own enum. Binaries fold them into `anyhow::Error`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Problems found while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("phase table is empty")]
    EmptyPhaseTable,

    #[error("phase durations must sum to 24 hours, got {0}")]
    PhaseSum(f64),

    #[error("phase '{name}' has a non-positive duration ({hours}h)")]
    PhaseDuration { name: String, hours: f64 },

    #[error("phase '{0}' appears more than once")]
    DuplicatePhase(String),

    #[error("invalid configuration value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

/// Problems found while building the action registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("action '{0}' is registered more than once")]
    DuplicateAction(String),

    #[error("action '{action_id}' references missing script {}", path.display())]
    MissingScript { action_id: String, path: PathBuf },

    #[error("action '{action_id}' has an unknown trigger value '{value}'")]
    UnknownTriggerValue { action_id: String, value: String },

    #[error("action '{action_id}' has usage threshold {value} outside [0, 1]")]
    ThresholdOutOfRange { action_id: String, value: f64 },

    #[error("failed to create archival script {}: {source}", path.display())]
    Archival {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A relayed envelope or stream frame that is not structurally well-formed.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope is missing the '{0}' field")]
    MissingField(&'static str),

    #[error("envelope field '{0}' has the wrong type")]
    WrongType(&'static str),

    #[error("unknown event kind '{0}'")]
    UnknownKind(String),
}

/// Why a dispatched action did not succeed.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("wait failed: {0}")]
    Wait(#[source] std::io::Error),
}

/// Why one connection to the event stream ended.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no data for {0:?}")]
    Idle(Duration),
}

/// The tracker's owning task is no longer running.
#[derive(Debug, Error)]
#[error("state tracker is not running")]
pub struct TrackerError;

/// The broadcaster's loop is no longer running.
#[derive(Debug, Error)]
#[error("event broadcaster is not running")]
pub struct BroadcasterError;
