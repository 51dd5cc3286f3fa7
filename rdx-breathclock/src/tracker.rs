//! The State Tracker: a single task that owns the [`BreathState`].
//!
//! Callers never touch the state directly. They hold a cloneable
//! [`StateTracker`] handle and send it requests over a channel; the owning
//! task applies them one at a time, so concurrent writers are serialized and
//! the last writer wins.

use crate::error::TrackerError;
use crate::state::{BreathState, Climate, PhaseTable, Snapshot};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Source of "now" for phase arithmetic.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const REQUEST_CAPACITY: usize = 64;

/// The wall clock.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// A partial update applied field by field through the guarded mutators.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatePatch {
    #[serde(default)]
    pub usage: Option<f64>,
    #[serde(default)]
    pub climate: Option<String>,
    #[serde(default)]
    pub drift: Option<bool>,
    #[serde(default)]
    pub caesura: Option<bool>,
}

enum Request {
    Snapshot(oneshot::Sender<Snapshot>),
    SetUsage(f64, oneshot::Sender<f64>),
    SetClimate(String, oneshot::Sender<Climate>),
    MarkDrift(bool),
    MarkCaesura(bool),
    Apply(StatePatch, oneshot::Sender<Snapshot>),
    Reset(oneshot::Sender<Snapshot>),
}

/// Handle to the task that owns the breath state.
#[derive(Clone)]
pub struct StateTracker {
    tx: mpsc::Sender<Request>,
}

impl StateTracker {
    /// Spawns the owning task with `epoch = now`.
    pub fn spawn(table: PhaseTable) -> Self {
        Self::spawn_with_clock(table, system_clock())
    }

    pub fn spawn_with_clock(table: PhaseTable, clock: Clock) -> Self {
        let state = BreathState::new(table, clock());
        let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
        info!(epoch = %state.epoch(), "State tracker started");
        tokio::spawn(owner_loop(state, clock, rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, TrackerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(build(reply_tx)).await.map_err(|_| TrackerError)?;
        reply_rx.await.map_err(|_| TrackerError)
    }

    pub async fn snapshot(&self) -> Result<Snapshot, TrackerError> {
        self.request(Request::Snapshot).await
    }

    pub async fn phase(&self) -> Result<String, TrackerError> {
        Ok(self.snapshot().await?.phase)
    }

    pub async fn phase_progress(&self) -> Result<f64, TrackerError> {
        Ok(self.snapshot().await?.phase_progress)
    }

    pub async fn usage(&self) -> Result<f64, TrackerError> {
        Ok(self.snapshot().await?.usage)
    }

    /// Stores `x` clamped to `[0, 1]` and returns the stored value.
    pub async fn set_usage(&self, x: f64) -> Result<f64, TrackerError> {
        self.request(|reply| Request::SetUsage(x, reply)).await
    }

    pub async fn climate(&self) -> Result<Climate, TrackerError> {
        Ok(self.snapshot().await?.climate)
    }

    /// Applies `value` if it is a climate name and returns the climate in
    /// effect afterwards. Unknown values are dropped without error.
    pub async fn set_climate(&self, value: impl Into<String>) -> Result<Climate, TrackerError> {
        let value = value.into();
        self.request(|reply| Request::SetClimate(value, reply)).await
    }

    pub async fn mark_drift(&self, flag: bool) -> Result<(), TrackerError> {
        self.tx
            .send(Request::MarkDrift(flag))
            .await
            .map_err(|_| TrackerError)
    }

    pub async fn mark_caesura(&self, flag: bool) -> Result<(), TrackerError> {
        self.tx
            .send(Request::MarkCaesura(flag))
            .await
            .map_err(|_| TrackerError)
    }

    /// Applies every present field of `patch` in one step.
    pub async fn apply(&self, patch: StatePatch) -> Result<Snapshot, TrackerError> {
        self.request(|reply| Request::Apply(patch, reply)).await
    }

    pub async fn reset(&self) -> Result<Snapshot, TrackerError> {
        self.request(Request::Reset).await
    }
}

async fn owner_loop(mut state: BreathState, clock: Clock, mut rx: mpsc::Receiver<Request>) {
    while let Some(request) = rx.recv().await {
        match request {
            Request::Snapshot(reply) => {
                reply.send(state.snapshot(clock())).ok();
            }
            Request::SetUsage(x, reply) => {
                state.set_usage(x);
                reply.send(state.usage()).ok();
            }
            Request::SetClimate(value, reply) => {
                apply_climate(&mut state, &value);
                reply.send(state.climate()).ok();
            }
            Request::MarkDrift(flag) => state.mark_drift(flag),
            Request::MarkCaesura(flag) => state.mark_caesura(flag),
            Request::Apply(patch, reply) => {
                if let Some(x) = patch.usage {
                    state.set_usage(x);
                }
                if let Some(value) = patch.climate.as_deref() {
                    apply_climate(&mut state, value);
                }
                if let Some(flag) = patch.drift {
                    state.mark_drift(flag);
                }
                if let Some(flag) = patch.caesura {
                    state.mark_caesura(flag);
                }
                reply.send(state.snapshot(clock())).ok();
            }
            Request::Reset(reply) => {
                state.reset(clock());
                info!(epoch = %state.epoch(), "Breath state reset");
                reply.send(state.snapshot(clock())).ok();
            }
        }
    }
    debug!("State tracker stopped: all handles dropped");
}

fn apply_climate(state: &mut BreathState, value: &str) {
    if !state.set_climate(value) {
        debug!(value, "Ignoring unknown climate value");
    }
}
