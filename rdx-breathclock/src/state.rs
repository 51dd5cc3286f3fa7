//! The canonical breath state and the pure functions that derive from it.
//!
//! Nothing in here reads the wall clock. Every derivation takes `now`
//! explicitly so the same state can be asked "what phase is it at T0+3h?"
//! without sleeping. The owning task in [`crate::tracker`] supplies
//! `Utc::now()` in production.

use crate::common::PhaseName;
use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of one full breath cycle.
pub const CYCLE_HOURS: f64 = 24.0;

const SUM_TOLERANCE: f64 = 1e-9;

/// Progress reported once the cycle has run past its last phase.
const PROGRESS_CEILING: f64 = 1.0 - f64::EPSILON;

/// One named segment of the cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: PhaseName,
    pub hours: f64,
}

impl PhaseSpec {
    pub fn new(name: impl Into<PhaseName>, hours: f64) -> Self {
        Self {
            name: name.into(),
            hours,
        }
    }
}

/// An ordered phase table whose durations sum to exactly 24 hours.
///
/// The invariant is checked once in [`PhaseTable::new`]; a table that exists
/// is a valid table.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseTable {
    phases: Vec<PhaseSpec>,
}

impl PhaseTable {
    pub fn new(phases: Vec<PhaseSpec>) -> Result<Self, ConfigError> {
        if phases.is_empty() {
            return Err(ConfigError::EmptyPhaseTable);
        }
        for (i, phase) in phases.iter().enumerate() {
            if !phase.hours.is_finite() || phase.hours <= 0.0 {
                return Err(ConfigError::PhaseDuration {
                    name: phase.name.clone(),
                    hours: phase.hours,
                });
            }
            if phases[..i].iter().any(|p| p.name == phase.name) {
                return Err(ConfigError::DuplicatePhase(phase.name.clone()));
            }
        }
        let sum: f64 = phases.iter().map(|p| p.hours).sum();
        if (sum - CYCLE_HOURS).abs() > SUM_TOLERANCE {
            return Err(ConfigError::PhaseSum(sum));
        }
        Ok(Self { phases })
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn contains(&self, name: &str) -> bool {
        self.phases.iter().any(|p| p.name == name)
    }

    /// The terminal phase of the cycle.
    pub fn last(&self) -> &PhaseSpec {
        // Non-empty by construction.
        &self.phases[self.phases.len() - 1]
    }

    /// Finds the phase containing `elapsed_hours` and how far into it we are.
    ///
    /// Elapsed time past the end of the table does not wrap: the last phase
    /// is returned with its progress pinned just below 1. Negative elapsed
    /// time (epoch in the future) reports the first phase at 0.
    pub fn locate(&self, elapsed_hours: f64) -> (&PhaseSpec, f64) {
        if elapsed_hours.is_nan() || elapsed_hours <= 0.0 {
            return (&self.phases[0], 0.0);
        }
        let mut start = 0.0;
        for phase in &self.phases {
            let end = start + phase.hours;
            if elapsed_hours < end {
                return (phase, (elapsed_hours - start) / phase.hours);
            }
            start = end;
        }
        (self.last(), PROGRESS_CEILING)
    }
}

impl Default for PhaseTable {
    fn default() -> Self {
        Self {
            phases: default_phases(),
        }
    }
}

/// `inhale:2, hold:4, exhale:4, return:4, night_hold:10`.
pub fn default_phases() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec::new("inhale", 2.0),
        PhaseSpec::new("hold", 4.0),
        PhaseSpec::new("exhale", 4.0),
        PhaseSpec::new("return", 4.0),
        PhaseSpec::new("night_hold", 10.0),
    ]
}

/// Coarse operational-risk gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Climate {
    #[default]
    Clear,
    Suspicious,
    Restricted,
}

impl Climate {
    pub const ALL: [Climate; 3] = [Climate::Clear, Climate::Suspicious, Climate::Restricted];

    pub fn as_str(&self) -> &'static str {
        match self {
            Climate::Clear => "clear",
            Climate::Suspicious => "suspicious",
            Climate::Restricted => "restricted",
        }
    }
}

impl fmt::Display for Climate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not one of the three climate values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown climate '{0}'")]
pub struct UnknownClimate(pub String);

impl FromStr for Climate {
    type Err = UnknownClimate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Climate::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownClimate(s.to_string()))
    }
}

/// A full point-in-time reading of the breath state.
///
/// This is the heartbeat payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub phase: PhaseName,
    pub phase_progress: f64,
    pub usage: f64,
    pub climate: Climate,
    #[serde(default)]
    pub drift: bool,
    #[serde(default)]
    pub caesura: bool,
    pub epoch: DateTime<Utc>,
}

/// The subset of a snapshot served by `GET /state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateView {
    pub phase: PhaseName,
    pub phase_progress: f64,
    pub usage: f64,
    pub climate: Climate,
}

impl From<&Snapshot> for StateView {
    fn from(s: &Snapshot) -> Self {
        Self {
            phase: s.phase.clone(),
            phase_progress: s.phase_progress,
            usage: s.usage,
            climate: s.climate,
        }
    }
}

/// The authoritative breath state. Exactly one instance exists per process,
/// owned by the tracker task.
#[derive(Debug, Clone)]
pub struct BreathState {
    table: PhaseTable,
    epoch: DateTime<Utc>,
    usage: f64,
    climate: Climate,
    drift: bool,
    caesura: bool,
}

impl BreathState {
    pub fn new(table: PhaseTable, now: DateTime<Utc>) -> Self {
        Self {
            table,
            epoch: now,
            usage: 0.0,
            climate: Climate::Clear,
            drift: false,
            caesura: false,
        }
    }

    pub fn table(&self) -> &PhaseTable {
        &self.table
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    fn elapsed_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.epoch).num_milliseconds() as f64 / 3_600_000.0
    }

    pub fn phase_at(&self, now: DateTime<Utc>) -> &str {
        &self.table.locate(self.elapsed_hours(now)).0.name
    }

    /// Fraction of the current phase already elapsed, in `[0, 1)`.
    pub fn phase_progress_at(&self, now: DateTime<Utc>) -> f64 {
        self.table.locate(self.elapsed_hours(now)).1
    }

    pub fn usage(&self) -> f64 {
        self.usage
    }

    /// Stores `x` clamped to `[0, 1]`. NaN is ignored.
    pub fn set_usage(&mut self, x: f64) {
        if x.is_nan() {
            return;
        }
        self.usage = x.clamp(0.0, 1.0);
    }

    pub fn climate(&self) -> Climate {
        self.climate
    }

    /// Applies `value` if it names a climate. Anything else leaves the
    /// current climate untouched; the return value only reports which
    /// happened.
    pub fn set_climate(&mut self, value: &str) -> bool {
        match value.parse::<Climate>() {
            Ok(climate) => {
                self.climate = climate;
                true
            }
            Err(_) => false,
        }
    }

    pub fn drift(&self) -> bool {
        self.drift
    }

    pub fn caesura(&self) -> bool {
        self.caesura
    }

    pub fn mark_drift(&mut self, flag: bool) {
        self.drift = flag;
    }

    pub fn mark_caesura(&mut self, flag: bool) {
        self.caesura = flag;
    }

    /// Starts a fresh cycle at `now` with every other field at its default.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.epoch = now;
        self.usage = 0.0;
        self.climate = Climate::Clear;
        self.drift = false;
        self.caesura = false;
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Snapshot {
        let (phase, progress) = self.table.locate(self.elapsed_hours(now));
        Snapshot {
            phase: phase.name.clone(),
            phase_progress: progress,
            usage: self.usage,
            climate: self.climate,
            drift: self.drift,
            caesura: self.caesura,
            epoch: self.epoch,
        }
    }
}
