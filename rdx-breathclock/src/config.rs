//! Defines all configuration structures for the Breathclock engine.
//!
//! These structs are deserialized with `serde` from layered sources built by
//! the `config` crate: built-in defaults, then an optional TOML file, then
//! `BREATH__*` environment variables. The phase table, tick cadence and the
//! scheduler's action registry are all defined here rather than in code.

use crate::error::ConfigError;
use crate::state::{default_phases, PhaseSpec, PhaseTable};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_STEM: &str = "breath";

/// The top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BreathConfig {
    pub server: ServerConfig,
    pub tracker: TrackerConfig,
    pub broadcaster: BroadcasterConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP surface binds to.
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Ordered phase table. Durations must sum to 24.
    pub phases: Vec<PhaseSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    pub tick_millis: u64,
    /// Minimum absolute usage change that produces a `usage_update`.
    pub usage_delta: f64,
    /// Idle time on a subscriber stream before a `keepalive` is sent.
    pub keepalive_secs: u64,
    pub mailbox_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub stream_url: String,
    pub reconnect_delay_secs: u64,
    pub memo_capacity: usize,
    /// Heartbeat usage within this distance of a threshold counts as a match.
    pub usage_epsilon: f64,
    pub default_timeout_secs: u64,
    /// Base directory for relative script paths.
    pub script_dir: PathBuf,
    pub archival: ArchivalConfig,
    pub night_hold: NightHoldConfig,
    pub actions: Vec<ActionConfig>,
}

/// The action that always runs on entering the archival phase.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchivalConfig {
    pub action_id: String,
    pub script: PathBuf,
    pub phase: String,
    pub timeout_secs: Option<u64>,
}

/// Throttle for the long terminal phase.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NightHoldConfig {
    pub phase: String,
    /// Actions for `phase` run only on every Nth observed entry into it.
    pub every: u32,
}

/// What kind of transition an action listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Phase,
    Climate,
    Usage,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Phase => "phase",
            TriggerKind::Climate => "climate",
            TriggerKind::Usage => "usage",
        }
    }
}

/// A trigger value as written in the file: a name or a threshold.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TriggerValue {
    Number(f64),
    Text(String),
}

impl std::fmt::Display for TriggerValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerValue::Number(n) => write!(f, "{n}"),
            TriggerValue::Text(s) => f.write_str(s),
        }
    }
}

/// Which way a usage threshold must be crossed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Crossing {
    Rising,
    Falling,
    #[default]
    Both,
}

/// One `[[scheduler.actions]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActionConfig {
    pub id: String,
    pub trigger: TriggerKind,
    pub value: TriggerValue,
    pub script: PathBuf,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub direction: Crossing,
}

// --- Default values ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7070".to_string(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            phases: default_phases(),
        }
    }
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            tick_millis: 1000,
            usage_delta: 0.05,
            keepalive_secs: 30,
            mailbox_capacity: 256,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stream_url: "http://127.0.0.1:7070/stream".to_string(),
            reconnect_delay_secs: 5,
            memo_capacity: 50,
            usage_epsilon: 0.01,
            default_timeout_secs: 30,
            script_dir: PathBuf::from("rituals"),
            archival: ArchivalConfig::default(),
            night_hold: NightHoldConfig::default(),
            actions: Vec::new(),
        }
    }
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self {
            action_id: "archive_cycle".to_string(),
            script: PathBuf::from("archive_cycle.sh"),
            phase: "return".to_string(),
            timeout_secs: None,
        }
    }
}

impl Default for NightHoldConfig {
    fn default() -> Self {
        Self {
            phase: "night_hold".to_string(),
            every: 3,
        }
    }
}

impl BroadcasterConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

impl SchedulerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

impl BreathConfig {
    /// Loads defaults, then `path` (or `breath.toml` if present), then the
    /// environment, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_STEM).required(false),
        };
        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("BREATH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: BreathConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document on top of the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        let config: BreathConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn phase_table(&self) -> Result<PhaseTable, ConfigError> {
        PhaseTable::new(self.tracker.phases.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.phase_table()?;
        let b = &self.broadcaster;
        if b.tick_millis == 0 {
            return Err(invalid("broadcaster.tick_millis", "must be positive"));
        }
        if !(0.0..=1.0).contains(&b.usage_delta) {
            return Err(invalid("broadcaster.usage_delta", "must lie in [0, 1]"));
        }
        if b.keepalive_secs == 0 {
            return Err(invalid("broadcaster.keepalive_secs", "must be positive"));
        }
        if b.mailbox_capacity == 0 {
            return Err(invalid("broadcaster.mailbox_capacity", "must be positive"));
        }
        let s = &self.scheduler;
        if s.memo_capacity == 0 {
            return Err(invalid("scheduler.memo_capacity", "must be positive"));
        }
        if s.night_hold.every == 0 {
            return Err(invalid("scheduler.night_hold.every", "must be positive"));
        }
        if !(0.0..1.0).contains(&s.usage_epsilon) {
            return Err(invalid("scheduler.usage_epsilon", "must lie in [0, 1)"));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BreathConfig::default();
        config.validate().unwrap();
        assert_eq!(config.phase_table().unwrap().phases().len(), 5);
        assert_eq!(config.scheduler.memo_capacity, 50);
        assert_eq!(config.broadcaster.keepalive(), Duration::from_secs(30));
    }

    #[test]
    fn toml_overrides_and_actions() {
        let config = BreathConfig::from_toml_str(
            r#"
            [server]
            bind = "0.0.0.0:9000"

            [broadcaster]
            tick_millis = 250

            [scheduler]
            script_dir = "/opt/rituals"

            [[scheduler.actions]]
            id = "lantern"
            trigger = "phase"
            value = "exhale"
            script = "lantern.sh"

            [[scheduler.actions]]
            id = "cool_down"
            trigger = "usage"
            value = 0.3
            script = "cool_down.sh"
            direction = "rising"
            timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.broadcaster.tick(), Duration::from_millis(250));
        assert_eq!(config.broadcaster.usage_delta, 0.05);
        assert_eq!(config.scheduler.actions.len(), 2);
        let usage = &config.scheduler.actions[1];
        assert_eq!(usage.trigger, TriggerKind::Usage);
        assert_eq!(usage.value, TriggerValue::Number(0.3));
        assert_eq!(usage.direction, Crossing::Rising);
        assert_eq!(usage.timeout_secs, Some(5));
        assert_eq!(config.scheduler.actions[0].direction, Crossing::Both);
    }

    #[test]
    fn phase_table_that_misses_a_day_is_rejected() {
        let err = BreathConfig::from_toml_str(
            r#"
            [[tracker.phases]]
            name = "inhale"
            hours = 2.0

            [[tracker.phases]]
            name = "rest"
            hours = 20.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::PhaseSum(_)));
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breath.toml");
        std::fs::write(&path, "[broadcaster]\nusage_delta = 0.1\n").unwrap();
        let config = BreathConfig::load(Some(&path)).unwrap();
        assert_eq!(config.broadcaster.usage_delta, 0.1);
        assert!(BreathConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn zero_tick_is_rejected() {
        let err = BreathConfig::from_toml_str("[broadcaster]\ntick_millis = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "broadcaster.tick_millis",
                ..
            }
        ));
    }
}
