//! The action registry: which script runs for which trigger.
//!
//! Built once from configuration and validated up front. A script that is
//! referenced but missing stops startup, except for the archival action,
//! whose script is written on first need.

use crate::config::{Crossing, SchedulerConfig, TriggerKind, TriggerValue};
use crate::error::RegistryError;
use crate::state::{Climate, PhaseTable};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// A resolved trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Phase(String),
    Climate(Climate),
    Usage { threshold: f64, direction: Crossing },
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Phase(_) => TriggerKind::Phase,
            Trigger::Climate(_) => TriggerKind::Climate,
            Trigger::Usage { .. } => TriggerKind::Usage,
        }
    }
}

/// One registered action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDescriptor {
    pub action_id: String,
    pub trigger: Trigger,
    pub script: PathBuf,
    pub timeout: Duration,
}

const ARCHIVAL_SCRIPT: &str = r#"#!/bin/sh
# Appends one JSON line per completed cycle.
dir="$(dirname "$0")"
printf '{"phase":"%s","climate":"%s","usage":"%s","context":%s}\n' \
    "$PHASE" "$CLIMATE" "$USAGE" "${CONTEXT:-null}" >> "$dir/archive.log"
"#;

#[derive(Debug, Clone)]
pub struct ActionRegistry {
    actions: Vec<ActionDescriptor>,
    archival: ActionDescriptor,
    night_hold_phase: String,
    night_hold_every: u32,
}

fn resolve(dir: &Path, script: &Path) -> PathBuf {
    if script.is_absolute() {
        script.to_path_buf()
    } else {
        dir.join(script)
    }
}

impl ActionRegistry {
    /// Resolves and validates every configured action against `table`.
    pub fn from_config(
        config: &SchedulerConfig,
        table: &PhaseTable,
    ) -> Result<Self, RegistryError> {
        let default_timeout = config.default_timeout();
        let archival_cfg = &config.archival;
        if !table.contains(&archival_cfg.phase) {
            return Err(RegistryError::UnknownTriggerValue {
                action_id: archival_cfg.action_id.clone(),
                value: archival_cfg.phase.clone(),
            });
        }
        if !table.contains(&config.night_hold.phase) {
            return Err(RegistryError::UnknownTriggerValue {
                action_id: "night_hold".to_string(),
                value: config.night_hold.phase.clone(),
            });
        }
        let archival = ActionDescriptor {
            action_id: archival_cfg.action_id.clone(),
            trigger: Trigger::Phase(archival_cfg.phase.clone()),
            script: resolve(&config.script_dir, &archival_cfg.script),
            timeout: archival_cfg
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
        };

        let mut seen = HashSet::from([archival.action_id.clone()]);
        let mut actions = Vec::with_capacity(config.actions.len());
        for entry in &config.actions {
            if !seen.insert(entry.id.clone()) {
                return Err(RegistryError::DuplicateAction(entry.id.clone()));
            }
            let unknown = || RegistryError::UnknownTriggerValue {
                action_id: entry.id.clone(),
                value: entry.value.to_string(),
            };
            let trigger = match (entry.trigger, &entry.value) {
                (TriggerKind::Phase, TriggerValue::Text(name)) if table.contains(name) => {
                    Trigger::Phase(name.clone())
                }
                (TriggerKind::Climate, TriggerValue::Text(value)) => {
                    Trigger::Climate(value.parse().map_err(|_| unknown())?)
                }
                (TriggerKind::Usage, TriggerValue::Number(threshold)) => {
                    if !(0.0..=1.0).contains(threshold) {
                        return Err(RegistryError::ThresholdOutOfRange {
                            action_id: entry.id.clone(),
                            value: *threshold,
                        });
                    }
                    Trigger::Usage {
                        threshold: *threshold,
                        direction: entry.direction,
                    }
                }
                _ => return Err(unknown()),
            };
            let script = resolve(&config.script_dir, &entry.script);
            if !script.is_file() {
                return Err(RegistryError::MissingScript {
                    action_id: entry.id.clone(),
                    path: script,
                });
            }
            actions.push(ActionDescriptor {
                action_id: entry.id.clone(),
                trigger,
                script,
                timeout: entry
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(default_timeout),
            });
        }

        info!(
            actions = actions.len(),
            archival = %archival.action_id,
            "Action registry loaded"
        );
        Ok(Self {
            actions,
            archival,
            night_hold_phase: config.night_hold.phase.clone(),
            night_hold_every: config.night_hold.every.max(1),
        })
    }

    pub fn actions(&self) -> &[ActionDescriptor] {
        &self.actions
    }

    pub fn for_phase<'a>(&'a self, phase: &'a str) -> impl Iterator<Item = &'a ActionDescriptor> {
        self.actions
            .iter()
            .filter(move |a| matches!(&a.trigger, Trigger::Phase(p) if p == phase))
    }

    pub fn for_climate(&self, climate: Climate) -> impl Iterator<Item = &ActionDescriptor> {
        self.actions
            .iter()
            .filter(move |a| matches!(a.trigger, Trigger::Climate(c) if c == climate))
    }

    pub fn usage_actions(&self) -> impl Iterator<Item = &ActionDescriptor> {
        self.actions
            .iter()
            .filter(|a| matches!(a.trigger, Trigger::Usage { .. }))
    }

    pub fn archival(&self) -> &ActionDescriptor {
        &self.archival
    }

    pub fn archival_phase(&self) -> &str {
        match &self.archival.trigger {
            Trigger::Phase(phase) => phase,
            _ => "",
        }
    }

    pub fn night_hold_phase(&self) -> &str {
        &self.night_hold_phase
    }

    pub fn night_hold_every(&self) -> u32 {
        self.night_hold_every
    }

    /// Writes the archival script if it does not exist yet.
    pub fn ensure_archival_script(&self) -> Result<(), RegistryError> {
        let path = &self.archival.script;
        if path.is_file() {
            return Ok(());
        }
        let wrap = |source| RegistryError::Archival {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(wrap)?;
        }
        std::fs::write(path, ARCHIVAL_SCRIPT).map_err(wrap)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(wrap)?;
        }
        info!(path = %path.display(), "Created archival script");
        Ok(())
    }
}
