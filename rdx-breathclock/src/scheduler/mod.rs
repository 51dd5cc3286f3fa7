//! The phase-aware scheduler.
//!
//! Consumes the broadcaster's stream and turns transitions into ritual
//! dispatches. Two paths feed it: typed `*_update` events, handled as they
//! arrive, and heartbeats, compared against the scheduler's own last-seen
//! copy so a missed update still fires. Either path may see the same
//! transition; the [`DedupMemo`] is what keeps an action from running twice.
//!
//! Actions run one at a time. The consumption loop does not read the next
//! frame until the current script has exited or been killed.

pub mod client;
pub mod memo;
pub mod registry;
pub mod runner;

pub use client::StreamClient;
pub use memo::{DedupMemo, MemoKey};
pub use registry::{ActionDescriptor, ActionRegistry, Trigger};
pub use runner::{ActionEnv, ActionOutcome, ActionRunner, ScriptRunner};

use crate::config::{Crossing, SchedulerConfig, TriggerKind};
use crate::events::{EventKind, StreamEvent};
use crate::state::Climate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Where the stream client is in its connect cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Streaming,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub dispatched: u64,
    pub skipped_by_memo: u64,
    pub failed: u64,
    /// Night-hold entries that did not fall on the configured interval.
    pub throttled: u64,
}

/// Connection state and counters, published after every change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerReport {
    pub state: ConnectionState,
    pub stats: SchedulerStats,
}

/// The fields the scheduler reads out of any payload. Unknown fields are
/// ignored so relayed or partial payloads never fail the whole frame.
#[derive(Debug, Default, Deserialize)]
struct Observed {
    phase: Option<String>,
    climate: Option<Climate>,
    usage: Option<f64>,
    previous: Option<Value>,
}

#[derive(Debug, Default, Clone)]
struct LastSeen {
    phase: Option<String>,
    climate: Option<Climate>,
    usage: Option<f64>,
}

/// Rising means `from < threshold <= to`; falling is the mirror image.
pub fn crossed(from: f64, to: f64, threshold: f64, direction: Crossing) -> bool {
    let rising = from < threshold && to >= threshold;
    let falling = from >= threshold && to < threshold;
    match direction {
        Crossing::Rising => rising,
        Crossing::Falling => falling,
        Crossing::Both => rising || falling,
    }
}

pub struct Scheduler<R: ActionRunner> {
    registry: ActionRegistry,
    runner: R,
    memo: DedupMemo,
    usage_epsilon: f64,
    last_seen: LastSeen,
    night_hold_entries: u32,
    report: SchedulerReport,
    report_tx: watch::Sender<SchedulerReport>,
}

impl<R: ActionRunner> Scheduler<R> {
    pub fn new(registry: ActionRegistry, runner: R, config: &SchedulerConfig) -> Self {
        let (report_tx, _) = watch::channel(SchedulerReport::default());
        Self {
            registry,
            runner,
            memo: DedupMemo::new(config.memo_capacity),
            usage_epsilon: config.usage_epsilon,
            last_seen: LastSeen::default(),
            night_hold_entries: 0,
            report: SchedulerReport::default(),
            report_tx,
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn memo(&self) -> &DedupMemo {
        &self.memo
    }

    pub fn report(&self) -> SchedulerReport {
        self.report
    }

    /// A receiver that observes every report change.
    pub fn watch(&self) -> watch::Receiver<SchedulerReport> {
        self.report_tx.subscribe()
    }

    pub fn set_connection(&mut self, state: ConnectionState) {
        if self.report.state == state {
            return;
        }
        self.report.state = state;
        let stats = self.report.stats;
        info!(
            %state,
            dispatched = stats.dispatched,
            skipped_by_memo = stats.skipped_by_memo,
            failed = stats.failed,
            "Scheduler connection state changed"
        );
        self.publish();
    }

    fn publish(&self) {
        self.report_tx.send_replace(self.report);
    }

    /// Handles one decoded stream event to completion, including any
    /// actions it triggers.
    pub async fn handle_event(&mut self, event: &StreamEvent) {
        let observed: Observed = match serde_json::from_value(event.payload.clone()) {
            Ok(observed) => observed,
            Err(e) => {
                debug!(kind = %event.kind, %e, "Payload carries no state fields");
                Observed::default()
            }
        };
        match event.kind {
            EventKind::PhaseUpdate => {
                if let Some(phase) = observed.phase {
                    self.on_phase(phase, &event.payload).await;
                }
            }
            EventKind::ClimateUpdate => {
                if let Some(climate) = observed.climate {
                    self.on_climate(climate, &event.payload).await;
                }
            }
            EventKind::UsageUpdate => {
                if let Some(usage) = observed.usage {
                    let from = observed
                        .previous
                        .as_ref()
                        .and_then(Value::as_f64)
                        .or(self.last_seen.usage);
                    self.on_usage(from, usage, false, &event.payload).await;
                }
            }
            EventKind::Heartbeat => self.on_heartbeat(observed, &event.payload).await,
            _ => debug!(kind = %event.kind, "Event has no scheduled actions"),
        }
    }

    async fn on_heartbeat(&mut self, observed: Observed, context: &Value) {
        if let Some(phase) = observed.phase {
            if self.last_seen.phase.as_deref() != Some(phase.as_str()) {
                debug!(%phase, "Phase transition derived from heartbeat");
                self.on_phase(phase, context).await;
            }
        }
        if let Some(climate) = observed.climate {
            if self.last_seen.climate != Some(climate) {
                debug!(%climate, "Climate transition derived from heartbeat");
                self.on_climate(climate, context).await;
            }
        }
        if let Some(usage) = observed.usage {
            if self.last_seen.usage != Some(usage) {
                self.on_usage(self.last_seen.usage, usage, true, context).await;
            }
        }
    }

    async fn on_phase(&mut self, phase: String, context: &Value) {
        let entered = self.last_seen.phase.as_deref() != Some(phase.as_str());
        self.last_seen.phase = Some(phase.clone());

        let mut actions: Vec<ActionDescriptor> = self.registry.for_phase(&phase).cloned().collect();
        if phase == self.registry.night_hold_phase() && !actions.is_empty() {
            if entered {
                self.night_hold_entries += 1;
            }
            let every = self.registry.night_hold_every();
            if self.night_hold_entries % every != 0 {
                if entered {
                    self.report.stats.throttled += 1;
                    self.publish();
                }
                debug!(
                    entries = self.night_hold_entries,
                    every, "Night-hold actions throttled"
                );
                actions.clear();
            }
        }
        if phase == self.registry.archival_phase() {
            match self.registry.ensure_archival_script() {
                Ok(()) => actions.push(self.registry.archival().clone()),
                Err(e) => {
                    warn!(%e, "Archival script unavailable");
                    self.report.stats.failed += 1;
                    self.publish();
                }
            }
        }
        for action in actions {
            self.dispatch(&action, TriggerKind::Phase, context).await;
        }
    }

    async fn on_climate(&mut self, climate: Climate, context: &Value) {
        self.last_seen.climate = Some(climate);
        let actions: Vec<ActionDescriptor> = self.registry.for_climate(climate).cloned().collect();
        for action in actions {
            self.dispatch(&action, TriggerKind::Climate, context).await;
        }
    }

    /// `near` enables the epsilon band used for heartbeat readings.
    async fn on_usage(&mut self, from: Option<f64>, to: f64, near: bool, context: &Value) {
        self.last_seen.usage = Some(to);
        let epsilon = self.usage_epsilon;
        let actions: Vec<ActionDescriptor> = self
            .registry
            .usage_actions()
            .filter(|action| match action.trigger {
                Trigger::Usage {
                    threshold,
                    direction,
                } => {
                    from.is_some_and(|from| crossed(from, to, threshold, direction))
                        || (near && (to - threshold).abs() <= epsilon)
                }
                _ => false,
            })
            .cloned()
            .collect();
        for action in actions {
            self.dispatch(&action, TriggerKind::Usage, context).await;
        }
    }

    fn env_for(&self, trigger: TriggerKind, context: &Value) -> ActionEnv {
        ActionEnv {
            phase: self.last_seen.phase.clone().unwrap_or_default(),
            climate: self.last_seen.climate.unwrap_or_default().as_str().to_string(),
            usage: self.last_seen.usage.unwrap_or_default(),
            trigger,
            context: context.clone(),
        }
    }

    async fn dispatch(&mut self, action: &ActionDescriptor, trigger: TriggerKind, context: &Value) {
        let key = MemoKey::new(action.action_id.clone(), trigger);
        if self.memo.contains(&key) {
            debug!(action = %action.action_id, trigger = trigger.as_str(), "Skipped by memo");
            self.report.stats.skipped_by_memo += 1;
            self.publish();
            return;
        }

        let env = self.env_for(trigger, context);
        info!(action = %action.action_id, trigger = trigger.as_str(), phase = %env.phase, "Dispatching action");
        match self
            .runner
            .run(action, &env)
            .await
            .and_then(ActionOutcome::check)
        {
            Ok(outcome) => {
                info!(
                    action = %action.action_id,
                    elapsed = ?outcome.elapsed,
                    "Action completed"
                );
                if !outcome.stdout.is_empty() {
                    debug!(action = %action.action_id, stdout = %outcome.stdout);
                }
                if !outcome.stderr.is_empty() {
                    info!(action = %action.action_id, stderr = %outcome.stderr, "Action wrote to stderr");
                }
                self.memo.insert(key);
                self.report.stats.dispatched += 1;
            }
            Err(e) => {
                warn!(action = %action.action_id, trigger = trigger.as_str(), %e, "Action failed");
                self.report.stats.failed += 1;
            }
        }
        self.publish();
    }
}
