//! The Event Broadcaster.
//!
//! A single loop samples the [`StateTracker`] on a fixed tick, turns the
//! differences into [`StreamEvent`]s and pushes each one into every
//! subscriber's mailbox. The subscriber table is owned by that loop alone;
//! the rest of the process reaches it through a cloneable [`Broadcaster`]
//! handle that sends commands.
//!
//! Delivery is per subscriber: each [`Subscription`] drains its own bounded
//! mailbox, so a slow HTTP client never stalls the tick loop. A mailbox that
//! refuses a push (closed or full) gets its subscriber dropped.

use crate::common::SubscriberId;
use crate::config::BroadcasterConfig;
use crate::error::BroadcasterError;
use crate::events::{ExternalEnvelope, StreamEvent};
use crate::state::{Climate, Snapshot};
use crate::tracker::StateTracker;
use futures_util::Stream;
use serde::Serialize;
use slotmap::SlotMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

const COMMAND_CAPACITY: usize = 256;

/// Diagnostic view served by `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStatus {
    pub active_subscriber_count: usize,
    pub last_phase: Option<String>,
    pub last_climate: Option<Climate>,
    pub last_usage: Option<f64>,
}

enum Command {
    Subscribe(oneshot::Sender<(SubscriberId, mpsc::Receiver<StreamEvent>)>),
    Unsubscribe(SubscriberId),
    Publish(StreamEvent, oneshot::Sender<usize>),
    Status(oneshot::Sender<BroadcastStatus>),
}

/// Handle to the running broadcaster loop.
#[derive(Clone)]
pub struct Broadcaster {
    tx: mpsc::Sender<Command>,
    keepalive: Duration,
}

impl Broadcaster {
    /// Spawns the tick loop. It runs until `shutdown_rx` fires.
    pub fn spawn(
        tracker: StateTracker,
        config: BroadcasterConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let keepalive = config.keepalive();
        let state = BroadcastLoop {
            tracker,
            config,
            subscribers: SlotMap::with_key(),
            last: None,
        };
        tokio::spawn(state.run(rx, shutdown_rx));
        Self { tx, keepalive }
    }

    /// Registers a subscriber. Its mailbox already holds one heartbeat with
    /// the live snapshot.
    pub async fn subscribe(&self) -> Result<Subscription, BroadcasterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe(reply_tx))
            .await
            .map_err(|_| BroadcasterError)?;
        let (id, mailbox) = reply_rx.await.map_err(|_| BroadcasterError)?;
        Ok(Subscription {
            id,
            mailbox,
            keepalive: self.keepalive,
            _guard: UnsubscribeGuard {
                id,
                tx: self.tx.clone(),
            },
        })
    }

    /// Fans `event` out to every subscriber and returns how many still hold
    /// it afterwards.
    pub async fn publish(&self, event: StreamEvent) -> Result<usize, BroadcasterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Publish(event, reply_tx))
            .await
            .map_err(|_| BroadcasterError)?;
        reply_rx.await.map_err(|_| BroadcasterError)
    }

    /// Relays an externally authored envelope as `relayed_external`.
    pub async fn relay(&self, envelope: ExternalEnvelope) -> Result<usize, BroadcasterError> {
        self.publish(StreamEvent::relayed(envelope)).await
    }

    pub async fn status(&self) -> Result<BroadcastStatus, BroadcasterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Status(reply_tx))
            .await
            .map_err(|_| BroadcasterError)?;
        reply_rx.await.map_err(|_| BroadcasterError)
    }
}

/// A live connection to the broadcaster.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    mailbox: mpsc::Receiver<StreamEvent>,
    keepalive: Duration,
    _guard: UnsubscribeGuard,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next event. If nothing arrives within the keepalive
    /// window a `keepalive` event is returned instead. `None` means the
    /// broadcaster dropped this subscriber or shut down.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        match tokio::time::timeout(self.keepalive, self.mailbox.recv()).await {
            Ok(event) => event,
            Err(_) => {
                trace!(subscriber = ?self.id, "Mailbox idle, sending keepalive");
                Some(StreamEvent::keepalive())
            }
        }
    }

    /// Returns a queued event without waiting.
    pub fn try_next(&mut self) -> Option<StreamEvent> {
        self.mailbox.try_recv().ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        futures_util::stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

struct UnsubscribeGuard {
    id: SubscriberId,
    tx: mpsc::Sender<Command>,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        // If the queue is full the closed mailbox is caught on the next push.
        self.tx.try_send(Command::Unsubscribe(self.id)).ok();
    }
}

struct Subscriber {
    mailbox: mpsc::Sender<StreamEvent>,
}

/// The broadcaster's last-observed copy of the state.
#[derive(Debug, Clone)]
struct Observed {
    phase: String,
    climate: Climate,
    usage: f64,
    drift: bool,
    caesura: bool,
}

impl From<&Snapshot> for Observed {
    fn from(s: &Snapshot) -> Self {
        Self {
            phase: s.phase.clone(),
            climate: s.climate,
            usage: s.usage,
            drift: s.drift,
            caesura: s.caesura,
        }
    }
}

struct BroadcastLoop {
    tracker: StateTracker,
    config: BroadcasterConfig,
    subscribers: SlotMap<SubscriberId, Subscriber>,
    last: Option<Observed>,
}

impl BroadcastLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        if let Ok(snapshot) = self.tracker.snapshot().await {
            self.last = Some(Observed::from(&snapshot));
        }
        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick = ?self.config.tick(), "Broadcaster running");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                Some(command) = commands.recv() => self.handle(command).await,
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!(
            subscribers = self.subscribers.len(),
            "Broadcaster stopped"
        );
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe(reply) => {
                let (mailbox, rx) = mpsc::channel(self.config.mailbox_capacity);
                match self.tracker.snapshot().await {
                    Ok(snapshot) => {
                        mailbox.try_send(StreamEvent::heartbeat(&snapshot)).ok();
                    }
                    Err(e) => warn!(%e, "No snapshot for new subscriber"),
                }
                let id = self.subscribers.insert(Subscriber { mailbox });
                info!(subscriber = ?id, active = self.subscribers.len(), "Subscriber connected");
                if reply.send((id, rx)).is_err() {
                    self.subscribers.remove(id);
                }
            }
            Command::Unsubscribe(id) => {
                if self.subscribers.remove(id).is_some() {
                    info!(subscriber = ?id, active = self.subscribers.len(), "Subscriber disconnected");
                }
            }
            Command::Publish(event, reply) => {
                debug!(kind = %event.kind, "Publishing event");
                self.fan_out(event);
                reply.send(self.subscribers.len()).ok();
            }
            Command::Status(reply) => {
                reply.send(self.status()).ok();
            }
        }
    }

    async fn tick(&mut self) {
        let snapshot = match self.tracker.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(%e, "Skipping tick");
                return;
            }
        };
        for event in self.detect_changes(&snapshot) {
            debug!(kind = %event.kind, "State change detected");
            self.fan_out(event);
        }
        self.fan_out(StreamEvent::heartbeat(&snapshot));
    }

    /// Compares `snapshot` with the last-observed copy and updates the copy
    /// for every field that produced an event.
    fn detect_changes(&mut self, snapshot: &Snapshot) -> Vec<StreamEvent> {
        let Some(last) = self.last.as_mut() else {
            self.last = Some(Observed::from(snapshot));
            return Vec::new();
        };
        let mut events = Vec::new();

        if snapshot.phase != last.phase {
            events.push(StreamEvent::phase_update(snapshot, &last.phase));
            last.phase = snapshot.phase.clone();
        }
        if snapshot.climate != last.climate {
            events.push(StreamEvent::climate_update(snapshot, last.climate));
            last.climate = snapshot.climate;
        }
        if (snapshot.usage - last.usage).abs() > self.config.usage_delta {
            events.push(StreamEvent::usage_update(snapshot, last.usage));
            last.usage = snapshot.usage;
        }

        // Rising edges only.
        if snapshot.drift && !last.drift {
            events.push(StreamEvent::drift_detected(snapshot));
        }
        if snapshot.caesura && !last.caesura {
            events.push(StreamEvent::caesura_detected(snapshot));
        }
        last.drift = snapshot.drift;
        last.caesura = snapshot.caesura;

        events
    }

    fn fan_out(&mut self, event: StreamEvent) {
        let mut failed = Vec::new();
        for (id, subscriber) in self.subscribers.iter() {
            if let Err(e) = subscriber.mailbox.try_send(event.clone()) {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "mailbox full",
                    mpsc::error::TrySendError::Closed(_) => "connection gone",
                };
                debug!(subscriber = ?id, reason, "Push failed");
                failed.push(id);
            }
        }
        for id in failed {
            self.subscribers.remove(id);
            info!(subscriber = ?id, active = self.subscribers.len(), "Subscriber dropped");
        }
    }

    fn status(&self) -> BroadcastStatus {
        BroadcastStatus {
            active_subscriber_count: self.subscribers.len(),
            last_phase: self.last.as_ref().map(|o| o.phase.clone()),
            last_climate: self.last.as_ref().map(|o| o.climate),
            last_usage: self.last.as_ref().map(|o| o.usage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::state::PhaseTable;
    use crate::tracker::Clock;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn config() -> BroadcasterConfig {
        BroadcasterConfig {
            tick_millis: 1000,
            usage_delta: 0.05,
            keepalive_secs: 30,
            mailbox_capacity: 16,
        }
    }

    struct Harness {
        tracker: StateTracker,
        broadcaster: Broadcaster,
        _shutdown: broadcast::Sender<()>,
    }

    fn harness_with(tracker: StateTracker, config: BroadcasterConfig) -> Harness {
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let broadcaster = Broadcaster::spawn(tracker.clone(), config, shutdown_rx);
        Harness {
            tracker,
            broadcaster,
            _shutdown: shutdown,
        }
    }

    fn harness() -> Harness {
        harness_with(StateTracker::spawn(PhaseTable::default()), config())
    }

    /// Lets the immediate first tick land, then empties the mailbox so the
    /// next events come from the tick after the test's mutation.
    async fn drain(sub: &mut Subscription) {
        tokio::time::sleep(Duration::from_millis(500)).await;
        while sub.try_next().is_some() {}
    }

    /// Next event that is not a heartbeat.
    async fn next_change(sub: &mut Subscription) -> StreamEvent {
        loop {
            let event = sub.next().await.expect("subscription closed");
            if event.kind != EventKind::Heartbeat {
                return event;
            }
        }
    }

    /// Collects everything up to and including the next heartbeat.
    async fn until_heartbeat(sub: &mut Subscription) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        loop {
            let event = sub.next().await.expect("subscription closed");
            kinds.push(event.kind);
            if event.kind == EventKind::Heartbeat {
                return kinds;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn new_subscriber_is_seeded_with_one_heartbeat() {
        let tracker = StateTracker::spawn(PhaseTable::default());
        tracker.set_usage(0.6).await.unwrap();
        let h = harness_with(tracker, config());
        let mut sub = h.broadcaster.subscribe().await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.kind, EventKind::Heartbeat);
        assert_eq!(first.payload["usage"], 0.6);

        // Quiet ticks only ever produce heartbeats.
        for _ in 0..5 {
            assert_eq!(until_heartbeat(&mut sub).await, vec![EventKind::Heartbeat]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn usage_changes_below_the_materiality_threshold_are_not_emitted() {
        let tracker = StateTracker::spawn(PhaseTable::default());
        tracker.set_usage(0.25).await.unwrap();
        let h = harness_with(tracker, config());
        let mut sub = h.broadcaster.subscribe().await.unwrap();
        drain(&mut sub).await;

        h.tracker.set_usage(0.42).await.unwrap();
        let event = next_change(&mut sub).await;
        assert_eq!(event.kind, EventKind::UsageUpdate);
        assert_eq!(event.payload["usage"], 0.42);

        h.tracker.set_usage(0.43).await.unwrap();
        assert_eq!(until_heartbeat(&mut sub).await, vec![EventKind::Heartbeat]);
        assert_eq!(until_heartbeat(&mut sub).await, vec![EventKind::Heartbeat]);
    }

    #[tokio::test(start_paused = true)]
    async fn climate_change_is_emitted_once() {
        let h = harness();
        let mut sub = h.broadcaster.subscribe().await.unwrap();
        drain(&mut sub).await;

        h.tracker.set_climate("restricted").await.unwrap();
        let event = next_change(&mut sub).await;
        assert_eq!(event.kind, EventKind::ClimateUpdate);
        assert_eq!(event.payload["climate"], "restricted");
        assert_eq!(event.payload["previous"], "clear");
        assert_eq!(until_heartbeat(&mut sub).await, vec![EventKind::Heartbeat]);
    }

    #[tokio::test(start_paused = true)]
    async fn flags_fire_on_rising_edges_only() {
        let h = harness();
        let mut sub = h.broadcaster.subscribe().await.unwrap();
        drain(&mut sub).await;

        h.tracker.mark_drift(true).await.unwrap();
        assert_eq!(
            until_heartbeat(&mut sub).await,
            vec![EventKind::DriftDetected, EventKind::Heartbeat]
        );
        // Still set: no new edge.
        assert_eq!(until_heartbeat(&mut sub).await, vec![EventKind::Heartbeat]);

        h.tracker.mark_drift(false).await.unwrap();
        assert_eq!(until_heartbeat(&mut sub).await, vec![EventKind::Heartbeat]);
        h.tracker.mark_drift(true).await.unwrap();
        h.tracker.mark_caesura(true).await.unwrap();
        assert_eq!(
            until_heartbeat(&mut sub).await,
            vec![
                EventKind::DriftDetected,
                EventKind::CaesuraDetected,
                EventKind::Heartbeat
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn phase_transition_is_emitted_with_previous_phase() {
        let t0: DateTime<Utc> = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let now = Arc::new(Mutex::new(t0 + ChronoDuration::minutes(110)));
        let reader = now.clone();
        let clock: Clock = Arc::new(move || *reader.lock().unwrap());
        let tracker = StateTracker::spawn_with_clock(PhaseTable::default(), clock);
        // Epoch is the clock reading at spawn; move it back to t0.
        *now.lock().unwrap() = t0;
        tracker.reset().await.unwrap();
        *now.lock().unwrap() = t0 + ChronoDuration::minutes(110);

        let h = harness_with(tracker, config());
        let mut sub = h.broadcaster.subscribe().await.unwrap();
        drain(&mut sub).await;

        *now.lock().unwrap() = t0 + ChronoDuration::minutes(121);
        let event = next_change(&mut sub).await;
        assert_eq!(event.kind, EventKind::PhaseUpdate);
        assert_eq!(event.payload["phase"], "hold");
        assert_eq!(event.payload["previous"], "inhale");

        let status = h.broadcaster.status().await.unwrap();
        assert_eq!(status.last_phase.as_deref(), Some("hold"));
    }

    #[tokio::test(start_paused = true)]
    async fn relay_reaches_every_subscriber_verbatim() {
        let h = harness();
        let mut a = h.broadcaster.subscribe().await.unwrap();
        let mut b = h.broadcaster.subscribe().await.unwrap();
        let data = json!({"coin": {"id": 7, "tags": ["dawn", null]}});

        let count = h
            .broadcaster
            .relay(ExternalEnvelope {
                event: "coin_minted".into(),
                timestamp: json!("2026-05-01T00:00:00Z"),
                data: data.clone(),
            })
            .await
            .unwrap();
        assert_eq!(count, 2);

        for sub in [&mut a, &mut b] {
            let event = next_change(sub).await;
            assert_eq!(event.kind, EventKind::RelayedExternal);
            assert_eq!(event.payload, data);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_subscribers_leave_the_active_set() {
        let h = harness();
        let keep = h.broadcaster.subscribe().await.unwrap();
        let gone = h.broadcaster.subscribe().await.unwrap();
        assert_eq!(h.broadcaster.status().await.unwrap().active_subscriber_count, 2);

        drop(gone);
        assert_eq!(h.broadcaster.status().await.unwrap().active_subscriber_count, 1);
        drop(keep);
        assert_eq!(h.broadcaster.status().await.unwrap().active_subscriber_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_mailbox_drops_the_subscriber() {
        let mut cfg = config();
        cfg.mailbox_capacity = 2;
        let h = harness_with(StateTracker::spawn(PhaseTable::default()), cfg);
        let _stalled = h.broadcaster.subscribe().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.broadcaster.status().await.unwrap().active_subscriber_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_mailbox_yields_keepalive() {
        let mut cfg = config();
        cfg.tick_millis = 3_600_000;
        let h = harness_with(StateTracker::spawn(PhaseTable::default()), cfg);
        let mut sub = h.broadcaster.subscribe().await.unwrap();
        assert_eq!(sub.next().await.unwrap().kind, EventKind::Heartbeat);
        drain(&mut sub).await;

        let started = tokio::time::Instant::now();
        let event = sub.next().await.unwrap();
        assert_eq!(event.kind, EventKind::Keepalive);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_subscriptions() {
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let broadcaster =
            Broadcaster::spawn(StateTracker::spawn(PhaseTable::default()), config(), shutdown_rx);
        let mut sub = broadcaster.subscribe().await.unwrap();
        assert_eq!(sub.next().await.unwrap().kind, EventKind::Heartbeat);

        shutdown.send(()).unwrap();
        loop {
            match sub.next().await {
                None => break,
                Some(event) => assert_ne!(event.kind, EventKind::Keepalive),
            }
        }
    }
}
