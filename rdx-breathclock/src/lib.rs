//! # Breathclock
//!
//! A phase-aware state engine with a live event stream and a ritual
//! scheduler.
//!
//! Breathclock keeps one canonical breath state (a 24 hour cycle of named
//! phases, a usage saturation and a risk climate), samples it on a fixed
//! tick and streams typed change events to any number of subscribers. A
//! separate scheduler consumes that stream and runs external scripts when
//! phase, climate or usage cross configured triggers.
//!
//! ## Core Concepts
//!
//! - **StateTracker**: the single owner of the breath state. Every read and
//!   write is a message to its task, so concurrent writers never race.
//! - **Broadcaster**: the tick loop. It compares each sample with the last
//!   one, fans out `phase_update`, `climate_update`, `usage_update` and
//!   edge-triggered `drift_detected`/`caesura_detected` events, and sends a
//!   heartbeat every tick. It also relays externally authored envelopes.
//! - **Scheduler**: reads the stream over HTTP, re-derives transitions from
//!   heartbeats as a safety net, and dispatches deduplicated, timed actions.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use breathclock::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = BreathEngine::new(BreathConfig::default())?;
//!
//!     let mut subscription = engine.broadcaster().subscribe().await?;
//!     tokio::spawn(async move {
//!         while let Some(event) = subscription.next().await {
//!             println!("{}", event.to_frame());
//!         }
//!     });
//!
//!     engine.tracker().set_usage(0.42).await?;
//!     engine.run().await
//! }
//! ```

pub const ENGINE_NAME: &str = "Breathclock";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod broadcaster;
pub mod common;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod tracker;

/// A prelude module for easy importing of the most common Breathclock types.
pub mod prelude {
    pub use crate::broadcaster::{BroadcastStatus, Broadcaster, Subscription};
    pub use crate::common::SubscriberId;
    pub use crate::config::BreathConfig;
    pub use crate::engine::BreathEngine;
    pub use crate::events::{EventKind, ExternalEnvelope, StreamEvent};
    pub use crate::scheduler::{
        ActionRegistry, ConnectionState, Scheduler, SchedulerReport, ScriptRunner, StreamClient,
    };
    pub use crate::state::{Climate, PhaseTable, Snapshot, StateView};
    pub use crate::tracker::{StatePatch, StateTracker};
}
