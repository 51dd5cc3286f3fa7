//! Contains common, primitive types shared across the Breathclock engine.
//!
//! Identifiers live here so the broadcaster, the HTTP layer and the shell can
//! refer to the same subscriber without sharing any of the owning structures.

use slotmap::new_key_type;

new_key_type! {
    /// Uniquely and safely identifies a live stream subscriber.
    ///
    /// Keys are handed out by the broadcaster's subscriber table and are never
    /// reused, so a stale id held by a disconnected stream cannot remove a
    /// newer subscriber.
    pub struct SubscriberId;
}

/// Name of a phase in the breath cycle, e.g. `"inhale"`.
pub type PhaseName = String;
