//! Bounded FIFO memo of recently dispatched `(action, trigger)` pairs.

use crate::config::TriggerKind;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoKey {
    pub action_id: String,
    pub trigger: TriggerKind,
}

impl MemoKey {
    pub fn new(action_id: impl Into<String>, trigger: TriggerKind) -> Self {
        Self {
            action_id: action_id.into(),
            trigger,
        }
    }
}

/// Remembers up to `capacity` keys; inserting into a full memo forgets the
/// oldest one.
#[derive(Debug, Clone)]
pub struct DedupMemo {
    capacity: usize,
    order: VecDeque<MemoKey>,
    members: HashSet<MemoKey>,
}

impl DedupMemo {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    pub fn contains(&self, key: &MemoKey) -> bool {
        self.members.contains(key)
    }

    /// Returns `false` if the key was already present.
    pub fn insert(&mut self, key: MemoKey) -> bool {
        if self.members.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
