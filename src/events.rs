//! Pending user-decision events.
//!
//! An inbound subscription request turns into an event the user resolves
//! later (`accept` / `reject`). Events carry an opaque id, the peer jid
//! as their payload, and an optional deadline after which they are
//! auto-cancelled. Removing an event drops its payload; nothing outlives
//! resolution.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventContext {
    Accept,
    Reject,
    Cancel,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Subscription,
}

#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub id: String,
    pub kind: EventKind,
    pub description: String,
    /// Peer bare jid this event is about.
    pub peer: String,
    pub deadline: Option<Instant>,
}

#[derive(Default)]
pub struct EventStore {
    events: HashMap<String, PendingEvent>,
    next_id: u32,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new pending event and returns its id.
    pub fn create(
        &mut self,
        kind: EventKind,
        description: &str,
        peer: &str,
        timeout: Option<Duration>,
    ) -> String {
        self.next_id += 1;
        let id = self.next_id.to_string();
        self.events.insert(
            id.clone(),
            PendingEvent {
                id: id.clone(),
                kind,
                description: description.to_string(),
                peer: peer.to_string(),
                deadline: timeout.map(|t| Instant::now() + t),
            },
        );
        id
    }

    pub fn get(&self, id: &str) -> Option<&PendingEvent> {
        self.events.get(id)
    }

    /// Takes the event out of the store for resolution.
    pub fn take(&mut self, id: &str) -> Option<PendingEvent> {
        self.events.remove(id)
    }

    /// Removes and returns every event whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingEvent> {
        let expired: Vec<String> = self
            .events
            .values()
            .filter(|e| e.deadline.map(|d| d <= now).unwrap_or(false))
            .map(|e| e.id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.events.remove(&id))
            .collect()
    }

    /// All pending events in creation order.
    pub fn list(&self) -> Vec<&PendingEvent> {
        let mut events: Vec<&PendingEvent> = self.events.values().collect();
        events.sort_by(|a, b| {
            a.id.parse::<u32>()
                .unwrap_or(0)
                .cmp(&b.id.parse::<u32>().unwrap_or(0))
        });
        events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
