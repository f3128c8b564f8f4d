//! In-flight request table.
//!
//! Each producer and consumer owns one table of its outstanding requests,
//! indexed by request id. There is at most one entry per id.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Outcome of checking one entry against the ack and restart windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// Within the ack window.
    Fresh,
    /// Past the ack window: resend the current phase message.
    Resend,
    /// Past the restart window: the connection must be rebuilt.
    Stalled,
}

impl Staleness {
    /// Classify the time elapsed since `since`.
    pub fn of(since: Instant, now: Instant, ack: Duration, restart: Duration) -> Self {
        let elapsed = now.saturating_duration_since(since);
        if elapsed > restart {
            Staleness::Stalled
        } else if elapsed > ack {
            Staleness::Resend
        } else {
            Staleness::Fresh
        }
    }
}

/// Outstanding requests keyed by request id.
#[derive(Debug)]
pub struct RequestTable<E> {
    entries: HashMap<String, E>,
}

impl<E> RequestTable<E> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert a new entry. Returns `false` and leaves the table unchanged if
    /// the id is already tracked.
    pub fn insert(&mut self, id: &str, entry: E) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries.insert(id.to_string(), entry);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut E> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<E> {
        self.entries.remove(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &E> {
        self.entries.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut E> {
        self.entries.values_mut()
    }
}

impl<E> Default for RequestTable<E> {
    fn default() -> Self {
        Self::new()
    }
}
