//! Bounded per-room ring of recent events.
//!
//! The hub's single append path writes under the write guard; readers (new
//! clients' backfill) take the read guard and get copies.

use crate::event::Event;
use std::collections::VecDeque;
use std::sync::RwLock;

/// Default ring capacity when the configuration does not say otherwise.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// Fixed-capacity ring of the most recent events, oldest first.
#[derive(Debug)]
pub struct HistoryRing {
    capacity: usize,
    events: RwLock<VecDeque<Event>>,
}

impl HistoryRing {
    /// Create an empty ring. A zero capacity falls back to the default.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_HISTORY_SIZE
        } else {
            capacity
        };
        Self {
            capacity,
            events: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().expect("history lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append events in order, evicting the oldest on wrap.
    pub fn append(&self, events: &[Event]) {
        let mut ring = self.events.write().expect("history lock poisoned");
        for event in events {
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }
    }

    /// Copy of the ring contents, oldest first, each flagged as history.
    ///
    /// The backfill flag is delivery metadata; ids are not recomputed.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        let ring = self.events.read().expect("history lock poisoned");
        ring.iter()
            .cloned()
            .map(|mut event| {
                event.history = true;
                event
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::kind;
    use crate::model::{Room, Source, Tags, User};

    fn numbered(n: usize) -> Event {
        let mut tags = Tags::new();
        tags.insert("message".into(), n.to_string());
        Event::new(
            Room::new("default", User::new("admin", "admin")),
            Source::client(User::new("alice", "alice")),
            "",
            "en",
            kind::CHAT,
            tags,
        )
    }

    #[test]
    fn wraps_evicting_oldest() {
        let ring = HistoryRing::new(3);
        let events: Vec<Event> = (0..5).map(numbered).collect();
        ring.append(&events);

        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 3);
        let messages: Vec<&str> = snapshot
            .iter()
            .map(|e| e.tags["message"].as_str())
            .collect();
        assert_eq!(messages, ["2", "3", "4"]);
    }

    #[test]
    fn snapshot_flags_history_without_touching_the_ring() {
        let ring = HistoryRing::new(3);
        ring.append(&[numbered(0)]);

        let snapshot = ring.snapshot();
        assert!(snapshot[0].history);

        // A second snapshot still starts from the as-appended flag.
        let again = ring.snapshot();
        assert_eq!(snapshot[0].id, again[0].id);
    }

    #[test]
    fn zero_capacity_falls_back_to_default() {
        let ring = HistoryRing::new(0);
        assert_eq!(ring.capacity(), DEFAULT_HISTORY_SIZE);
    }
}
