use event_schema::{Cursor, PushEvent};
use std::time::Duration;
use tokio::time::Instant;

struct Held {
    due: Instant,
    seq: u64,
    event: PushEvent,
}

/// Holds push events for a short delay so events that arrive slightly out of
/// cursor order are merged in order.
///
/// The owner schedules a timer for [`ReorderBuffer::next_deadline`] and calls
/// [`ReorderBuffer::release`] when it fires.
pub struct ReorderBuffer {
    delay: Duration,
    next_seq: u64,
    held: Vec<Held>,
}

fn cursor_of(event: &PushEvent) -> Option<Cursor> {
    match event {
        PushEvent::Persisted(m) => Some(m.cursor()),
        _ => None,
    }
}

impl ReorderBuffer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_seq: 0,
            held: Vec::new(),
        }
    }

    pub fn push(&mut self, event: PushEvent, now: Instant) {
        self.held.push(Held {
            due: now + self.delay,
            seq: self.next_seq,
            event,
        });
        self.next_seq += 1;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.held.iter().map(|h| h.due).min()
    }

    /// Events whose delay has elapsed. Events without a cursor come first in
    /// arrival order, persisted messages follow in cursor order.
    pub fn release(&mut self, now: Instant) -> Vec<PushEvent> {
        let (mut ready, held): (Vec<Held>, Vec<Held>) =
            self.held.drain(..).partition(|h| h.due <= now);
        self.held = held;
        ready.sort_by_key(|h| (cursor_of(&h.event), h.seq));
        ready.into_iter().map(|h| h.event).collect()
    }

    /// Drop everything still held
    pub fn clear(&mut self) {
        self.held.clear();
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
