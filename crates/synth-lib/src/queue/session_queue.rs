//! Per-session sub-queue with an additive delay

use std::cmp::Ordering;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;
use crate::event::{Event, SessionEventName};
use crate::models::SimTime;

use super::heap::{HeapOrder, IndexedHeap};
use super::ordering::{check_consistency, compare_same_tick, QueuedEvent};

/// Added to the next timestamp while a hold is active (ten years).
pub const HOLD_OFFSET: Duration = Duration::from_secs(87_660 * 60 * 60);

#[derive(Debug)]
pub struct SessionEventQueue {
    session_id: String,
    delay: Duration,
    held: bool,
    events: IndexedHeap<QueuedEvent>,
}

impl SessionEventQueue {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            delay: Duration::ZERO,
            held: false,
            events: IndexedHeap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Buffer an event after checking it against same-tick events.
    pub fn push(&mut self, event: Event, requeued: bool) -> Result<()> {
        let mut queued = QueuedEvent::new(event, SimTime::ZERO);
        queued.adjusted = queued.event.timestamp + self.delay;
        queued.requeued = requeued;
        for other in self.events.iter() {
            check_consistency(&queued, other)?;
        }
        self.events.push(queued);
        Ok(())
    }

    pub fn peek(&self) -> Option<&QueuedEvent> {
        self.events.peek()
    }

    pub fn pop(&mut self) -> Option<QueuedEvent> {
        let queued = self.events.pop()?;
        if self.held {
            warn!(session = %self.session_id, event = %queued.event, "Popping event from a held session");
        }
        Some(queued)
    }

    /// Adjusted timestamp of the next event, including any hold.
    pub fn next_timestamp(&self) -> Option<SimTime> {
        let next = self.events.peek()?.adjusted;
        Some(if self.held { next + HOLD_OFFSET } else { next })
    }

    pub fn next_event_name(&self) -> Option<SessionEventName> {
        self.events.peek().and_then(|queued| queued.session_event())
    }

    pub fn has_events_for_tick(&self, tick: SimTime) -> bool {
        self.next_timestamp().is_some_and(|next| next <= tick)
    }

    /// Add `extra` to the delay of every buffered and future event.
    pub fn incur_delay(&mut self, extra: Duration) {
        if extra.is_zero() {
            return;
        }
        self.delay += extra;
        self.readjust();
    }

    pub fn reset_delay(&mut self) {
        self.delay = Duration::ZERO;
        self.readjust();
    }

    pub fn set_hold(&mut self, held: bool) {
        self.held = held;
    }

    pub fn drain(&mut self) -> Vec<QueuedEvent> {
        self.events.drain()
    }

    fn readjust(&mut self) {
        let delay = self.delay;
        for queued in self.events.iter_mut() {
            queued.adjusted = queued.event.timestamp + delay;
        }
        self.events.rebuild();
    }
}

/// Sub-queues with events sort before empty ones; empty ones sort by session id.
impl HeapOrder for SessionEventQueue {
    fn heap_cmp(&self, other: &Self) -> Ordering {
        match (self.next_timestamp(), other.next_timestamp()) {
            (None, None) => self.session_id.cmp(&other.session_id),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) if a != b => a.cmp(&b),
            (Some(_), Some(_)) => {
                let global = |q: &Self| q.peek().map(|e| e.event.global_index);
                compare_same_tick(self.next_event_name(), other.next_event_name())
                    .then(global(self).cmp(&global(other)))
                    .then(self.session_id.cmp(&other.session_id))
            }
        }
    }
}
