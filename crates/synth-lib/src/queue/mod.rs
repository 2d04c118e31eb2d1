//! Two-level event queue
//!
//! Session-level events are buffered per session in a [`SessionEventQueue`].
//! The sub-queues themselves sit in a top-level heap ordered by their next
//! adjusted timestamp, so delaying one session only touches that session's
//! events and its position among the other sessions.

mod heap;
mod ordering;
mod session_queue;


pub use heap::{Handle, HeapOrder, IndexedHeap};
pub use ordering::{check_consistency, compare_events, QueuedEvent};
pub use session_queue::{SessionEventQueue, HOLD_OFFSET};

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, SynthError};
use crate::event::{Event, SessionEventName};
use crate::models::SimTime;
use crate::observability::{StructuredLogger, SynthMetrics};

#[derive(Default)]
struct Inner {
    sessions: IndexedHeap<SessionEventQueue>,
    handles: HashMap<String, Handle>,
    terminated: HashSet<String>,
    len: usize,
}

impl Inner {
    fn handle(&self, session_id: &str) -> Result<Handle> {
        self.handles
            .get(session_id)
            .copied()
            .ok_or_else(|| SynthError::UnregisteredSession(session_id.to_string()))
    }

    /// Run `f` on a session's sub-queue and restore its position.
    fn update<R>(
        &mut self,
        session_id: &str,
        f: impl FnOnce(&mut SessionEventQueue) -> R,
    ) -> Result<R> {
        let handle = self.handle(session_id)?;
        let queue = self
            .sessions
            .get_mut(handle)
            .ok_or_else(|| SynthError::UnregisteredSession(session_id.to_string()))?;
        let result = f(queue);
        self.sessions.fix(handle);
        Ok(result)
    }

    fn insert(&mut self, event: Event, requeued: bool) -> Result<()> {
        let session_id = match event.session_id() {
            Some(id) => id.to_string(),
            None => {
                warn!(event = %event, "Discarding event without a session");
                return Ok(());
            }
        };
        if event.name.session() == Some(SessionEventName::SessionStarted) {
            if !self.handles.contains_key(&session_id) {
                let handle = self.sessions.push(SessionEventQueue::new(session_id.clone()));
                self.handles.insert(session_id, handle);
            }
            return Ok(());
        }
        if self.terminated.contains(&session_id) {
            debug!(session = %session_id, event = %event.name, "Discarding event of terminated session");
            return Ok(());
        }
        self.update(&session_id, |queue| queue.push(event, requeued))??;
        self.len += 1;
        Ok(())
    }

    fn peek(&self, threshold: SimTime) -> Option<&QueuedEvent> {
        let queue = self.sessions.peek()?;
        match queue.next_timestamp() {
            Some(next) if next <= threshold => queue.peek(),
            _ => None,
        }
    }
}

/// Thread-safe two-level priority queue of session-level events
pub struct EventQueue {
    inner: Mutex<Inner>,
    metrics: Option<SynthMetrics>,
    logger: Option<StructuredLogger>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            metrics: None,
            logger: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SynthMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Buffer a session-level event.
    ///
    /// `session-started` registers the session's sub-queue and is not itself
    /// buffered. Any other event of an unknown session fails with
    /// [`SynthError::UnregisteredSession`]; events of terminated sessions are
    /// discarded.
    pub fn enqueue_event(&self, event: Event) -> Result<()> {
        self.insert(event, false)
    }

    /// Hand back an event a consumer could not process yet. Requeued events
    /// are exempt from the ordering consistency check.
    pub fn requeue_event(&self, event: Event) -> Result<()> {
        self.insert(event, true)
    }

    /// The next event, if its adjusted timestamp is at or before `threshold`.
    pub fn peek(&self, threshold: SimTime) -> Option<Event> {
        self.inner.lock().peek(threshold).map(|queued| queued.event.clone())
    }

    /// Remove and return the next event, if its adjusted timestamp is at or
    /// before `threshold`.
    pub fn pop(&self, threshold: SimTime) -> Option<Event> {
        let mut inner = self.inner.lock();
        inner.peek(threshold)?;
        let handle = inner.sessions.peek_handle()?;
        let queued = inner.sessions.get_mut(handle)?.pop()?;
        inner.sessions.fix(handle);
        inner.len -= 1;
        let depth = inner.len;
        drop(inner);

        self.record_depth(depth);
        Some(queued.event)
    }

    /// Additively delay every current and future event of a session.
    pub fn delay_session(&self, session_id: &str, extra: Duration) -> Result<()> {
        self.inner
            .lock()
            .update(session_id, |queue| queue.incur_delay(extra))?;
        debug!(session = %session_id, extra_ms = extra.as_millis() as u64, "Delayed session");
        Ok(())
    }

    pub fn reset_session_delay(&self, session_id: &str) -> Result<()> {
        self.inner
            .lock()
            .update(session_id, |queue| queue.reset_delay())
    }

    pub fn session_delay(&self, session_id: &str) -> Result<Duration> {
        let inner = self.inner.lock();
        let handle = inner.handle(session_id)?;
        Ok(inner
            .sessions
            .get(handle)
            .map(|queue| queue.delay())
            .unwrap_or_default())
    }

    /// Keep a session's events out of reach until released. The delay is untouched.
    pub fn hold_session(&self, session_id: &str) -> Result<()> {
        self.inner
            .lock()
            .update(session_id, |queue| queue.set_hold(true))
    }

    pub fn release_session(&self, session_id: &str) -> Result<()> {
        self.inner
            .lock()
            .update(session_id, |queue| queue.set_hold(false))
    }

    /// Drop a session's sub-queue. Later events of the session are discarded.
    /// Returns the number of buffered events that were dropped.
    pub fn terminate_session(&self, session_id: &str) -> Result<usize> {
        let mut inner = self.inner.lock();
        let handle = inner.handle(session_id)?;
        let dropped = inner
            .sessions
            .remove(handle)
            .map(|mut queue| queue.drain().len())
            .unwrap_or(0);
        inner.handles.remove(session_id);
        inner.terminated.insert(session_id.to_string());
        inner.len -= dropped;
        let depth = inner.len;
        drop(inner);

        self.record_depth(depth);
        debug!(session = %session_id, dropped = dropped, "Terminated session");
        Ok(dropped)
    }

    pub fn has_events_for_session(&self, session_id: &str) -> Result<bool> {
        let inner = self.inner.lock();
        let handle = inner.handle(session_id)?;
        Ok(inner
            .sessions
            .get(handle)
            .is_some_and(|queue| !queue.is_empty()))
    }

    pub fn has_events_for_tick(&self, tick: SimTime) -> bool {
        self.inner
            .lock()
            .sessions
            .peek()
            .is_some_and(|queue| queue.has_events_for_tick(tick))
    }

    /// Adjusted timestamp of the next event, if any.
    pub fn next_event_timestamp(&self) -> Option<SimTime> {
        self.inner
            .lock()
            .sessions
            .peek()
            .and_then(|queue| queue.next_timestamp())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_session_queues(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    fn insert(&self, event: Event, requeued: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.insert(event, requeued) {
            if let (SynthError::FatalInconsistency { .. }, Some(logger)) = (&e, &self.logger) {
                logger.log_fatal_inconsistency(&e.to_string());
            }
            return Err(e);
        }
        let depth = inner.len;
        drop(inner);

        self.record_depth(depth);
        Ok(())
    }

    fn record_depth(&self, depth: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(depth as i64);
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
