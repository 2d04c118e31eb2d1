//! Per-source event buffering and sequence-key assignment

use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use std::collections::VecDeque;
use std::time::Duration;

use crate::event::{Event, SourceId};
use crate::models::SimTime;

/// Events of one source are never keyed closer than this to the next tick.
const KEY_GUARD: Duration = Duration::from_secs(1);

/// Buffers same-timestamp events of one source and releases them as sorted batches.
///
/// Each transition batch (the events produced by one entity in one step) is
/// keyed at `timestamp - jitter` and its members get consecutive keys, so a
/// batch keeps its creation order while batches of different entities
/// interleave randomly within the tick.
pub struct EventEmitter {
    source: SourceId,
    reading_interval: Duration,
    rng: Pcg64,
    buffer: Vec<Event>,
    buffered_at: Option<SimTime>,
    last_batch: Option<u64>,
    next_batch: u64,
    outbox: VecDeque<Event>,
    /// Timestamp of the newest event released to the outbox
    released_at: Option<SimTime>,
}

impl EventEmitter {
    pub fn new(source: SourceId, reading_interval: Duration, seed: u64) -> Self {
        Self {
            source,
            reading_interval,
            rng: Pcg64::seed_from_u64(seed),
            buffer: Vec::new(),
            buffered_at: None,
            last_batch: None,
            next_batch: 0,
            outbox: VecDeque::new(),
            released_at: None,
        }
    }

    /// Start a new transition batch.
    pub fn begin_batch(&mut self) -> u64 {
        self.next_batch += 1;
        self.next_batch
    }

    pub fn trigger(&mut self, batch: u64, mut event: Event) {
        if let Some(at) = self.buffered_at {
            if at != event.timestamp {
                self.flush(at);
            }
        }

        event.sequence_key = match (self.last_batch, self.buffer.last()) {
            (Some(last), Some(prev)) if last == batch => prev.sequence_key + 1,
            _ => self.jittered_key(event.timestamp),
        };
        self.buffered_at = Some(event.timestamp);
        self.last_batch = Some(batch);
        self.buffer.push(event);
    }

    /// Release the buffered batch in sequence-key order. An empty buffer
    /// releases a tick holder, unless an event at `at` already went out.
    pub fn flush(&mut self, at: SimTime) {
        if self.buffer.is_empty() {
            if self.released_at != Some(at) {
                self.push_direct(Event::tick_holder(self.source, at));
            }
        } else {
            self.buffer.sort_by_key(|e| e.sequence_key);
            self.released_at = self.buffer.last().map(|e| e.timestamp);
            self.outbox.extend(self.buffer.drain(..));
        }
        self.buffered_at = None;
        self.last_batch = None;
    }

    /// Queue an event that bypasses buffering, such as a sentinel.
    pub fn push_direct(&mut self, event: Event) {
        self.released_at = Some(event.timestamp);
        self.outbox.push_back(event);
    }

    pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, Event> {
        self.outbox.drain(..)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn jittered_key(&mut self, at: SimTime) -> i64 {
        let window = self.reading_interval.saturating_sub(KEY_GUARD).as_nanos();
        let window = i64::try_from(window).unwrap_or(i64::MAX);
        if window <= 0 {
            return at.as_nanos();
        }
        at.as_nanos() - self.rng.gen_range(0..window)
    }
}
