//! Synthesizer
//!
//! Merges the event channels of every resource driver into one globally
//! time-ordered stream, feeds it through the per-session state machines and
//! hands the resulting session events to an [`EventConsumer`].
//!
//! Two modes are supported:
//! - **standard**: every session event carries a full session snapshot with
//!   the precomputed maxima of the session and its current training task.
//! - **statistics**: no events are emitted; `training-started` and
//!   `training-ended` only bracket the per-task maxima gathered by the drivers.

mod consumer;
mod maxima;


pub use consumer::{EventConsumer, QueueConsumer};
pub use maxima::{
    cpus_from_utilization, gpu_reservation, memory_gb_from_bytes, MaxUtilization, MaximaPaths,
    MaximaReport, ResourceMaxima,
};

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::MaximaTracker;
use crate::error::{Result, SynthError};
use crate::event::{Event, EventName, EventPayload, SessionEventName, SourceId};
use crate::models::{SessionSnapshot, SimTime};
use crate::observability::{StructuredLogger, SynthMetrics};
use crate::session::{Session, SessionPolicy};

/// Longest session id passed downstream unchanged
pub const MAX_SESSION_ID_LEN: usize = 36;

/// Source id stamped on session events
pub const SYNTHESIZER_SOURCE: SourceId = 0;

/// What the synthesizer does with session events
pub enum SynthMode {
    Standard {
        consumer: Arc<dyn EventConsumer>,
        maxima: Arc<MaxUtilization>,
    },
    Statistics { trackers: Vec<MaximaTracker> },
}

impl SynthMode {
    pub fn name(&self) -> &'static str {
        match self {
            SynthMode::Standard { .. } => "standard",
            SynthMode::Statistics { .. } => "statistics",
        }
    }
}

/// Counters of one synthesizer run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SynthesisSummary {
    pub events_received: u64,
    pub session_events: u64,
    pub sessions: usize,
    pub transition_errors: u64,
    pub sessions_skipped: usize,
    pub last_timestamp: Option<SimTime>,
}

/// Next unconsumed event of one source
struct HeadEvent {
    event: Event,
    position: usize,
}

impl HeadEvent {
    fn key(&self) -> (SimTime, i64, usize) {
        (self.event.timestamp, self.event.sequence_key, self.position)
    }
}

impl PartialEq for HeadEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for HeadEvent {}

impl PartialOrd for HeadEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeadEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap
        other.key().cmp(&self.key())
    }
}

struct SessionEntry {
    session: Session,
    /// Id reported downstream
    public_id: String,
    limits: ResourceMaxima,
    next_local: u64,
}

struct EventSource {
    id: SourceId,
    rx: mpsc::Receiver<Event>,
}

pub struct Synthesizer {
    sources: Vec<EventSource>,
    policy: SessionPolicy,
    mode: SynthMode,
    sessions: HashMap<String, SessionEntry>,
    skipped: HashSet<String>,
    next_global: u64,
    active: i64,
    summary: SynthesisSummary,
    metrics: Option<SynthMetrics>,
    logger: StructuredLogger,
}

impl Synthesizer {
    pub fn new(policy: SessionPolicy, mode: SynthMode, logger: StructuredLogger) -> Self {
        Self {
            sources: Vec::new(),
            policy,
            mode,
            sessions: HashMap::new(),
            skipped: HashSet::new(),
            next_global: 0,
            active: 0,
            summary: SynthesisSummary::default(),
            metrics: None,
            logger,
        }
    }

    pub fn with_metrics(mut self, metrics: SynthMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn add_source(&mut self, id: SourceId, rx: mpsc::Receiver<Event>) {
        self.sources.push(EventSource { id, rx });
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Merge every source until all are retired.
    ///
    /// Returns [`SynthError::Canceled`] if `cancel` fires first, or the first
    /// fatal error raised by the session machinery or the consumer.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<SynthesisSummary> {
        info!(
            sources = self.sources.len(),
            mode = self.mode.name(),
            "Starting synthesizer"
        );

        let result = self.merge(&cancel).await;
        match result {
            Ok(()) => {
                if let SynthMode::Standard { consumer, .. } = &self.mode {
                    consumer.generator_complete().await;
                }
                self.summary.sessions = self.sessions.len();
                self.logger.log_replay_finished(
                    self.summary.sessions,
                    self.summary.session_events,
                    self.summary.transition_errors,
                );
                Ok(self.summary)
            }
            Err(e) => {
                if let SynthError::FatalInconsistency { .. } = &e {
                    self.logger.log_fatal_inconsistency(&e.to_string());
                }
                if let SynthMode::Standard { consumer, .. } = &self.mode {
                    let reported = match &e {
                        SynthError::Canceled => SynthError::Canceled,
                        other => SynthError::SourceFailed {
                            id: SYNTHESIZER_SOURCE,
                            message: other.to_string(),
                        },
                    };
                    consumer.report_error(reported).await;
                }
                Err(e)
            }
        }
    }

    async fn merge(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut heap = BinaryHeap::with_capacity(self.sources.len());
        for position in 0..self.sources.len() {
            let event = self.receive(position, cancel).await?;
            heap.push(HeadEvent { event, position });
        }

        while let Some(HeadEvent { event, position }) = heap.pop() {
            if let SynthMode::Statistics { trackers } = &self.mode {
                trackers.iter().for_each(|t| t.settle(event.timestamp));
            }
            match event.name {
                EventName::NoMore => {
                    info!(
                        source = self.sources[position].id,
                        remaining = heap.len(),
                        "Source exhausted"
                    );
                    continue;
                }
                EventName::Error => {
                    let message = match &event.payload {
                        EventPayload::Error(message) => message.clone(),
                        _ => String::new(),
                    };
                    warn!(source = self.sources[position].id, error = %message, "Source failed");
                    if let SynthMode::Standard { consumer, .. } = &self.mode {
                        consumer
                            .report_error(SynthError::SourceFailed {
                                id: self.sources[position].id,
                                message,
                            })
                            .await;
                    }
                    continue;
                }
                EventName::TickHolder => {}
                _ => {
                    let start = Instant::now();
                    self.summary.events_received += 1;
                    self.summary.last_timestamp = Some(event.timestamp);
                    self.dispatch(event).await?;
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_merge_latency(start.elapsed().as_secs_f64());
                    }
                }
            }

            let next = self.receive(position, cancel).await?;
            heap.push(HeadEvent {
                event: next,
                position,
            });
        }
        Ok(())
    }

    /// Wait for the next event of one source. A closed channel reads as `NoMore`.
    async fn receive(&mut self, position: usize, cancel: &CancellationToken) -> Result<Event> {
        let source = &mut self.sources[position];
        let id = source.id;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Synthesizer canceled");
                Err(SynthError::Canceled)
            }
            event = source.rx.recv() => {
                Ok(event.unwrap_or_else(|| Event::no_more(id, SimTime::ZERO)))
            }
        }
    }

    async fn dispatch(&mut self, event: Event) -> Result<()> {
        let Some(key) = event.session_id().map(str::to_string) else {
            debug!(event = %event, "Ignoring event without a session");
            return Ok(());
        };
        if self.skipped.contains(&key) {
            return Ok(());
        }
        if !self.sessions.contains_key(&key) && !self.open_session(&key) {
            return Ok(());
        }

        let timestamp = event.timestamp;
        let origin = event.original_source;
        let Some(entry) = self.sessions.get_mut(&key) else {
            return Ok(());
        };
        let triggered = match entry.session.transit(event) {
            Ok(triggered) => triggered,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.summary.transition_errors += 1;
                self.logger
                    .log_transition_error("session", &key, &e.to_string());
                if let Some(metrics) = &self.metrics {
                    metrics.inc_transition_errors("session");
                }
                return Ok(());
            }
        };

        for name in triggered {
            self.emit(&key, name, timestamp, origin).await?;
        }
        Ok(())
    }

    /// Create the session state for `key`. Returns false if the session has
    /// no maxima and is skipped.
    fn open_session(&mut self, key: &str) -> bool {
        let limits = match &self.mode {
            SynthMode::Standard { maxima, .. } => maxima.session(key),
            SynthMode::Statistics { .. } => Some(ResourceMaxima::default()),
        };
        let Some(limits) = limits else {
            warn!(session = %key, "No maxima for session, skipping");
            self.skipped.insert(key.to_string());
            self.summary.sessions_skipped += 1;
            return false;
        };

        let public_id = if key.len() > MAX_SESSION_ID_LEN {
            let id = Uuid::new_v4().to_string();
            debug!(session = %key, remapped = %id, "Remapping long session id");
            id
        } else {
            key.to_string()
        };
        self.sessions.insert(
            key.to_string(),
            SessionEntry {
                session: Session::new(key, self.policy),
                public_id,
                limits,
                next_local: 0,
            },
        );
        true
    }

    async fn emit(
        &mut self,
        key: &str,
        name: SessionEventName,
        timestamp: SimTime,
        origin: SourceId,
    ) -> Result<()> {
        match name {
            SessionEventName::SessionStarted => self.active += 1,
            SessionEventName::SessionStopped => self.active -= 1,
            _ => {}
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc_session_event(name.as_str());
            metrics.set_active_sessions(self.active);
        }

        let (consumer, event) = match &self.mode {
            SynthMode::Statistics { trackers } => {
                match name {
                    SessionEventName::TrainingStarted => {
                        trackers.iter().for_each(|t| t.training_started(key, timestamp))
                    }
                    SessionEventName::TrainingEnded => {
                        trackers.iter().for_each(|t| t.training_ended(key, timestamp))
                    }
                    _ => {}
                }
                return Ok(());
            }
            SynthMode::Standard { consumer, maxima } => {
                let Some(entry) = self.sessions.get_mut(key) else {
                    return Ok(());
                };
                let mut snapshot = entry.session.snapshot();
                snapshot.session_id = entry.public_id.clone();
                attach_maxima(&mut snapshot, key, name, &entry.limits, maxima);

                let mut event = Event::new(
                    EventName::Session(name),
                    SYNTHESIZER_SOURCE,
                    timestamp,
                    EventPayload::Session(Box::new(snapshot)),
                );
                event.original_source = origin;
                event.global_index = self.next_global;
                event.local_index = entry.next_local;
                self.next_global += 1;
                entry.next_local += 1;

                self.logger
                    .log_session_event(&entry.public_id, name.as_str(), timestamp);
                (consumer.clone(), event)
            }
        };

        self.summary.session_events += 1;
        match consumer.submit_event(event).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(session = %key, error = %e, "Consumer rejected session event");
                Ok(())
            }
        }
    }
}

fn attach_maxima(
    snapshot: &mut SessionSnapshot,
    key: &str,
    name: SessionEventName,
    limits: &ResourceMaxima,
    maxima: &MaxUtilization,
) {
    snapshot.max_session_cpus = limits.cpus;
    snapshot.max_session_memory_gb = limits.memory_gb;
    snapshot.max_session_gpus = limits.gpus;
    snapshot.max_session_vram_gb = limits.vram_gb;
    snapshot.adjustment_factor = limits.adjustment_factor;

    let index = snapshot.training_index.unwrap_or(0);
    let task = match maxima.task(key, index) {
        Some(task) => task,
        None => {
            if name == SessionEventName::TrainingStarted && maxima.has_task_tables() {
                warn!(
                    session = %key,
                    training = index,
                    "No maxima for training task, using session maxima"
                );
            }
            *limits
        }
    };
    snapshot.current_training_max_cpus = task.cpus;
    snapshot.current_training_max_memory_gb = task.memory_gb;
    snapshot.current_training_max_gpus = task.gpus;
    snapshot.current_training_max_vram_gb = task.vram_gb;
}

/// Builder for creating a synthesizer
pub struct SynthesizerBuilder {
    policy: SessionPolicy,
    mode: Option<SynthMode>,
    sources: Vec<(SourceId, mpsc::Receiver<Event>)>,
    logger: Option<StructuredLogger>,
    metrics: Option<SynthMetrics>,
}

impl SynthesizerBuilder {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            policy,
            mode: None,
            sources: Vec::new(),
            logger: None,
            metrics: None,
        }
    }

    /// Emit full session events to `consumer`
    pub fn standard(mut self, consumer: Arc<dyn EventConsumer>, maxima: Arc<MaxUtilization>) -> Self {
        self.mode = Some(SynthMode::Standard { consumer, maxima });
        self
    }

    /// Only bracket training tasks in `trackers`
    pub fn statistics(mut self, trackers: Vec<MaximaTracker>) -> Self {
        self.mode = Some(SynthMode::Statistics { trackers });
        self
    }

    pub fn source(mut self, id: SourceId, rx: mpsc::Receiver<Event>) -> Self {
        self.sources.push((id, rx));
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn metrics(mut self, metrics: SynthMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Synthesizer> {
        let mode = self.mode.ok_or_else(|| {
            SynthError::setup(std::path::PathBuf::new(), "synthesizer mode is required")
        })?;
        let logger = self
            .logger
            .unwrap_or_else(|| StructuredLogger::new("default"));

        let mut synthesizer = Synthesizer::new(self.policy, mode, logger);
        if let Some(metrics) = self.metrics {
            synthesizer = synthesizer.with_metrics(metrics);
        }
        for (id, rx) in self.sources {
            synthesizer.add_source(id, rx);
        }
        Ok(synthesizer)
    }
}
