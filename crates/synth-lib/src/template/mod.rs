//! Workloads generated from session templates
//!
//! A template lists sessions with their resource limits, their lifetime and
//! their training tasks, all measured in ticks. [`TemplateSequencer`] turns
//! those sessions into the same session event stream the synthesizer derives
//! from traces, and submits it to an [`EventConsumer`] in timestamp order.
//!
//! Each session yields `session-started` and `session-ready` at its start
//! tick, a `training-started`/`training-ended` pair per training and
//! `session-stopped` at its stop tick. An event is held back until the next
//! step of its session is known, so steps added out of order are rejected.

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, SynthError};
use crate::event::{Event, EventName, EventPayload, SessionEventName};
use crate::models::{
    ResourceKind, SessionSnapshot, SessionStatus, SimTime, UtilStatus, UtilizationSnapshot,
};
use crate::synth::{EventConsumer, ResourceMaxima, SYNTHESIZER_SOURCE};

/// Simulated time between two template ticks
pub const DEFAULT_TEMPLATE_TICK: Duration = Duration::from_secs(60);

const MB_PER_GB: f64 = 1000.0;

/// Peak resources a session may use over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    pub cpus: f64,
    pub memory_mb: f64,
    pub gpus: u32,
    pub vram_gb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateTraining {
    pub start_tick: i64,
    pub duration_in_ticks: i64,
    #[serde(default)]
    pub cpus: f64,
    #[serde(default)]
    pub memory_mb: f64,
    #[serde(default)]
    pub vram_gb: f64,
    /// Utilization of each GPU in percent. Its length is the GPU count.
    #[serde(default)]
    pub gpu_utilizations: Vec<f64>,
}

impl TemplateTraining {
    pub fn num_gpus(&self) -> u32 {
        u32::try_from(self.gpu_utilizations.len()).unwrap_or(u32::MAX)
    }

    /// GPUs with a non-zero utilization
    pub fn busy_gpus(&self) -> u32 {
        let busy = self.gpu_utilizations.iter().filter(|u| **u > 0.0).count();
        u32::try_from(busy).unwrap_or(u32::MAX)
    }

    pub fn end_tick(&self) -> i64 {
        self.start_tick.saturating_add(self.duration_in_ticks)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateSession {
    pub id: String,
    #[serde(default)]
    pub max_resource_request: ResourceRequest,
    pub start_tick: i64,
    pub stop_tick: i64,
    #[serde(default)]
    pub trainings: Vec<TemplateTraining>,
}

fn invalid(message: String) -> SynthError {
    SynthError::InvalidTemplate(message)
}

impl TemplateSession {
    /// Check limits, lifetime and every training against each other.
    pub fn validate(&self) -> Result<()> {
        let id = &self.id;
        if id.is_empty() {
            return Err(invalid("session id must not be empty".to_string()));
        }

        let max = &self.max_resource_request;
        for (resource, amount) in [
            ("CPUs", max.cpus),
            ("memory", max.memory_mb),
            ("VRAM", max.vram_gb),
        ] {
            if amount < 0.0 {
                return Err(invalid(format!(
                    "session {}: maximum {} ({}) must not be negative",
                    id, resource, amount
                )));
            }
        }

        if self.start_tick < 0 {
            return Err(invalid(format!(
                "session {}: start tick {} must not be negative",
                id, self.start_tick
            )));
        }
        if self.start_tick > self.stop_tick {
            return Err(invalid(format!(
                "session {}: start tick {} is after its stop tick {}",
                id, self.start_tick, self.stop_tick
            )));
        }

        let mut previous_end = None;
        for (index, training) in self.trainings.iter().enumerate() {
            let prefix = format!("session {}: training {}", id, index);
            if training.duration_in_ticks <= 0 {
                return Err(invalid(format!(
                    "{} must last at least one tick, got {}",
                    prefix, training.duration_in_ticks
                )));
            }
            if training.start_tick < self.start_tick {
                return Err(invalid(format!(
                    "{} starts at tick {} before the session starts at tick {}",
                    prefix, training.start_tick, self.start_tick
                )));
            }
            if training.end_tick() > self.stop_tick {
                return Err(invalid(format!(
                    "{} ends at tick {} after the session stops at tick {}",
                    prefix,
                    training.end_tick(),
                    self.stop_tick
                )));
            }
            if let Some(end) = previous_end.filter(|end| training.start_tick < *end) {
                return Err(invalid(format!(
                    "{} starts at tick {} before training {} ends at tick {}",
                    prefix,
                    training.start_tick,
                    index - 1,
                    end
                )));
            }
            previous_end = Some(training.end_tick());

            if training.cpus > max.cpus {
                return Err(invalid(format!(
                    "{} uses {} CPUs, more than the session maximum of {}",
                    prefix, training.cpus, max.cpus
                )));
            }
            if training.num_gpus() > max.gpus {
                return Err(invalid(format!(
                    "{} uses {} GPUs, more than the session maximum of {}",
                    prefix,
                    training.num_gpus(),
                    max.gpus
                )));
            }
            if training.memory_mb > max.memory_mb {
                return Err(invalid(format!(
                    "{} uses {} MB of memory, more than the session maximum of {} MB",
                    prefix, training.memory_mb, max.memory_mb
                )));
            }
        }
        Ok(())
    }

    pub fn limits(&self) -> ResourceMaxima {
        let max = &self.max_resource_request;
        ResourceMaxima {
            cpus: max.cpus,
            memory_gb: max.memory_mb / MB_PER_GB,
            gpus: max.gpus,
            vram_gb: max.vram_gb,
            adjustment_factor: 1.0,
        }
    }

    /// Last tick at which the session has an event
    pub fn final_tick(&self) -> i64 {
        self.trainings
            .iter()
            .map(TemplateTraining::end_tick)
            .fold(self.stop_tick, i64::max)
    }
}

/// A workload described session by session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadTemplate {
    pub sessions: Vec<TemplateSession>,
}

impl WorkloadTemplate {
    /// Read a template from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| SynthError::setup(path, e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| SynthError::setup(path, e))
    }

    /// Validate every session and return the last tick of the workload.
    pub fn validate(&self) -> Result<i64> {
        if self.sessions.is_empty() {
            return Err(invalid("template has no sessions".to_string()));
        }

        let mut seen = HashSet::new();
        let mut final_tick = 0;
        for session in &self.sessions {
            session.validate()?;
            if !seen.insert(session.id.as_str()) {
                return Err(invalid(format!("duplicate session id {}", session.id)));
            }
            final_tick = final_tick.max(session.final_tick());
        }
        Ok(final_tick)
    }

    /// Add the events of every session to `sequencer`.
    pub fn sequence(&self, sequencer: &mut TemplateSequencer) -> Result<()> {
        for session in &self.sessions {
            sequencer.register_session(&session.id, session.limits())?;
            sequencer.add_session_started(&session.id, session.start_tick)?;
            for training in &session.trainings {
                sequencer.add_training(&session.id, training)?;
            }
            sequencer.add_session_terminated(&session.id, session.stop_tick)?;
        }
        Ok(())
    }
}

/// Outcome of [`generate_template_workload`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateReport {
    pub sessions: usize,
    pub trainings: usize,
    pub events: u64,
    pub final_tick: i64,
    pub final_timestamp: SimTime,
}

/// Sequenced event waiting in the heap. Pops by timestamp, then creation order.
struct Pending(Event);

impl Pending {
    fn key(&self) -> (SimTime, u64) {
        (self.0.timestamp, self.0.global_index)
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap
        other.key().cmp(&self.key())
    }
}

struct SequencedSession {
    snapshot: SessionSnapshot,
    next_local: u64,
    trainings: usize,
    /// Created but not yet released to the heap
    waiting: Option<Event>,
}

fn usage(
    kind: ResourceKind,
    session: &str,
    at: SimTime,
    value: f64,
    status: UtilStatus,
    gpus: u32,
    vram_gb: f64,
) -> UtilizationSnapshot {
    UtilizationSnapshot {
        kind,
        timestamp: at,
        onset: at,
        session_id: session.to_string(),
        value,
        running_max: value,
        status,
        repeat: 0,
        gpus,
        vram_gb,
    }
}

fn set_usage(snapshot: &mut SessionSnapshot, at: SimTime, status: UtilStatus) {
    let id = snapshot.session_id.clone();
    snapshot.cpu = Some(usage(ResourceKind::Cpu, &id, at, 0.0, status, 0, 0.0));
    snapshot.gpu = Some(usage(ResourceKind::Gpu, &id, at, 0.0, status, 0, 0.0));
    snapshot.memory = Some(usage(ResourceKind::Memory, &id, at, 0.0, status, 0, 0.0));
}

/// Builds a time-ordered session event stream step by step
pub struct TemplateSequencer {
    start: SimTime,
    tick: Duration,
    sessions: HashMap<String, SequencedSession>,
    heap: BinaryHeap<Pending>,
    next_global: u64,
}

impl TemplateSequencer {
    /// Tick 0 falls on `start`; every further tick adds `tick`.
    pub fn new(start: SimTime, tick: Duration) -> Self {
        Self {
            start,
            tick,
            sessions: HashMap::new(),
            heap: BinaryHeap::new(),
            next_global: 0,
        }
    }

    pub fn time_of(&self, tick: i64) -> SimTime {
        let tick_nanos = i64::try_from(self.tick.as_nanos()).unwrap_or(i64::MAX);
        SimTime::from_nanos(
            self.start
                .as_nanos()
                .saturating_add(tick.saturating_mul(tick_nanos)),
        )
    }

    /// Events released to the heap so far
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn entry(&mut self, id: &str) -> Result<&mut SequencedSession> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| SynthError::UnregisteredSession(id.to_string()))
    }

    fn status(&mut self, id: &str) -> Result<Option<SessionStatus>> {
        Ok(self.entry(id)?.snapshot.status)
    }

    pub fn register_session(&mut self, id: &str, limits: ResourceMaxima) -> Result<()> {
        if self.sessions.contains_key(id) {
            return Err(invalid(format!("session {} is already registered", id)));
        }
        let snapshot = SessionSnapshot {
            session_id: id.to_string(),
            status: Some(SessionStatus::Init),
            max_session_cpus: limits.cpus,
            max_session_memory_gb: limits.memory_gb,
            max_session_gpus: limits.gpus,
            max_session_vram_gb: limits.vram_gb,
            adjustment_factor: limits.adjustment_factor,
            ..SessionSnapshot::default()
        };
        self.sessions.insert(
            id.to_string(),
            SequencedSession {
                snapshot,
                next_local: 0,
                trainings: 0,
                waiting: None,
            },
        );
        Ok(())
    }

    /// Create an event carrying the session's current snapshot.
    fn create(&mut self, id: &str, name: SessionEventName, at: SimTime) -> Result<Event> {
        let global_index = self.next_global;
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SynthError::UnregisteredSession(id.to_string()))?;
        session.snapshot.timestamp = at;

        let mut event = Event::new(
            EventName::Session(name),
            SYNTHESIZER_SOURCE,
            at,
            EventPayload::Session(Box::new(session.snapshot.clone())),
        );
        event.global_index = global_index;
        event.local_index = session.next_local;
        session.next_local += 1;
        self.next_global += 1;

        debug!(session = %id, event = %event, "Sequenced template event");
        Ok(event)
    }

    fn hold(&mut self, id: &str, event: Event) -> Result<()> {
        self.entry(id)?.waiting = Some(event);
        Ok(())
    }

    /// Push the held event of `id` once its next step at `next` is known.
    fn release_waiting(&mut self, id: &str, next: SimTime) -> Result<()> {
        let session = self.entry(id)?;
        let Some(waiting) = session.waiting.take() else {
            return Ok(());
        };
        if waiting.timestamp > next {
            let message = format!(
                "session {}: step at {} comes before its {} at {}",
                id, next, waiting.name, waiting.timestamp
            );
            session.waiting = Some(waiting);
            return Err(invalid(message));
        }
        self.heap.push(Pending(waiting));
        Ok(())
    }

    /// `session-started` and `session-ready` at `tick`.
    pub fn add_session_started(&mut self, id: &str, tick: i64) -> Result<()> {
        if self.status(id)? != Some(SessionStatus::Init) {
            return Err(invalid(format!("session {} was already started", id)));
        }
        let at = self.time_of(tick);

        self.entry(id)?.snapshot.status = Some(SessionStatus::Initializing);
        let started = self.create(id, SessionEventName::SessionStarted, at)?;
        self.heap.push(Pending(started));

        let snapshot = &mut self.entry(id)?.snapshot;
        snapshot.status = Some(SessionStatus::Idle);
        snapshot.inited_at = Some(at);
        set_usage(snapshot, at, UtilStatus::Idle);
        let ready = self.create(id, SessionEventName::SessionReady, at)?;
        self.hold(id, ready)
    }

    /// `training-started` at the training's start tick and `training-ended`
    /// after its duration.
    pub fn add_training(&mut self, id: &str, training: &TemplateTraining) -> Result<()> {
        match self.status(id)? {
            Some(SessionStatus::Idle) => {}
            Some(SessionStatus::Init) => {
                return Err(invalid(format!("session {} trains before it started", id)))
            }
            _ => return Err(invalid(format!("session {} trains after it stopped", id))),
        }
        if training.duration_in_ticks <= 0 {
            return Err(invalid(format!(
                "session {}: training must last at least one tick, got {}",
                id, training.duration_in_ticks
            )));
        }
        let start = self.time_of(training.start_tick);
        let end = self.time_of(training.end_tick());
        self.release_waiting(id, start)?;

        let session = self.entry(id)?;
        let index = session.trainings;
        session.trainings += 1;

        let snapshot = &mut session.snapshot;
        let gpu_total: f64 = training.gpu_utilizations.iter().sum();
        let gpu_status = if gpu_total > 0.0 {
            UtilStatus::Busy
        } else {
            UtilStatus::Idle
        };
        let memory_gb = training.memory_mb / MB_PER_GB;
        snapshot.status = Some(SessionStatus::Training);
        snapshot.training_index = Some(index);
        snapshot.current_training_max_cpus = training.cpus;
        snapshot.current_training_max_memory_gb = memory_gb;
        snapshot.current_training_max_gpus = training.busy_gpus();
        snapshot.current_training_max_vram_gb = training.vram_gb;
        snapshot.cpu = Some(usage(
            ResourceKind::Cpu,
            id,
            start,
            training.cpus,
            UtilStatus::Busy,
            0,
            0.0,
        ));
        snapshot.gpu = Some(usage(
            ResourceKind::Gpu,
            id,
            start,
            gpu_total,
            gpu_status,
            training.busy_gpus(),
            training.vram_gb,
        ));
        snapshot.memory = Some(usage(
            ResourceKind::Memory,
            id,
            start,
            memory_gb,
            UtilStatus::Busy,
            0,
            0.0,
        ));
        let started = self.create(id, SessionEventName::TrainingStarted, start)?;
        self.heap.push(Pending(started));

        let snapshot = &mut self.entry(id)?.snapshot;
        snapshot.status = Some(SessionStatus::Idle);
        set_usage(snapshot, end, UtilStatus::Idle);
        let ended = self.create(id, SessionEventName::TrainingEnded, end)?;
        self.hold(id, ended)
    }

    /// `session-stopped` at `tick`.
    pub fn add_session_terminated(&mut self, id: &str, tick: i64) -> Result<()> {
        match self.status(id)? {
            Some(SessionStatus::Init) => {
                return Err(invalid(format!("session {} stops before it started", id)))
            }
            Some(SessionStatus::Stopped) => {
                return Err(invalid(format!("session {} was already stopped", id)))
            }
            _ => {}
        }
        let at = self.time_of(tick);
        self.release_waiting(id, at)?;

        let snapshot = &mut self.entry(id)?.snapshot;
        snapshot.status = Some(SessionStatus::Stopped);
        set_usage(snapshot, at, UtilStatus::Stopped);
        let stopped = self.create(id, SessionEventName::SessionStopped, at)?;
        self.heap.push(Pending(stopped));
        Ok(())
    }

    /// Hand every event to `consumer` in order, then signal completion.
    /// Returns the number of accepted events.
    pub async fn submit_events(mut self, consumer: Arc<dyn EventConsumer>) -> Result<u64> {
        for (id, session) in self.sessions.iter_mut() {
            if let Some(event) = session.waiting.take() {
                warn!(session = %id, event = %event.name, "Session was never stopped");
                self.heap.push(Pending(event));
            }
        }

        let mut submitted = 0;
        while let Some(Pending(event)) = self.heap.pop() {
            match consumer.submit_event(event).await {
                Ok(()) => submitted += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "Consumer rejected template event"),
            }
        }

        consumer.generator_complete().await;
        info!(events = submitted, "Template events submitted");
        Ok(submitted)
    }
}

fn copy_error(err: &SynthError) -> SynthError {
    match err {
        SynthError::InvalidTemplate(message) => SynthError::InvalidTemplate(message.clone()),
        other => SynthError::InvalidTemplate(other.to_string()),
    }
}

/// Validate `template`, sequence it with one tick per [`DEFAULT_TEMPLATE_TICK`]
/// starting at the epoch, and submit its events to `consumer`. A rejected
/// template is also reported to the consumer.
pub async fn generate_template_workload(
    template: &WorkloadTemplate,
    consumer: Arc<dyn EventConsumer>,
) -> Result<TemplateReport> {
    let prepared = template.validate().and_then(|final_tick| {
        let mut sequencer = TemplateSequencer::new(SimTime::ZERO, DEFAULT_TEMPLATE_TICK);
        template.sequence(&mut sequencer)?;
        Ok((final_tick, sequencer))
    });
    let (final_tick, sequencer) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            consumer.report_error(copy_error(&e)).await;
            return Err(e);
        }
    };

    let trainings: usize = template.sessions.iter().map(|s| s.trainings.len()).sum();
    let final_timestamp = sequencer.time_of(final_tick);
    info!(
        sessions = template.sessions.len(),
        trainings,
        final_tick,
        "Generating workload from template"
    );
    let events = sequencer.submit_events(consumer).await?;

    Ok(TemplateReport {
        sessions: template.sessions.len(),
        trainings,
        events,
        final_tick,
        final_timestamp,
    })
}
