//! Session state machine
//!
//! Fuses the per-resource lifecycle events of one session id into
//! session-level events. A session is ready once every replayed resource
//! kind has reported `started`, and stopped once every stop-relevant kind has
//! reported `stopped`. Events that cannot be interpreted yet are parked in a
//! bounded pending buffer and retried after each state change.

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, SynthError};
use crate::event::{DriverEventName, Event, EventName, SessionEventName};
use crate::models::{
    ResourceKind, SessionSnapshot, SessionStatus, SimTime, UtilStatus, UtilizationSnapshot,
};

/// Maximum number of events parked per session
pub const PENDING_CAPACITY: usize = 8;

/// Which resource kinds a session waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Flags that must be set before the session is ready
    pub ready_mask: u8,
    /// Flags that must be set before the session is stopped
    pub stop_mask: u8,
    /// Kind whose activation defines a training task
    pub training_kind: ResourceKind,
    pub pending_capacity: usize,
}

impl SessionPolicy {
    pub fn for_kinds(kinds: &[ResourceKind]) -> Self {
        let ready_mask = kinds.iter().fold(0u8, |mask, kind| mask | kind.ready_flag());
        let without_memory = ready_mask & !ResourceKind::Memory.ready_flag();
        let stop_mask = if without_memory == 0 {
            ready_mask
        } else {
            without_memory
        };
        let training_kind = [ResourceKind::Gpu, ResourceKind::Cpu, ResourceKind::Memory]
            .into_iter()
            .find(|kind| kinds.contains(kind))
            .unwrap_or(ResourceKind::Gpu);

        Self {
            ready_mask,
            stop_mask,
            training_kind,
            pending_capacity: PENDING_CAPACITY,
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::for_kinds(&ResourceKind::ALL)
    }
}

enum Step {
    Applied(Option<SessionEventName>),
    Deferred,
}

#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    policy: SessionPolicy,
    status: SessionStatus,
    timestamp: SimTime,
    ready_flags: u8,
    stop_flags: u8,
    cpu: Option<UtilizationSnapshot>,
    gpu: Option<UtilizationSnapshot>,
    memory: Option<UtilizationSnapshot>,
    inited_at: Option<SimTime>,
    init_delay: Duration,
    trainings: usize,
    training_index: Option<usize>,
    pending: VecDeque<Event>,
    dropped: u64,
}

impl Session {
    pub fn new(id: impl Into<String>, policy: SessionPolicy) -> Self {
        Self {
            id: id.into(),
            policy,
            status: SessionStatus::Init,
            timestamp: SimTime::ZERO,
            ready_flags: 0,
            stop_flags: 0,
            cpu: None,
            gpu: None,
            memory: None,
            inited_at: None,
            init_delay: Duration::ZERO,
            trainings: 0,
            training_index: None,
            pending: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Parked events discarded because they failed on retry
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Number of training tasks started so far
    pub fn trainings(&self) -> usize {
        self.trainings
    }

    pub fn reading(&self, kind: ResourceKind) -> Option<&UtilizationSnapshot> {
        match kind {
            ResourceKind::Cpu => self.cpu.as_ref(),
            ResourceKind::Gpu => self.gpu.as_ref(),
            ResourceKind::Memory => self.memory.as_ref(),
        }
    }

    /// Apply a driver event. Returns the session events it produced, including
    /// those released from the pending buffer.
    ///
    /// An illegal transition leaves the session untouched and returns
    /// [`SynthError::UnexpectedSessionTransition`].
    pub fn transit(&mut self, event: Event) -> Result<Vec<SessionEventName>> {
        let mut emitted = Vec::new();
        match self.apply(&event)? {
            Step::Deferred => {
                self.defer(event)?;
                return Ok(emitted);
            }
            Step::Applied(name) => {
                emitted.extend(name);
                self.settle(&mut emitted);
            }
        }
        self.retry_pending(&mut emitted);
        Ok(emitted)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            timestamp: self.timestamp,
            status: Some(self.status),
            cpu: self.cpu.clone(),
            gpu: self.gpu.clone(),
            memory: self.memory.clone(),
            inited_at: self.inited_at,
            init_delay: self.init_delay,
            training_index: self.training_index,
            adjustment_factor: 1.0,
            ..SessionSnapshot::default()
        }
    }

    fn defer(&mut self, event: Event) -> Result<()> {
        if self.pending.len() >= self.policy.pending_capacity {
            return Err(SynthError::PendingOverflow {
                session: self.id.clone(),
            });
        }
        debug!(session = %self.id, status = %self.status, event = %event.name, "Deferring event");
        self.pending.push_back(event);
        Ok(())
    }

    fn retry_pending(&mut self, emitted: &mut Vec<SessionEventName>) {
        for _ in 0..=self.policy.pending_capacity {
            if self.pending.is_empty() {
                return;
            }
            let mut progressed = false;
            let parked = std::mem::take(&mut self.pending);
            for event in parked {
                match self.apply(&event) {
                    Ok(Step::Deferred) => self.pending.push_back(event),
                    Ok(Step::Applied(name)) => {
                        progressed = true;
                        emitted.extend(name);
                        self.settle(emitted);
                    }
                    Err(e) => {
                        progressed = true;
                        self.dropped += 1;
                        warn!(session = %self.id, error = %e, "Dropping pending event");
                    }
                }
            }
            if !progressed {
                return;
            }
        }
    }

    /// Completion checks that follow every applied transition.
    fn settle(&mut self, emitted: &mut Vec<SessionEventName>) {
        match self.status {
            SessionStatus::Initializing if self.ready_flags == self.policy.ready_mask => {
                self.status = SessionStatus::Idle;
                emitted.push(SessionEventName::SessionReady);
            }
            SessionStatus::Stopping if self.stop_flags == self.policy.stop_mask => {
                self.status = SessionStatus::Stopped;
                emitted.push(SessionEventName::SessionStopped);
            }
            _ => {}
        }
    }

    fn apply(&mut self, event: &Event) -> Result<Step> {
        let EventName::Resource(kind, name) = event.name else {
            return Err(self.unexpected(event));
        };
        let step = self.step(kind, name, event.timestamp).ok_or_else(|| self.unexpected(event))?;
        if let Step::Applied(_) = step {
            self.timestamp = event.timestamp;
            if let Some(reading) = event.reading_snapshot() {
                self.set_reading(kind, reading.clone());
            }
        }
        Ok(step)
    }

    /// The transition table. `None` marks an undefined combination.
    fn step(&mut self, kind: ResourceKind, name: DriverEventName, at: SimTime) -> Option<Step> {
        use DriverEventName as Driver;
        use SessionStatus as Status;

        let flag = kind.ready_flag();
        let training = kind == self.policy.training_kind;
        let stops = flag & self.policy.stop_mask != 0;

        let step = match (self.status, name) {
            (Status::Init, Driver::Started) => {
                self.status = Status::Initializing;
                self.inited_at = Some(at);
                self.ready_flags = flag & self.policy.ready_mask;
                Step::Applied(Some(SessionEventName::SessionStarted))
            }
            (Status::Initializing, Driver::Started) => {
                self.ready_flags |= flag & self.policy.ready_mask;
                self.init_delay = at.duration_since(self.inited_at.unwrap_or(at));
                Step::Applied(None)
            }
            (Status::Initializing, _) => Step::Deferred,

            (Status::Idle, Driver::Activated) if training => {
                self.status = Status::Training;
                self.training_index = Some(self.trainings);
                self.trainings += 1;
                Step::Applied(Some(SessionEventName::TrainingStarted))
            }
            (Status::Idle, Driver::Activated | Driver::Deactivated) => Step::Applied(None),
            (Status::Idle, Driver::Stopped) if stops => {
                self.status = Status::Stopping;
                self.stop_flags = flag;
                Step::Applied(None)
            }
            (Status::Idle, Driver::Stopped) => Step::Applied(None),

            (Status::Training, Driver::Deactivated) if training => {
                self.status = Status::Idle;
                Step::Applied(Some(SessionEventName::TrainingEnded))
            }
            (Status::Training, Driver::Activated | Driver::Deactivated) if !training => {
                Step::Applied(None)
            }
            (Status::Training, Driver::Stopped) if !stops => Step::Applied(None),
            (Status::Training, Driver::Stopped) if !training => Step::Deferred,

            (Status::Stopping, Driver::Stopped) => {
                self.stop_flags |= flag & self.policy.stop_mask;
                Step::Applied(None)
            }
            (Status::Stopping, Driver::Started)
                if self.reading(kind).map(|r| r.status) == Some(UtilStatus::Stopped) =>
            {
                self.status = Status::Idle;
                self.stop_flags = 0;
                Step::Applied(None)
            }
            (Status::Stopping, Driver::Activated | Driver::Deactivated) if !training => {
                Step::Applied(None)
            }

            (Status::Stopped, Driver::Stopped) if !stops => Step::Applied(None),

            _ => return None,
        };
        Some(step)
    }

    fn set_reading(&mut self, kind: ResourceKind, reading: UtilizationSnapshot) {
        let slot = match kind {
            ResourceKind::Cpu => &mut self.cpu,
            ResourceKind::Gpu => &mut self.gpu,
            ResourceKind::Memory => &mut self.memory,
        };
        *slot = Some(reading);
    }

    fn unexpected(&self, event: &Event) -> SynthError {
        SynthError::UnexpectedSessionTransition {
            session: self.id.clone(),
            status: self.status.to_string(),
            event: event.name.to_string(),
        }
    }
}
