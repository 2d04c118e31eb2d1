//! Events passed between drivers, the synthesizer and the event queue

use serde::{Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

use crate::models::{ResourceKind, SessionSnapshot, SimTime, UtilizationSnapshot};

/// Identifier of an event producer (a driver or the synthesizer).
pub type SourceId = u32;

/// Lifecycle transitions reported by a resource driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverEventName {
    Started,
    Activated,
    Deactivated,
    Stopped,
}

impl DriverEventName {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DriverEventName::Started => "started",
            DriverEventName::Activated => "activated",
            DriverEventName::Deactivated => "deactivated",
            DriverEventName::Stopped => "stopped",
        }
    }
}

/// Lifecycle transitions of a whole session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventName {
    SessionStarted,
    SessionReady,
    TrainingStarted,
    TrainingEnded,
    SessionStopped,
}

impl SessionEventName {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionEventName::SessionStarted => "session-started",
            SessionEventName::SessionReady => "session-ready",
            SessionEventName::TrainingStarted => "training-started",
            SessionEventName::TrainingEnded => "training-ended",
            SessionEventName::SessionStopped => "session-stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Resource(ResourceKind, DriverEventName),
    Session(SessionEventName),
    /// Marks that a source advanced to a tick without lifecycle changes.
    TickHolder,
    /// The source has no more events.
    NoMore,
    /// The source failed; the payload carries the message.
    Error,
}

impl EventName {
    /// Sentinels retire a source in the synthesizer.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, EventName::NoMore | EventName::Error)
    }

    pub fn session(&self) -> Option<SessionEventName> {
        match self {
            EventName::Session(name) => Some(*name),
            _ => None,
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventName::Resource(kind, name) => write!(f, "{}-{}", kind, name.as_str()),
            EventName::Session(name) => f.write_str(name.as_str()),
            EventName::TickHolder => f.write_str("tickholder"),
            EventName::NoMore => f.write_str("nomore"),
            EventName::Error => f.write_str("error"),
        }
    }
}

impl Serialize for EventName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Reading(UtilizationSnapshot),
    Session(Box<SessionSnapshot>),
    Error(String),
    Empty,
}

/// An immutable event. Only its position inside a heap changes after creation.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: Uuid,
    pub name: EventName,
    pub source: SourceId,
    pub original_source: SourceId,
    pub timestamp: SimTime,
    /// Tie-break among events sharing a timestamp within one source.
    pub sequence_key: i64,
    /// Creation order across the whole synthesizer run.
    pub global_index: u64,
    /// Creation order within the event's session.
    pub local_index: u64,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(name: EventName, source: SourceId, timestamp: SimTime, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            source,
            original_source: source,
            timestamp,
            sequence_key: timestamp.as_nanos(),
            global_index: 0,
            local_index: 0,
            payload,
        }
    }

    pub fn reading(
        kind: ResourceKind,
        name: DriverEventName,
        source: SourceId,
        snapshot: UtilizationSnapshot,
    ) -> Self {
        let timestamp = snapshot.timestamp;
        Self::new(
            EventName::Resource(kind, name),
            source,
            timestamp,
            EventPayload::Reading(snapshot),
        )
    }

    pub fn tick_holder(source: SourceId, timestamp: SimTime) -> Self {
        Self::new(EventName::TickHolder, source, timestamp, EventPayload::Empty)
    }

    pub fn no_more(source: SourceId, timestamp: SimTime) -> Self {
        Self::new(EventName::NoMore, source, timestamp, EventPayload::Empty)
    }

    pub fn error(source: SourceId, timestamp: SimTime, message: impl Into<String>) -> Self {
        Self::new(
            EventName::Error,
            source,
            timestamp,
            EventPayload::Error(message.into()),
        )
    }

    /// Session id carried by the payload, if any.
    pub fn session_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Reading(reading) => Some(&reading.session_id),
            EventPayload::Session(snapshot) => Some(&snapshot.session_id),
            _ => None,
        }
    }

    pub fn reading_snapshot(&self) -> Option<&UtilizationSnapshot> {
        match &self.payload {
            EventPayload::Reading(reading) => Some(reading),
            _ => None,
        }
    }

    pub fn session_snapshot(&self) -> Option<&SessionSnapshot> {
        match &self.payload {
            EventPayload::Session(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[session={}, ts={}, global={}, local={}]",
            self.name,
            self.session_id().unwrap_or("-"),
            self.timestamp,
            self.global_index,
            self.local_index
        )
    }
}
