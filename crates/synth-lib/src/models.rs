//! Core data models shared by drivers, sessions and queues

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// Raw trace timestamps below this value are unix seconds, above it nanoseconds.
pub const MAX_TIME_SEC: i64 = 10_000_000_000;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Virtual time in nanoseconds since the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimTime(i64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        SimTime(nanos)
    }

    pub const fn from_secs(secs: i64) -> Self {
        SimTime(secs.saturating_mul(NANOS_PER_SEC))
    }

    /// Interpret a raw trace value as seconds or nanoseconds depending on magnitude.
    pub fn from_unix(raw: i64) -> Self {
        if raw < MAX_TIME_SEC {
            Self::from_secs(raw)
        } else {
            Self::from_nanos(raw)
        }
    }

    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    pub const fn as_secs(&self) -> i64 {
        self.0.div_euclid(NANOS_PER_SEC)
    }

    /// Elapsed time since `earlier`, zero if `earlier` is later.
    pub fn duration_since(&self, earlier: SimTime) -> Duration {
        if self.0 <= earlier.0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((self.0 - earlier.0) as u64)
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> SimTime {
        SimTime(self.0.saturating_add(duration_nanos(rhs)))
    }
}

impl Sub<Duration> for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Duration) -> SimTime {
        SimTime(self.0.saturating_sub(duration_nanos(rhs)))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

/// serde helper for trace columns holding unix seconds or nanoseconds.
pub fn deserialize_unix_time<'de, D>(deserializer: D) -> Result<SimTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    Ok(SimTime::from_unix(raw))
}

/// Kind of traced resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Gpu,
    Memory,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Cpu, ResourceKind::Gpu, ResourceKind::Memory];

    /// Readiness bit used by the session state machine.
    pub const fn ready_flag(&self) -> u8 {
        match self {
            ResourceKind::Cpu => 0x01,
            ResourceKind::Gpu => 0x02,
            ResourceKind::Memory => 0x04,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Gpu => "gpu",
            ResourceKind::Memory => "memory",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamped observation decoded from a trace row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: SimTime,
    pub entity_index: usize,
    pub value: f64,
    /// GPU device label, one row per device and tick.
    pub device: Option<String>,
    pub vram_gb: f64,
}

impl Record {
    pub fn new(timestamp: SimTime, entity_index: usize, value: f64) -> Self {
        Self {
            timestamp,
            entity_index,
            value,
            device: None,
            vram_gb: 0.0,
        }
    }
}

/// Status of a per-entity utilization state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtilStatus {
    Stopped,
    Idle,
    IdleDelay,
    Busy,
    Stopping,
}

impl UtilStatus {
    pub const ALL: [UtilStatus; 5] = [
        UtilStatus::Stopped,
        UtilStatus::Idle,
        UtilStatus::IdleDelay,
        UtilStatus::Busy,
        UtilStatus::Stopping,
    ];

    /// Status used for repeat counting: debounce states count as their target.
    pub fn effective(&self) -> UtilStatus {
        match self {
            UtilStatus::IdleDelay => UtilStatus::Idle,
            UtilStatus::Stopping => UtilStatus::Stopped,
            other => *other,
        }
    }
}

impl fmt::Display for UtilStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UtilStatus::Stopped => "stopped",
            UtilStatus::Idle => "idle",
            UtilStatus::IdleDelay => "idle_delay",
            UtilStatus::Busy => "busy",
            UtilStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Immutable copy of an entity's utilization state, carried by driver events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSnapshot {
    pub kind: ResourceKind,
    pub timestamp: SimTime,
    /// Tick at which the current status run began.
    pub onset: SimTime,
    pub session_id: String,
    pub value: f64,
    pub running_max: f64,
    pub status: UtilStatus,
    pub repeat: u32,
    /// Number of GPU devices reporting in this tick.
    pub gpus: u32,
    pub vram_gb: f64,
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Init,
    Initializing,
    Idle,
    Training,
    Stopping,
    Stopped,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Init => "init",
            SessionStatus::Initializing => "initializing",
            SessionStatus::Idle => "idle",
            SessionStatus::Training => "training",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a session attached to every session-level event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub timestamp: SimTime,
    pub status: Option<SessionStatus>,
    pub cpu: Option<UtilizationSnapshot>,
    pub gpu: Option<UtilizationSnapshot>,
    pub memory: Option<UtilizationSnapshot>,
    pub inited_at: Option<SimTime>,
    /// Time between session start and the last readiness flag.
    pub init_delay: Duration,
    /// Zero-based index of the current or most recent training task.
    pub training_index: Option<usize>,

    /// Whole-session maxima, only populated in standard mode
    pub max_session_cpus: f64,
    pub max_session_memory_gb: f64,
    pub max_session_gpus: u32,
    pub max_session_vram_gb: f64,

    /// Maxima of the current training task, only populated in standard mode
    pub current_training_max_cpus: f64,
    pub current_training_max_memory_gb: f64,
    pub current_training_max_gpus: u32,
    pub current_training_max_vram_gb: f64,

    /// Ratio between reported and adjusted GPU count, 1.0 when unadjusted.
    pub adjustment_factor: f64,
}
