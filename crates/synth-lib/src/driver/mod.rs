//! Resource drivers
//!
//! A driver owns the utilization state machines of every entity of one
//! resource kind. It consumes a chronological record stream and emits
//! per-entity lifecycle events (`started`, `activated`, `deactivated`,
//! `stopped`) onto its own channel, debouncing noisy readings with the
//! thresholds of its [`DriverProfile`].

mod emitter;
mod maxima;
mod profile;
mod state;
mod task;
mod trace_driver;


pub use emitter::EventEmitter;
pub use maxima::{MaximaTracker, SessionMaxima, TaskMaxima};
pub use profile::{
    Aggregation, DriverProfile, Thresholds, CPU_ACTIVATION_THRESHOLD, CPU_DEACTIVATION_DELAY,
    CPU_RATE_OFFSET_SECS, CPU_STOP_DELAY, GPU_ACTIVATION_THRESHOLD, GPU_DEACTIVATION_DELAY,
    GPU_STOP_DELAY, MEMORY_DEACTIVATION_DELAY, MEMORY_STOP_DELAY,
};
pub use state::{transit, EntitySlot, TickReading, UtilizationState};
pub use task::{DriverTask, DriverTaskBuilder};
pub use trace_driver::{DriverStats, TraceDriver};

use std::path::PathBuf;
use std::time::Duration;

use crate::models::{ResourceKind, SimTime};

/// Default cap on entity indices accepted from a trace
pub const DEFAULT_MAX_ENTITIES: usize = 1 << 20;

/// Configuration of one resource driver
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Thresholds, timestamp correction and aggregation of the resource kind
    pub profile: DriverProfile,
    /// Optional `key` file mapping entity index to session id
    pub mapping_path: Option<PathBuf>,
    /// Alternating downtime start/end timestamps
    pub downtimes: Vec<SimTime>,
    /// Nominal distance between trace readings (default: 60 seconds)
    pub reading_interval: Duration,
    /// Seed of the sequence-key jitter
    pub rng_seed: u64,
    /// Capacity of the driver's event channel (default: 1)
    pub channel_capacity: usize,
    /// Records with an entity index at or above this are skipped
    pub max_entities: usize,
}

impl DriverConfig {
    pub fn for_kind(kind: ResourceKind) -> Self {
        Self {
            profile: DriverProfile::for_kind(kind),
            ..Self::default()
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            profile: DriverProfile::cpu(),
            mapping_path: None,
            downtimes: Vec::new(),
            reading_interval: Duration::from_secs(60),
            rng_seed: 0,
            channel_capacity: 1,
            max_entities: DEFAULT_MAX_ENTITIES,
        }
    }
}
