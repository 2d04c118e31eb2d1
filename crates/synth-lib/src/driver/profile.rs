//! Per-resource driver profiles
//!
//! A profile bundles the hysteresis thresholds, the timestamp correction and
//! the same-tick aggregation rule of one resource kind.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{ResourceKind, SimTime, UtilStatus};

/// CPU deactivates after 3 consecutive idle readings
pub const CPU_DEACTIVATION_DELAY: u32 = 2;
/// CPU stops after 10 consecutive missing readings
pub const CPU_STOP_DELAY: u32 = 9;
/// CPU readings lag by the extrapolation window of the rate query
pub const CPU_RATE_OFFSET_SECS: i64 = -120;
pub const CPU_ACTIVATION_THRESHOLD: f64 = 1.0;

pub const GPU_DEACTIVATION_DELAY: u32 = 2;
pub const GPU_STOP_DELAY: u32 = 2;
pub const GPU_ACTIVATION_THRESHOLD: f64 = 0.0;

pub const MEMORY_DEACTIVATION_DELAY: u32 = 2;
pub const MEMORY_STOP_DELAY: u32 = 9;

/// Hysteresis thresholds of a utilization state machine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Readings strictly above this value are Busy. `None` disables activation.
    pub activation: Option<f64>,
    /// Idle repeats required before a Busy entity is deactivated
    pub deactivation_delay: u32,
    /// Missing-reading repeats required before an idle entity is stopped
    pub stop_delay: u32,
}

impl Thresholds {
    pub fn status_of(&self, value: f64) -> UtilStatus {
        match self.activation {
            Some(threshold) if value > threshold => UtilStatus::Busy,
            _ => UtilStatus::Idle,
        }
    }
}

/// How multiple rows of one entity within a single tick are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// The last row of the tick wins
    Latest,
    /// One row per device: values are summed, devices counted, VRAM maxed
    SumDevices,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriverProfile {
    pub kind: ResourceKind,
    pub thresholds: Thresholds,
    /// Added to every record timestamp, in seconds.
    pub timestamp_offset_secs: i64,
    pub aggregation: Aggregation,
}

impl DriverProfile {
    pub fn for_kind(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Cpu => Self::cpu(),
            ResourceKind::Gpu => Self::gpu(),
            ResourceKind::Memory => Self::memory(),
        }
    }

    pub fn cpu() -> Self {
        Self {
            kind: ResourceKind::Cpu,
            thresholds: Thresholds {
                activation: Some(CPU_ACTIVATION_THRESHOLD),
                deactivation_delay: CPU_DEACTIVATION_DELAY,
                stop_delay: CPU_STOP_DELAY,
            },
            timestamp_offset_secs: CPU_RATE_OFFSET_SECS,
            aggregation: Aggregation::Latest,
        }
    }

    pub fn gpu() -> Self {
        Self {
            kind: ResourceKind::Gpu,
            thresholds: Thresholds {
                activation: Some(GPU_ACTIVATION_THRESHOLD),
                deactivation_delay: GPU_DEACTIVATION_DELAY,
                stop_delay: GPU_STOP_DELAY,
            },
            timestamp_offset_secs: 0,
            aggregation: Aggregation::SumDevices,
        }
    }

    /// Memory only reports start and stop.
    pub fn memory() -> Self {
        Self {
            kind: ResourceKind::Memory,
            thresholds: Thresholds {
                activation: None,
                deactivation_delay: MEMORY_DEACTIVATION_DELAY,
                stop_delay: MEMORY_STOP_DELAY,
            },
            timestamp_offset_secs: 0,
            aggregation: Aggregation::Latest,
        }
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_timestamp_offset(mut self, secs: i64) -> Self {
        self.timestamp_offset_secs = secs;
        self
    }

    pub fn adjust(&self, ts: SimTime) -> SimTime {
        let offset = Duration::from_secs(self.timestamp_offset_secs.unsigned_abs());
        if self.timestamp_offset_secs < 0 {
            ts - offset
        } else {
            ts + offset
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_profile_applies_rate_offset() {
        let profile = DriverProfile::cpu();
        let adjusted = profile.adjust(SimTime::from_secs(1_000));
        assert_eq!(adjusted, SimTime::from_secs(880));
    }

    #[test]
    fn test_memory_never_activates() {
        let profile = DriverProfile::memory();
        assert_eq!(profile.thresholds.status_of(1e12), UtilStatus::Idle);
    }

    #[test]
    fn test_activation_is_strictly_above_threshold() {
        let thresholds = DriverProfile::cpu().thresholds;
        assert_eq!(thresholds.status_of(1.0), UtilStatus::Idle);
        assert_eq!(thresholds.status_of(1.01), UtilStatus::Busy);

        let gpu = DriverProfile::gpu().thresholds;
        assert_eq!(gpu.status_of(0.0), UtilStatus::Idle);
        assert_eq!(gpu.status_of(0.5), UtilStatus::Busy);
    }
}
