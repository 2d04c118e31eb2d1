//! Per-entity utilization state and its hysteresis transition function

use crate::error::{Result, SynthError};
use crate::event::DriverEventName;
use crate::models::{Record, ResourceKind, SimTime, UtilStatus, UtilizationSnapshot};

use super::profile::{Aggregation, Thresholds};

#[derive(Debug, Clone, PartialEq)]
pub struct UtilizationState {
    pub timestamp: SimTime,
    pub onset: SimTime,
    pub session_id: String,
    pub value: f64,
    pub running_max: f64,
    pub status: UtilStatus,
    /// Consecutive readings with the same effective status, minus one.
    pub repeat: u32,
    pub gpus: u32,
    pub vram_gb: f64,
}

impl UtilizationState {
    pub fn stopped(session_id: impl Into<String>) -> Self {
        Self {
            timestamp: SimTime::ZERO,
            onset: SimTime::ZERO,
            session_id: session_id.into(),
            value: 0.0,
            running_max: 0.0,
            status: UtilStatus::Stopped,
            repeat: 0,
            gpus: 0,
            vram_gb: 0.0,
        }
    }

    pub fn snapshot(&self, kind: ResourceKind) -> UtilizationSnapshot {
        UtilizationSnapshot {
            kind,
            timestamp: self.timestamp,
            onset: self.onset,
            session_id: self.session_id.clone(),
            value: self.value,
            running_max: self.running_max,
            status: self.status,
            repeat: self.repeat,
            gpus: self.gpus,
            vram_gb: self.vram_gb,
        }
    }
}

/// Readings of one entity accumulated within the current tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReading {
    pub timestamp: SimTime,
    pub value: f64,
    pub gpus: u32,
    pub vram_gb: f64,
}

/// Two-slot ring of an entity's state: `current` and the `previous` step.
#[derive(Debug, Clone)]
pub struct EntitySlot {
    pub current: UtilizationState,
    pub previous: Option<UtilizationState>,
    pub pending: Option<TickReading>,
}

impl EntitySlot {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            current: UtilizationState::stopped(session_id),
            previous: None,
            pending: None,
        }
    }

    /// Fold a record into the reading of its tick.
    pub fn stage(&mut self, timestamp: SimTime, record: &Record, aggregation: Aggregation) {
        let reading = match (self.pending, aggregation) {
            (Some(acc), Aggregation::SumDevices) if acc.timestamp == timestamp => TickReading {
                timestamp,
                value: acc.value + record.value,
                gpus: acc.gpus + 1,
                vram_gb: acc.vram_gb.max(record.vram_gb),
            },
            _ => TickReading {
                timestamp,
                value: record.value,
                gpus: u32::from(record.device.is_some()),
                vram_gb: record.vram_gb,
            },
        };
        self.pending = Some(reading);
    }

    fn archive(&mut self) -> &UtilizationState {
        self.previous.insert(self.current.clone())
    }

    fn advance_to(&mut self, timestamp: SimTime, value: f64, status: UtilStatus) {
        let prev = self.archive().clone();
        let repeat = if status == prev.status.effective() {
            prev.repeat + 1
        } else {
            0
        };
        self.current.timestamp = timestamp;
        self.current.value = value;
        self.current.status = status;
        self.current.repeat = repeat;
        self.current.onset = if repeat == 0 { timestamp } else { prev.onset };
        self.current.running_max = prev.running_max.max(value);
    }

    /// Commit a real reading; the status still needs [`transit`].
    pub fn commit(&mut self, reading: TickReading, thresholds: &Thresholds) {
        self.advance_to(reading.timestamp, reading.value, thresholds.status_of(reading.value));
        self.current.gpus = reading.gpus;
        self.current.vram_gb = reading.vram_gb;
    }

    /// Synthesize a zero reading for a tick without data.
    pub fn reset(&mut self, timestamp: SimTime) {
        self.advance_to(timestamp, 0.0, UtilStatus::Stopped);
    }

    /// Restore the state before the last commit or reset.
    pub fn rollback(&mut self) {
        if let Some(prev) = self.previous.take() {
            self.current = prev;
        }
    }

    pub fn previous_status(&self) -> UtilStatus {
        self.previous
            .as_ref()
            .map(|p| p.status)
            .unwrap_or(UtilStatus::Stopped)
    }
}

fn unexpected(kind: ResourceKind, from: UtilStatus, to: UtilStatus) -> SynthError {
    SynthError::UnexpectedStateTransition {
        kind,
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Drive `state.status` from `previous` towards the freshly computed status.
///
/// Debounce states (`IdleDelay`, `Stopping`) are written back into
/// `state.status`. Emitted events are appended to `out` in order.
pub fn transit(
    kind: ResourceKind,
    previous: UtilStatus,
    state: &mut UtilizationState,
    force: bool,
    thresholds: &Thresholds,
    out: &mut Vec<DriverEventName>,
) -> Result<()> {
    let mut last = previous;
    loop {
        if last == state.status {
            return Ok(());
        }

        match (last, state.status) {
            (UtilStatus::Stopped, UtilStatus::Idle | UtilStatus::Busy) => {
                out.push(DriverEventName::Started);
                last = UtilStatus::Idle;
            }
            (UtilStatus::Idle, UtilStatus::Busy) => {
                out.push(DriverEventName::Activated);
                last = UtilStatus::Busy;
            }
            (UtilStatus::Idle, UtilStatus::Stopped) => {
                if force || state.repeat == thresholds.stop_delay {
                    out.push(DriverEventName::Stopped);
                    last = UtilStatus::Stopped;
                } else {
                    state.status = UtilStatus::Stopping;
                    return Ok(());
                }
            }
            (UtilStatus::IdleDelay, UtilStatus::Idle)
                if state.repeat < thresholds.deactivation_delay =>
            {
                state.status = UtilStatus::IdleDelay;
                return Ok(());
            }
            (UtilStatus::IdleDelay, UtilStatus::Idle | UtilStatus::Stopped) => {
                out.push(DriverEventName::Deactivated);
                last = UtilStatus::Idle;
            }
            (UtilStatus::IdleDelay, UtilStatus::Busy) => {
                last = UtilStatus::Busy;
            }
            (UtilStatus::Busy, UtilStatus::Idle)
                if state.repeat == thresholds.deactivation_delay =>
            {
                out.push(DriverEventName::Deactivated);
                last = UtilStatus::Idle;
            }
            (UtilStatus::Busy, UtilStatus::Stopped) => {
                out.push(DriverEventName::Deactivated);
                last = UtilStatus::Idle;
            }
            (UtilStatus::Busy, UtilStatus::Idle) => {
                state.status = UtilStatus::IdleDelay;
                return Ok(());
            }
            (UtilStatus::Stopping, UtilStatus::Stopped) => {
                if !force && state.repeat < thresholds.stop_delay {
                    state.status = UtilStatus::Stopping;
                    return Ok(());
                }
                out.push(DriverEventName::Stopped);
                last = UtilStatus::Stopped;
            }
            (UtilStatus::Stopping, UtilStatus::Idle | UtilStatus::Busy) => {
                last = UtilStatus::Idle;
            }
            (from, to) => return Err(unexpected(kind, from, to)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(deactivation_delay: u32, stop_delay: u32) -> Thresholds {
        Thresholds {
            activation: Some(1.0),
            deactivation_delay,
            stop_delay,
        }
    }

    fn run(previous: UtilStatus, status: UtilStatus, repeat: u32, force: bool) -> (Result<()>, UtilStatus, Vec<DriverEventName>) {
        let mut state = UtilizationState::stopped("s");
        state.status = status;
        state.repeat = repeat;
        let mut out = Vec::new();
        let result = transit(
            ResourceKind::Cpu,
            previous,
            &mut state,
            force,
            &thresholds(2, 2),
            &mut out,
        );
        (result, state.status, out)
    }

    #[test]
    fn test_started_then_activated_from_stopped() {
        let (result, status, out) = run(UtilStatus::Stopped, UtilStatus::Busy, 0, false);
        assert!(result.is_ok());
        assert_eq!(status, UtilStatus::Busy);
        assert_eq!(out, vec![DriverEventName::Started, DriverEventName::Activated]);
    }

    #[test]
    fn test_busy_to_idle_is_debounced() {
        let (_, status, out) = run(UtilStatus::Busy, UtilStatus::Idle, 0, false);
        assert_eq!(status, UtilStatus::IdleDelay);
        assert!(out.is_empty());

        let (_, status, out) = run(UtilStatus::IdleDelay, UtilStatus::Idle, 1, false);
        assert_eq!(status, UtilStatus::IdleDelay);
        assert!(out.is_empty());

        let (_, status, out) = run(UtilStatus::IdleDelay, UtilStatus::Idle, 2, false);
        assert_eq!(status, UtilStatus::Idle);
        assert_eq!(out, vec![DriverEventName::Deactivated]);
    }

    #[test]
    fn test_forced_stop_from_busy_deactivates_then_stops() {
        let (_, status, out) = run(UtilStatus::Busy, UtilStatus::Stopped, 0, true);
        assert_eq!(status, UtilStatus::Stopped);
        assert_eq!(
            out,
            vec![DriverEventName::Deactivated, DriverEventName::Stopped]
        );
    }

    #[test]
    fn test_stopping_recovers_on_reading() {
        let (_, status, out) = run(UtilStatus::Stopping, UtilStatus::Busy, 0, false);
        assert_eq!(status, UtilStatus::Busy);
        assert_eq!(out, vec![DriverEventName::Activated]);

        let (_, status, out) = run(UtilStatus::Stopping, UtilStatus::Idle, 0, false);
        assert_eq!(status, UtilStatus::Idle);
        assert!(out.is_empty());
    }

    #[test]
    fn test_transition_function_is_total() {
        // Raw statuses computed from readings are Stopped, Idle or Busy; every
        // pair with those targets is defined. Debounce states are never a
        // valid target unless already current.
        let raw = [UtilStatus::Stopped, UtilStatus::Idle, UtilStatus::Busy];
        for previous in UtilStatus::ALL {
            for status in UtilStatus::ALL {
                for force in [false, true] {
                    let (result, _, _) = run(previous, status, 0, force);
                    if raw.contains(&status) || previous == status {
                        assert!(result.is_ok(), "{previous} -> {status} should be defined");
                    } else {
                        assert!(
                            matches!(result, Err(SynthError::UnexpectedStateTransition { .. })),
                            "{previous} -> {status} should be rejected"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_repeat_counts_effective_status() {
        let th = thresholds(2, 2);
        let mut slot = EntitySlot::new("s");
        let at = |s| SimTime::from_secs(s);
        let reading = |s, v| TickReading {
            timestamp: at(s),
            value: v,
            gpus: 0,
            vram_gb: 0.0,
        };

        slot.commit(reading(0, 2.0), &th);
        assert_eq!((slot.current.status, slot.current.repeat), (UtilStatus::Busy, 0));
        slot.commit(reading(60, 0.0), &th);
        assert_eq!(slot.current.repeat, 0);
        slot.current.status = UtilStatus::IdleDelay;
        slot.commit(reading(120, 0.0), &th);
        assert_eq!(slot.current.repeat, 1);
        assert_eq!(slot.current.onset, at(60));
        assert_eq!(slot.current.running_max, 2.0);

        slot.current.status = UtilStatus::Stopping;
        slot.reset(at(180));
        assert_eq!((slot.current.status, slot.current.repeat), (UtilStatus::Stopped, 2));
    }

    #[test]
    fn test_rollback_restores_previous_state() {
        let mut slot = EntitySlot::new("s");
        slot.commit(
            TickReading {
                timestamp: SimTime::from_secs(1),
                value: 5.0,
                gpus: 0,
                vram_gb: 0.0,
            },
            &thresholds(2, 2),
        );
        slot.rollback();
        assert_eq!(slot.current.status, UtilStatus::Stopped);
        assert_eq!(slot.current.value, 0.0);
    }

    #[test]
    fn test_stage_sums_gpu_devices() {
        let mut slot = EntitySlot::new("s");
        let ts = SimTime::from_secs(10);
        let mut rec = Record::new(ts, 0, 30.0);
        rec.device = Some("gpu-0".into());
        rec.vram_gb = 4.0;
        slot.stage(ts, &rec, Aggregation::SumDevices);
        rec.device = Some("gpu-1".into());
        rec.value = 20.0;
        rec.vram_gb = 8.0;
        slot.stage(ts, &rec, Aggregation::SumDevices);

        let pending = slot.pending.unwrap();
        assert_eq!(pending.gpus, 2);
        assert_eq!(pending.value, 50.0);
        assert_eq!(pending.vram_gb, 8.0);
    }
}
