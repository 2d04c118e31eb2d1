//! Per-session and per-training-task maxima gathered in statistics mode
//!
//! The tracker is shared between a driver task, which records readings, and
//! the synthesizer task, which brackets training tasks. The driver runs ahead
//! of the synthesizer, so tasks are bracketed by timestamp: a task started at
//! `start` and ended at `end` covers every reading with `start <= at < end`,
//! whenever that reading arrived. Readings that a future bracket may still
//! claim are kept per session until the synthesizer's watermark passes them.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::models::{ResourceKind, SimTime};

/// Peaks of a session or of one of its training tasks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskMaxima {
    pub max_value: f64,
    pub max_gpus: u32,
    pub max_vram_gb: f64,
    /// Peak utilization per GPU device label
    pub devices: BTreeMap<String, f64>,
}

impl TaskMaxima {
    fn raise(&mut self, sample: &Sample) {
        match sample {
            Sample::Total {
                value,
                gpus,
                vram_gb,
            } => {
                self.max_value = self.max_value.max(*value);
                self.max_gpus = self.max_gpus.max(*gpus);
                self.max_vram_gb = self.max_vram_gb.max(*vram_gb);
            }
            Sample::Device { label, value } => {
                let peak = self.devices.entry(label.clone()).or_insert(*value);
                *peak = peak.max(*value);
            }
        }
    }

    fn fold<'a>(samples: impl Iterator<Item = &'a (SimTime, Sample)>) -> Self {
        let mut maxima = Self::default();
        samples.for_each(|(_, sample)| maxima.raise(sample));
        maxima
    }
}

/// Maxima of one session over the whole replay
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionMaxima {
    pub session: TaskMaxima,
    pub tasks: Vec<TaskMaxima>,
}

#[derive(Debug, Clone, PartialEq)]
enum Sample {
    Total { value: f64, gpus: u32, vram_gb: f64 },
    Device { label: String, value: f64 },
}

#[derive(Debug, Default)]
struct SessionState {
    maxima: SessionMaxima,
    /// Start of the open training task
    open: Option<SimTime>,
    /// Readings a bracket may still claim, in arrival order
    pending: VecDeque<(SimTime, Sample)>,
}

impl SessionState {
    fn record(&mut self, at: SimTime, sample: Sample, watermark: SimTime) {
        self.maxima.session.raise(&sample);
        let floor = self.open.unwrap_or(watermark);
        self.drop_before(floor);
        if at >= floor {
            self.pending.push_back((at, sample));
        }
    }

    fn drop_before(&mut self, at: SimTime) {
        while self.pending.front().is_some_and(|(ts, _)| *ts < at) {
            self.pending.pop_front();
        }
    }

    fn start(&mut self, at: SimTime) {
        if self.open.is_some() {
            self.end(at);
        }
        self.drop_before(at);
        self.open = Some(at);
    }

    fn end(&mut self, at: SimTime) {
        let Some(start) = self.open.take() else {
            return;
        };
        let task = TaskMaxima::fold(
            self.pending
                .iter()
                .filter(|(ts, _)| *ts >= start && *ts < at),
        );
        self.maxima.tasks.push(task);
        self.drop_before(at);
    }

    /// Maxima with a still open task closed over everything seen so far.
    fn settled(&self) -> SessionMaxima {
        let mut maxima = self.maxima.clone();
        if let Some(start) = self.open {
            let task = TaskMaxima::fold(self.pending.iter().filter(|(ts, _)| *ts >= start));
            maxima.tasks.push(task);
        }
        maxima
    }
}

#[derive(Debug, Clone)]
pub struct MaximaTracker {
    kind: ResourceKind,
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<SessionState>>>>>,
    /// Timestamp of the newest event merged by the synthesizer
    watermark: Arc<AtomicI64>,
}

impl MaximaTracker {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            watermark: Arc::new(AtomicI64::new(i64::MIN)),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn state(&self, session: &str) -> Arc<Mutex<SessionState>> {
        if let Some(state) = self.sessions.read().get(session) {
            return state.clone();
        }
        self.sessions
            .write()
            .entry(session.to_string())
            .or_default()
            .clone()
    }

    fn watermark(&self) -> SimTime {
        SimTime::from_nanos(self.watermark.load(Ordering::Acquire))
    }

    /// Record a committed reading taken at `at`.
    pub fn observe(&self, session: &str, at: SimTime, value: f64, gpus: u32, vram_gb: f64) {
        let sample = Sample::Total {
            value,
            gpus,
            vram_gb,
        };
        self.state(session).lock().record(at, sample, self.watermark());
    }

    /// Record the raw reading of one GPU device taken at `at`.
    pub fn observe_device(&self, session: &str, at: SimTime, device: &str, value: f64) {
        let sample = Sample::Device {
            label: device.to_string(),
            value,
        };
        self.state(session).lock().record(at, sample, self.watermark());
    }

    /// Open a training task for `session` at `at`.
    pub fn training_started(&self, session: &str, at: SimTime) {
        self.state(session).lock().start(at);
    }

    /// Close the open training task of `session` at `at`.
    pub fn training_ended(&self, session: &str, at: SimTime) {
        if let Some(state) = self.sessions.read().get(session) {
            state.lock().end(at);
        }
    }

    /// Every training bracket still to come is at or after `at`.
    pub fn settle(&self, at: SimTime) {
        self.watermark.fetch_max(at.as_nanos(), Ordering::AcqRel);
    }

    pub fn session(&self, session: &str) -> Option<SessionMaxima> {
        let state = self.sessions.read().get(session).cloned()?;
        let maxima = state.lock().settled();
        Some(maxima)
    }

    pub fn snapshot(&self) -> HashMap<String, SessionMaxima> {
        self.sessions
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), state.lock().settled()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> SimTime {
        SimTime::from_secs(secs)
    }

    #[test]
    fn test_session_maxima_only_rise() {
        let tracker = MaximaTracker::new(ResourceKind::Cpu);
        tracker.observe("s1", at(0), 3.0, 0, 0.0);
        tracker.observe("s1", at(60), 1.0, 0, 0.0);
        tracker.observe("s1", at(120), 5.0, 0, 0.0);

        assert_eq!(tracker.session("s1").unwrap().session.max_value, 5.0);
        assert!(tracker.session("s2").is_none());
    }

    #[test]
    fn test_task_maxima_bracketed_by_training() {
        let tracker = MaximaTracker::new(ResourceKind::Gpu);
        tracker.observe("s1", at(0), 90.0, 2, 8.0);
        tracker.training_started("s1", at(60));
        tracker.observe("s1", at(60), 40.0, 1, 4.0);
        tracker.training_ended("s1", at(120));
        tracker.observe("s1", at(120), 60.0, 1, 4.0);
        tracker.training_started("s1", at(180));
        tracker.observe("s1", at(180), 70.0, 4, 16.0);
        tracker.training_ended("s1", at(240));

        let maxima = tracker.session("s1").unwrap();
        assert_eq!(maxima.tasks.len(), 2);
        assert_eq!(maxima.tasks[0].max_value, 40.0);
        assert_eq!(maxima.tasks[1].max_gpus, 4);
        assert_eq!(maxima.session.max_value, 90.0);
        assert_eq!(maxima.session.max_vram_gb, 16.0);
    }

    #[test]
    fn test_readings_ahead_of_brackets_land_in_their_task() {
        let tracker = MaximaTracker::new(ResourceKind::Gpu);
        for (secs, value) in [(0, 0.0), (60, 50.0), (120, 30.0), (180, 80.0), (240, 0.0)] {
            tracker.observe("s1", at(secs), value, 1, 0.0);
        }
        tracker.training_started("s1", at(60));
        tracker.training_ended("s1", at(180));

        let maxima = tracker.session("s1").unwrap();
        assert_eq!(maxima.tasks.len(), 1);
        assert_eq!(maxima.tasks[0].max_value, 50.0);
        assert_eq!(maxima.session.max_value, 80.0);
    }

    #[test]
    fn test_open_task_is_closed_in_snapshot() {
        let tracker = MaximaTracker::new(ResourceKind::Cpu);
        tracker.training_started("s1", at(60));
        tracker.observe("s1", at(60), 250.0, 0, 0.0);
        tracker.observe("s1", at(120), 150.0, 0, 0.0);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot["s1"].tasks.len(), 1);
        assert_eq!(snapshot["s1"].tasks[0].max_value, 250.0);
    }

    #[test]
    fn test_readings_behind_the_watermark_are_not_kept() {
        let tracker = MaximaTracker::new(ResourceKind::Cpu);
        tracker.observe("s1", at(0), 500.0, 0, 0.0);
        tracker.settle(at(60));
        tracker.observe("s1", at(60), 100.0, 0, 0.0);
        tracker.training_started("s1", at(60));
        tracker.training_ended("s1", at(120));

        let state = tracker.state("s1");
        assert!(state.lock().pending.is_empty());
        let maxima = tracker.session("s1").unwrap();
        assert_eq!(maxima.tasks[0].max_value, 100.0);
        assert_eq!(maxima.session.max_value, 500.0);
    }

    #[test]
    fn test_device_peaks_per_session_and_task() {
        let tracker = MaximaTracker::new(ResourceKind::Gpu);
        tracker.observe_device("s1", at(0), "gpu-0", 10.0);
        tracker.observe_device("s1", at(60), "gpu-0", 30.0);
        tracker.observe_device("s1", at(60), "gpu-1", 5.0);
        tracker.observe_device("s1", at(120), "gpu-0", 20.0);
        tracker.training_started("s1", at(120));
        tracker.training_ended("s1", at(180));

        let maxima = tracker.session("s1").unwrap();
        assert_eq!(maxima.session.devices["gpu-0"], 30.0);
        assert_eq!(maxima.session.devices["gpu-1"], 5.0);
        assert_eq!(maxima.tasks[0].devices.len(), 1);
        assert_eq!(maxima.tasks[0].devices["gpu-0"], 20.0);
    }

    #[test]
    fn test_concurrent_updates_are_consistent() {
        let tracker = MaximaTracker::new(ResourceKind::Cpu);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let value = (t * 250 + i) as f64;
                        tracker.observe("shared", at(i), value, 0, 0.0);
                        tracker.observe(&format!("own-{}", t), at(i), value, 0, 0.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.session("shared").unwrap().session.max_value, 999.0);
        assert_eq!(tracker.snapshot().len(), 5);
    }
}
