//! Observability infrastructure for trace replay
//!
//! Provides:
//! - Prometheus metrics (records processed, lifecycle events, transition errors, queue depth)
//! - Structured JSON logging with tracing
//!
//! Both handles are plain values passed into the components that use them.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::{error, info, warn};

use crate::models::{ResourceKind, SimTime};

/// Histogram buckets for the merge step latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
];

/// Replay metrics for Prometheus exposition
///
/// Clones share the same underlying metrics and registry.
#[derive(Clone)]
pub struct SynthMetrics {
    registry: Registry,
    records_processed: IntCounterVec,
    records_skipped: IntCounterVec,
    driver_events: IntCounterVec,
    session_events: IntCounterVec,
    transition_errors: IntCounterVec,
    active_sessions: IntGauge,
    queue_depth: IntGauge,
    merge_latency_seconds: Histogram,
}

impl SynthMetrics {
    /// Create the metrics and register them in a private registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let records_processed = IntCounterVec::new(
            Opts::new(
                "synth_records_processed_total",
                "Trace records handled by resource drivers",
            ),
            &["kind"],
        )?;
        let records_skipped = IntCounterVec::new(
            Opts::new(
                "synth_records_skipped_total",
                "Malformed or out-of-order trace records that were skipped",
            ),
            &["kind"],
        )?;
        let driver_events = IntCounterVec::new(
            Opts::new(
                "synth_driver_events_total",
                "Lifecycle events emitted by resource drivers",
            ),
            &["kind"],
        )?;
        let session_events = IntCounterVec::new(
            Opts::new(
                "synth_session_events_total",
                "Session-level events emitted by the synthesizer",
            ),
            &["name"],
        )?;
        let transition_errors = IntCounterVec::new(
            Opts::new(
                "synth_transition_errors_total",
                "Events dropped because of an unexpected state transition",
            ),
            &["component"],
        )?;
        let active_sessions = IntGauge::new(
            "synth_active_sessions",
            "Sessions known to the synthesizer that have not stopped",
        )?;
        let queue_depth = IntGauge::new("synth_queue_depth", "Events buffered in the event queue")?;
        let merge_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "synth_merge_latency_seconds",
                "Time spent merging one driver event into the session stream",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(records_processed.clone()))?;
        registry.register(Box::new(records_skipped.clone()))?;
        registry.register(Box::new(driver_events.clone()))?;
        registry.register(Box::new(session_events.clone()))?;
        registry.register(Box::new(transition_errors.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(merge_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            records_processed,
            records_skipped,
            driver_events,
            session_events,
            transition_errors,
            active_sessions,
            queue_depth,
            merge_latency_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn inc_records_processed(&self, kind: ResourceKind) {
        self.records_processed
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_records_skipped(&self, kind: ResourceKind) {
        self.records_skipped.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn inc_driver_events(&self, kind: ResourceKind, count: u64) {
        self.driver_events
            .with_label_values(&[kind.as_str()])
            .inc_by(count);
    }

    pub fn inc_session_event(&self, name: &str) {
        self.session_events.with_label_values(&[name]).inc();
    }

    pub fn inc_transition_errors(&self, component: &str) {
        self.transition_errors.with_label_values(&[component]).inc();
    }

    pub fn set_active_sessions(&self, count: i64) {
        self.active_sessions.set(count);
    }

    pub fn set_queue_depth(&self, depth: i64) {
        self.queue_depth.set(depth);
    }

    pub fn observe_merge_latency(&self, duration_secs: f64) {
        self.merge_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for replay lifecycle events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    workload: String,
}

impl StructuredLogger {
    pub fn new(workload: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
        }
    }

    pub fn workload(&self) -> &str {
        &self.workload
    }

    /// Log the start of a replay
    pub fn log_replay_started(&self, mode: &str, kinds: &[ResourceKind]) {
        let kinds: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
        info!(
            event = "replay_started",
            workload = %self.workload,
            mode = %mode,
            kinds = ?kinds,
            "Trace replay started"
        );
    }

    /// Log the end of a replay
    pub fn log_replay_finished(&self, sessions: usize, session_events: u64, transition_errors: u64) {
        info!(
            event = "replay_finished",
            workload = %self.workload,
            sessions = sessions,
            session_events = session_events,
            transition_errors = transition_errors,
            "Trace replay finished"
        );
    }

    /// Log a synthesized session event
    pub fn log_session_event(&self, session: &str, name: &str, timestamp: SimTime) {
        info!(
            event = "session_event",
            workload = %self.workload,
            session = %session,
            name = %name,
            sim_time = %timestamp,
            "Session event synthesized"
        );
    }

    /// Log an event dropped because of an illegal transition
    pub fn log_transition_error(&self, component: &str, subject: &str, details: &str) {
        warn!(
            event = "transition_error",
            workload = %self.workload,
            component = %component,
            subject = %subject,
            details = %details,
            "Unexpected state transition, event dropped"
        );
    }

    /// Log a trace gap covered by a downtime window
    pub fn log_downtime_entered(&self, kind: ResourceKind, since: SimTime) {
        warn!(
            event = "downtime_entered",
            workload = %self.workload,
            kind = %kind,
            since = %since,
            "Trace server down, skipping garbage collection"
        );
    }

    pub fn log_downtime_resumed(&self, kind: ResourceKind, at: SimTime) {
        warn!(
            event = "downtime_resumed",
            workload = %self.workload,
            kind = %kind,
            at = %at,
            "Trace server resumed, garbage collection restored"
        );
    }

    /// Log an ordering violation that aborts the run
    pub fn log_fatal_inconsistency(&self, details: &str) {
        error!(
            event = "fatal_inconsistency",
            workload = %self.workload,
            details = %details,
            "Event ordering invariant violated"
        );
    }
}
