//! Replay orchestration
//!
//! Wires a [`WorkloadSpec`] into running components: one driver task per
//! traced resource kind on the blocking pool, each with its own bounded
//! channel, and the synthesizer on the async runtime. Every file is opened
//! before any task starts, so setup errors surface without side effects.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::driver::{
    DriverConfig, DriverStats, DriverTask, DriverTaskBuilder, MaximaTracker, DEFAULT_MAX_ENTITIES,
};
use crate::error::{Result, SynthError};
use crate::event::{Event, SourceId};
use crate::health::{components, HealthRegistry};
use crate::models::{ResourceKind, SimTime};
use crate::observability::{StructuredLogger, SynthMetrics};
use crate::session::SessionPolicy;
use crate::synth::{
    EventConsumer, MaxUtilization, MaximaPaths, MaximaReport, SynthesisSummary, SynthesizerBuilder,
};
use crate::trace::TraceSource;

/// Workload registration input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSpec {
    pub name: String,
    pub cpu_traces: Vec<PathBuf>,
    pub gpu_traces: Vec<PathBuf>,
    pub memory_traces: Vec<PathBuf>,
    pub cpu_mapping: Option<PathBuf>,
    pub gpu_mapping: Option<PathBuf>,
    pub memory_mapping: Option<PathBuf>,
    /// Nominal distance between trace readings, in seconds
    pub tick_secs: u64,
    /// Alternating downtime start/end timestamps (unix seconds or nanoseconds)
    pub cpu_downtimes: Vec<i64>,
    pub gpu_downtimes: Vec<i64>,
    pub memory_downtimes: Vec<i64>,
    pub maxima: MaximaPaths,
    pub adjust_gpu_reservations: bool,
    pub rng_seed: u64,
    pub channel_capacity: usize,
    /// Records after this timestamp are ignored
    pub last_timestamp: Option<i64>,
    /// Highest entity index accepted, exclusive
    pub max_entities: usize,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            name: "workload".to_string(),
            cpu_traces: Vec::new(),
            gpu_traces: Vec::new(),
            memory_traces: Vec::new(),
            cpu_mapping: None,
            gpu_mapping: None,
            memory_mapping: None,
            tick_secs: 60,
            cpu_downtimes: Vec::new(),
            gpu_downtimes: Vec::new(),
            memory_downtimes: Vec::new(),
            maxima: MaximaPaths::default(),
            adjust_gpu_reservations: false,
            rng_seed: 0,
            channel_capacity: 1,
            last_timestamp: None,
            max_entities: DEFAULT_MAX_ENTITIES,
        }
    }
}

impl WorkloadSpec {
    /// Kinds with at least one trace file, in CPU, GPU, memory order
    pub fn kinds(&self) -> Vec<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .filter(|kind| !self.traces(*kind).is_empty())
            .collect()
    }

    pub fn traces(&self, kind: ResourceKind) -> &[PathBuf] {
        match kind {
            ResourceKind::Cpu => &self.cpu_traces,
            ResourceKind::Gpu => &self.gpu_traces,
            ResourceKind::Memory => &self.memory_traces,
        }
    }

    pub fn mapping(&self, kind: ResourceKind) -> Option<&PathBuf> {
        match kind {
            ResourceKind::Cpu => self.cpu_mapping.as_ref(),
            ResourceKind::Gpu => self.gpu_mapping.as_ref(),
            ResourceKind::Memory => self.memory_mapping.as_ref(),
        }
    }

    pub fn downtimes(&self, kind: ResourceKind) -> Vec<SimTime> {
        let raw = match kind {
            ResourceKind::Cpu => &self.cpu_downtimes,
            ResourceKind::Gpu => &self.gpu_downtimes,
            ResourceKind::Memory => &self.memory_downtimes,
        };
        raw.iter().map(|ts| SimTime::from_unix(*ts)).collect()
    }

    pub fn cutoff(&self) -> Option<SimTime> {
        self.last_timestamp.map(SimTime::from_unix)
    }

    pub fn driver_config(&self, kind: ResourceKind) -> DriverConfig {
        DriverConfig {
            mapping_path: self.mapping(kind).cloned(),
            downtimes: self.downtimes(kind),
            reading_interval: Duration::from_secs(self.tick_secs.max(1)),
            rng_seed: self.rng_seed,
            channel_capacity: self.channel_capacity,
            max_entities: self.max_entities,
            ..DriverConfig::for_kind(kind)
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        SessionPolicy::for_kinds(&self.kinds())
    }
}

/// Outcome of a standard replay
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayReport {
    pub summary: SynthesisSummary,
    pub drivers: Vec<(ResourceKind, DriverStats)>,
}

/// A driver task that is ready to spawn, with the receiving end of its channel
struct BoundDriver {
    id: SourceId,
    task: DriverTask,
    rx: mpsc::Receiver<Event>,
}

/// Runs replays of one workload
#[derive(Clone)]
pub struct Replayer {
    spec: WorkloadSpec,
    logger: StructuredLogger,
    metrics: Option<SynthMetrics>,
    health: Option<HealthRegistry>,
}

impl Replayer {
    pub fn new(spec: WorkloadSpec) -> Self {
        let logger = StructuredLogger::new(spec.name.clone());
        Self {
            spec,
            logger,
            metrics: None,
            health: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SynthMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn spec(&self) -> &WorkloadSpec {
        &self.spec
    }

    /// Replay with full session snapshots delivered to `consumer`.
    pub async fn run_standard(
        &self,
        consumer: Arc<dyn EventConsumer>,
        cancel: CancellationToken,
    ) -> Result<ReplayReport> {
        let maxima = MaxUtilization::load(&self.spec.maxima, self.spec.adjust_gpu_reservations)?;
        let drivers_cancel = cancel.child_token();
        let tasks = self.build_tasks(&drivers_cancel, &[])?;

        let builder = SynthesizerBuilder::new(self.spec.policy())
            .standard(consumer, Arc::new(maxima))
            .logger(self.logger.clone());
        self.run(builder, tasks, "standard", cancel, drivers_cancel)
            .await
    }

    /// Replay in statistics mode and collect the maxima of every session and
    /// training task.
    pub async fn run_prerun(&self, cancel: CancellationToken) -> Result<MaximaReport> {
        let trackers: Vec<MaximaTracker> = self
            .spec
            .kinds()
            .into_iter()
            .map(MaximaTracker::new)
            .collect();
        let drivers_cancel = cancel.child_token();
        let tasks = self.build_tasks(&drivers_cancel, &trackers)?;

        let builder = SynthesizerBuilder::new(self.spec.policy())
            .statistics(trackers.clone())
            .logger(self.logger.clone());
        let report = self
            .run(builder, tasks, "prerun", cancel, drivers_cancel)
            .await?;
        info!(
            sessions = report.summary.sessions,
            "Collected resource maxima"
        );
        Ok(MaximaReport::from_trackers(&trackers))
    }

    /// Open every trace and mapping file and bind one driver per kind.
    fn build_tasks(
        &self,
        cancel: &CancellationToken,
        trackers: &[MaximaTracker],
    ) -> Result<Vec<BoundDriver>> {
        let kinds = self.spec.kinds();
        if kinds.is_empty() {
            return Err(SynthError::setup(
                PathBuf::new(),
                format!("workload {} has no trace files", self.spec.name),
            ));
        }

        let mut tasks = Vec::with_capacity(kinds.len());
        for (position, kind) in kinds.into_iter().enumerate() {
            let id = position as SourceId + 1;
            let source = TraceSource::open(kind, self.spec.traces(kind).to_vec(), self.spec.cutoff())?;
            let mut builder = DriverTaskBuilder::new(id, self.spec.driver_config(kind))
                .source(source)
                .logger(self.logger.clone())
                .cancel(cancel.clone());
            if let Some(metrics) = &self.metrics {
                builder = builder.metrics(metrics.clone());
            }
            if let Some(tracker) = trackers.iter().find(|t| t.kind() == kind) {
                builder = builder.tracker(tracker.clone());
            }
            let (task, rx) = builder.build()?;
            tasks.push(BoundDriver { id, task, rx });
        }
        Ok(tasks)
    }

    async fn run(
        &self,
        mut builder: SynthesizerBuilder,
        tasks: Vec<BoundDriver>,
        mode: &str,
        cancel: CancellationToken,
        drivers_cancel: CancellationToken,
    ) -> Result<ReplayReport> {
        let kinds = self.spec.kinds();
        self.logger.log_replay_started(mode, &kinds);
        if let Some(health) = &self.health {
            health.start_replay(&kinds).await;
        }

        let mut handles: Vec<(ResourceKind, JoinHandle<DriverStats>)> = Vec::new();
        if let Some(metrics) = &self.metrics {
            builder = builder.metrics(metrics.clone());
        }
        for BoundDriver { id, task, rx } in tasks {
            handles.push((task.kind(), task.spawn()));
            builder = builder.source(id, rx);
        }

        let outcome = match builder.build() {
            Ok(synthesizer) => synthesizer.run(cancel).await,
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            drivers_cancel.cancel();
        }

        let mut drivers = Vec::with_capacity(handles.len());
        for (kind, handle) in handles {
            match handle.await {
                Ok(stats) => {
                    self.report_driver(kind, &stats).await;
                    drivers.push((kind, stats));
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Resource driver task failed");
                    if let Some(health) = &self.health {
                        health
                            .set_unhealthy(components::driver(kind), e.to_string())
                            .await;
                    }
                }
            }
        }

        if let Some(health) = &self.health {
            health.finish_replay().await;
        }
        match outcome {
            Ok(summary) => {
                if let Some(health) = &self.health {
                    if summary.transition_errors > 0 {
                        health
                            .set_degraded(
                                components::SYNTHESIZER,
                                format!("{} transition errors", summary.transition_errors),
                            )
                            .await;
                    }
                }
                Ok(ReplayReport { summary, drivers })
            }
            Err(e) => {
                if let Some(health) = &self.health {
                    health
                        .set_unhealthy(components::SYNTHESIZER, e.to_string())
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn report_driver(&self, kind: ResourceKind, stats: &DriverStats) {
        info!(
            kind = %kind,
            records = stats.records,
            skipped = stats.skipped,
            events = stats.events,
            transition_errors = stats.transition_errors,
            "Resource driver finished"
        );
        let Some(health) = &self.health else {
            return;
        };
        if stats.skipped > 0 || stats.transition_errors > 0 {
            health
                .set_degraded(
                    components::driver(kind),
                    format!(
                        "{} rows skipped, {} transition errors",
                        stats.skipped, stats.transition_errors
                    ),
                )
                .await;
        }
    }
}

/// Replay `spec` in standard mode.
pub async fn run_standard(
    spec: WorkloadSpec,
    consumer: Arc<dyn EventConsumer>,
    cancel: CancellationToken,
) -> Result<ReplayReport> {
    Replayer::new(spec).run_standard(consumer, cancel).await
}

/// Replay `spec` in statistics mode.
pub async fn run_prerun(spec: WorkloadSpec, cancel: CancellationToken) -> Result<MaximaReport> {
    Replayer::new(spec).run_prerun(cancel).await
}
