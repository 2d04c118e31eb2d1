//! Resource driver: trace records in, per-entity lifecycle events out

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::event::{Event, SourceId};
use crate::models::{Record, ResourceKind, SimTime, UtilStatus};
use crate::observability::{StructuredLogger, SynthMetrics};
use crate::trace::load_mapping;

use super::emitter::EventEmitter;
use super::maxima::MaximaTracker;
use super::state::{transit, EntitySlot, UtilizationState};
use super::DriverConfig;

/// Fallback tick interval when a trace has a single timestamp.
const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Counters of one driver run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub records: u64,
    pub skipped: u64,
    pub events: u64,
    pub transition_errors: u64,
}

/// Owns the utilization state of every entity of one resource kind.
pub struct TraceDriver {
    id: SourceId,
    config: DriverConfig,
    mapping: Option<Vec<String>>,
    entities: Vec<Option<EntitySlot>>,
    last_read: Option<SimTime>,
    interval: Option<Duration>,
    /// Number of downtime boundaries passed; odd means down.
    down: usize,
    emitter: EventEmitter,
    tracker: Option<MaximaTracker>,
    metrics: Option<SynthMetrics>,
    logger: StructuredLogger,
    stats: DriverStats,
}

impl TraceDriver {
    pub fn new(id: SourceId, mut config: DriverConfig, logger: StructuredLogger) -> Self {
        config.downtimes.sort();
        let emitter = EventEmitter::new(id, config.reading_interval, config.rng_seed ^ u64::from(id));
        Self {
            id,
            config,
            mapping: None,
            entities: Vec::new(),
            last_read: None,
            interval: None,
            down: 0,
            emitter,
            tracker: None,
            metrics: None,
            logger,
            stats: DriverStats::default(),
        }
    }

    /// Enable statistics mode.
    pub fn with_tracker(mut self, tracker: MaximaTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_metrics(mut self, metrics: SynthMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.config.profile.kind
    }

    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    pub fn is_down(&self) -> bool {
        self.down % 2 == 1
    }

    pub fn entity(&self, index: usize) -> Option<&UtilizationState> {
        self.entities
            .get(index)
            .and_then(|slot| slot.as_ref())
            .map(|slot| &slot.current)
    }

    /// Load the entity mapping file, if configured.
    pub fn setup(&mut self) -> Result<()> {
        if let Some(path) = &self.config.mapping_path {
            let mapping = load_mapping(path)?;
            self.config.max_entities = self.config.max_entities.max(mapping.len());
            self.entities = Vec::with_capacity(mapping.len());
            self.mapping = Some(mapping);
        }
        info!(
            kind = %self.kind(),
            source = self.id,
            mapped = self.mapping.is_some(),
            "Resource driver set up"
        );
        Ok(())
    }

    pub fn handle_record(&mut self, record: Record) {
        let kind = self.kind();
        if record.entity_index >= self.config.max_entities {
            warn!(
                kind = %kind,
                entity = record.entity_index,
                limit = self.config.max_entities,
                "Entity index out of range, record skipped"
            );
            self.skip();
            return;
        }
        let ts = self.config.profile.adjust(record.timestamp);

        if let Some(last) = self.last_read {
            if ts < last {
                warn!(kind = %kind, timestamp = %ts, last = %last, "Out-of-order record skipped");
                self.skip();
                return;
            }
            if ts > last {
                let was_down = self.is_down();
                let up = self.validate_tick(ts, ts.duration_since(last));
                if up && was_down {
                    self.logger.log_downtime_resumed(kind, ts);
                } else if !up && !was_down {
                    self.logger.log_downtime_entered(kind, ts);
                }
                self.advance(last, false, up);
                self.emitter.flush(last);
            }
        }
        self.last_read = Some(ts);
        self.stats.records += 1;
        if let Some(metrics) = &self.metrics {
            metrics.inc_records_processed(kind);
        }

        let aggregation = self.config.profile.aggregation;
        let session = self.session_id_for(record.entity_index);
        if let (Some(tracker), Some(device)) = (&self.tracker, &record.device) {
            tracker.observe_device(&session, ts, device, record.value);
        }
        let slot = self.ensure_entity(record.entity_index, session);
        slot.stage(ts, &record, aggregation);
    }

    /// Count a record that was rejected before reaching the state machine.
    pub fn skip(&mut self) {
        self.stats.skipped += 1;
        if let Some(metrics) = &self.metrics {
            metrics.inc_records_skipped(self.kind());
        }
    }

    /// Commit the last tick, force final transitions one interval later and
    /// close the stream with `NoMore`.
    pub fn teardown(&mut self) {
        let end = self.flush_final();
        self.emitter.push_direct(Event::no_more(self.id, end));
        info!(
            kind = %self.kind(),
            records = self.stats.records,
            skipped = self.stats.skipped,
            events = self.stats.events,
            transition_errors = self.stats.transition_errors,
            "Resource driver torn down"
        );
    }

    /// Like [`teardown`](Self::teardown), but closes the stream with an
    /// `Error` sentinel carrying `message`.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        let end = self.flush_final();
        error!(kind = %self.kind(), error = %message, "Resource driver failed");
        self.emitter.push_direct(Event::error(self.id, end, message));
    }

    fn flush_final(&mut self) -> SimTime {
        let Some(last) = self.last_read else {
            return SimTime::ZERO;
        };
        self.advance(last, false, true);
        self.emitter.flush(last);

        let end = last + self.interval.unwrap_or(DEFAULT_TICK);
        self.advance(end, true, true);
        self.emitter.flush(end);
        self.entities.clear();
        end
    }

    /// Events ready to be sent, in order.
    pub fn drain_events(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.emitter.drain()
    }

    fn validate_tick(&mut self, ts: SimTime, gap: Duration) -> bool {
        while self.down < self.config.downtimes.len() && ts >= self.config.downtimes[self.down] {
            self.down += 1;
        }
        if self.is_down() {
            return false;
        }
        if self.interval.map_or(true, |interval| gap <= interval) {
            self.interval = Some(gap);
        }
        true
    }

    fn session_id_for(&self, index: usize) -> String {
        match self.mapping.as_ref().and_then(|m| m.get(index)) {
            Some(key) => key.clone(),
            None => index.to_string(),
        }
    }

    fn ensure_entity(&mut self, index: usize, session: String) -> &mut EntitySlot {
        if index >= self.entities.len() {
            self.entities.resize_with(index + 1, || None);
        }
        self.entities[index].get_or_insert_with(|| {
            debug!(entity = index, session = %session, "Tracking new entity");
            EntitySlot::new(session)
        })
    }

    /// Commit staged readings at `ts` and, when `collect` is set, drive
    /// entities without a reading towards Stopped.
    fn advance(&mut self, ts: SimTime, force: bool, collect: bool) {
        let kind = self.kind();
        let thresholds = self.config.profile.thresholds;
        let Self {
            id,
            entities,
            emitter,
            tracker,
            metrics,
            logger,
            stats,
            ..
        } = self;

        let mut names = Vec::with_capacity(2);
        for slot in entities.iter_mut().flatten() {
            let committed = match slot.pending.take() {
                Some(reading) => {
                    slot.commit(reading, &thresholds);
                    true
                }
                None => {
                    if !collect
                        || slot.current.timestamp == ts
                        || slot.current.status == UtilStatus::Stopped
                    {
                        continue;
                    }
                    slot.reset(ts);
                    false
                }
            };

            names.clear();
            let previous = slot.previous_status();
            if let Err(e) = transit(kind, previous, &mut slot.current, force, &thresholds, &mut names) {
                slot.rollback();
                stats.transition_errors += 1;
                if let Some(metrics) = metrics.as_ref() {
                    metrics.inc_transition_errors(kind.as_str());
                }
                logger.log_transition_error(kind.as_str(), &slot.current.session_id, &e.to_string());
                continue;
            }

            if committed {
                if let Some(tracker) = tracker.as_ref() {
                    let state = &slot.current;
                    tracker.observe(
                        &state.session_id,
                        state.timestamp,
                        state.value,
                        state.gpus,
                        state.vram_gb,
                    );
                }
            }
            if names.is_empty() {
                continue;
            }

            let snapshot = slot.current.snapshot(kind);
            let batch = emitter.begin_batch();
            for name in names.iter().copied() {
                emitter.trigger(batch, Event::reading(kind, name, *id, snapshot.clone()));
            }
            stats.events += names.len() as u64;
            if let Some(metrics) = metrics.as_ref() {
                metrics.inc_driver_events(kind, names.len() as u64);
            }
        }
    }
}

impl std::fmt::Debug for TraceDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceDriver")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("entities", &self.entities.len())
            .field("last_read", &self.last_read)
            .finish()
    }
}

