//! Driver task
//!
//! Runs a [`TraceDriver`] over its [`TraceSource`] on the blocking pool and
//! forwards the produced events over a bounded channel.

use std::panic::{self, AssertUnwindSafe};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SynthError};
use crate::event::{Event, SourceId};
use crate::models::ResourceKind;
use crate::observability::{StructuredLogger, SynthMetrics};
use crate::trace::TraceSource;

use super::{DriverConfig, DriverStats, MaximaTracker, TraceDriver};

/// A driver bound to its input and output
pub struct DriverTask {
    driver: TraceDriver,
    source: TraceSource,
    events_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
}

impl DriverTask {
    pub fn new(
        driver: TraceDriver,
        source: TraceSource,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let task = Self {
            driver,
            source,
            events_tx,
            cancel,
        };
        (task, events_rx)
    }

    pub fn kind(&self) -> ResourceKind {
        self.driver.kind()
    }

    /// Run the task on the blocking pool
    pub fn spawn(self) -> JoinHandle<DriverStats> {
        tokio::task::spawn_blocking(move || self.run_blocking())
    }

    /// Read every record, then tear the driver down. Must not be called from
    /// an async context.
    pub fn run_blocking(mut self) -> DriverStats {
        let kind = self.driver.kind();
        info!(kind = %kind, files = self.source.paths().len(), "Starting resource driver");

        let mut failure = None;
        let mut connected = true;
        for item in self.source.records() {
            if self.cancel.is_cancelled() {
                info!(kind = %kind, "Resource driver canceled, flushing");
                break;
            }
            match item {
                Ok(record) => {
                    let driver = &mut self.driver;
                    if let Err(payload) =
                        panic::catch_unwind(AssertUnwindSafe(|| driver.handle_record(record)))
                    {
                        failure = Some(format!("driver panicked: {}", panic_message(&*payload)));
                        break;
                    }
                }
                Err(SynthError::Parse { line, reason }) => {
                    warn!(kind = %kind, line = line, error = %reason, "Skipping malformed trace row");
                    self.driver.skip();
                }
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
            if !self.forward() {
                connected = false;
                break;
            }
        }

        match failure {
            Some(message) => self.driver.fail(message),
            None => self.driver.teardown(),
        }
        if connected && !self.forward() {
            debug!(kind = %kind, "Receiver dropped before the final flush");
        }
        self.driver.stats()
    }

    /// Send every ready event. Returns false once the receiver is gone.
    fn forward(&mut self) -> bool {
        for event in self.driver.drain_events() {
            if self.events_tx.blocking_send(event).is_err() {
                return false;
            }
        }
        true
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Builder for creating a driver task
pub struct DriverTaskBuilder {
    id: SourceId,
    config: DriverConfig,
    source: Option<TraceSource>,
    logger: Option<StructuredLogger>,
    metrics: Option<SynthMetrics>,
    tracker: Option<MaximaTracker>,
    cancel: CancellationToken,
}

impl DriverTaskBuilder {
    pub fn new(id: SourceId, config: DriverConfig) -> Self {
        Self {
            id,
            config,
            source: None,
            logger: None,
            metrics: None,
            tracker: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn source(mut self, source: TraceSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn metrics(mut self, metrics: SynthMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run in statistics mode, recording maxima into `tracker`
    pub fn tracker(mut self, tracker: MaximaTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Load the mapping file and bind the driver to its channel
    pub fn build(self) -> Result<(DriverTask, mpsc::Receiver<Event>)> {
        let kind = self.config.profile.kind;
        let source = self.source.ok_or_else(|| {
            SynthError::setup(
                std::path::PathBuf::new(),
                format!("no {} trace source configured", kind),
            )
        })?;
        let capacity = self.config.channel_capacity;
        let logger = self
            .logger
            .unwrap_or_else(|| StructuredLogger::new("default"));

        let mut driver = TraceDriver::new(self.id, self.config, logger);
        if let Some(tracker) = self.tracker {
            driver = driver.with_tracker(tracker);
        }
        if let Some(metrics) = self.metrics {
            driver = driver.with_metrics(metrics);
        }
        driver.setup().map_err(|e| {
            error!(kind = %kind, error = %e, "Resource driver setup failed");
            e
        })?;

        Ok(DriverTask::new(driver, source, capacity, self.cancel))
    }
}
