//! synthd - trace replay daemon
//!
//! Replays a workload's utilization traces into a session event queue and
//! pulls the queue tick by tick, standing in for the workload driver that
//! would consume the synthesized events. Health and metrics are served over
//! HTTP for the duration of the replay.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use synth_lib::{
    health::{components, HealthRegistry},
    observability::{StructuredLogger, SynthMetrics},
    EventQueue, QueueConsumer, Replayer,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const SYNTHD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = SYNTHD_VERSION, "Starting synthd");

    let mut config = config::SynthdConfig::load()?;
    info!(
        workload = %config.workload.name,
        kinds = ?config.workload.kinds(),
        "synthd configured"
    );

    let health_registry = HealthRegistry::new();
    let metrics = SynthMetrics::new().context("Failed to register metrics")?;
    let logger = StructuredLogger::new(config.workload.name.clone());

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("SIGINT received");
                cancel.cancel();
            }
        }
    });

    if let Some(dir) = config.prerun_dir.clone() {
        let report = Replayer::new(config.workload.clone())
            .run_prerun(cancel.clone())
            .await
            .context("Statistics pass failed")?;
        config.workload.maxima = report.write_to(&dir)?;
        info!(dir = %dir.display(), sessions = report.sessions().len(), "Wrote maxima files");
    }

    let queue = Arc::new(
        EventQueue::new()
            .with_metrics(metrics.clone())
            .with_logger(logger),
    );
    let consumer = Arc::new(QueueConsumer::new(queue));
    let pump_cancel = cancel.child_token();
    let pump = tokio::spawn(pump_events(
        consumer.clone(),
        Duration::from_millis(config.tick_pause_ms),
        pump_cancel.clone(),
    ));

    let replayer = Replayer::new(config.workload.clone())
        .with_metrics(metrics)
        .with_health(health_registry.clone());
    let outcome = replayer.run_standard(consumer.clone(), cancel.clone()).await;
    if outcome.is_err() {
        pump_cancel.cancel();
    }
    let delivered = pump.await.unwrap_or_else(|e| {
        warn!(error = %e, "Event pump failed");
        0
    });

    match &outcome {
        Ok(report) => info!(
            sessions = report.summary.sessions,
            session_events = report.summary.session_events,
            delivered,
            "Replay complete"
        ),
        Err(e) => {
            error!(error = %e, delivered, "Replay failed");
            health_registry
                .set_unhealthy(components::EVENT_QUEUE, "Replay aborted")
                .await;
        }
    }

    if config.linger && !cancel.is_cancelled() {
        info!("Serving health and metrics until shutdown");
        cancel.cancelled().await;
    }
    api_handle.abort();
    info!("Shutting down");

    outcome.map(|_| ()).map_err(Into::into)
}

/// Drain the queue one tick at a time until the generator has finished and
/// every buffered event has been delivered. Returns the delivered count.
async fn pump_events(
    consumer: Arc<QueueConsumer>,
    pause: Duration,
    cancel: CancellationToken,
) -> u64 {
    let queue = consumer.queue().clone();
    let mut generator = consumer.subscribe_generator_complete();
    let mut delivered = 0u64;

    loop {
        let Some(tick) = queue.next_event_timestamp() else {
            if *generator.borrow_and_update() {
                match queue.next_event_timestamp() {
                    Some(_) => continue,
                    None => break,
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return delivered,
                changed = generator.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        while let Some(event) = queue.pop(tick) {
            delivered += 1;
            debug!(
                session = event.session_id().unwrap_or_default(),
                event = %event.name,
                timestamp = %event.timestamp,
                "Delivered session event"
            );
        }

        if pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return delivered,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    consumer.workload_complete();
    delivered
}
