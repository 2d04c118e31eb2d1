//! Replay command

use anyhow::{bail, Result};
use async_trait::async_trait;
use colored::Colorize;
use serde::Serialize;
use std::sync::Arc;
use synth_lib::{Event, EventConsumer, ReplayReport, Replayer, SynthError, WorkloadSpec};
use tabled::Tabled;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::output::{
    color_event, format_amount, format_timestamp, print_info, print_json, print_table,
    print_warning, OutputFormat,
};

/// Keeps every submitted event in arrival order
#[derive(Default)]
pub(crate) struct CollectingConsumer {
    pub(crate) events: Mutex<Vec<Event>>,
    pub(crate) errors: Mutex<Vec<String>>,
}

#[async_trait]
impl EventConsumer for CollectingConsumer {
    async fn submit_event(&self, event: Event) -> synth_lib::Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn report_error(&self, error: SynthError) {
        self.errors.lock().await.push(error.to_string());
    }

    async fn generator_complete(&self) {}
}

/// Row for session events table
#[derive(Tabled)]
pub(crate) struct EventRow {
    #[tabled(rename = "#")]
    index: u64,
    #[tabled(rename = "Timestamp")]
    timestamp: String,
    #[tabled(rename = "Session")]
    session: String,
    #[tabled(rename = "Event")]
    event: String,
    #[tabled(rename = "Task")]
    task: String,
    #[tabled(rename = "CPUs")]
    cpus: String,
    #[tabled(rename = "Mem GB")]
    memory_gb: String,
    #[tabled(rename = "GPUs")]
    gpus: String,
}

impl EventRow {
    pub(crate) fn from_event(event: &Event) -> Self {
        let snapshot = event.session_snapshot();
        Self {
            index: event.global_index,
            timestamp: format_timestamp(event.timestamp),
            session: event.session_id().unwrap_or("-").to_string(),
            event: color_event(&event.name.to_string()),
            task: snapshot
                .and_then(|s| s.training_index)
                .map(|i| i.to_string())
                .unwrap_or_else(|| "-".to_string()),
            cpus: format_amount(snapshot.map_or(0.0, |s| s.max_session_cpus)),
            memory_gb: format_amount(snapshot.map_or(0.0, |s| s.max_session_memory_gb)),
            gpus: format_amount(snapshot.map_or(0.0, |s| s.max_session_gpus as f64)),
        }
    }
}

#[derive(Serialize)]
struct ReplayOutput<'a> {
    report: &'a ReplayReport,
    events: &'a [Event],
    errors: &'a [String],
}

/// Replay a workload and print its session events
pub async fn replay(spec: WorkloadSpec, cancel: CancellationToken, format: OutputFormat) -> Result<()> {
    if spec.kinds().is_empty() {
        bail!("no trace files given; pass at least one of --cpu, --gpu or --memory");
    }

    let consumer = Arc::new(CollectingConsumer::default());
    let report = Replayer::new(spec)
        .run_standard(consumer.clone(), cancel)
        .await?;
    let events = consumer.events.lock().await;
    let errors = consumer.errors.lock().await;

    match format {
        OutputFormat::Json => print_json(&ReplayOutput {
            report: &report,
            events: &events,
            errors: &errors,
        })?,
        OutputFormat::Table => {
            let rows: Vec<EventRow> = events.iter().map(EventRow::from_event).collect();
            print_table(&rows);

            println!();
            println!("{}", "Replay Summary".bold());
            println!("{}", "=".repeat(40));
            println!("Sessions:           {}", report.summary.sessions);
            println!("Session events:     {}", report.summary.session_events);
            println!("Driver events:      {}", report.summary.events_received);
            if report.summary.sessions_skipped > 0 {
                print_warning(&format!(
                    "{} sessions skipped for lack of maxima",
                    report.summary.sessions_skipped
                ));
            }
            if report.summary.transition_errors > 0 {
                print_warning(&format!(
                    "{} session transition errors",
                    report.summary.transition_errors
                ));
            }
            for (kind, stats) in &report.drivers {
                print_info(&format!(
                    "{} driver: {} records, {} skipped, {} events",
                    kind, stats.records, stats.skipped, stats.events
                ));
            }
            for error in errors.iter() {
                print_warning(error);
            }
        }
    }

    Ok(())
}
