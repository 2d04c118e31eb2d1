//! Template command: generate session events from a workload template

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use synth_lib::{generate_template_workload, Event, TemplateReport, WorkloadTemplate};

use super::replay::{CollectingConsumer, EventRow};
use crate::output::{format_timestamp, print_json, print_table, OutputFormat};

#[derive(Serialize)]
struct TemplateOutput<'a> {
    report: &'a TemplateReport,
    events: &'a [Event],
}

/// Sequence the sessions of a template file and print their events
pub async fn template(path: &Path, format: OutputFormat) -> Result<()> {
    let workload = WorkloadTemplate::from_path(path)?;
    let consumer = Arc::new(CollectingConsumer::default());
    let report = generate_template_workload(&workload, consumer.clone()).await?;
    let events = consumer.events.lock().await;

    match format {
        OutputFormat::Json => print_json(&TemplateOutput {
            report: &report,
            events: &events,
        })?,
        OutputFormat::Table => {
            let rows: Vec<EventRow> = events.iter().map(EventRow::from_event).collect();
            print_table(&rows);

            println!();
            println!("{}", "Template Summary".bold());
            println!("{}", "=".repeat(40));
            println!("Sessions:           {}", report.sessions);
            println!("Trainings:          {}", report.trainings);
            println!("Session events:     {}", report.events);
            println!(
                "Final tick:         {} ({})",
                report.final_tick,
                format_timestamp(report.final_timestamp)
            );
        }
    }

    Ok(())
}
