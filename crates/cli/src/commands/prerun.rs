//! Prerun command: statistics pass that writes maxima files

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::Path;
use synth_lib::{MaximaPaths, MaximaReport, Replayer, WorkloadSpec};
use tabled::Tabled;
use tokio_util::sync::CancellationToken;

use crate::output::{format_amount, print_json, print_success, print_table, OutputFormat};

/// Row for maxima table
#[derive(Tabled)]
struct MaximaRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Session")]
    session: String,
    #[tabled(rename = "Peak")]
    peak: String,
    #[tabled(rename = "GPUs")]
    gpus: String,
    #[tabled(rename = "VRAM GB")]
    vram_gb: String,
    #[tabled(rename = "Tasks")]
    tasks: usize,
}

fn rows(report: &MaximaReport) -> Vec<MaximaRow> {
    let mut rows = Vec::new();
    for kind in report.kinds() {
        for session in report.sessions() {
            let Some(maxima) = report.get(kind, &session) else {
                continue;
            };
            rows.push(MaximaRow {
                kind: kind.to_string(),
                session,
                peak: format_amount(maxima.session.max_value),
                gpus: format_amount(maxima.session.max_gpus as f64),
                vram_gb: format_amount(maxima.session.max_vram_gb),
                tasks: maxima.tasks.len(),
            });
        }
    }
    rows
}

#[derive(Serialize)]
struct PrerunOutput<'a> {
    files: &'a MaximaPaths,
    sessions: Vec<String>,
}

/// Compute maxima for every session and write them into `output`
pub async fn prerun(
    spec: WorkloadSpec,
    output: &Path,
    cancel: CancellationToken,
    format: OutputFormat,
) -> Result<()> {
    if spec.kinds().is_empty() {
        bail!("no trace files given; pass at least one of --cpu, --gpu or --memory");
    }

    let report = Replayer::new(spec).run_prerun(cancel).await?;
    let files = report
        .write_to(output)
        .with_context(|| format!("Failed to write maxima files to {}", output.display()))?;

    match format {
        OutputFormat::Json => print_json(&PrerunOutput {
            files: &files,
            sessions: report.sessions(),
        })?,
        OutputFormat::Table => {
            print_table(&rows(&report));
            print_success(&format!(
                "Wrote maxima of {} sessions to {}",
                report.sessions().len(),
                output.display()
            ));
        }
    }

    Ok(())
}
