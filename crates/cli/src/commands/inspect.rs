//! Inspect command

use anyhow::Result;
use colored::Colorize;
use std::path::PathBuf;
use synth_lib::{trace, ResourceKind};

use crate::output::{format_optional_timestamp, print_json, print_warning, OutputFormat};

/// Summarize the rows, entities and time span of a trace
pub fn inspect(kind: ResourceKind, files: Vec<PathBuf>, format: OutputFormat) -> Result<()> {
    let source = trace::TraceSource::open(kind, files, None)?;
    let summary = trace::summarize(&source)?;

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => {
            println!("{}", "Trace Summary".bold());
            println!("{}", "=".repeat(40));
            println!("Kind:      {}", kind.to_string().cyan());
            for path in source.paths() {
                println!("File:      {}", path.display());
            }
            println!("Rows:      {}", summary.rows);
            println!("Entities:  {}", summary.entities);
            println!("Ticks:     {}", summary.ticks);
            println!("First:     {}", format_optional_timestamp(summary.first));
            println!("Last:      {}", format_optional_timestamp(summary.last));
            if summary.skipped > 0 {
                print_warning(&format!("{} malformed rows skipped", summary.skipped));
            }
        }
    }

    Ok(())
}
