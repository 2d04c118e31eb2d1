//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use synth_lib::SimTime;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of items
pub fn print_table<T: Tabled>(items: &[T]) {
    if items.is_empty() {
        println!("{}", "No items found".yellow());
        return;
    }
    let table = Table::new(items).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format a simulated timestamp as RFC 3339 with second precision
pub fn format_timestamp(ts: SimTime) -> String {
    ts.to_datetime().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn format_optional_timestamp(ts: Option<SimTime>) -> String {
    ts.map(format_timestamp).unwrap_or_else(|| "-".to_string())
}

/// Format a resource amount, dropping trailing zeros
pub fn format_amount(value: f64) -> String {
    if value == 0.0 {
        "-".to_string()
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{:.2}", value)
    }
}

/// Color a session event name by lifecycle phase
pub fn color_event(name: &str) -> String {
    match name {
        "session-started" | "session-ready" => name.green().to_string(),
        "training-started" => name.cyan().to_string(),
        "training-ended" => name.blue().to_string(),
        "session-stopped" => name.red().to_string(),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(0.0), "-");
        assert_eq!(format_amount(4.0), "4");
        assert_eq!(format_amount(1.256), "1.26");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            format_timestamp(SimTime::from_secs(1_700_000_000)),
            "2023-11-14 22:13:20"
        );
        assert_eq!(format_optional_timestamp(None), "-");
    }
}
