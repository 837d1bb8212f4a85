//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use netcheck_harness::{Outcome, Status, SuiteResult};
use serde::Serialize;

/// Longest message shown in a table cell
const MAX_MESSAGE_WIDTH: usize = 120;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    if items.is_empty() {
        println!("No items found.");
        return;
    }

    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);

            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }

            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(items).unwrap_or_default());
        }
    }
}

pub fn status_mark(status: Status) -> String {
    match status {
        Status::Pass => "✓ PASS".green().to_string(),
        Status::Fail => "✗ FAIL".red().to_string(),
        Status::Error => "! ERROR".yellow().to_string(),
    }
}

impl TableDisplay for Outcome {
    fn headers() -> Vec<&'static str> {
        vec!["Case", "Status", "Duration", "Message"]
    }

    fn row(&self) -> Vec<String> {
        let mut message = self.message.clone();
        if message.len() > MAX_MESSAGE_WIDTH {
            let mut end = MAX_MESSAGE_WIDTH;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
            message.push('…');
        }
        vec![
            self.name.clone(),
            status_mark(self.status),
            format!("{}ms", self.duration_ms),
            message,
        ]
    }
}

/// Print the outcome of one suite run
pub fn print_result(result: &SuiteResult, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            println!();
            println!("{}", format!("Suite: {}", result.suite()).bold());
            if let Some(reason) = result.preflight_error() {
                print_error(&format!("Setup failed. Aborting tests: {}", reason));
            } else {
                print_list(result.outcomes(), format);
            }
            if result.aborted() {
                print_warning("Run aborted; remaining cases were not executed");
            }

            let summary = result.summary();
            println!("{}", "=".repeat(60));
            println!("Total:     {}", summary.total);
            println!("Passed:    {}", summary.passed.to_string().green());
            println!("Failed:    {}", summary.failed.to_string().red());
            println!("Errored:   {}", summary.errored.to_string().yellow());
            println!("Pass Rate: {}", summary.pass_rate_display());
            println!("{}", "=".repeat(60));
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result.report()).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(&result.report()).unwrap_or_default());
        }
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}
