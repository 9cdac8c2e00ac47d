//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, Default)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    Json,
}

/// Print a list in the selected format.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => print_single(&data, format),
    }
}

/// Print one item as pretty JSON.
pub fn print_single<T: Serialize + ?Sized>(data: &T, _format: OutputFormat) {
    let json = serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string());
    println!("{}", json);
}

pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

/// Color a state like `running` or `terminating(preempted)` for tables.
pub fn colored_state(state: &str) -> String {
    let name = state.split('(').next().unwrap_or(state);
    match name {
        "running" | "waiting" => state.green().to_string(),
        "pending" | "assigned" | "starting" => state.yellow().to_string(),
        "terminating" => state.magenta().to_string(),
        "terminated" => state.dimmed().to_string(),
        _ => state.to_string(),
    }
}
