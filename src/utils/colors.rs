// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 buildgraph contributors

//! Terminal status formatting
//!
//! Provides consistent symbols and colors for run states across the CLI.

use colored::{ColoredString, Colorize};
use std::time::Duration;

use crate::scheduler::RunStatus;

/// Symbol for a run status
pub fn status_symbol(status: RunStatus) -> ColoredString {
    match status {
        RunStatus::Succeeded => "✓".green(),
        RunStatus::Failed => "✗".red(),
        RunStatus::FailedToStart => "⊘".red(),
        RunStatus::Cancelled => "○".yellow(),
        RunStatus::Queued | RunStatus::Running => "→".blue(),
    }
}

/// Status label, colored by outcome
pub fn status_label(status: RunStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        RunStatus::Succeeded => label.green(),
        RunStatus::Failed | RunStatus::FailedToStart => label.red(),
        RunStatus::Cancelled => label.yellow(),
        RunStatus::Queued | RunStatus::Running => label.dimmed(),
    }
}

/// Print a styled header
pub fn print_header(title: &str) {
    println!("{}", title.bold());
    println!("{}", "═".repeat(title.len().max(40)));
}

/// Print a success check
pub fn print_success(msg: &str) {
    println!("  {} {}", "✓".green(), msg);
}

/// Print an error cross
pub fn print_error(msg: &str) {
    println!("  {} {}", "✗".red(), msg);
}

/// Print a warning
pub fn print_warning(msg: &str) {
    println!("  {} {}", "⚠".yellow(), msg);
}

/// Compact duration, e.g. `4s`, `3m`, `2h`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(180)), "3m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(3 * 86400)), "3d");
    }
}
