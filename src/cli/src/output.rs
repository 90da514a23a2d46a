//! Table formatting helpers for CLI output.

use chrono::{DateTime, Utc};
use comfy_table::{ContentArrangement, Table};
use lxbake_runtime::AliasReport;

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// First 12 characters of a fingerprint.
pub fn short_fingerprint(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

/// Format unix seconds as a relative "ago" string.
pub fn format_created(created_at: Option<i64>) -> String {
    match created_at.and_then(|secs| DateTime::from_timestamp(secs, 0)) {
        Some(dt) => format_ago(&dt),
        None => "-".to_string(),
    }
}

/// Format a chrono timestamp as a relative "ago" string.
pub fn format_ago(dt: &DateTime<Utc>) -> String {
    let duration = Utc::now().signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }
    if secs < 60 {
        return format!("{secs} seconds ago");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }

    let days = duration.num_days();
    if days < 30 {
        return format!("{days} days ago");
    }
    if days < 365 {
        return format!("{} months ago", days / 30);
    }
    format!("{} years ago", days / 365)
}

/// Print alias failures to stderr.
pub fn print_alias_failures(report: &AliasReport) {
    if !report.is_clean() {
        eprintln!("Warning: some aliases were not applied:");
        eprintln!("{}", report.failure_summary());
    }
}
