//! Replication log display for the blobfs-sync CLI.
//!
//! Human-readable wrappers around the core [`ReplicationLog`].

pub use blobfs_core::{ReplicationLog, ReplicationLogEntry};

use anyhow::Result;
use std::io::Write;
use uuid::Uuid;

/// Format a replication log entry for human-readable display.
pub fn format_entry(entry: &ReplicationLogEntry) -> String {
    let status = if entry.success { "OK" } else { "FAILED" };
    let skipped = if entry.skipped.is_empty() {
        String::new()
    } else {
        format!(", {} skipped", entry.skipped.len())
    };

    format!(
        "[{}] {} <- {} | {} applied, {} present, {} deleted{} | {} | {}ms | {}{}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        entry.folder_url,
        entry.source_name,
        entry.applied,
        entry.present,
        entry.deleted,
        skipped,
        format_size(entry.bytes_transferred),
        entry.duration_ms,
        status,
        entry
            .error
            .as_ref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default(),
    )
}

/// Print replication log entries, optionally filtered by folder and source.
pub fn print_repl_log(
    log: &ReplicationLog,
    folder: Option<&str>,
    source: Option<Uuid>,
    verbose: bool,
    writer: &mut dyn Write,
) -> Result<()> {
    let entries = log.query(folder, source)?;

    if entries.is_empty() {
        writeln!(writer, "No replication log entries found.")?;
        return Ok(());
    }

    writeln!(writer, "Replication Log ({} entries):", entries.len())?;
    writeln!(writer, "{}", "-".repeat(80))?;
    for entry in &entries {
        writeln!(writer, "  {}", format_entry(entry))?;
        if verbose {
            for skipped in &entry.skipped {
                writeln!(
                    writer,
                    "      skipped {} (file {}): {}",
                    skipped.version_id, skipped.file_id, skipped.reason
                )?;
            }
        }
    }
    writeln!(writer, "{}", "-".repeat(80))?;

    let total_applied: u64 = entries.iter().map(|e| e.applied).sum();
    let total_bytes: u64 = entries.iter().map(|e| e.bytes_transferred).sum();
    let total_ms: u64 = entries.iter().map(|e| e.duration_ms).sum();
    let successes = entries.iter().filter(|e| e.success).count();

    writeln!(
        writer,
        "Summary: {} pulls ({} successful), {} versions, {}, {}ms total",
        entries.len(),
        successes,
        total_applied,
        format_size(total_bytes),
        total_ms,
    )?;

    Ok(())
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
