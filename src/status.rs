//! Store overview and per-file history.
//!
//! `uph status` prints counts per lifecycle state, the failed files with
//! their reasons, and who holds the writer lock. `uph history <file>`
//! prints the audit log of one file. Both are read-only and safe to run
//! while an upload is in progress.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use crate::config::Config;
use crate::models::{LifecycleState, StateCounters};
use crate::pipeline;

#[derive(Debug, Serialize)]
struct LockHolder {
    owner: String,
    pid: i64,
    heartbeat_at: i64,
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    by_state: Vec<(LifecycleState, u64)>,
    counters: StateCounters,
    failed: Vec<(String, String)>,
    lock: Option<LockHolder>,
}

pub async fn run_status(config: &Config, json: bool) -> Result<()> {
    let store = pipeline::open_store(config).await?;

    let by_state = store.count_by_state().await?;
    let counters = store.counters().await?;
    let failed = store.failed_records().await?;
    let last_transition: Option<i64> = sqlx::query_scalar("SELECT MAX(recorded_at) FROM transitions")
        .fetch_one(store.pool())
        .await?;
    let lock = sqlx::query("SELECT owner, pid, heartbeat_at FROM writer_lock WHERE id = 1")
        .fetch_optional(store.pool())
        .await?
        .map(|row| LockHolder {
            owner: row.get("owner"),
            pid: row.get("pid"),
            heartbeat_at: row.get("heartbeat_at"),
        });
    store.close().await;

    if json {
        let output = StatusOutput {
            by_state,
            counters,
            failed,
            lock,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Upload Harness — Status");
    println!("=======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Store:       {}", config.remote.store_name);
    println!(
        "  Last change: {}",
        last_transition
            .map(|ms| format_ts_relative(ms / 1000))
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!("  {:<12} {:>8}", "STATE", "FILES");
    println!("  {}", "-".repeat(21));
    for state in LifecycleState::ALL {
        let n = by_state
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        println!("  {:<12} {:>8}", state.as_str(), n);
    }
    println!("  {}", "-".repeat(21));
    println!("  {:<12} {:>8}", "TOTAL", counters.total());

    match &lock {
        Some(holder) => println!(
            "\n  Writer lock: held by pid {} (heartbeat {})",
            holder.pid,
            format_ts_relative(holder.heartbeat_at / 1000)
        ),
        None => println!("\n  Writer lock: free"),
    }

    if !failed.is_empty() {
        println!();
        println!("  Failed files:");
        for (file_id, reason) in &failed {
            println!("    {}  {}", file_id, reason);
        }
        println!();
        println!("  Use `uph reset --failed` to retry them.");
    }
    println!();
    Ok(())
}

pub async fn run_history(config: &Config, file_id: &str) -> Result<()> {
    let store = pipeline::open_store(config).await?;
    let record = store.get(file_id).await?;
    let history = store.history(file_id).await?;
    store.close().await;

    let Some(record) = record else {
        anyhow::bail!("Unknown file: {}", file_id);
    };

    println!("{}", record.file_id);
    println!("  state:       {}", record.lifecycle_state);
    println!("  generation:  {}", record.generation);
    println!("  attempts:    {}", record.attempt_count);
    if let Some(doc) = &record.remote_document_id {
        println!("  document:    {}", doc);
    }
    if let Some(tag) = &record.confirmation {
        println!("  confirmed:   {}", tag);
    }
    if let Some(err) = &record.error_detail {
        println!("  error:       {}", err);
    }
    println!();
    for entry in &history {
        let from = entry
            .from_state
            .map(|s| s.as_str())
            .unwrap_or("-");
        println!(
            "  {}  {:<10} {:>10} → {:<10} {}",
            format_ts_iso(entry.recorded_at / 1000),
            entry.phase,
            from,
            entry.to_state.as_str(),
            entry.detail.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_time() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }
}
