//! Upload progress reporting.
//!
//! The orchestrator emits events at three granularities:
//!
//! - **Run**: aggregate counters after each checkpoint.
//! - **Cohort**: `done / total` for one cohort of files.
//! - **Item**: one file changed lifecycle state.
//!
//! Human and JSON progress go to **stderr** so stdout stays parseable.
//! [`ChannelProgress`] forwards events to an async consumer (a UI, a test).

use std::io::Write;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::models::{LifecycleState, StateCounters};

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Run {
        pass: u32,
        counters: StateCounters,
    },
    Cohort {
        cohort_id: u64,
        done: u64,
        total: u64,
    },
    Item {
        cohort_id: u64,
        file_id: String,
        new_state: LifecycleState,
        timestamp_ms: i64,
    },
}

/// Receives progress events. Must not block.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Run { pass, counters } => format!(
                "run  pass {}  pending {} · uploading {} · indexed {} · failed {} · orphaned {}\n",
                pass,
                format_number(counters.pending),
                format_number(counters.uploading),
                format_number(counters.indexed),
                format_number(counters.failed),
                format_number(counters.orphaned),
            ),
            ProgressEvent::Cohort {
                cohort_id,
                done,
                total,
            } => format!(
                "cohort {}  {} / {} files\n",
                cohort_id,
                format_number(*done),
                format_number(*total)
            ),
            ProgressEvent::Item {
                file_id, new_state, ..
            } => format!("  {}  → {}\n", file_id, new_state),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards events into an unbounded channel. Events are dropped once
/// the receiver is gone.
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn item_events_serialize_with_tag() {
        let event = ProgressEvent::Item {
            cohort_id: 3,
            file_id: "docs/a.md".into(),
            new_state: LifecycleState::Indexed,
            timestamp_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "item");
        assert_eq!(json["new_state"], "INDEXED");
        assert_eq!(json["cohort_id"], 3);
    }

    #[tokio::test]
    async fn channel_progress_forwards_events() {
        let (reporter, mut rx) = ChannelProgress::channel();
        reporter.report(ProgressEvent::Cohort {
            cohort_id: 1,
            done: 0,
            total: 5,
        });
        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::Cohort {
                cohort_id: 1,
                done: 0,
                total: 5
            })
        );
    }
}
