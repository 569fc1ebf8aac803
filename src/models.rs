//! Core data models used throughout Upload Harness.
//!
//! These types describe a local file's relationship with the remote store:
//! its position in the lifecycle state machine, the remote identifiers it
//! has accumulated, and the counters derived from the whole population.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::metadata::Metadata;

/// Position of a file in the upload lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Known locally, nothing (current) on the remote side.
    Untracked,
    /// Upload intent recorded; the raw object may or may not exist yet.
    Uploading,
    /// Import into the store requested or in flight.
    Processing,
    /// Indexed document confirmed.
    Indexed,
    /// Previously indexed, but the local file changed or disappeared.
    Stale,
    /// The local file is gone; any remote document has been released.
    Orphaned,
    /// Gave up. Needs an explicit reset to re-enter `Untracked`.
    Failed,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 7] = [
        LifecycleState::Untracked,
        LifecycleState::Uploading,
        LifecycleState::Processing,
        LifecycleState::Indexed,
        LifecycleState::Stale,
        LifecycleState::Orphaned,
        LifecycleState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Untracked => "UNTRACKED",
            LifecycleState::Uploading => "UPLOADING",
            LifecycleState::Processing => "PROCESSING",
            LifecycleState::Indexed => "INDEXED",
            LifecycleState::Stale => "STALE",
            LifecycleState::Orphaned => "ORPHANED",
            LifecycleState::Failed => "FAILED",
        }
    }

    /// `Uploading` and `Processing` stand for a remote call that is in
    /// flight or was interrupted. They are never terminal.
    pub fn is_transient(&self) -> bool {
        matches!(self, LifecycleState::Uploading | LifecycleState::Processing)
    }

    /// States picked up by the ordinary upload path.
    pub fn is_eligible(&self) -> bool {
        matches!(self, LifecycleState::Untracked | LifecycleState::Stale)
    }

    /// Whether a record in this state may carry a `remote_document_id`.
    pub fn may_hold_document(&self) -> bool {
        matches!(self, LifecycleState::Indexed | LifecycleState::Stale)
    }

    /// The transition table of the lifecycle state machine.
    ///
    /// Self-transitions on `Uploading` and `Processing` are result writes
    /// that persist remote identifiers without changing position.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Untracked, Uploading | Orphaned | Failed)
                | (Stale, Uploading | Orphaned | Failed | Untracked)
                | (Uploading, Uploading | Processing | Untracked | Failed)
                | (Processing, Processing | Indexed | Untracked | Failed)
                | (Indexed, Stale | Untracked)
                | (Orphaned, Untracked)
                | (Failed, Untracked)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown lifecycle state: '{}'", s))
    }
}

/// One record per local file, as persisted in the `files` table.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    /// Stable identity: the file path relative to the scan root.
    pub file_id: String,
    pub content_hash: String,
    pub metadata: Metadata,
    pub lifecycle_state: LifecycleState,
    /// Ephemeral raw object name (e.g. `files/abc-3`).
    pub remote_object_id: Option<String>,
    /// Unix seconds after which the raw object is gone on the remote side.
    pub remote_object_expires_at: Option<i64>,
    /// Set once the raw object has been observed ACTIVE.
    pub remote_object_confirmed: bool,
    /// Long-running import operation name.
    pub operation_id: Option<String>,
    /// Permanent indexed document name.
    pub remote_document_id: Option<String>,
    /// A document replaced by an in-flight re-upload; deleted once the new
    /// one is indexed.
    pub superseded_document_id: Option<String>,
    /// Confirmation assumption applied when the record reached `Indexed`.
    pub confirmation: Option<String>,
    pub generation: i64,
    pub attempt_count: i64,
    pub error_detail: Option<String>,
    /// Unix milliseconds of the last committed transition.
    pub state_updated_at: i64,
    pub created_at: i64,
}

/// A file as reported by the scanner collaborator.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: String,
    pub content_hash: String,
    pub metadata: Metadata,
}

/// Aggregate counters exposed to progress displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounters {
    /// `Untracked` + `Stale`.
    pub pending: u64,
    /// `Uploading` + `Processing`.
    pub uploading: u64,
    pub indexed: u64,
    pub failed: u64,
    pub orphaned: u64,
}

impl StateCounters {
    pub fn add(&mut self, state: LifecycleState, n: u64) {
        match state {
            LifecycleState::Untracked | LifecycleState::Stale => self.pending += n,
            LifecycleState::Uploading | LifecycleState::Processing => self.uploading += n,
            LifecycleState::Indexed => self.indexed += n,
            LifecycleState::Failed => self.failed += n,
            LifecycleState::Orphaned => self.orphaned += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.uploading + self.indexed + self.failed + self.orphaned
    }
}

/// One row of the append-only audit log.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEntry {
    pub id: i64,
    pub file_id: String,
    pub from_state: Option<LifecycleState>,
    pub to_state: LifecycleState,
    pub phase: String,
    pub detail: Option<String>,
    pub recorded_at: i64,
}
