//! Durable lifecycle state store.
//!
//! The `files` table is the single source of truth for every file's
//! position in the lifecycle state machine. Every mutation goes through one
//! of the transition methods below, and each of them commits a local SQLite
//! transaction that updates the record *and* appends a row to the
//! `transitions` audit log.
//!
//! # Write-ahead protocol
//!
//! ```text
//!   record_intent(from -> to)   commit   ──▶  remote call  ──▶  record_result / record_failure   commit
//! ```
//!
//! No transaction is ever open while a remote call is awaited. Writes are
//! serialized in-process by a mutex held only across the local write; the
//! writer lock (see [`crate::writer_lock`]) keeps other processes out.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db;
use crate::error::{ErrorKind, TransitionError};
use crate::metadata::Metadata;
use crate::migrate;
use crate::models::{FileRecord, LifecycleState, ScannedFile, StateCounters, TransitionEntry};

/// Remote identifiers persisted by a result write. `None` leaves a column
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct RemoteIds {
    pub object_id: Option<String>,
    pub object_expires_at: Option<i64>,
    pub object_confirmed: bool,
    pub operation_id: Option<String>,
    pub document_id: Option<String>,
    pub confirmation: Option<String>,
    /// Forget the superseded document (it has been deleted, or deletion
    /// was attempted).
    pub clear_superseded: bool,
}

/// A failed remote step, translated into a lifecycle outcome by
/// [`LifecycleStore::record_failure`].
#[derive(Debug, Clone)]
pub struct Failure {
    pub kind: ErrorKind,
    pub detail: String,
    pub max_attempts: i64,
}

/// Query used by the orchestrator to page through eligible work.
#[derive(Debug, Clone, Default)]
pub struct EligibleFilter {
    /// Only ids strictly greater than this (cursor paging).
    pub after: Option<String>,
    pub limit: usize,
}

/// Outcome counts of a scanner seeding pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub discovered: u64,
    pub changed: u64,
    pub revived: u64,
    pub refreshed: u64,
    pub unchanged: u64,
    pub in_flight: u64,
    pub missing: u64,
}

/// Handle to the lifecycle tables. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleStore {
    pool: SqlitePool,
    write_guard: Arc<Mutex<()>>,
}

impl LifecycleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_guard: Arc::new(Mutex::new(())),
        }
    }

    /// Connect to (and migrate) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// In-process write serialization shared with the writer lock.
    pub(crate) fn write_guard(&self) -> &Mutex<()> {
        &self.write_guard
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub async fn get(&self, file_id: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn fetch(&self, file_id: &str) -> Result<FileRecord> {
        self.get(file_id)
            .await?
            .ok_or_else(|| TransitionError::UnknownFile(file_id.to_string()).into())
    }

    /// Records the ordinary upload path may work on. Never returns
    /// `Uploading` or `Processing` records; those belong to recovery.
    pub async fn list_eligible(&self, filter: &EligibleFilter) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM files
            WHERE lifecycle_state IN ('UNTRACKED', 'STALE')
              AND (? IS NULL OR file_id > ?)
            ORDER BY file_id
            LIMIT ?
            "#,
        )
        .bind(&filter.after)
        .bind(&filter.after)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn list_in_state(&self, state: LifecycleState) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query("SELECT * FROM files WHERE lifecycle_state = ? ORDER BY file_id")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    pub async fn count_by_state(&self) -> Result<Vec<(LifecycleState, u64)>> {
        let rows = sqlx::query(
            "SELECT lifecycle_state, COUNT(*) AS n FROM files GROUP BY lifecycle_state",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let state: String = row.get("lifecycle_state");
            let n: i64 = row.get("n");
            out.push((state.parse()?, n as u64));
        }
        out.sort_by_key(|(state, _)| LifecycleState::ALL.iter().position(|s| s == state));
        Ok(out)
    }

    pub async fn counters(&self) -> Result<StateCounters> {
        let mut counters = StateCounters::default();
        for (state, n) in self.count_by_state().await? {
            counters.add(state, n);
        }
        Ok(counters)
    }

    /// `(file_id, reason)` for every `Failed` record.
    pub async fn failed_records(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT file_id, error_detail FROM files WHERE lifecycle_state = 'FAILED' ORDER BY file_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let detail: Option<String> = row.get("error_detail");
                (row.get("file_id"), detail.unwrap_or_default())
            })
            .collect())
    }

    /// `(file_id, remote_document_id)` for every `Indexed` record, for
    /// cross-checking against a live remote listing.
    pub async fn indexed_documents(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT file_id, remote_document_id FROM files
            WHERE lifecycle_state = 'INDEXED' AND remote_document_id IS NOT NULL
            ORDER BY file_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("file_id"), row.get("remote_document_id")))
            .collect())
    }

    /// Every document id the store still knows about, in any column.
    pub async fn known_document_ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            r#"
            SELECT remote_document_id AS id FROM files WHERE remote_document_id IS NOT NULL
            UNION
            SELECT superseded_document_id AS id FROM files WHERE superseded_document_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get::<String, _>("id")).collect())
    }

    /// Audit history of one file, oldest first.
    pub async fn history(&self, file_id: &str) -> Result<Vec<TransitionEntry>> {
        let rows = sqlx::query("SELECT * FROM transitions WHERE file_id = ? ORDER BY id")
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<TransitionEntry> {
                let from: Option<String> = row.get("from_state");
                let to: String = row.get("to_state");
                Ok(TransitionEntry {
                    id: row.get("id"),
                    file_id: row.get("file_id"),
                    from_state: from.map(|s| s.parse()).transpose()?,
                    to_state: to.parse()?,
                    phase: row.get("phase"),
                    detail: row.get("detail"),
                    recorded_at: row.get("recorded_at"),
                })
            })
            .collect()
    }

    // ─── Seeding ──────────────────────────────────────────────────────

    /// Seed records from the scanner stream.
    ///
    /// With `complete_scan`, `Indexed` records whose file was not reported
    /// are marked `Stale`; the orchestrator later finds the file missing
    /// and orphans it.
    pub async fn seed<I>(&self, files: I, complete_scan: bool) -> Result<SeedReport>
    where
        I: IntoIterator<Item = ScannedFile>,
    {
        let _guard = self.write_guard.lock().await;
        let mut report = SeedReport::default();
        let mut seen = HashSet::new();
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        for file in files {
            file.metadata
                .validate()
                .with_context(|| format!("invalid metadata for {}", file.path))?;
            seen.insert(file.path.clone());
            let metadata_json = serde_json::to_string(&file.metadata)?;

            let existing = sqlx::query("SELECT * FROM files WHERE file_id = ?")
                .bind(&file.path)
                .fetch_optional(&mut *tx)
                .await?;

            let Some(row) = existing else {
                sqlx::query(
                    r#"
                    INSERT INTO files (file_id, content_hash, metadata_json, lifecycle_state,
                                       state_updated_at, created_at)
                    VALUES (?, ?, ?, 'UNTRACKED', ?, ?)
                    "#,
                )
                .bind(&file.path)
                .bind(&file.content_hash)
                .bind(&metadata_json)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                append_log(&mut tx, &file.path, None, LifecycleState::Untracked, "discovered", None)
                    .await?;
                report.discovered += 1;
                continue;
            };

            let mut record = row_to_record(&row)?;
            let changed = record.content_hash != file.content_hash;

            match record.lifecycle_state {
                LifecycleState::Uploading | LifecycleState::Processing => {
                    report.in_flight += 1;
                    continue;
                }
                LifecycleState::Indexed if changed => {
                    let from = record.lifecycle_state;
                    record.lifecycle_state = LifecycleState::Stale;
                    record.content_hash = file.content_hash.clone();
                    record.metadata = file.metadata.clone();
                    record.state_updated_at = now;
                    write_record(&mut tx, &record).await?;
                    append_log(
                        &mut tx,
                        &record.file_id,
                        Some(from),
                        LifecycleState::Stale,
                        "detected",
                        Some("content changed"),
                    )
                    .await?;
                    report.changed += 1;
                }
                LifecycleState::Orphaned => {
                    record.lifecycle_state = LifecycleState::Untracked;
                    record.content_hash = file.content_hash.clone();
                    record.metadata = file.metadata.clone();
                    record.state_updated_at = now;
                    write_record(&mut tx, &record).await?;
                    append_log(
                        &mut tx,
                        &record.file_id,
                        Some(LifecycleState::Orphaned),
                        LifecycleState::Untracked,
                        "detected",
                        Some("file reappeared"),
                    )
                    .await?;
                    report.revived += 1;
                }
                _ if changed || record.metadata != file.metadata => {
                    // Same lifecycle position, new content for the next upload.
                    sqlx::query(
                        "UPDATE files SET content_hash = ?, metadata_json = ? WHERE file_id = ?",
                    )
                    .bind(&file.content_hash)
                    .bind(&metadata_json)
                    .bind(&record.file_id)
                    .execute(&mut *tx)
                    .await?;
                    report.refreshed += 1;
                }
                _ => report.unchanged += 1,
            }
        }

        if complete_scan {
            let indexed = sqlx::query("SELECT * FROM files WHERE lifecycle_state = 'INDEXED'")
                .fetch_all(&mut *tx)
                .await?;
            for row in &indexed {
                let mut record = row_to_record(row)?;
                if seen.contains(&record.file_id) {
                    continue;
                }
                record.lifecycle_state = LifecycleState::Stale;
                record.state_updated_at = now;
                write_record(&mut tx, &record).await?;
                append_log(
                    &mut tx,
                    &record.file_id,
                    Some(LifecycleState::Indexed),
                    LifecycleState::Stale,
                    "detected",
                    Some("file missing from scan"),
                )
                .await?;
                report.missing += 1;
            }
        }

        tx.commit().await?;
        debug!(?report, "seed committed");
        Ok(report)
    }

    // ─── Transitions ──────────────────────────────────────────────────

    /// Durably record the intent to move `file_id` from `from` to `to`.
    ///
    /// Must commit before the remote call tied to the transition is made.
    /// Calling it again once the record already sits in `to` is a no-op.
    ///
    /// Entering `Uploading` allocates a new generation and plans the raw
    /// object name; entering any state that may not hold a document moves
    /// the current document id to `superseded_document_id`.
    pub async fn record_intent(
        &self,
        file_id: &str,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<FileRecord> {
        let _guard = self.write_guard.lock().await;
        let mut record = self.fetch(file_id).await?;

        if record.lifecycle_state == to && from != to {
            debug!(file_id, state = %to, "intent already recorded");
            return Ok(record);
        }
        if record.lifecycle_state != from {
            return Err(TransitionError::StateMismatch {
                file_id: file_id.to_string(),
                expected: from,
                actual: record.lifecycle_state,
            }
            .into());
        }
        ensure_allowed(file_id, from, to)?;

        if to == LifecycleState::Uploading {
            record.generation += 1;
            record.remote_object_id = Some(planned_object_name(
                &record.file_id,
                &record.content_hash,
                record.generation,
            ));
            record.remote_object_expires_at = None;
            record.remote_object_confirmed = false;
            record.operation_id = None;
        }
        if to == LifecycleState::Untracked {
            record.remote_object_id = None;
            record.remote_object_expires_at = None;
            record.remote_object_confirmed = false;
            record.operation_id = None;
        }
        if !to.may_hold_document() {
            if let Some(doc) = record.remote_document_id.take() {
                if let Some(old) = record.superseded_document_id.replace(doc) {
                    warn!(file_id, document = %old, "dropping older superseded document");
                }
            }
        }
        if to != LifecycleState::Failed {
            record.error_detail = None;
        }
        record.lifecycle_state = to;
        record.state_updated_at = now_ms();

        let mut tx = self.pool.begin().await?;
        write_record(&mut tx, &record).await?;
        append_log(&mut tx, file_id, Some(from), to, "intent", record.remote_object_id.as_deref())
            .await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Durably record the successful outcome of a remote step.
    pub async fn record_result(
        &self,
        file_id: &str,
        to: LifecycleState,
        remote: RemoteIds,
    ) -> Result<FileRecord> {
        let _guard = self.write_guard.lock().await;
        let mut record = self.fetch(file_id).await?;
        let from = record.lifecycle_state;
        // A result for the state the intent already entered confirms it.
        if from != to {
            ensure_allowed(file_id, from, to)?;
        }

        if let Some(id) = remote.object_id {
            record.remote_object_id = Some(id);
        }
        if let Some(expires) = remote.object_expires_at {
            record.remote_object_expires_at = Some(expires);
        }
        if remote.object_confirmed {
            record.remote_object_confirmed = true;
        }
        if let Some(op) = remote.operation_id {
            record.operation_id = Some(op);
        }
        if let Some(doc) = remote.document_id {
            record.remote_document_id = Some(doc);
        }
        if let Some(tag) = remote.confirmation {
            record.confirmation = Some(tag);
        }
        if remote.clear_superseded {
            record.superseded_document_id = None;
        }
        if to == LifecycleState::Indexed && record.remote_document_id.is_none() {
            anyhow::bail!("{} cannot become INDEXED without a document id", file_id);
        }
        if !to.may_hold_document() && record.remote_document_id.is_some() {
            anyhow::bail!("{} cannot hold a document id in {}", file_id, to);
        }
        if to == LifecycleState::Indexed {
            record.attempt_count = 0;
        }
        record.error_detail = None;
        record.lifecycle_state = to;
        record.state_updated_at = now_ms();

        let detail = match to {
            LifecycleState::Indexed => record.remote_document_id.clone(),
            LifecycleState::Processing => record.operation_id.clone(),
            _ => record.remote_object_id.clone(),
        };
        let mut tx = self.pool.begin().await?;
        write_record(&mut tx, &record).await?;
        append_log(&mut tx, file_id, Some(from), to, "result", detail.as_deref()).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Durably record a failed remote step.
    ///
    /// | Kind | Target | `attempt_count` |
    /// |------|--------|-----------------|
    /// | `RateLimited` | `Untracked` | unchanged |
    /// | `Transient` | `Untracked`, or `Failed` at the ceiling | +1 |
    /// | `Permanent`, `Inconsistent` | `Failed` | +1 |
    pub async fn record_failure(&self, file_id: &str, failure: &Failure) -> Result<FileRecord> {
        let _guard = self.write_guard.lock().await;
        let mut record = self.fetch(file_id).await?;
        let from = record.lifecycle_state;

        let (to, phase) = match failure.kind {
            ErrorKind::RateLimited => (LifecycleState::Untracked, "requeue"),
            ErrorKind::Transient => {
                record.attempt_count += 1;
                if record.attempt_count >= failure.max_attempts {
                    (LifecycleState::Failed, "failure")
                } else {
                    (LifecycleState::Untracked, "requeue")
                }
            }
            ErrorKind::Permanent | ErrorKind::Inconsistent => {
                record.attempt_count += 1;
                (LifecycleState::Failed, "failure")
            }
        };
        if from == to {
            return Ok(record);
        }
        ensure_allowed(file_id, from, to)?;

        record.remote_object_id = None;
        record.remote_object_expires_at = None;
        record.remote_object_confirmed = false;
        record.operation_id = None;
        if let Some(doc) = record.remote_document_id.take() {
            if let Some(old) = record.superseded_document_id.replace(doc) {
                warn!(file_id, document = %old, "dropping older superseded document");
            }
        }
        let detail = format!("{}: {}", failure.kind, failure.detail);
        record.error_detail = (to == LifecycleState::Failed).then(|| detail.clone());
        record.lifecycle_state = to;
        record.state_updated_at = now_ms();

        let mut tx = self.pool.begin().await?;
        write_record(&mut tx, &record).await?;
        append_log(&mut tx, file_id, Some(from), to, phase, Some(&detail)).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Externally triggered corrective transition back to `Untracked`.
    pub async fn force_reset(&self, file_id: &str) -> Result<FileRecord> {
        let record = self.fetch(file_id).await?;
        let from = record.lifecycle_state;
        if from == LifecycleState::Untracked {
            return Ok(record);
        }
        if from.is_transient() {
            anyhow::bail!(
                "{} is {}; run recovery instead of resetting an in-flight record",
                file_id,
                from
            );
        }
        self.record_intent(file_id, from, LifecycleState::Untracked)
            .await?;
        self.record_result(file_id, LifecycleState::Untracked, RemoteIds::default())
            .await
    }

    /// Reset every `Failed` record. Returns how many were reset.
    pub async fn reset_failed(&self) -> Result<u64> {
        let failed = self.list_in_state(LifecycleState::Failed).await?;
        for record in &failed {
            self.force_reset(&record.file_id).await?;
        }
        Ok(failed.len() as u64)
    }
}

/// Deterministic raw object name for one upload generation of a file.
///
/// Re-sending the same generation collides with the existing object
/// instead of creating a duplicate.
pub fn planned_object_name(file_id: &str, content_hash: &str, generation: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(content_hash.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("files/{}-{}", &digest[..24], generation)
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn ensure_allowed(file_id: &str, from: LifecycleState, to: LifecycleState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(TransitionError::Illegal {
            file_id: file_id.to_string(),
            from,
            to,
        }
        .into())
    }
}

async fn write_record(tx: &mut Transaction<'_, Sqlite>, record: &FileRecord) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE files SET
            content_hash = ?,
            metadata_json = ?,
            lifecycle_state = ?,
            remote_object_id = ?,
            remote_object_expires_at = ?,
            remote_object_confirmed = ?,
            operation_id = ?,
            remote_document_id = ?,
            superseded_document_id = ?,
            confirmation = ?,
            generation = ?,
            attempt_count = ?,
            error_detail = ?,
            state_updated_at = ?
        WHERE file_id = ?
        "#,
    )
    .bind(&record.content_hash)
    .bind(serde_json::to_string(&record.metadata)?)
    .bind(record.lifecycle_state.as_str())
    .bind(&record.remote_object_id)
    .bind(record.remote_object_expires_at)
    .bind(record.remote_object_confirmed)
    .bind(&record.operation_id)
    .bind(&record.remote_document_id)
    .bind(&record.superseded_document_id)
    .bind(&record.confirmation)
    .bind(record.generation)
    .bind(record.attempt_count)
    .bind(&record.error_detail)
    .bind(record.state_updated_at)
    .bind(&record.file_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn append_log(
    tx: &mut Transaction<'_, Sqlite>,
    file_id: &str,
    from: Option<LifecycleState>,
    to: LifecycleState,
    phase: &str,
    detail: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO transitions (file_id, from_state, to_state, phase, detail, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(file_id)
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(phase)
    .bind(detail)
    .bind(now_ms())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_record(row: &SqliteRow) -> Result<FileRecord> {
    let state: String = row.get("lifecycle_state");
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json)
        .with_context(|| format!("corrupt metadata for {}", row.get::<String, _>("file_id")))?;
    Ok(FileRecord {
        file_id: row.get("file_id"),
        content_hash: row.get("content_hash"),
        metadata,
        lifecycle_state: state.parse()?,
        remote_object_id: row.get("remote_object_id"),
        remote_object_expires_at: row.get("remote_object_expires_at"),
        remote_object_confirmed: row.get("remote_object_confirmed"),
        operation_id: row.get("operation_id"),
        remote_document_id: row.get("remote_document_id"),
        superseded_document_id: row.get("superseded_document_id"),
        confirmation: row.get("confirmation"),
        generation: row.get("generation"),
        attempt_count: row.get("attempt_count"),
        error_detail: row.get("error_detail"),
        state_updated_at: row.get("state_updated_at"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, LifecycleStore) {
        let tmp = TempDir::new().unwrap();
        let store = LifecycleStore::open(&tmp.path().join("state.sqlite")).await.unwrap();
        (tmp, store)
    }

    fn scanned(path: &str, hash: &str) -> ScannedFile {
        ScannedFile {
            path: path.to_string(),
            content_hash: hash.to_string(),
            metadata: Metadata::new(),
        }
    }

    async fn index(store: &LifecycleStore, id: &str, doc: &str) {
        store
            .record_intent(id, LifecycleState::Untracked, LifecycleState::Uploading)
            .await
            .unwrap();
        store
            .record_intent(id, LifecycleState::Uploading, LifecycleState::Processing)
            .await
            .unwrap();
        store
            .record_result(
                id,
                LifecycleState::Indexed,
                RemoteIds {
                    document_id: Some(doc.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn seed_creates_untracked_records() {
        let (_tmp, store) = store().await;
        let report = store
            .seed(vec![scanned("a.md", "h1"), scanned("b.md", "h2")], true)
            .await
            .unwrap();
        assert_eq!(report.discovered, 2);
        let rec = store.get("a.md").await.unwrap().unwrap();
        assert_eq!(rec.lifecycle_state, LifecycleState::Untracked);
        assert_eq!(store.history("a.md").await.unwrap()[0].phase, "discovered");

        let again = store.seed(vec![scanned("a.md", "h1")], false).await.unwrap();
        assert_eq!(again.unchanged, 1);
        assert_eq!(again.discovered, 0);
    }

    #[tokio::test]
    async fn intent_plans_object_and_is_idempotent() {
        let (_tmp, store) = store().await;
        store.seed(vec![scanned("a.md", "h1")], false).await.unwrap();

        let first = store
            .record_intent("a.md", LifecycleState::Untracked, LifecycleState::Uploading)
            .await
            .unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(
            first.remote_object_id.as_deref(),
            Some(planned_object_name("a.md", "h1", 1).as_str())
        );

        let second = store
            .record_intent("a.md", LifecycleState::Untracked, LifecycleState::Uploading)
            .await
            .unwrap();
        assert_eq!(second.generation, 1);
        assert_eq!(second.remote_object_id, first.remote_object_id);
        let intents = store
            .history("a.md")
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.phase == "intent")
            .count();
        assert_eq!(intents, 1);
    }

    #[tokio::test]
    async fn intent_rejects_wrong_source_state() {
        let (_tmp, store) = store().await;
        store.seed(vec![scanned("a.md", "h1")], false).await.unwrap();
        let err = store
            .record_intent("a.md", LifecycleState::Processing, LifecycleState::Indexed)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransitionError>(),
            Some(TransitionError::StateMismatch { .. })
        ));
        let err = store
            .record_intent("a.md", LifecycleState::Untracked, LifecycleState::Indexed)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransitionError>(),
            Some(TransitionError::Illegal { .. })
        ));
    }

    #[tokio::test]
    async fn eligible_never_includes_in_flight_records() {
        let (_tmp, store) = store().await;
        store
            .seed(
                vec![scanned("a.md", "1"), scanned("b.md", "2"), scanned("c.md", "3")],
                false,
            )
            .await
            .unwrap();
        store
            .record_intent("b.md", LifecycleState::Untracked, LifecycleState::Uploading)
            .await
            .unwrap();

        let all = store
            .list_eligible(&EligibleFilter { after: None, limit: 10 })
            .await
            .unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.file_id.as_str()).collect();
        assert_eq!(ids, vec!["a.md", "c.md"]);

        let page = store
            .list_eligible(&EligibleFilter {
                after: Some("a.md".into()),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].file_id, "c.md");
    }

    #[tokio::test]
    async fn indexed_requires_document_and_holds_it() {
        let (_tmp, store) = store().await;
        store.seed(vec![scanned("a.md", "1")], false).await.unwrap();
        store
            .record_intent("a.md", LifecycleState::Untracked, LifecycleState::Uploading)
            .await
            .unwrap();
        store
            .record_intent("a.md", LifecycleState::Uploading, LifecycleState::Processing)
            .await
            .unwrap();
        assert!(store
            .record_result("a.md", LifecycleState::Indexed, RemoteIds::default())
            .await
            .is_err());
        store
            .record_result(
                "a.md",
                LifecycleState::Indexed,
                RemoteIds {
                    document_id: Some("doc-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            store.indexed_documents().await.unwrap(),
            vec![("a.md".to_string(), "doc-1".to_string())]
        );
    }

    #[tokio::test]
    async fn failure_kinds_map_to_states() {
        let (_tmp, store) = store().await;
        store
            .seed(vec![scanned("a.md", "1"), scanned("b.md", "2")], false)
            .await
            .unwrap();

        store
            .record_intent("a.md", LifecycleState::Untracked, LifecycleState::Uploading)
            .await
            .unwrap();
        let rec = store
            .record_failure(
                "a.md",
                &Failure {
                    kind: ErrorKind::RateLimited,
                    detail: "429".into(),
                    max_attempts: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(rec.lifecycle_state, LifecycleState::Untracked);
        assert_eq!(rec.attempt_count, 0);
        assert!(rec.error_detail.is_none());

        for expected in [LifecycleState::Untracked, LifecycleState::Failed] {
            store
                .record_intent("a.md", LifecycleState::Untracked, LifecycleState::Uploading)
                .await
                .unwrap();
            let rec = store
                .record_failure(
                    "a.md",
                    &Failure {
                        kind: ErrorKind::Transient,
                        detail: "503".into(),
                        max_attempts: 2,
                    },
                )
                .await
                .unwrap();
            assert_eq!(rec.lifecycle_state, expected);
        }
        let failed = store.failed_records().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].1.contains("transient"));

        store
            .record_intent("b.md", LifecycleState::Untracked, LifecycleState::Uploading)
            .await
            .unwrap();
        let rec = store
            .record_failure(
                "b.md",
                &Failure {
                    kind: ErrorKind::Permanent,
                    detail: "400".into(),
                    max_attempts: 5,
                },
            )
            .await
            .unwrap();
        assert_eq!(rec.lifecycle_state, LifecycleState::Failed);
        assert_eq!(store.reset_failed().await.unwrap(), 2);
        assert_eq!(store.counters().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn changed_content_marks_indexed_stale_and_supersedes_on_upload() {
        let (_tmp, store) = store().await;
        store.seed(vec![scanned("a.md", "v1")], false).await.unwrap();
        index(&store, "a.md", "doc-1").await;

        let report = store.seed(vec![scanned("a.md", "v2")], false).await.unwrap();
        assert_eq!(report.changed, 1);
        let rec = store.get("a.md").await.unwrap().unwrap();
        assert_eq!(rec.lifecycle_state, LifecycleState::Stale);
        assert_eq!(rec.remote_document_id.as_deref(), Some("doc-1"));

        let rec = store
            .record_intent("a.md", LifecycleState::Stale, LifecycleState::Uploading)
            .await
            .unwrap();
        assert!(rec.remote_document_id.is_none());
        assert_eq!(rec.superseded_document_id.as_deref(), Some("doc-1"));
        assert_eq!(rec.generation, 2);
    }

    #[tokio::test]
    async fn complete_scan_marks_missing_indexed_files_stale() {
        let (_tmp, store) = store().await;
        store
            .seed(vec![scanned("a.md", "1"), scanned("b.md", "2")], false)
            .await
            .unwrap();
        index(&store, "a.md", "doc-a").await;
        let report = store.seed(vec![scanned("b.md", "2")], true).await.unwrap();
        assert_eq!(report.missing, 1);
        assert_eq!(
            store.get("a.md").await.unwrap().unwrap().lifecycle_state,
            LifecycleState::Stale
        );
    }

    #[tokio::test]
    async fn force_reset_refuses_in_flight_records() {
        let (_tmp, store) = store().await;
        store.seed(vec![scanned("a.md", "1")], false).await.unwrap();
        store
            .record_intent("a.md", LifecycleState::Untracked, LifecycleState::Uploading)
            .await
            .unwrap();
        assert!(store.force_reset("a.md").await.is_err());
    }

    #[tokio::test]
    async fn force_reset_of_indexed_keeps_document_for_cleanup() {
        let (_tmp, store) = store().await;
        store.seed(vec![scanned("a.md", "1")], false).await.unwrap();
        index(&store, "a.md", "doc-a").await;
        let rec = store.force_reset("a.md").await.unwrap();
        assert_eq!(rec.lifecycle_state, LifecycleState::Untracked);
        assert!(rec.remote_document_id.is_none());
        assert_eq!(rec.superseded_document_id.as_deref(), Some("doc-a"));
        assert!(store.known_document_ids().await.unwrap().contains("doc-a"));
    }
}
