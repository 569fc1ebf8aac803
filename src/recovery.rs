//! # Startup Recovery
//!
//! Resolves records a previous process left in `Uploading` or
//! `Processing`. Each record is resolved from what the remote side can
//! still confirm, never by blindly re-running the step:
//!
//! | Found | Condition | Resolution |
//! |-------|-----------|------------|
//! | `Uploading` | raw object exists, usable, not near expiry | activate, import, poll → `Indexed` |
//! | `Uploading` | object missing, failed, or near expiry | reset → `Untracked` |
//! | `Processing` | operation known and `Done` | → `Indexed` |
//! | `Processing` | operation failed, unknown, or past the expiry ceiling | reset → `Untracked` |
//! | `Processing` | no operation id persisted | match listing by source key, else reset |
//!
//! Every resolution goes through the ordinary intent/result writes. The
//! whole pass is bounded by a deadline; anything still open when it
//! passes, or that hit a retryable error, is reported as unresolved and
//! left for the next start.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::metadata::source_key_value;
use crate::models::{FileRecord, LifecycleState};
use crate::orchestrator::complete_indexing;
use crate::remote::client::RemoteClient;
use crate::remote::{DocumentId, ObjectState, OperationHandle, OperationStatus, RemoteDocument};
use crate::state_store::{Failure, LifecycleStore, RemoteIds};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Upper bound on the whole recovery pass.
    pub deadline: Duration,
    /// Treat a raw object as expired this long before its real expiry.
    pub expiry_margin: Duration,
    pub max_attempts: i64,
    pub concurrency: usize,
    /// Raw object lifetime, used when no expiry was persisted.
    pub object_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Indexed,
    Reset,
    Failed,
    Unresolved,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryItem {
    pub file_id: String,
    pub from: LifecycleState,
    pub outcome: RecoveryOutcome,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub items: Vec<RecoveryItem>,
    pub indexed: u64,
    pub reset: u64,
    pub failed: u64,
    pub unresolved: u64,
}

impl RecoveryReport {
    fn push(&mut self, item: RecoveryItem) {
        match item.outcome {
            RecoveryOutcome::Indexed => self.indexed += 1,
            RecoveryOutcome::Reset => self.reset += 1,
            RecoveryOutcome::Failed => self.failed += 1,
            RecoveryOutcome::Unresolved => self.unresolved += 1,
        }
        self.items.push(item);
    }

    pub fn total(&self) -> u64 {
        self.items.len() as u64
    }

    /// No record was left in a transient state.
    pub fn is_clean(&self) -> bool {
        self.unresolved == 0
    }
}

type Resolution = (RecoveryOutcome, Option<String>);

pub struct RecoveryManager {
    store: LifecycleStore,
    client: Arc<RemoteClient>,
    config: RecoveryConfig,
    /// Remote listing, fetched at most once per pass.
    listing: OnceCell<Vec<RemoteDocument>>,
}

impl RecoveryManager {
    pub fn new(store: LifecycleStore, client: Arc<RemoteClient>, config: RecoveryConfig) -> Self {
        Self {
            store,
            client,
            config,
            listing: OnceCell::new(),
        }
    }

    /// Resolve every `Uploading` and `Processing` record.
    pub async fn run(&self) -> Result<RecoveryReport> {
        let mut stuck = self.store.list_in_state(LifecycleState::Uploading).await?;
        stuck.extend(self.store.list_in_state(LifecycleState::Processing).await?);

        let mut report = RecoveryReport::default();
        if stuck.is_empty() {
            debug!("nothing to recover");
            return Ok(report);
        }
        info!(records = stuck.len(), "recovering interrupted transitions");

        let deadline = Instant::now() + self.config.deadline;
        let items: Vec<RecoveryItem> = stream::iter(stuck)
            .map(|record| self.resolve_bounded(record, deadline))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for item in items {
            if item.outcome == RecoveryOutcome::Unresolved {
                warn!(
                    file_id = %item.file_id,
                    from = %item.from,
                    detail = item.detail.as_deref().unwrap_or(""),
                    "left unresolved"
                );
            }
            report.push(item);
        }
        info!(
            indexed = report.indexed,
            reset = report.reset,
            failed = report.failed,
            unresolved = report.unresolved,
            "recovery finished"
        );
        Ok(report)
    }

    async fn resolve_bounded(&self, record: FileRecord, deadline: Instant) -> RecoveryItem {
        let file_id = record.file_id.clone();
        let from = record.lifecycle_state;
        let (outcome, detail) =
            match tokio::time::timeout_at(deadline, self.resolve(record, deadline)).await {
                Ok(Ok(resolution)) => resolution,
                Ok(Err(e)) => (RecoveryOutcome::Unresolved, Some(format!("{:#}", e))),
                Err(_) => (
                    RecoveryOutcome::Unresolved,
                    Some("recovery deadline passed".to_string()),
                ),
            };
        RecoveryItem {
            file_id,
            from,
            outcome,
            detail,
        }
    }

    async fn resolve(&self, record: FileRecord, deadline: Instant) -> Result<Resolution> {
        match record.lifecycle_state {
            LifecycleState::Uploading => self.resolve_uploading(record, deadline).await,
            LifecycleState::Processing => self.resolve_processing(record, deadline).await,
            other => Err(anyhow!("{} is {}, not in flight", record.file_id, other)),
        }
    }

    async fn resolve_uploading(&self, record: FileRecord, deadline: Instant) -> Result<Resolution> {
        let file_id = record.file_id.as_str();
        let Some(object_name) = record.remote_object_id.clone() else {
            return self.reset(&record, "no raw object was planned").await;
        };
        let handle = match self.client.find_object(&object_name).await {
            Ok(Some(handle)) => handle,
            Ok(None) => return self.reset(&record, "raw object not found").await,
            Err(e) => return self.remote_error(&record, e).await,
        };
        if handle.state() == ObjectState::Failed {
            return self.reset(&record, "raw object failed processing").await;
        }
        if let Some(expires) = handle.expires_at().or(record.remote_object_expires_at) {
            if self.near_expiry(expires) {
                return self.reset(&record, "raw object near expiry").await;
            }
        }

        debug!(file_id, object = %object_name, "resuming interrupted upload");
        let active = match self.client.wait_until_active(handle).await {
            Ok(active) => active,
            Err(e) => return self.remote_error(&record, e).await,
        };
        self.store
            .record_result(
                file_id,
                LifecycleState::Uploading,
                RemoteIds {
                    object_id: Some(active.name().to_string()),
                    object_expires_at: active.expires_at(),
                    object_confirmed: true,
                    ..Default::default()
                },
            )
            .await?;

        let rec = self
            .store
            .record_intent(file_id, LifecycleState::Uploading, LifecycleState::Processing)
            .await?;
        let metadata = rec.metadata.with_source_key(file_id);
        let op = match self.client.import_to_store(&active, &metadata).await {
            Ok(op) => op,
            Err(e) => return self.remote_error(&rec, e).await,
        };
        let rec = self
            .store
            .record_result(
                file_id,
                LifecycleState::Processing,
                RemoteIds {
                    operation_id: Some(op.name().to_string()),
                    ..Default::default()
                },
            )
            .await?;
        self.settle(&rec, &op, deadline).await
    }

    async fn resolve_processing(&self, record: FileRecord, deadline: Instant) -> Result<Resolution> {
        match record.operation_id.clone() {
            Some(op) => {
                self.settle(&record, &OperationHandle::from_persisted(op), deadline)
                    .await
            }
            None => self.adopt_from_listing(&record).await,
        }
    }

    /// Poll a known operation until it settles, the object's expiry
    /// ceiling passes, or the recovery deadline passes.
    async fn settle(
        &self,
        record: &FileRecord,
        op: &OperationHandle,
        deadline: Instant,
    ) -> Result<Resolution> {
        let ceiling = self.expiry_ceiling(record);
        let status = match self.client.poll_operation(op, Some(deadline.min(ceiling))).await {
            Ok(status) => status,
            Err(e) => return self.remote_error(record, e).await,
        };
        match status {
            OperationStatus::Done(doc) => self.index(record, doc).await,
            OperationStatus::Failed(msg) => self.reset(record, &msg).await,
            OperationStatus::Pending if Instant::now() >= ceiling => {
                self.reset(record, "operation still pending at the object's expiry ceiling")
                    .await
            }
            OperationStatus::Pending => Ok((
                RecoveryOutcome::Unresolved,
                Some(format!("{} still pending", op.name())),
            )),
        }
    }

    /// The import may or may not have been sent: look for a document
    /// carrying this file's source key that nothing else claims.
    async fn adopt_from_listing(&self, record: &FileRecord) -> Result<Resolution> {
        let listing = match self
            .listing
            .get_or_try_init(|| self.client.list_documents())
            .await
        {
            Ok(listing) => listing,
            Err(e) => return self.remote_error(record, e).await,
        };
        let known = self.store.known_document_ids().await?;
        match find_unclaimed(listing, &record.file_id, &known) {
            Some(doc) => {
                debug!(file_id = %record.file_id, document = %doc.name, "adopting document from listing");
                let doc = DocumentId::from_persisted(doc.name.clone());
                self.index(record, doc).await
            }
            None => self.reset(record, "no operation and no matching document").await,
        }
    }

    async fn index(&self, record: &FileRecord, doc: DocumentId) -> Result<Resolution> {
        let doc = match self.client.confirm(doc).await {
            Ok(doc) => doc,
            Err(e) => return self.remote_error(record, e).await,
        };
        let rec = complete_indexing(&self.store, &self.client, &record.file_id, doc).await?;
        info!(file_id = %record.file_id, "recovered to INDEXED");
        Ok((RecoveryOutcome::Indexed, rec.remote_document_id))
    }

    /// Back to `Untracked` through an ordinary intent/result pair,
    /// releasing the raw object on the way.
    async fn reset(&self, record: &FileRecord, reason: &str) -> Result<Resolution> {
        let file_id = record.file_id.as_str();
        self.store
            .record_intent(file_id, record.lifecycle_state, LifecycleState::Untracked)
            .await?;
        if let Some(object) = record.remote_object_id.as_deref() {
            if let Err(e) = self.client.delete_object(object).await {
                debug!(file_id, object, error = %e, "raw object cleanup failed; it will expire");
            }
        }
        self.store
            .record_result(file_id, LifecycleState::Untracked, RemoteIds::default())
            .await?;
        info!(file_id, reason, "reset to UNTRACKED");
        Ok((RecoveryOutcome::Reset, Some(reason.to_string())))
    }

    async fn remote_error(&self, record: &FileRecord, err: RemoteError) -> Result<Resolution> {
        if err.is_retryable() {
            return Ok((RecoveryOutcome::Unresolved, Some(err.to_string())));
        }
        let failure = Failure {
            kind: err.kind(),
            detail: err.to_string(),
            max_attempts: self.config.max_attempts,
        };
        let rec = self.store.record_failure(&record.file_id, &failure).await?;
        let outcome = match rec.lifecycle_state {
            LifecycleState::Failed => RecoveryOutcome::Failed,
            _ => RecoveryOutcome::Reset,
        };
        Ok((outcome, Some(err.to_string())))
    }

    fn near_expiry(&self, expires_at_secs: i64) -> bool {
        let margin = self.config.expiry_margin.as_secs() as i64;
        chrono::Utc::now().timestamp() + margin >= expires_at_secs
    }

    /// Instant at which an in-flight import must be abandoned because its
    /// raw object is about to expire.
    fn expiry_ceiling(&self, record: &FileRecord) -> Instant {
        let expires_at = record.remote_object_expires_at.unwrap_or_else(|| {
            record.state_updated_at / 1000 + self.config.object_ttl.as_secs() as i64
        });
        let margin = self.config.expiry_margin.as_secs() as i64;
        let remaining = expires_at - margin - chrono::Utc::now().timestamp();
        Instant::now() + Duration::from_secs(remaining.max(0) as u64)
    }
}

/// A listed document carrying `file_id`'s source key that no record
/// already holds.
pub(crate) fn find_unclaimed<'a>(
    listing: &'a [RemoteDocument],
    file_id: &str,
    known: &HashSet<String>,
) -> Option<&'a RemoteDocument> {
    let key = source_key_value(file_id);
    listing
        .iter()
        .find(|doc| doc.source_key.as_deref() == Some(key.as_str()) && !known.contains(&doc.name))
}
