//! # Upload Orchestrator
//!
//! Drives eligible files (`Untracked`, `Stale`) through the upload
//! lifecycle:
//!
//! ```text
//!   Untracked/Stale ──intent──▶ Uploading ──upload, wait ACTIVE──▶ (result)
//!        ──intent──▶ Processing ──import──▶ (result: operation id)
//!        ──poll, confirm──▶ Indexed
//! ```
//!
//! Every remote call is preceded by a committed intent and followed by a
//! committed result or failure, so a crash at any point leaves a state
//! that [`crate::recovery`] can resolve.
//!
//! ## Scheduling
//!
//! Work is processed in passes. Each pass pages through eligible records
//! in cohorts of `cohort_size`; cohorts are progress checkpoints, not
//! barriers, so files from the next cohort start as soon as capacity
//! frees up. Upload-phase concurrency follows the rate limiter's
//! recommendation; polling is bounded separately. While the circuit
//! breaker is open, files are deferred instead of started.
//!
//! Files that were requeued (rate limited, transient failure) or deferred
//! are picked up by the next pass, up to `max_passes`.
//!
//! An import that times out may still have created a document, so it is
//! never re-sent. The file stays `Processing` without an operation id
//! and is settled from the document listing, here or by the next
//! recovery pass.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::breaker::{Admission, TrialTicket};
use crate::error::{ErrorKind, RemoteError};
use crate::limiter::RateLimiter;
use crate::models::{FileRecord, LifecycleState, StateCounters};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::recovery::find_unclaimed;
use crate::remote::client::RemoteClient;
use crate::remote::{DocumentId, OperationStatus};
use crate::scanner::{content_hash, mime_for, read_local};
use crate::shutdown::Shutdown;
use crate::state_store::{now_ms, EligibleFilter, Failure, LifecycleStore, RemoteIds};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub cohort_size: usize,
    pub max_upload_concurrency: usize,
    pub poll_concurrency: usize,
    pub max_attempts: i64,
    pub max_passes: u32,
    /// Pause between passes when nothing tells us how long to wait.
    pub pass_delay: Duration,
    /// Process at most this many files in one run.
    pub limit: Option<usize>,
    /// Directory that file ids are relative to.
    pub scan_root: Option<PathBuf>,
    pub max_file_bytes: u64,
}

/// What one run accomplished.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub indexed: u64,
    pub requeued: u64,
    pub orphaned: u64,
    pub newly_failed: u64,
    /// Files skipped because the circuit breaker was open (or a drain began).
    pub deferred: u64,
    /// Imports with an unknown outcome, left `Processing` for recovery.
    pub unsettled: u64,
    pub passes: u32,
    /// `true` when the run stopped early because of a drain request.
    pub drained: bool,
    /// Every `Failed` record at the end of the run, with its reason.
    pub failed: Vec<(String, String)>,
    pub counters: StateCounters,
}

#[derive(Debug, Clone, PartialEq)]
enum FileOutcome {
    Indexed,
    Requeued,
    Failed(String),
    Orphaned,
    Deferred,
    Unsettled,
}

// ═══════════════════════════════════════════════════════════════════════
// Adaptive upload gate
// ═══════════════════════════════════════════════════════════════════════

/// Counting gate whose capacity follows the limiter's recommendation.
struct UploadGate {
    limiter: Arc<RateLimiter>,
    hard_max: usize,
    active: Mutex<usize>,
    notify: Notify,
}

struct UploadPermit<'a> {
    gate: &'a UploadGate,
}

impl UploadGate {
    fn new(limiter: Arc<RateLimiter>, hard_max: usize) -> Self {
        Self {
            limiter,
            hard_max: hard_max.max(1),
            active: Mutex::new(0),
            notify: Notify::new(),
        }
    }

    async fn acquire(&self) -> UploadPermit<'_> {
        loop {
            let notified = self.notify.notified();
            {
                let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
                let capacity = self.limiter.concurrency().clamp(1, self.hard_max);
                if *active < capacity {
                    *active += 1;
                    return UploadPermit { gate: self };
                }
            }
            notified.await;
        }
    }
}

impl Drop for UploadPermit<'_> {
    fn drop(&mut self) {
        let mut active = self.gate.active.lock().unwrap_or_else(|p| p.into_inner());
        *active = active.saturating_sub(1);
        drop(active);
        self.gate.notify.notify_waiters();
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════

struct Shared {
    store: LifecycleStore,
    client: Arc<RemoteClient>,
    config: OrchestratorConfig,
    content_root: PathBuf,
    progress: Arc<dyn ProgressReporter>,
    shutdown: Shutdown,
    gate: UploadGate,
    poll_slots: Semaphore,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct RunState {
    summary: RunSummary,
    processed: usize,
    cohort_seq: u64,
}

impl Orchestrator {
    pub fn new(
        store: LifecycleStore,
        client: Arc<RemoteClient>,
        config: OrchestratorConfig,
        progress: Arc<dyn ProgressReporter>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let content_root = config
            .scan_root
            .clone()
            .ok_or_else(|| anyhow!("scan.root must be configured to read file contents"))?;
        let gate = UploadGate::new(client.limiter().clone(), config.max_upload_concurrency);
        let poll_slots = Semaphore::new(config.poll_concurrency.max(1));
        Ok(Self {
            shared: Arc::new(Shared {
                store,
                client,
                config,
                content_root,
                progress,
                shutdown,
                gate,
                poll_slots,
            }),
        })
    }

    /// Process eligible files until none are left, the pass budget runs
    /// out, the run limit is reached, or a drain is requested.
    pub async fn run(&self) -> Result<RunSummary> {
        let shared = &self.shared;
        let mut state = RunState::default();
        info!(
            cohort_size = shared.config.cohort_size,
            max_passes = shared.config.max_passes,
            "upload run starting"
        );

        for pass in 1..=shared.config.max_passes {
            if shared.shutdown.is_draining() || self.limit_reached(&state, 0) {
                break;
            }
            state.summary.passes = pass;
            let before = (state.summary.requeued, state.summary.deferred);
            self.run_pass(pass, &mut state).await?;

            let counters = shared.store.counters().await?;
            shared.progress.report(ProgressEvent::Run { pass, counters });

            let requeued = state.summary.requeued - before.0;
            let deferred = state.summary.deferred - before.1;
            if requeued + deferred == 0 || pass == shared.config.max_passes {
                break;
            }
            let wait = shared
                .client
                .breaker()
                .snapshot()
                .retry_after
                .unwrap_or(shared.config.pass_delay);
            info!(
                pass,
                requeued,
                deferred,
                wait_ms = wait.as_millis() as u64,
                breaker = %shared.client.breaker().state(),
                "pass finished with work left"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shared.shutdown.drained() => {}
            }
        }

        let mut summary = state.summary;
        summary.drained = shared.shutdown.is_draining();
        summary.counters = shared.store.counters().await?;
        summary.failed = shared.store.failed_records().await?;
        info!(
            indexed = summary.indexed,
            requeued = summary.requeued,
            failed = summary.newly_failed,
            orphaned = summary.orphaned,
            deferred = summary.deferred,
            unsettled = summary.unsettled,
            passes = summary.passes,
            drained = summary.drained,
            "upload run finished"
        );
        Ok(summary)
    }

    fn limit_reached(&self, state: &RunState, in_flight: usize) -> bool {
        self.shared
            .config
            .limit
            .is_some_and(|limit| state.processed + in_flight >= limit)
    }

    async fn run_pass(&self, pass: u32, state: &mut RunState) -> Result<()> {
        let shared = &self.shared;
        let max_in_flight =
            shared.config.max_upload_concurrency + shared.config.poll_concurrency;
        let mut set: JoinSet<(u64, String, Result<FileOutcome>)> = JoinSet::new();
        let mut queue: VecDeque<(u64, FileRecord)> = VecDeque::new();
        let mut cohorts: HashMap<u64, (u64, u64)> = HashMap::new();
        let mut cursor: Option<String> = None;
        let mut exhausted = false;
        let mut first_error: Option<anyhow::Error> = None;

        loop {
            while set.len() < max_in_flight
                && first_error.is_none()
                && !shared.shutdown.is_draining()
                && !self.limit_reached(state, set.len())
            {
                if queue.is_empty() && !exhausted {
                    let filter = EligibleFilter {
                        after: cursor.clone(),
                        limit: shared.config.cohort_size,
                    };
                    let batch = match shared.store.list_eligible(&filter).await {
                        Ok(batch) => batch,
                        Err(e) => {
                            first_error = Some(e);
                            break;
                        }
                    };
                    if batch.is_empty() {
                        exhausted = true;
                        break;
                    }
                    state.cohort_seq += 1;
                    let cohort_id = state.cohort_seq;
                    let total = batch.len() as u64;
                    cursor = batch.last().map(|r| r.file_id.clone());
                    cohorts.insert(cohort_id, (0, total));
                    debug!(pass, cohort_id, files = total, "cohort dispatched");
                    shared.progress.report(ProgressEvent::Cohort {
                        cohort_id,
                        done: 0,
                        total,
                    });
                    queue.extend(batch.into_iter().map(|r| (cohort_id, r)));
                }
                let Some((cohort_id, record)) = queue.pop_front() else {
                    break;
                };
                let task = shared.clone();
                set.spawn(async move {
                    let file_id = record.file_id.clone();
                    let outcome = process(task, cohort_id, record).await;
                    (cohort_id, file_id, outcome)
                });
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            match joined {
                Ok((cohort_id, file_id, Ok(outcome))) => {
                    self.tally(state, &file_id, outcome);
                    if let Some(entry) = cohorts.get_mut(&cohort_id) {
                        entry.0 += 1;
                        let (done, total) = *entry;
                        shared.progress.report(ProgressEvent::Cohort {
                            cohort_id,
                            done,
                            total,
                        });
                        if done == total {
                            cohorts.remove(&cohort_id);
                            debug!(pass, cohort_id, "cohort checkpoint");
                            if let Ok(counters) = shared.store.counters().await {
                                shared.progress.report(ProgressEvent::Run { pass, counters });
                            }
                        }
                    }
                }
                Ok((_, file_id, Err(e))) => {
                    error!(file_id = %file_id, error = %e, "lifecycle write failed; finishing in-flight files");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "upload task aborted");
                    first_error.get_or_insert(anyhow!("upload task aborted: {}", e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn tally(&self, state: &mut RunState, file_id: &str, outcome: FileOutcome) {
        let summary = &mut state.summary;
        match outcome {
            FileOutcome::Indexed => summary.indexed += 1,
            FileOutcome::Requeued => summary.requeued += 1,
            FileOutcome::Orphaned => summary.orphaned += 1,
            FileOutcome::Unsettled => summary.unsettled += 1,
            FileOutcome::Failed(reason) => {
                warn!(file_id, reason = %reason, "file failed");
                summary.newly_failed += 1;
            }
            FileOutcome::Deferred => {
                summary.deferred += 1;
                return;
            }
        }
        state.processed += 1;
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Per-file pipeline
// ═══════════════════════════════════════════════════════════════════════

async fn process(shared: Arc<Shared>, cohort_id: u64, record: FileRecord) -> Result<FileOutcome> {
    let permit = shared.gate.acquire().await;
    if shared.shutdown.is_draining() {
        return Ok(FileOutcome::Deferred);
    }
    let trial = match shared.client.breaker().admit() {
        Admission::Allowed => None,
        Admission::Trial(ticket) => {
            info!(file_id = %record.file_id, "circuit half-open; sending trial upload");
            Some(ticket)
        }
        Admission::Rejected { .. } => return Ok(FileOutcome::Deferred),
    };
    let outcome = shared.run_file(cohort_id, record, permit, trial).await;
    if let Some(ticket) = trial {
        // No-op once the upload reported against the ticket.
        shared.client.breaker().release_trial(ticket);
    }
    outcome
}

impl Shared {
    fn emit(&self, cohort_id: u64, file_id: &str, new_state: LifecycleState) {
        self.progress.report(ProgressEvent::Item {
            cohort_id,
            file_id: file_id.to_string(),
            new_state,
            timestamp_ms: now_ms(),
        });
    }

    async fn run_file(
        &self,
        cohort_id: u64,
        record: FileRecord,
        permit: UploadPermit<'_>,
        trial: Option<TrialTicket>,
    ) -> Result<FileOutcome> {
        let file_id = record.file_id.clone();
        let from = record.lifecycle_state;

        let bytes = match read_local(&self.content_root, &file_id).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return self.orphan(cohort_id, record).await,
            Err(e) => {
                let detail = format!("cannot read local file: {}", e);
                return self.fail_with(cohort_id, &file_id, ErrorKind::Permanent, detail).await;
            }
        };
        if bytes.len() as u64 > self.config.max_file_bytes {
            let detail = format!("file exceeds {} bytes", self.config.max_file_bytes);
            return self.fail_with(cohort_id, &file_id, ErrorKind::Permanent, detail).await;
        }
        if let Err(e) = record.metadata.validate() {
            return self
                .fail_with(cohort_id, &file_id, ErrorKind::Permanent, e.to_string())
                .await;
        }
        if content_hash(&bytes) != record.content_hash {
            debug!(file_id = %file_id, "file changed since last scan; uploading current content");
        }

        // Raw upload
        let rec = self
            .store
            .record_intent(&file_id, from, LifecycleState::Uploading)
            .await?;
        self.emit(cohort_id, &file_id, LifecycleState::Uploading);
        let object_name = rec
            .remote_object_id
            .clone()
            .ok_or_else(|| anyhow!("{} entered UPLOADING without a planned object", file_id))?;

        let raw = match self
            .client
            .upload_as(&object_name, &file_id, mime_for(&file_id), bytes, trial)
            .await
        {
            Ok(raw) => raw,
            Err(e) => return self.fail(cohort_id, &file_id, e).await,
        };
        let active = match self.client.wait_until_active(raw).await {
            Ok(active) => active,
            Err(e) => return self.fail(cohort_id, &file_id, e).await,
        };
        self.store
            .record_result(
                &file_id,
                LifecycleState::Uploading,
                RemoteIds {
                    object_id: Some(active.name().to_string()),
                    object_expires_at: active.expires_at(),
                    object_confirmed: true,
                    ..Default::default()
                },
            )
            .await?;

        // Import
        self.store
            .record_intent(&file_id, LifecycleState::Uploading, LifecycleState::Processing)
            .await?;
        self.emit(cohort_id, &file_id, LifecycleState::Processing);
        let metadata = rec.metadata.with_source_key(&file_id);
        let op = match self.client.import_to_store(&active, &metadata).await {
            Ok(op) => op,
            Err(e @ RemoteError::Transient(_)) => {
                return self.settle_unknown_import(cohort_id, &file_id, e).await
            }
            Err(e) => return self.fail(cohort_id, &file_id, e).await,
        };
        self.store
            .record_result(
                &file_id,
                LifecycleState::Processing,
                RemoteIds {
                    operation_id: Some(op.name().to_string()),
                    ..Default::default()
                },
            )
            .await?;
        drop(permit);

        // Poll
        let _slot = self.poll_slots.acquire().await?;
        let doc = match self.client.poll_operation(&op, None).await {
            Ok(OperationStatus::Done(doc)) => doc,
            Ok(OperationStatus::Failed(msg)) => {
                let detail = format!("import failed: {}", msg);
                return self.fail_with(cohort_id, &file_id, ErrorKind::Transient, detail).await;
            }
            Ok(OperationStatus::Pending) => {
                let detail = format!(
                    "{} did not finish within {:?}",
                    op.name(),
                    self.client.config().poll.operation_timeout
                );
                return self.fail_with(cohort_id, &file_id, ErrorKind::Permanent, detail).await;
            }
            Err(e) => return self.fail(cohort_id, &file_id, e).await,
        };
        let doc = match self.client.confirm(doc).await {
            Ok(doc) => doc,
            Err(e) => return self.fail(cohort_id, &file_id, e).await,
        };

        complete_indexing(&self.store, &self.client, &file_id, doc).await?;
        self.emit(cohort_id, &file_id, LifecycleState::Indexed);
        Ok(FileOutcome::Indexed)
    }

    /// The import may have reached the remote. Adopt its document if the
    /// listing already shows it; otherwise leave the record `Processing`
    /// with no operation id for recovery.
    async fn settle_unknown_import(
        &self,
        cohort_id: u64,
        file_id: &str,
        err: RemoteError,
    ) -> Result<FileOutcome> {
        warn!(file_id, error = %err, "import outcome unknown; checking the store listing");
        let listing = match self.client.list_documents().await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(file_id, error = %e, "listing failed; leaving file for recovery");
                return Ok(FileOutcome::Unsettled);
            }
        };
        let known = self.store.known_document_ids().await?;
        let Some(found) = find_unclaimed(&listing, file_id, &known) else {
            info!(file_id, "no document yet; leaving file PROCESSING for recovery");
            return Ok(FileOutcome::Unsettled);
        };
        debug!(file_id, document = %found.name, "adopting document from listing");
        let doc = match self
            .client
            .confirm(DocumentId::from_persisted(found.name.clone()))
            .await
        {
            Ok(doc) => doc,
            Err(e) => return self.fail(cohort_id, file_id, e).await,
        };
        complete_indexing(&self.store, &self.client, file_id, doc).await?;
        self.emit(cohort_id, file_id, LifecycleState::Indexed);
        Ok(FileOutcome::Indexed)
    }

    /// The local file is gone: release any document it still owns.
    async fn orphan(&self, cohort_id: u64, record: FileRecord) -> Result<FileOutcome> {
        let file_id = record.file_id.as_str();
        let rec = self
            .store
            .record_intent(file_id, record.lifecycle_state, LifecycleState::Orphaned)
            .await?;
        let cleared = release_superseded(&self.client, &rec).await;
        self.store
            .record_result(
                file_id,
                LifecycleState::Orphaned,
                RemoteIds {
                    clear_superseded: cleared,
                    ..Default::default()
                },
            )
            .await?;
        info!(file_id, "local file missing; orphaned");
        self.emit(cohort_id, file_id, LifecycleState::Orphaned);
        Ok(FileOutcome::Orphaned)
    }

    async fn fail(&self, cohort_id: u64, file_id: &str, err: RemoteError) -> Result<FileOutcome> {
        self.fail_with(cohort_id, file_id, err.kind(), err.to_string())
            .await
    }

    async fn fail_with(
        &self,
        cohort_id: u64,
        file_id: &str,
        kind: ErrorKind,
        detail: String,
    ) -> Result<FileOutcome> {
        let failure = Failure {
            kind,
            detail: detail.clone(),
            max_attempts: self.config.max_attempts,
        };
        let rec = self.store.record_failure(file_id, &failure).await?;
        self.emit(cohort_id, file_id, rec.lifecycle_state);
        if rec.lifecycle_state == LifecycleState::Failed {
            Ok(FileOutcome::Failed(detail))
        } else {
            debug!(file_id, kind = %kind, attempts = rec.attempt_count, "requeued");
            Ok(FileOutcome::Requeued)
        }
    }
}

/// Best-effort deletion of a record's superseded document. Returns
/// whether the reference can be dropped.
pub(crate) async fn release_superseded(client: &RemoteClient, record: &FileRecord) -> bool {
    let Some(old) = record.superseded_document_id.as_deref() else {
        return true;
    };
    match client.delete_document(&DocumentId::from_persisted(old)).await {
        Ok(()) => {
            debug!(file_id = %record.file_id, document = old, "superseded document deleted");
            true
        }
        Err(e) => {
            warn!(
                file_id = %record.file_id,
                document = old,
                error = %e,
                "could not delete superseded document; keeping it for reconcile"
            );
            false
        }
    }
}

/// Final step shared with recovery: drop the superseded document, commit
/// `Indexed`, then release the raw object.
pub(crate) async fn complete_indexing(
    store: &LifecycleStore,
    client: &RemoteClient,
    file_id: &str,
    doc: DocumentId,
) -> Result<FileRecord> {
    let current = store
        .get(file_id)
        .await?
        .ok_or_else(|| anyhow!("unknown file: {}", file_id))?;
    let cleared = release_superseded(client, &current).await;
    let rec = store
        .record_result(
            file_id,
            LifecycleState::Indexed,
            RemoteIds {
                document_id: Some(doc.into_string()),
                confirmation: Some(client.confirmation_tag().to_string()),
                clear_superseded: cleared,
                ..Default::default()
            },
        )
        .await?;
    debug!(file_id, document = ?rec.remote_document_id, "indexed");
    if let Some(object) = rec.remote_object_id.as_deref() {
        if let Err(e) = client.delete_object(object).await {
            debug!(file_id, object, error = %e, "raw object cleanup failed; it will expire");
        }
    }
    Ok(rec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::limiter::LimiterConfig;
    use crate::metadata::Metadata;
    use crate::models::ScannedFile;
    use crate::progress::{ChannelProgress, NoProgress};
    use crate::remote::client::{ClientConfig, ConfirmationMode, PollConfig};
    use crate::remote::memory::{ApiCall, FaultPlan, InMemoryFileSearch};
    use tempfile::TempDir;

    struct Harness {
        tmp: TempDir,
        store: LifecycleStore,
        api: Arc<InMemoryFileSearch>,
        client: Arc<RemoteClient>,
    }

    impl Harness {
        async fn new(api: InMemoryFileSearch, confirmation: ConfirmationMode) -> Self {
            let tmp = TempDir::new().unwrap();
            std::fs::create_dir_all(tmp.path().join("root")).unwrap();
            let store = LifecycleStore::open(&tmp.path().join("state.sqlite")).await.unwrap();
            let api = Arc::new(api);
            let breaker = Arc::new(CircuitBreaker::new(
                "test",
                BreakerConfig {
                    cooldown: Duration::from_millis(20),
                    max_cooldown: Duration::from_millis(80),
                    ..BreakerConfig::default()
                },
            ));
            let limiter = Arc::new(RateLimiter::new(
                LimiterConfig {
                    base_interval: Duration::ZERO,
                    min_concurrency: 1,
                    max_concurrency: 4,
                    ramp_successes: 2,
                },
                breaker,
            ));
            let client = Arc::new(RemoteClient::new(
                api.clone(),
                limiter,
                ClientConfig {
                    max_retries: 1,
                    retry_base: Duration::from_millis(1),
                    retry_cap: Duration::from_millis(2),
                    poll: PollConfig {
                        initial: Duration::from_millis(1),
                        max: Duration::from_millis(4),
                        operation_timeout: Duration::from_millis(100),
                        activation_timeout: Duration::from_millis(100),
                    },
                    confirmation,
                },
            ));
            Self {
                tmp,
                store,
                api,
                client,
            }
        }

        fn root(&self) -> PathBuf {
            self.tmp.path().join("root")
        }

        async fn add_file(&self, id: &str, body: &str) {
            std::fs::write(self.root().join(id), body).unwrap();
            self.store
                .seed(
                    vec![ScannedFile {
                        path: id.to_string(),
                        content_hash: content_hash(body.as_bytes()),
                        metadata: Metadata::new(),
                    }],
                    false,
                )
                .await
                .unwrap();
        }

        fn orchestrator(&self, progress: Arc<dyn ProgressReporter>) -> Orchestrator {
            self.orchestrator_with(progress, Shutdown::new())
        }

        fn orchestrator_with(
            &self,
            progress: Arc<dyn ProgressReporter>,
            shutdown: Shutdown,
        ) -> Orchestrator {
            Orchestrator::new(
                self.store.clone(),
                self.client.clone(),
                OrchestratorConfig {
                    cohort_size: 4,
                    max_upload_concurrency: 4,
                    poll_concurrency: 4,
                    max_attempts: 3,
                    max_passes: 5,
                    pass_delay: Duration::from_millis(1),
                    limit: None,
                    scan_root: Some(self.root()),
                    max_file_bytes: 1024,
                },
                progress,
                shutdown,
            )
            .unwrap()
        }

        async fn state_of(&self, id: &str) -> LifecycleState {
            self.store.get(id).await.unwrap().unwrap().lifecycle_state
        }
    }

    #[tokio::test]
    async fn indexes_files_and_reports_items() {
        let h = Harness::new(InMemoryFileSearch::default(), ConfirmationMode::Operation).await;
        h.add_file("a.md", "alpha").await;
        h.add_file("b.md", "beta").await;

        let (reporter, mut rx) = ChannelProgress::channel();
        let summary = h.orchestrator(Arc::new(reporter)).run().await.unwrap();
        assert_eq!(summary.indexed, 2);
        assert_eq!(summary.counters.indexed, 2);
        assert_eq!(h.api.document_count(), 2);

        let rec = h.store.get("a.md").await.unwrap().unwrap();
        assert_eq!(rec.confirmation.as_deref(), Some("operation-v1"));
        assert!(rec.remote_object_confirmed);

        let mut indexed_items = 0;
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Item { new_state: LifecycleState::Indexed, .. } = event {
                indexed_items += 1;
            }
        }
        assert_eq!(indexed_items, 2);
    }

    #[tokio::test]
    async fn missing_local_file_is_orphaned_and_document_released() {
        let h = Harness::new(InMemoryFileSearch::default(), ConfirmationMode::Operation).await;
        h.add_file("a.md", "alpha").await;
        h.orchestrator(Arc::new(NoProgress)).run().await.unwrap();
        let doc = h.store.get("a.md").await.unwrap().unwrap().remote_document_id.unwrap();

        std::fs::remove_file(h.root().join("a.md")).unwrap();
        h.store.seed(Vec::<ScannedFile>::new(), true).await.unwrap();
        assert_eq!(h.state_of("a.md").await, LifecycleState::Stale);

        let summary = h.orchestrator(Arc::new(NoProgress)).run().await.unwrap();
        assert_eq!(summary.orphaned, 1);
        let rec = h.store.get("a.md").await.unwrap().unwrap();
        assert_eq!(rec.lifecycle_state, LifecycleState::Orphaned);
        assert!(rec.remote_document_id.is_none());
        assert!(rec.superseded_document_id.is_none());
        assert!(!h.api.has_document(&doc));
    }

    #[tokio::test]
    async fn changed_file_replaces_its_document() {
        let h = Harness::new(InMemoryFileSearch::default(), ConfirmationMode::Operation).await;
        h.add_file("a.md", "v1").await;
        h.orchestrator(Arc::new(NoProgress)).run().await.unwrap();
        let old = h.store.get("a.md").await.unwrap().unwrap().remote_document_id.unwrap();

        h.add_file("a.md", "v2").await;
        assert_eq!(h.state_of("a.md").await, LifecycleState::Stale);
        h.orchestrator(Arc::new(NoProgress)).run().await.unwrap();

        let rec = h.store.get("a.md").await.unwrap().unwrap();
        assert_eq!(rec.lifecycle_state, LifecycleState::Indexed);
        assert_ne!(rec.remote_document_id.as_deref(), Some(old.as_str()));
        assert!(!h.api.has_document(&old));
        assert_eq!(h.api.document_count(), 1);
    }

    #[tokio::test]
    async fn permanent_import_error_fails_the_file() {
        let h = Harness::new(InMemoryFileSearch::default(), ConfirmationMode::Operation).await;
        h.add_file("a.md", "alpha").await;
        h.api
            .fail_next(ApiCall::Import, RemoteError::Permanent("HTTP 400: bad".into()));

        let summary = h.orchestrator(Arc::new(NoProgress)).run().await.unwrap();
        assert_eq!(summary.newly_failed, 1);
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].1.contains("HTTP 400"));
        assert_eq!(h.state_of("a.md").await, LifecycleState::Failed);
    }

    #[tokio::test]
    async fn rate_limited_upload_is_requeued_then_indexed() {
        let h = Harness::new(InMemoryFileSearch::default(), ConfirmationMode::Operation).await;
        h.add_file("a.md", "alpha").await;
        h.api
            .fail_next(ApiCall::Upload, RemoteError::RateLimited("HTTP 429".into()));

        let summary = h.orchestrator(Arc::new(NoProgress)).run().await.unwrap();
        assert_eq!(summary.requeued, 1);
        assert_eq!(summary.indexed, 1);
        assert!(summary.passes >= 2);
        let rec = h.store.get("a.md").await.unwrap().unwrap();
        assert_eq!(rec.attempt_count, 0);
        assert_eq!(rec.generation, 2);
    }

    #[tokio::test]
    async fn invisible_document_is_inconsistent_in_visible_mode() {
        let api = InMemoryFileSearch::default().with_faults(FaultPlan {
            hide_documents: true,
            ..Default::default()
        });
        let h = Harness::new(
            api,
            ConfirmationMode::Visible {
                timeout: Duration::from_millis(10),
            },
        )
        .await;
        h.add_file("a.md", "alpha").await;
        let summary = h.orchestrator(Arc::new(NoProgress)).run().await.unwrap();
        assert_eq!(summary.newly_failed, 1);
        assert!(summary.failed[0].1.contains("inconsistent"));
    }

    #[tokio::test]
    async fn stuck_operation_fails_after_timeout() {
        let api = InMemoryFileSearch::default().with_faults(FaultPlan {
            operations_stuck: true,
            ..Default::default()
        });
        let h = Harness::new(api, ConfirmationMode::Operation).await;
        h.add_file("a.md", "alpha").await;
        let summary = h.orchestrator(Arc::new(NoProgress)).run().await.unwrap();
        assert_eq!(summary.newly_failed, 1);
        assert_eq!(h.state_of("a.md").await, LifecycleState::Failed);
    }

    #[tokio::test]
    async fn oversized_file_fails_without_remote_calls() {
        let h = Harness::new(InMemoryFileSearch::default(), ConfirmationMode::Operation).await;
        h.add_file("big.md", &"x".repeat(2048)).await;
        let summary = h.orchestrator(Arc::new(NoProgress)).run().await.unwrap();
        assert_eq!(summary.newly_failed, 1);
        assert_eq!(h.api.calls(ApiCall::Upload), 0);
    }

    #[tokio::test]
    async fn drain_before_start_dispatches_nothing() {
        let h = Harness::new(InMemoryFileSearch::default(), ConfirmationMode::Operation).await;
        h.add_file("a.md", "alpha").await;
        let shutdown = Shutdown::new();
        shutdown.request_drain();
        let orch = Orchestrator::new(
            h.store.clone(),
            h.client.clone(),
            OrchestratorConfig {
                cohort_size: 4,
                max_upload_concurrency: 2,
                poll_concurrency: 2,
                max_attempts: 3,
                max_passes: 3,
                pass_delay: Duration::from_millis(1),
                limit: None,
                scan_root: Some(h.root()),
                max_file_bytes: 1024,
            },
            Arc::new(NoProgress),
            shutdown,
        )
        .unwrap();
        let summary = orch.run().await.unwrap();
        assert!(summary.drained);
        assert_eq!(summary.counters.pending, 1);
        assert_eq!(h.api.calls(ApiCall::Upload), 0);
    }

    #[tokio::test]
    async fn limit_caps_processed_files() {
        let h = Harness::new(InMemoryFileSearch::default(), ConfirmationMode::Operation).await;
        for i in 0..5 {
            h.add_file(&format!("f{}.md", i), &format!("body {}", i)).await;
        }
        let orch = Orchestrator::new(
            h.store.clone(),
            h.client.clone(),
            OrchestratorConfig {
                cohort_size: 2,
                max_upload_concurrency: 4,
                poll_concurrency: 4,
                max_attempts: 3,
                max_passes: 3,
                pass_delay: Duration::from_millis(1),
                limit: Some(3),
                scan_root: Some(h.root()),
                max_file_bytes: 1024,
            },
            Arc::new(NoProgress),
            Shutdown::new(),
        )
        .unwrap();
        let summary = orch.run().await.unwrap();
        assert_eq!(summary.indexed, 3);
        assert_eq!(summary.counters.pending, 2);
    }

    #[tokio::test]
    async fn drain_mid_run_finishes_in_flight_files_and_defers_the_rest() {
        let api = InMemoryFileSearch::default().with_faults(FaultPlan {
            operation_polls: 5,
            ..Default::default()
        });
        let h = Harness::new(api, ConfirmationMode::Operation).await;
        for i in 0..8 {
            h.add_file(&format!("f{}.md", i), &format!("body {}", i)).await;
        }
        let shutdown = Shutdown::new();
        let (reporter, mut rx) = ChannelProgress::channel();
        let orch = h.orchestrator_with(Arc::new(reporter), shutdown.clone());
        let run = tokio::spawn(async move { orch.run().await });

        while let Some(event) = rx.recv().await {
            if let ProgressEvent::Item { new_state: LifecycleState::Processing, .. } = event {
                shutdown.request_drain();
                break;
            }
        }
        let summary = run.await.unwrap().unwrap();

        assert!(summary.drained);
        assert!(summary.indexed >= 1);
        assert!(summary.counters.pending >= 2);
        assert_eq!(summary.counters.uploading, 0);
        assert!(h.store.list_in_state(LifecycleState::Uploading).await.unwrap().is_empty());
        assert!(h.store.list_in_state(LifecycleState::Processing).await.unwrap().is_empty());
        // Nothing deferred ever reached the remote.
        assert_eq!(h.api.calls(ApiCall::Upload), summary.indexed);
        assert_eq!(summary.counters.indexed, summary.indexed);
    }

    #[tokio::test]
    async fn timed_out_import_adopts_the_document_it_created() {
        let h = Harness::new(InMemoryFileSearch::default(), ConfirmationMode::Operation).await;
        h.add_file("a.md", "alpha").await;
        h.api.lose_next_response(ApiCall::Import);

        let summary = h.orchestrator(Arc::new(NoProgress)).run().await.unwrap();
        assert_eq!(summary.indexed, 1);
        assert_eq!(h.api.calls(ApiCall::Import), 1);
        assert_eq!(h.api.document_count(), 1);
        let rec = h.store.get("a.md").await.unwrap().unwrap();
        assert_eq!(rec.lifecycle_state, LifecycleState::Indexed);
        assert_eq!(rec.remote_document_id, Some(h.api.documents()[0].name.clone()));
    }

    #[tokio::test]
    async fn timed_out_import_without_a_document_is_left_for_recovery() {
        let api = InMemoryFileSearch::default().with_faults(FaultPlan {
            operation_polls: 3,
            ..Default::default()
        });
        let h = Harness::new(api, ConfirmationMode::Operation).await;
        h.add_file("a.md", "alpha").await;
        h.api.lose_next_response(ApiCall::Import);

        let summary = h.orchestrator(Arc::new(NoProgress)).run().await.unwrap();
        assert_eq!(summary.unsettled, 1);
        assert_eq!(summary.requeued, 0);
        assert_eq!(h.api.calls(ApiCall::Import), 1);
        let rec = h.store.get("a.md").await.unwrap().unwrap();
        assert_eq!(rec.lifecycle_state, LifecycleState::Processing);
        assert!(rec.operation_id.is_none());
        assert_eq!(rec.attempt_count, 0);
    }
}
