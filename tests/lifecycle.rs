//! End-to-end lifecycle scenarios against the in-memory file search API.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use upload_harness::breaker::{BreakerConfig, CallOutcome, CircuitBreaker, CircuitState};
use upload_harness::config::ScanConfig;
use upload_harness::limiter::{LimiterConfig, RateLimiter};
use upload_harness::models::LifecycleState;
use upload_harness::orchestrator::{Orchestrator, OrchestratorConfig, RunSummary};
use upload_harness::progress::NoProgress;
use upload_harness::recovery::{RecoveryConfig, RecoveryManager};
use upload_harness::remote::client::{ClientConfig, ConfirmationMode, PollConfig, RemoteClient};
use upload_harness::remote::memory::{ApiCall, FaultPlan, InMemoryFileSearch};
use upload_harness::remote::OperationStatus;
use upload_harness::scanner::scan_directory;
use upload_harness::shutdown::Shutdown;
use upload_harness::state_store::{LifecycleStore, RemoteIds};

struct Env {
    _tmp: TempDir,
    root: PathBuf,
    store: LifecycleStore,
    api: Arc<InMemoryFileSearch>,
}

impl Env {
    async fn new(files: usize) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("docs");
        fs::create_dir_all(&root).unwrap();
        for i in 0..files {
            fs::write(
                root.join(format!("doc-{:03}.md", i)),
                format!("# Document {}\n\nBody of document {}.", i, i),
            )
            .unwrap();
        }
        let store = LifecycleStore::open(&tmp.path().join("state.sqlite"))
            .await
            .unwrap();
        let scanned = scan_directory(&ScanConfig {
            root: root.clone(),
            include_globs: vec!["**/*.md".into()],
            exclude_globs: vec![],
            follow_symlinks: false,
            max_file_bytes: 1024 * 1024,
        })
        .unwrap();
        assert_eq!(scanned.len(), files);
        store.seed(scanned, true).await.unwrap();

        Self {
            _tmp: tmp,
            root,
            store,
            api: Arc::new(InMemoryFileSearch::new("fileSearchStores/lifecycle")),
        }
    }

    /// A fresh client, breaker and limiter, as after a process restart.
    fn client(&self) -> Arc<RemoteClient> {
        let breaker = Arc::new(CircuitBreaker::new(
            "test",
            BreakerConfig {
                cooldown: Duration::from_millis(10),
                max_cooldown: Duration::from_millis(40),
                ..BreakerConfig::default()
            },
        ));
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig {
                base_interval: Duration::ZERO,
                min_concurrency: 1,
                max_concurrency: 5,
                ramp_successes: 3,
            },
            breaker,
        ));
        Arc::new(RemoteClient::new(
            self.api.clone(),
            limiter,
            ClientConfig {
                max_retries: 3,
                retry_base: Duration::from_millis(1),
                retry_cap: Duration::from_millis(4),
                poll: PollConfig {
                    initial: Duration::from_millis(1),
                    max: Duration::from_millis(4),
                    operation_timeout: Duration::from_secs(2),
                    activation_timeout: Duration::from_secs(2),
                },
                confirmation: ConfirmationMode::Operation,
            },
        ))
    }

    async fn upload_all(&self, client: &Arc<RemoteClient>, limit: Option<usize>) -> RunSummary {
        let config = OrchestratorConfig {
            cohort_size: 20,
            max_upload_concurrency: 5,
            poll_concurrency: 10,
            max_attempts: 3,
            max_passes: 500,
            pass_delay: Duration::from_millis(1),
            limit,
            scan_root: Some(self.root.clone()),
            max_file_bytes: 1024 * 1024,
        };
        Orchestrator::new(
            self.store.clone(),
            client.clone(),
            config,
            Arc::new(NoProgress),
            Shutdown::new(),
        )
        .unwrap()
        .run()
        .await
        .unwrap()
    }

    async fn recover(&self, client: &Arc<RemoteClient>) -> upload_harness::recovery::RecoveryReport {
        RecoveryManager::new(
            self.store.clone(),
            client.clone(),
            RecoveryConfig {
                deadline: Duration::from_secs(10),
                expiry_margin: Duration::from_secs(3600),
                max_attempts: 3,
                concurrency: 4,
                object_ttl: Duration::from_secs(48 * 3600),
            },
        )
        .run()
        .await
        .unwrap()
    }

    async fn state_of(&self, file_id: &str) -> LifecycleState {
        self.store.get(file_id).await.unwrap().unwrap().lifecycle_state
    }

    /// `remote_document_id` is only ever held by `Indexed` or `Stale`
    /// records, and nothing is left in flight.
    async fn assert_settled(&self) {
        for state in LifecycleState::ALL {
            for record in self.store.list_in_state(state).await.unwrap() {
                if record.remote_document_id.is_some() {
                    assert!(
                        state.may_hold_document(),
                        "{} holds a document in {}",
                        record.file_id,
                        state
                    );
                }
                assert!(
                    !state.is_transient(),
                    "{} left in {}",
                    record.file_id,
                    state
                );
            }
        }
    }
}

fn file_id(i: usize) -> String {
    format!("doc-{:03}.md", i)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum CrashPoint {
    AfterUploadIntent,
    AfterUpload,
    AfterUploadResult,
    AfterImportIntent,
    AfterImport,
    AfterImportResult,
    AfterOperationDone,
}

/// Drive one file through the lifecycle by hand and stop at `point`, as
/// if the process died there.
async fn drive_until(env: &Env, client: &RemoteClient, file_id: &str, point: CrashPoint) {
    let store = &env.store;
    let rec = store
        .record_intent(file_id, LifecycleState::Untracked, LifecycleState::Uploading)
        .await
        .unwrap();
    if point == CrashPoint::AfterUploadIntent {
        return;
    }
    let content = fs::read(env.root.join(file_id)).unwrap();
    let raw = client
        .upload(
            rec.remote_object_id.as_deref().unwrap(),
            file_id,
            "text/markdown",
            content,
        )
        .await
        .unwrap();
    if point == CrashPoint::AfterUpload {
        return;
    }
    let active = client.wait_until_active(raw).await.unwrap();
    store
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
        .await
        .unwrap();
    if point == CrashPoint::AfterUploadResult {
        return;
    }
    store
        .record_intent(file_id, LifecycleState::Uploading, LifecycleState::Processing)
        .await
        .unwrap();
    if point == CrashPoint::AfterImportIntent {
        return;
    }
    let op = client
        .import_to_store(&active, &rec.metadata.with_source_key(file_id))
        .await
        .unwrap();
    if point == CrashPoint::AfterImport {
        return;
    }
    store
        .record_result(
            file_id,
            LifecycleState::Processing,
            RemoteIds {
                operation_id: Some(op.name().to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    if point == CrashPoint::AfterImportResult {
        return;
    }
    let status = client.poll_operation(&op, None).await.unwrap();
    assert!(matches!(status, OperationStatus::Done(_)));
}

#[tokio::test]
async fn uploads_fifty_files_through_rate_limiting() {
    let env = Env::new(50).await;
    env.api.set_faults(FaultPlan {
        rate_limit_every: Some(10),
        ..Default::default()
    });
    let client = env.client();

    let summary = env.upload_all(&client, None).await;

    assert_eq!(summary.counters.indexed, 50, "{:?}", summary);
    assert_eq!(summary.counters.failed, 0);
    assert_eq!(summary.counters.pending, 0);
    assert!(summary.failed.is_empty());
    assert!(summary.requeued + summary.deferred > 0);
    assert_eq!(env.api.document_count(), 50);

    let breaker = client.breaker().snapshot();
    assert!(breaker.times_opened >= 1, "breaker never opened");
    assert!(breaker.times_recovered >= 1, "breaker never closed again");
    env.assert_settled().await;
}

#[tokio::test]
async fn crash_mid_cohort_recovers_and_finishes() {
    let env = Env::new(50).await;
    let client = env.client();

    let summary = env.upload_all(&client, Some(30)).await;
    assert_eq!(summary.indexed, 30);

    // One more file gets as far as a running import, then the process dies.
    let stuck = env
        .store
        .list_in_state(LifecycleState::Untracked)
        .await
        .unwrap()
        .remove(0)
        .file_id;
    env.api.set_faults(FaultPlan {
        operation_polls: 3,
        ..Default::default()
    });
    drive_until(&env, &client, &stuck, CrashPoint::AfterImportResult).await;
    assert_eq!(env.state_of(&stuck).await, LifecycleState::Processing);
    drop(client);

    let restarted = env.client();
    let report = env.recover(&restarted).await;
    assert_eq!(report.total(), 1);
    assert_eq!(report.indexed, 1);
    assert_eq!(env.state_of(&stuck).await, LifecycleState::Indexed);

    let summary = env.upload_all(&restarted, None).await;
    assert_eq!(summary.indexed, 19);
    assert_eq!(summary.counters.indexed, 50);
    assert_eq!(env.api.document_count(), 50);
    env.assert_settled().await;
}

#[tokio::test]
async fn recovery_indexes_exactly_the_resolvable_operations() {
    let env = Env::new(10).await;
    env.api.set_faults(FaultPlan {
        operation_polls: 1_000,
        ..Default::default()
    });
    let client = env.client();
    for i in 0..10 {
        drive_until(&env, &client, &file_id(i), CrashPoint::AfterImportResult).await;
    }

    for i in 0..10 {
        let op = env
            .store
            .get(&file_id(i))
            .await
            .unwrap()
            .unwrap()
            .operation_id
            .unwrap();
        if i < 6 {
            env.api.complete_operation(&op);
        } else {
            env.api.forget_operation(&op);
        }
    }

    let report = env.recover(&env.client()).await;
    assert_eq!(report.indexed, 6);
    assert_eq!(report.reset, 4);
    assert!(report.is_clean());

    let counts = env.store.counters().await.unwrap();
    assert_eq!(counts.indexed, 6);
    assert_eq!(counts.pending, 4);
    for i in 6..10 {
        assert_eq!(env.state_of(&file_id(i)).await, LifecycleState::Untracked);
    }
    env.assert_settled().await;
}

#[tokio::test]
async fn every_crash_point_resolves_to_one_document() {
    let points = [
        CrashPoint::AfterUploadIntent,
        CrashPoint::AfterUpload,
        CrashPoint::AfterUploadResult,
        CrashPoint::AfterImportIntent,
        CrashPoint::AfterImport,
        CrashPoint::AfterImportResult,
        CrashPoint::AfterOperationDone,
    ];
    for point in points {
        let env = Env::new(1).await;
        let id = file_id(0);
        drive_until(&env, &env.client(), &id, point).await;
        assert!(env.state_of(&id).await.is_transient(), "{:?}", point);

        let restarted = env.client();
        let report = env.recover(&restarted).await;
        assert!(report.is_clean(), "{:?}: {:?}", point, report);
        env.upload_all(&restarted, None).await;

        assert_eq!(env.state_of(&id).await, LifecycleState::Indexed, "{:?}", point);
        assert_eq!(env.api.document_count(), 1, "{:?}", point);
        env.assert_settled().await;
    }
}

#[tokio::test]
async fn repeated_upload_creates_one_object_and_one_document() {
    let env = Env::new(1).await;
    let client = env.client();
    let id = file_id(0);

    // Re-sending the same generation collides with the first object.
    let rec = env
        .store
        .record_intent(&id, LifecycleState::Untracked, LifecycleState::Uploading)
        .await
        .unwrap();
    let name = rec.remote_object_id.clone().unwrap();
    for _ in 0..2 {
        client
            .upload(&name, &id, "text/markdown", b"same".to_vec())
            .await
            .unwrap();
    }
    assert_eq!(env.api.object_count(), 1);

    env.recover(&client).await;
    env.upload_all(&client, None).await;
    env.upload_all(&client, None).await;

    assert_eq!(env.state_of(&id).await, LifecycleState::Indexed);
    assert_eq!(env.api.document_count(), 1);
    assert_eq!(env.api.calls(ApiCall::Upload), 2);
    assert_eq!(env.api.calls(ApiCall::Import), 1);
}

#[tokio::test]
async fn changed_and_deleted_files_keep_documents_consistent() {
    let env = Env::new(3).await;
    let client = env.client();
    env.upload_all(&client, None).await;
    assert_eq!(env.api.document_count(), 3);

    fs::write(env.root.join(file_id(0)), "rewritten").unwrap();
    fs::remove_file(env.root.join(file_id(1))).unwrap();
    let scanned = scan_directory(&ScanConfig {
        root: env.root.clone(),
        include_globs: vec!["**/*.md".into()],
        exclude_globs: vec![],
        follow_symlinks: false,
        max_file_bytes: 1024 * 1024,
    })
    .unwrap();
    let report = env.store.seed(scanned, true).await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.missing, 1);
    env.assert_settled().await;

    let summary = env.upload_all(&client, None).await;
    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.orphaned, 1);
    assert_eq!(env.state_of(&file_id(1)).await, LifecycleState::Orphaned);
    // One replaced, one released.
    assert_eq!(env.api.document_count(), 2);
    env.assert_settled().await;
}

#[test]
fn breaker_trips_on_share_or_streak() {
    fn run(rate_limited_at: &[usize]) -> CircuitState {
        let breaker = CircuitBreaker::new("property", BreakerConfig::default());
        for i in 0..100 {
            breaker.record(if rate_limited_at.contains(&i) {
                CallOutcome::RateLimited
            } else {
                CallOutcome::Success
            });
        }
        breaker.state()
    }

    for offset in [0, 3, 9, 16] {
        let six: Vec<usize> = (0..6).map(|k| offset + k * 16).collect();
        assert_eq!(run(&six), CircuitState::Open, "six at {:?}", six);

        let four: Vec<usize> = (0..4).map(|k| offset + k * 20).collect();
        assert_eq!(run(&four), CircuitState::Closed, "four at {:?}", four);
    }
    assert_eq!(run(&[10, 40, 41, 42]), CircuitState::Open);
    assert_eq!(run(&[10, 40, 41, 60]), CircuitState::Closed);
}

#[tokio::test]
async fn invisible_documents_fail_in_visible_mode_and_pass_in_operation_mode() {
    async fn run(mode: ConfirmationMode) -> (Env, RunSummary) {
        let env = Env::new(2).await;
        env.api.set_faults(FaultPlan {
            hide_documents: true,
            ..Default::default()
        });
        let base = env.client();
        let mut config = base.config().clone();
        config.confirmation = mode;
        let client = Arc::new(RemoteClient::new(
            env.api.clone(),
            base.limiter().clone(),
            config,
        ));
        let summary = env.upload_all(&client, None).await;
        (env, summary)
    }

    let (env, summary) = run(ConfirmationMode::Operation).await;
    assert_eq!(summary.counters.indexed, 2);
    let rec = env.store.get(&file_id(0)).await.unwrap().unwrap();
    assert_eq!(rec.confirmation.as_deref(), Some("operation-v1"));

    let (_env, summary) = run(ConfirmationMode::Visible {
        timeout: Duration::from_millis(20),
    })
    .await;
    assert_eq!(summary.counters.failed, 2);
    assert!(summary.failed.iter().all(|(_, reason)| reason.contains("not visible")));
}
