//! Command-level wiring.
//!
//! Builds the store, remote client, breaker and limiter from [`Config`]
//! and runs the scan → recover → upload flow behind the writer lock.
//! Each `run_*` function backs one `uph` subcommand.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::info;

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::orchestrator::{Orchestrator, RunSummary};
use crate::progress::ProgressMode;
use crate::recovery::{RecoveryManager, RecoveryOutcome, RecoveryReport};
use crate::remote::client::RemoteClient;
use crate::remote::http::HttpFileSearch;
use crate::remote::FileSearchApi;
use crate::scanner;
use crate::shutdown::Shutdown;
use crate::state_store::LifecycleStore;
use crate::writer_lock::WriterLock;

/// Options for `uph run`.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub recover: bool,
    pub limit: Option<usize>,
    pub progress: ProgressMode,
    pub json: bool,
}

pub async fn open_store(config: &Config) -> Result<LifecycleStore> {
    LifecycleStore::open(&config.db.path).await
}

/// Remote client over any transport, with a fresh breaker and limiter.
pub fn build_client(config: &Config, api: Arc<dyn FileSearchApi>) -> Result<Arc<RemoteClient>> {
    let breaker = Arc::new(CircuitBreaker::new("file-search", config.breaker_config()));
    let limiter = Arc::new(RateLimiter::new(config.limiter_config()?, breaker));
    Ok(Arc::new(RemoteClient::new(
        api,
        limiter,
        config.client_config()?,
    )))
}

/// Remote client over HTTP. Fails when the API key is not set.
pub fn http_client(config: &Config) -> Result<Arc<RemoteClient>> {
    let api = Arc::new(HttpFileSearch::from_config(&config.remote)?);
    build_client(config, api)
}

/// Take the writer lock and keep it alive. Losing it drains `shutdown`.
pub(crate) async fn acquire_lock(
    config: &Config,
    store: &LifecycleStore,
    shutdown: &Shutdown,
) -> Result<WriterLock> {
    let stale_after = Duration::from_secs(config.lock.stale_after_secs);
    let mut lock = WriterLock::acquire(store, stale_after).await?;
    lock.spawn_heartbeat(
        (stale_after / 3).max(Duration::from_secs(1)),
        shutdown.clone(),
    );
    Ok(lock)
}

// ═══════════════════════════════════════════════════════════════════════
// uph scan
// ═══════════════════════════════════════════════════════════════════════

pub async fn run_scan(config: &Config) -> Result<()> {
    let Some(scan) = config.scan.as_ref() else {
        bail!("No [scan] section configured");
    };
    let files = scanner::scan_directory(scan)?;
    let found = files.len();

    let store = open_store(config).await?;
    let lock = acquire_lock(config, &store, &Shutdown::new()).await?;
    let seeded = store.seed(files, true).await;
    lock.release().await?;
    store.close().await;
    let report = seeded?;

    println!("scan {}", scan.root.display());
    println!("  files found:     {}", found);
    println!("  new:             {}", report.discovered);
    println!("  changed:         {}", report.changed);
    println!("  reappeared:      {}", report.revived);
    println!("  missing:         {}", report.missing);
    println!("  unchanged:       {}", report.unchanged + report.refreshed);
    if report.in_flight > 0 {
        println!("  in flight:       {} (left for recovery)", report.in_flight);
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// uph run
// ═══════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct RunOutput<'a> {
    recovery: Option<&'a RecoveryReport>,
    summary: &'a RunSummary,
    breaker: &'a BreakerSnapshot,
}

pub async fn run_upload(config: &Config, options: UploadOptions) -> Result<()> {
    let client = http_client(config)?;
    let store = open_store(config).await?;
    let shutdown = Shutdown::new();
    let lock = acquire_lock(config, &store, &shutdown).await?;
    let signals = shutdown.install_signal_handler();

    let outcome = async {
        let recovery = if options.recover {
            let manager =
                RecoveryManager::new(store.clone(), client.clone(), config.recovery_config());
            Some(manager.run().await?)
        } else {
            None
        };
        let mut orchestrator_config = config.orchestrator_config();
        orchestrator_config.limit = options.limit;
        let orchestrator = Orchestrator::new(
            store.clone(),
            client.clone(),
            orchestrator_config,
            options.progress.reporter(),
            shutdown.clone(),
        )?;
        let summary = orchestrator.run().await?;
        Ok::<_, anyhow::Error>((recovery, summary))
    }
    .await;

    signals.abort();
    lock.release().await?;
    store.close().await;
    let (recovery, summary) = outcome?;
    let breaker = client.breaker().snapshot();

    if options.json {
        let output = RunOutput {
            recovery: recovery.as_ref(),
            summary: &summary,
            breaker: &breaker,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if let Some(report) = &recovery {
        if report.total() > 0 {
            print_recovery(report);
            println!();
        }
    }
    print_summary(&summary, &breaker);
    Ok(())
}

fn print_summary(summary: &RunSummary, breaker: &BreakerSnapshot) {
    let c = &summary.counters;
    println!(
        "run {}",
        if summary.drained { "interrupted" } else { "complete" }
    );
    println!("  passes:          {}", summary.passes);
    println!("  indexed:         {}", summary.indexed);
    println!("  requeued:        {}", summary.requeued);
    println!("  orphaned:        {}", summary.orphaned);
    println!("  deferred:        {}", summary.deferred);
    if summary.unsettled > 0 {
        println!("  unsettled:       {} (left for recovery)", summary.unsettled);
    }
    println!("  newly failed:    {}", summary.newly_failed);
    println!();
    println!(
        "  store:           pending {} · in flight {} · indexed {} · failed {} · orphaned {}",
        c.pending, c.uploading, c.indexed, c.failed, c.orphaned
    );
    println!(
        "  breaker:         {} (opened {}x, recovered {}x)",
        breaker.state, breaker.times_opened, breaker.times_recovered
    );
    if c.pending > 0 {
        println!();
        println!("{} files still pending; run again to continue.", c.pending);
    }
    if !summary.failed.is_empty() {
        println!();
        println!("Failed files:");
        for (file_id, reason) in &summary.failed {
            println!("  {}  {}", file_id, reason);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// uph recover
// ═══════════════════════════════════════════════════════════════════════

pub async fn run_recover(config: &Config, json: bool) -> Result<()> {
    let client = http_client(config)?;
    let store = open_store(config).await?;
    let lock = acquire_lock(config, &store, &Shutdown::new()).await?;
    let outcome = RecoveryManager::new(store.clone(), client, config.recovery_config())
        .run()
        .await;
    lock.release().await?;
    store.close().await;
    let report = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_recovery(&report);
    }
    Ok(())
}

fn print_recovery(report: &RecoveryReport) {
    println!("recovery");
    println!("  examined:        {}", report.total());
    println!("  indexed:         {}", report.indexed);
    println!("  reset:           {}", report.reset);
    println!("  failed:          {}", report.failed);
    println!("  unresolved:      {}", report.unresolved);
    let open: Vec<_> = report
        .items
        .iter()
        .filter(|item| item.outcome != RecoveryOutcome::Indexed)
        .collect();
    if !open.is_empty() {
        println!();
        for item in open {
            println!(
                "  {:<40} {:<11} {:?}  {}",
                item.file_id,
                item.from.as_str(),
                item.outcome,
                item.detail.as_deref().unwrap_or("")
            );
        }
    }
    if report.unresolved > 0 {
        println!();
        println!("Unresolved records stay in flight; run `uph recover` again once the remote is reachable.");
    }
}

// ═══════════════════════════════════════════════════════════════════════
// uph reset
// ═══════════════════════════════════════════════════════════════════════

pub async fn run_reset(config: &Config, file_id: Option<&str>, failed: bool) -> Result<()> {
    if file_id.is_none() && !failed {
        bail!("Specify a file id or --failed");
    }
    let store = open_store(config).await?;
    let lock = acquire_lock(config, &store, &Shutdown::new()).await?;
    let outcome = async {
        let mut reset = 0u64;
        if let Some(id) = file_id {
            store.force_reset(id).await?;
            reset += 1;
        }
        if failed {
            reset += store.reset_failed().await?;
        }
        Ok::<_, anyhow::Error>(reset)
    }
    .await;
    lock.release().await?;
    store.close().await;
    let reset = outcome?;
    info!(reset, "records reset");
    println!("Reset {} record(s) to UNTRACKED.", reset);
    Ok(())
}
