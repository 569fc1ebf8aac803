//! Cross-check of local `Indexed` records against a live remote listing.
//!
//! Divergence is reported, not repaired, with one exception: records
//! whose document is gone remotely can be force-reset to `Untracked` so
//! the next run uploads them again. Documents nobody owns are listed for
//! an operator to inspect; they are never deleted here.
//!
//! The remote listing is eventually consistent. A document indexed
//! moments ago may be missing from it, so run this against a quiet store.

use std::collections::HashSet;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::pipeline;
use crate::remote::client::RemoteClient;
use crate::remote::RemoteDocument;
use crate::shutdown::Shutdown;
use crate::state_store::LifecycleStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Indexed records compared.
    pub checked: u64,
    /// Documents present in the remote listing.
    pub remote_documents: u64,
    /// `(file_id, document)` for `Indexed` records whose document is gone.
    pub missing_remote: Vec<(String, String)>,
    /// Remote documents that no local record claims.
    pub untracked_remote: Vec<RemoteDocument>,
    /// Records force-reset to `Untracked`.
    pub reset: u64,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_remote.is_empty() && self.untracked_remote.is_empty()
    }
}

pub async fn reconcile(
    store: &LifecycleStore,
    client: &RemoteClient,
    reset_missing: bool,
) -> Result<ReconcileReport> {
    let indexed = store.indexed_documents().await?;
    let remote = client.list_documents().await?;
    let remote_names: HashSet<&str> = remote.iter().map(|d| d.name.as_str()).collect();
    let known = store.known_document_ids().await?;

    let mut report = ReconcileReport {
        checked: indexed.len() as u64,
        remote_documents: remote.len() as u64,
        ..Default::default()
    };
    report.missing_remote = indexed
        .into_iter()
        .filter(|(_, doc)| !remote_names.contains(doc.as_str()))
        .collect();
    report.untracked_remote = remote
        .iter()
        .filter(|doc| !known.contains(&doc.name))
        .cloned()
        .collect();

    for (file_id, doc) in &report.missing_remote {
        warn!(file_id = %file_id, document = %doc, "indexed document missing remotely");
    }
    if reset_missing {
        for (file_id, _) in &report.missing_remote {
            store.force_reset(file_id).await?;
            report.reset += 1;
        }
    }
    info!(
        checked = report.checked,
        missing = report.missing_remote.len(),
        untracked = report.untracked_remote.len(),
        reset = report.reset,
        "reconcile finished"
    );
    Ok(report)
}

/// `uph reconcile`: print divergence between the store and the remote.
pub async fn run_reconcile(config: &Config, reset_missing: bool, json: bool) -> Result<()> {
    let client = pipeline::http_client(config)?;
    let store = pipeline::open_store(config).await?;
    // Only resets write lifecycle state.
    let lock = if reset_missing {
        Some(pipeline::acquire_lock(config, &store, &Shutdown::new()).await?)
    } else {
        None
    };
    let outcome = reconcile(&store, &client, reset_missing).await;
    if let Some(lock) = lock {
        lock.release().await?;
    }
    store.close().await;
    let report = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("reconcile {}", config.remote.store_name);
    println!("  indexed records:   {}", report.checked);
    println!("  remote documents:  {}", report.remote_documents);
    println!("  missing remotely:  {}", report.missing_remote.len());
    for (file_id, doc) in &report.missing_remote {
        println!("    {}  ({})", file_id, doc);
    }
    println!("  untracked remote:  {}", report.untracked_remote.len());
    for doc in &report.untracked_remote {
        println!(
            "    {}  {}",
            doc.name,
            doc.display_name.as_deref().unwrap_or("-")
        );
    }
    if reset_missing {
        println!("  reset:             {}", report.reset);
    } else if !report.missing_remote.is_empty() {
        println!();
        println!("Re-run with --reset-missing to re-upload the missing files.");
    }
    Ok(())
}
