//! Durable single-writer lock.
//!
//! Exactly one orchestrating process may write lifecycle state at a time.
//! The lock is a single row in `writer_lock`; a holder keeps it alive with
//! a heartbeat, and a row whose heartbeat is older than `stale_after` is
//! considered abandoned (its process crashed) and may be taken over.
//! A holder whose row was taken over drains instead of writing on.

use std::time::Duration;

use anyhow::Result;
use sqlx::Row;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::shutdown::Shutdown;
use crate::state_store::{now_ms, LifecycleStore};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another writer holds the lock (owner {owner}, pid {pid}, last heartbeat {age_secs}s ago)")]
    Held { owner: String, pid: i64, age_secs: i64 },
}

/// A held writer lock. Call [`WriterLock::release`] on the way out.
pub struct WriterLock {
    store: LifecycleStore,
    owner: String,
    heartbeat: Option<JoinHandle<()>>,
}

impl WriterLock {
    /// Take the lock, or fail with [`LockError::Held`].
    pub async fn acquire(store: &LifecycleStore, stale_after: Duration) -> Result<Self> {
        let owner = Uuid::new_v4().to_string();
        let pid = std::process::id() as i64;
        let now = now_ms();
        let stale_ms = stale_after.as_millis() as i64;

        let _guard = store.write_guard().lock().await;
        let mut tx = store.pool().begin().await?;
        let existing = sqlx::query("SELECT owner, pid, heartbeat_at FROM writer_lock WHERE id = 1")
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = existing {
            let holder: String = row.get("owner");
            let holder_pid: i64 = row.get("pid");
            let heartbeat_at: i64 = row.get("heartbeat_at");
            let age = now - heartbeat_at;
            if age < stale_ms {
                return Err(LockError::Held {
                    owner: holder,
                    pid: holder_pid,
                    age_secs: age / 1000,
                }
                .into());
            }
            warn!(owner = %holder, pid = holder_pid, age_ms = age, "taking over stale writer lock");
        }

        sqlx::query(
            r#"
            INSERT INTO writer_lock (id, owner, pid, acquired_at, heartbeat_at)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                owner = excluded.owner,
                pid = excluded.pid,
                acquired_at = excluded.acquired_at,
                heartbeat_at = excluded.heartbeat_at
            "#,
        )
        .bind(&owner)
        .bind(pid)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(owner = %owner, pid, "writer lock acquired");

        Ok(Self {
            store: store.clone(),
            owner,
            heartbeat: None,
        })
    }

    /// Refresh the heartbeat every `interval` until released. Losing the
    /// lock requests a drain on `shutdown`.
    pub fn spawn_heartbeat(&mut self, interval: Duration, shutdown: Shutdown) {
        let store = self.store.clone();
        let owner = self.owner.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match beat(&store, &owner).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(owner = %owner, "writer lock lost; draining");
                        shutdown.request_drain();
                        break;
                    }
                    Err(e) => warn!(error = %e, "writer lock heartbeat failed"),
                }
            }
        }));
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Delete the lock row if this holder still owns it.
    pub async fn release(mut self) -> Result<()> {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        let _guard = self.store.write_guard().lock().await;
        sqlx::query("DELETE FROM writer_lock WHERE id = 1 AND owner = ?")
            .bind(&self.owner)
            .execute(self.store.pool())
            .await?;
        info!(owner = %self.owner, "writer lock released");
        Ok(())
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

async fn beat(store: &LifecycleStore, owner: &str) -> Result<bool> {
    let _guard = store.write_guard().lock().await;
    let result = sqlx::query("UPDATE writer_lock SET heartbeat_at = ? WHERE id = 1 AND owner = ?")
        .bind(now_ms())
        .bind(owner)
        .execute(store.pool())
        .await?;
    Ok(result.rows_affected() == 1)
}
