use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // One row per local file
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            file_id TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '[]',
            lifecycle_state TEXT NOT NULL,
            remote_object_id TEXT,
            remote_object_expires_at INTEGER,
            remote_object_confirmed INTEGER NOT NULL DEFAULT 0,
            operation_id TEXT,
            remote_document_id TEXT,
            superseded_document_id TEXT,
            confirmation TEXT,
            generation INTEGER NOT NULL DEFAULT 0,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            error_detail TEXT,
            state_updated_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            CHECK (remote_document_id IS NULL OR lifecycle_state IN ('INDEXED', 'STALE'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only audit log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id TEXT NOT NULL,
            from_state TEXT,
            to_state TEXT NOT NULL,
            phase TEXT NOT NULL,
            detail TEXT,
            recorded_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Single-row single-writer lock
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS writer_lock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            owner TEXT NOT NULL,
            pid INTEGER NOT NULL,
            acquired_at INTEGER NOT NULL,
            heartbeat_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_state ON files(lifecycle_state, file_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_transitions_file ON transitions(file_id, id)")
        .execute(pool)
        .await?;

    Ok(())
}
