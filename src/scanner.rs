//! Local directory scanner.
//!
//! Walks the configured root, applies include/exclude globs, hashes each
//! file and attaches a small metadata payload. The output feeds
//! [`LifecycleStore::seed`](crate::state_store::LifecycleStore::seed); file
//! ids are paths relative to the root, so they survive moving the tree.

use std::path::Path;

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::ScanConfig;
use crate::metadata::Metadata;
use crate::models::ScannedFile;

pub fn scan_directory(scan: &ScanConfig) -> Result<Vec<ScannedFile>> {
    let root = &scan.root;
    if !root.exists() {
        bail!("Scan root does not exist: {}", root.display());
    }

    let include_set = build_globset(&scan.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(scan.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();

    let walker = WalkDir::new(root).follow_links(scan.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let size = entry.metadata()?.len();
        if size > scan.max_file_bytes {
            warn!(file = %rel_str, size, limit = scan.max_file_bytes, "skipping oversized file");
            continue;
        }

        files.push(scan_file(path, &rel_str)?);
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(files)
}

fn scan_file(path: &Path, relative_path: &str) -> Result<ScannedFile> {
    let fs_meta = std::fs::metadata(path)?;
    let modified_secs = fs_meta
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let bytes = std::fs::read(path)?;

    let mut metadata = Metadata::new();
    if let Some(name) = path.file_name() {
        metadata.insert_string("file_name", name.to_string_lossy())?;
    }
    if let Some(ext) = path.extension() {
        metadata.insert_string("extension", ext.to_string_lossy().to_lowercase())?;
    }
    metadata.insert_numeric("size_bytes", fs_meta.len() as f64)?;
    metadata.insert_numeric("modified_unix", modified_secs as f64)?;

    Ok(ScannedFile {
        path: relative_path.to_string(),
        content_hash: content_hash(&bytes),
        metadata,
    })
}

/// Hex SHA-256 of file contents.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// MIME type sent with an upload, by extension.
pub fn mime_for(file_id: &str) -> &'static str {
    let ext = Path::new(file_id)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" => "text/markdown",
        "txt" | "text" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => "application/octet-stream",
    }
}

/// Read a tracked file's bytes. `None` when it no longer exists.
pub async fn read_local(root: &Path, file_id: &str) -> std::io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(root.join(file_id)).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
