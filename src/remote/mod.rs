//! Remote file-search API.
//!
//! Two layers:
//!
//! - [`FileSearchApi`] is the raw transport: one method per REST call,
//!   errors already classified into [`RemoteError`]. Implemented over HTTP
//!   by [`http::HttpFileSearch`] and in memory by
//!   [`memory::InMemoryFileSearch`].
//! - [`client::RemoteClient`] wraps a transport with retries, pacing,
//!   polling and circuit-breaker bookkeeping, and hands out the typed
//!   handles below.
//!
//! ```text
//!   upload ──▶ RawObjectHandle ──wait_until_active──▶ ActiveObject
//!                                                         │
//!                                                   import_to_store
//!                                                         ▼
//!   DocumentId ◀──────── poll_operation (Done) ◀── OperationHandle
//! ```
//!
//! The handles are distinct types so that an ephemeral raw object can never
//! be mistaken for an indexed, searchable document.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::RemoteError;
use crate::metadata::MetadataEntry;

pub mod client;
pub mod http;
pub mod memory;

// ═══════════════════════════════════════════════════════════════════════
// Wire-level records
// ═══════════════════════════════════════════════════════════════════════

/// Processing state of a raw uploaded object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObjectState {
    Processing,
    Active,
    Failed,
}

/// A raw object as reported by the API.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub name: String,
    pub state: ObjectState,
    /// Unix seconds.
    pub expires_at: Option<i64>,
}

/// A long-running import operation as reported by the API.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOperation {
    pub name: String,
    pub done: bool,
    pub document_name: Option<String>,
    pub error: Option<String>,
}

/// An indexed document in the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteDocument {
    pub name: String,
    pub display_name: Option<String>,
    /// Value of the reserved source-key metadata entry, if present.
    pub source_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentPage {
    pub documents: Vec<RemoteDocument>,
    pub next_page_token: Option<String>,
}

/// Body of a raw upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Caller-chosen object name (`files/<id>`), so a retried upload of the
    /// same generation collides instead of duplicating.
    pub object_name: String,
    pub display_name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

// ═══════════════════════════════════════════════════════════════════════
// Transport trait
// ═══════════════════════════════════════════════════════════════════════

/// Raw transport for the file-search REST surface. Each method is exactly
/// one request; no retries happen at this layer.
#[async_trait]
pub trait FileSearchApi: Send + Sync {
    /// Create a raw object. An object that already exists under the same
    /// name is returned as-is.
    async fn upload_file(&self, request: UploadRequest) -> Result<RemoteObject, RemoteError>;

    /// `None` when the object does not exist (or has expired).
    async fn get_file(&self, name: &str) -> Result<Option<RemoteObject>, RemoteError>;

    /// Start importing a raw object into the configured store.
    async fn import_file(
        &self,
        object_name: &str,
        metadata: &[MetadataEntry],
    ) -> Result<RemoteOperation, RemoteError>;

    /// `None` when the operation is unknown.
    async fn get_operation(&self, name: &str) -> Result<Option<RemoteOperation>, RemoteError>;

    /// Deleting something that is already gone succeeds.
    async fn delete_file(&self, name: &str) -> Result<(), RemoteError>;

    async fn get_document(&self, name: &str) -> Result<Option<RemoteDocument>, RemoteError>;

    /// Deleting something that is already gone succeeds.
    async fn delete_document(&self, name: &str) -> Result<(), RemoteError>;

    async fn list_documents(&self, page_token: Option<&str>) -> Result<DocumentPage, RemoteError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Typed handles
// ═══════════════════════════════════════════════════════════════════════

/// An uploaded raw object that may not be importable yet.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObjectHandle {
    name: String,
    state: ObjectState,
    expires_at: Option<i64>,
}

impl RawObjectHandle {
    pub(crate) fn from_remote(object: RemoteObject) -> Self {
        Self {
            name: object.name,
            state: object.state,
            expires_at: object.expires_at,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.expires_at
    }

    pub(crate) fn activate(self) -> ActiveObject {
        ActiveObject {
            name: self.name,
            expires_at: self.expires_at,
        }
    }
}

/// A raw object confirmed `ACTIVE`; the only thing that can be imported.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveObject {
    name: String,
    expires_at: Option<i64>,
}

impl ActiveObject {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.expires_at
    }
}

/// A pending import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    name: String,
}

impl OperationHandle {
    /// Rebuild a handle from a persisted operation id.
    pub fn from_persisted(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A permanent, searchable document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId(String);

impl DocumentId {
    /// Rebuild an id from persisted state or a remote listing.
    pub fn from_persisted(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    Done(DocumentId),
    Pending,
    Failed(String),
}
