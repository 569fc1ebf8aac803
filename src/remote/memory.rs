//! In-memory [`FileSearchApi`] for tests and dry runs.
//!
//! Behaves like the real service closely enough to exercise the whole
//! pipeline: named raw objects that turn `ACTIVE` after a few polls,
//! imports that finish after a few operation polls, and a paginated
//! document listing. Faults are injected deterministically through a
//! [`FaultPlan`] and a queue of scripted errors.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    DocumentPage, FileSearchApi, ObjectState, RemoteDocument, RemoteObject, RemoteOperation,
    UploadRequest,
};
use crate::error::RemoteError;
use crate::metadata::{MetadataEntry, MetadataValue, SOURCE_KEY};

const PAGE_SIZE: usize = 20;

/// One kind of transport call, for fault scripting and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiCall {
    Upload,
    GetFile,
    Import,
    GetOperation,
    DeleteFile,
    GetDocument,
    DeleteDocument,
    ListDocuments,
}

/// Deterministic fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Every k-th call (counted across all kinds) answers 429.
    pub rate_limit_every: Option<u64>,
    /// `get_file` calls before a new object turns `ACTIVE`.
    pub activation_polls: u32,
    /// `get_operation` calls before an import finishes. Zero finishes the
    /// import synchronously.
    pub operation_polls: u32,
    /// Imports never finish.
    pub operations_stuck: bool,
    /// Finished documents stay invisible to `get_document` and listings.
    pub hide_documents: bool,
}

struct StoredObject {
    object: RemoteObject,
    display_name: String,
    polls_left: u32,
}

struct StoredOperation {
    object_name: String,
    display_name: String,
    source_key: Option<String>,
    polls_left: u32,
    done: bool,
    document_name: Option<String>,
}

#[derive(Default)]
struct State {
    plan: FaultPlan,
    total_calls: u64,
    calls: HashMap<ApiCall, u64>,
    scripted: VecDeque<(ApiCall, RemoteError)>,
    lost: VecDeque<ApiCall>,
    objects: HashMap<String, StoredObject>,
    operations: HashMap<String, StoredOperation>,
    documents: BTreeMap<String, RemoteDocument>,
    next_id: u64,
}

pub struct InMemoryFileSearch {
    store_name: String,
    object_ttl: Duration,
    state: Mutex<State>,
}

impl InMemoryFileSearch {
    pub fn new(store_name: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
            object_ttl: Duration::from_secs(48 * 3600),
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_faults(self, plan: FaultPlan) -> Self {
        self.lock().plan = plan;
        self
    }

    pub fn set_faults(&self, plan: FaultPlan) {
        self.lock().plan = plan;
    }

    /// Make the next call of `call` fail with `error`.
    pub fn fail_next(&self, call: ApiCall, error: RemoteError) {
        self.lock().scripted.push_back((call, error));
    }

    /// Let the next call of `call` take effect remotely, then answer with
    /// a timeout as if the response never arrived.
    pub fn lose_next_response(&self, call: ApiCall) {
        self.lock().lost.push_back(call);
    }

    /// Finish a pending import immediately.
    pub fn complete_operation(&self, name: &str) {
        let mut state = self.lock();
        let store = self.store_name.clone();
        finish_operation(&mut state, &store, name);
    }

    /// Drop all knowledge of an operation, as if it aged out remotely.
    pub fn forget_operation(&self, name: &str) {
        self.lock().operations.remove(name);
    }

    /// Expire a raw object.
    pub fn expire_object(&self, name: &str) {
        self.lock().objects.remove(name);
    }

    /// Add a document that was created outside this process.
    pub fn insert_document(&self, display_name: &str, source_key: Option<&str>) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let name = format!("{}/documents/ext-{}", self.store_name, state.next_id);
        state.documents.insert(
            name.clone(),
            RemoteDocument {
                name: name.clone(),
                display_name: Some(display_name.to_string()),
                source_key: source_key.map(str::to_string),
            },
        );
        name
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn document_count(&self) -> usize {
        self.lock().documents.len()
    }

    pub fn documents(&self) -> Vec<RemoteDocument> {
        self.lock().documents.values().cloned().collect()
    }

    pub fn has_document(&self, name: &str) -> bool {
        self.lock().documents.contains_key(name)
    }

    pub fn calls(&self, call: ApiCall) -> u64 {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, call: ApiCall) -> Result<MutexGuard<'_, State>, RemoteError> {
        let mut state = self.lock();
        state.total_calls += 1;
        *state.calls.entry(call).or_insert(0) += 1;

        if let Some(pos) = state.scripted.iter().position(|(c, _)| *c == call) {
            if let Some((_, err)) = state.scripted.remove(pos) {
                return Err(err);
            }
        }
        if let Some(k) = state.plan.rate_limit_every {
            if k > 0 && state.total_calls % k == 0 {
                return Err(RemoteError::RateLimited(format!(
                    "HTTP 429: injected on call {}",
                    state.total_calls
                )));
            }
        }
        Ok(state)
    }
}

fn take_lost(state: &mut State, call: ApiCall) -> Result<(), RemoteError> {
    match state.lost.iter().position(|c| *c == call) {
        Some(pos) => {
            state.lost.remove(pos);
            Err(RemoteError::Transient(format!(
                "{:?} timed out after the remote accepted it",
                call
            )))
        }
        None => Ok(()),
    }
}

impl Default for InMemoryFileSearch {
    fn default() -> Self {
        Self::new("fileSearchStores/test-store")
    }
}

fn finish_operation(state: &mut State, store_name: &str, op_name: &str) {
    state.next_id += 1;
    let id = state.next_id;
    let Some(op) = state.operations.get_mut(op_name) else {
        return;
    };
    if op.done {
        return;
    }
    let doc_name = format!("{}/documents/doc-{}", store_name, id);
    op.done = true;
    op.document_name = Some(doc_name.clone());
    let doc = RemoteDocument {
        name: doc_name.clone(),
        display_name: Some(op.display_name.clone()),
        source_key: op.source_key.clone(),
    };
    state.documents.insert(doc_name, doc);
}

fn operation_view(name: &str, op: &StoredOperation) -> RemoteOperation {
    RemoteOperation {
        name: name.to_string(),
        done: op.done,
        document_name: op.document_name.clone(),
        error: None,
    }
}

#[async_trait]
impl FileSearchApi for InMemoryFileSearch {
    async fn upload_file(&self, request: UploadRequest) -> Result<RemoteObject, RemoteError> {
        let mut state = self.enter(ApiCall::Upload)?;
        if let Some(existing) = state.objects.get(&request.object_name) {
            return Ok(existing.object.clone());
        }
        let polls = state.plan.activation_polls;
        let object = RemoteObject {
            name: request.object_name.clone(),
            state: if polls == 0 {
                ObjectState::Active
            } else {
                ObjectState::Processing
            },
            expires_at: Some(chrono::Utc::now().timestamp() + self.object_ttl.as_secs() as i64),
        };
        state.objects.insert(
            request.object_name,
            StoredObject {
                object: object.clone(),
                display_name: request.display_name,
                polls_left: polls,
            },
        );
        take_lost(&mut state, ApiCall::Upload)?;
        Ok(object)
    }

    async fn get_file(&self, name: &str) -> Result<Option<RemoteObject>, RemoteError> {
        let mut state = self.enter(ApiCall::GetFile)?;
        let Some(stored) = state.objects.get_mut(name) else {
            return Ok(None);
        };
        if stored.object.state == ObjectState::Processing {
            stored.polls_left = stored.polls_left.saturating_sub(1);
            if stored.polls_left == 0 {
                stored.object.state = ObjectState::Active;
            }
        }
        Ok(Some(stored.object.clone()))
    }

    async fn import_file(
        &self,
        object_name: &str,
        metadata: &[MetadataEntry],
    ) -> Result<RemoteOperation, RemoteError> {
        let mut state = self.enter(ApiCall::Import)?;
        let display_name = match state.objects.get(object_name) {
            Some(stored) if stored.object.state == ObjectState::Active => {
                stored.display_name.clone()
            }
            Some(_) => {
                return Err(RemoteError::Permanent(format!(
                    "HTTP 400: {} is not ACTIVE",
                    object_name
                )))
            }
            None => {
                return Err(RemoteError::Permanent(format!(
                    "HTTP 400: {} does not exist",
                    object_name
                )))
            }
        };
        let source_key = metadata.iter().find(|e| e.key == SOURCE_KEY).and_then(|e| {
            match &e.value {
                MetadataValue::String(s) => Some(s.clone()),
                MetadataValue::Numeric(_) => None,
            }
        });

        state.next_id += 1;
        let name = format!("{}/operations/op-{}", self.store_name, state.next_id);
        let polls = state.plan.operation_polls;
        let stuck = state.plan.operations_stuck;
        state.operations.insert(
            name.clone(),
            StoredOperation {
                object_name: object_name.to_string(),
                display_name,
                source_key,
                polls_left: polls,
                done: false,
                document_name: None,
            },
        );
        if polls == 0 && !stuck {
            finish_operation(&mut state, &self.store_name, &name);
        }
        take_lost(&mut state, ApiCall::Import)?;
        let op = &state.operations[&name];
        Ok(operation_view(&name, op))
    }

    async fn get_operation(&self, name: &str) -> Result<Option<RemoteOperation>, RemoteError> {
        let mut state = self.enter(ApiCall::GetOperation)?;
        let stuck = state.plan.operations_stuck;
        let ready = match state.operations.get_mut(name) {
            None => return Ok(None),
            Some(op) if op.done || stuck => false,
            Some(op) => {
                op.polls_left = op.polls_left.saturating_sub(1);
                op.polls_left == 0
            }
        };
        if ready {
            finish_operation(&mut state, &self.store_name, name);
        }
        Ok(state.operations.get(name).map(|op| operation_view(name, op)))
    }

    async fn delete_file(&self, name: &str) -> Result<(), RemoteError> {
        let mut state = self.enter(ApiCall::DeleteFile)?;
        state.objects.remove(name);
        state.operations.retain(|_, op| op.object_name != name || op.done);
        Ok(())
    }

    async fn get_document(&self, name: &str) -> Result<Option<RemoteDocument>, RemoteError> {
        let state = self.enter(ApiCall::GetDocument)?;
        if state.plan.hide_documents {
            return Ok(None);
        }
        Ok(state.documents.get(name).cloned())
    }

    async fn delete_document(&self, name: &str) -> Result<(), RemoteError> {
        let mut state = self.enter(ApiCall::DeleteDocument)?;
        state.documents.remove(name);
        Ok(())
    }

    async fn list_documents(&self, page_token: Option<&str>) -> Result<DocumentPage, RemoteError> {
        let state = self.enter(ApiCall::ListDocuments)?;
        if state.plan.hide_documents {
            return Ok(DocumentPage::default());
        }
        let start: usize = match page_token {
            Some(token) => token
                .parse()
                .map_err(|_| RemoteError::Permanent(format!("HTTP 400: bad page token {}", token)))?,
            None => 0,
        };
        let documents: Vec<RemoteDocument> = state
            .documents
            .values()
            .skip(start)
            .take(PAGE_SIZE)
            .cloned()
            .collect();
        let end = start + documents.len();
        let next_page_token = (end < state.documents.len()).then(|| end.to_string());
        Ok(DocumentPage {
            documents,
            next_page_token,
        })
    }
}
