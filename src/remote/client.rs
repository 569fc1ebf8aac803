//! Resilient client over a [`FileSearchApi`] transport.
//!
//! Every call goes through one wrapper that:
//!
//! - waits for a pacing slot from the [`RateLimiter`] (quota-consuming
//!   calls only: uploads, imports, deletes, listings),
//! - records the outcome in the circuit breaker and the concurrency ramp,
//! - retries transient failures with exponential backoff plus jitter.
//!
//! Rate-limited responses are never retried here. They go back to the
//! caller, which requeues the file and lets the breaker decide when new
//! work may start. Imports are never retried either: a timed-out import
//! may still have created a document, so the caller settles it by
//! listing instead of sending it again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    ActiveObject, DocumentId, FileSearchApi, ObjectState, OperationHandle, OperationStatus,
    RawObjectHandle, RemoteDocument, UploadRequest,
};
use crate::breaker::{CallOutcome, CircuitBreaker, TrialTicket};
use crate::error::RemoteError;
use crate::limiter::RateLimiter;
use crate::metadata::MetadataEntry;

/// Poll cadence for objects, operations and document visibility.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub initial: Duration,
    pub max: Duration,
    pub operation_timeout: Duration,
    pub activation_timeout: Duration,
}

/// What counts as "indexed" once an import operation reports success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationMode {
    /// Operation completion is sufficient.
    Operation,
    /// The document must also be readable by name within `timeout`.
    Visible { timeout: Duration },
}

impl ConfirmationMode {
    /// Tag persisted with every `Indexed` record.
    pub fn tag(&self) -> &'static str {
        match self {
            ConfirmationMode::Operation => "operation-v1",
            ConfirmationMode::Visible { .. } => "visible-v1",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub poll: PollConfig,
    pub confirmation: ConfirmationMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(32),
            poll: PollConfig {
                initial: Duration::from_secs(5),
                max: Duration::from_secs(60),
                operation_timeout: Duration::from_secs(3600),
                activation_timeout: Duration::from_secs(600),
            },
            confirmation: ConfirmationMode::Operation,
        }
    }
}

pub struct RemoteClient {
    api: Arc<dyn FileSearchApi>,
    limiter: Arc<RateLimiter>,
    config: ClientConfig,
}

impl RemoteClient {
    pub fn new(api: Arc<dyn FileSearchApi>, limiter: Arc<RateLimiter>, config: ClientConfig) -> Self {
        Self {
            api,
            limiter,
            config,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.limiter.breaker()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn confirmation_tag(&self) -> &'static str {
        self.config.confirmation.tag()
    }

    fn observe<T>(&self, result: &Result<T, RemoteError>, trial: Option<TrialTicket>) {
        let outcome = match result {
            Ok(_) => CallOutcome::Success,
            Err(RemoteError::RateLimited(_)) => CallOutcome::RateLimited,
            Err(_) => CallOutcome::OtherError,
        };
        match trial {
            Some(ticket) => self.breaker().record_trial(ticket, outcome),
            None => self.breaker().record(outcome),
        }
        self.limiter.observe(outcome);
    }

    async fn call<T, F, Fut>(&self, what: &'static str, paced: bool, f: F) -> Result<T, RemoteError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.call_with(what, paced, self.config.max_retries, None, f)
            .await
    }

    /// Only the first attempt reports against `trial`; retries are
    /// ordinary outcomes.
    async fn call_with<T, F, Fut>(
        &self,
        what: &'static str,
        paced: bool,
        max_retries: u32,
        mut trial: Option<TrialTicket>,
        f: F,
    ) -> Result<T, RemoteError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0u32;
        loop {
            if paced {
                self.limiter.pace().await;
            }
            let result = f().await;
            self.observe(&result, trial.take());
            match result {
                Err(RemoteError::Transient(msg)) if attempt < max_retries => {
                    let delay = backoff(self.config.retry_base, self.config.retry_cap, attempt);
                    attempt += 1;
                    warn!(
                        op = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "transient remote error; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    // ─── Raw objects ──────────────────────────────────────────────────

    pub async fn upload(
        &self,
        object_name: &str,
        display_name: &str,
        mime_type: &str,
        content: Vec<u8>,
    ) -> Result<RawObjectHandle, RemoteError> {
        self.upload_as(object_name, display_name, mime_type, content, None)
            .await
    }

    /// Upload whose first attempt is the half-open trial when `trial` is set.
    pub async fn upload_as(
        &self,
        object_name: &str,
        display_name: &str,
        mime_type: &str,
        content: Vec<u8>,
        trial: Option<TrialTicket>,
    ) -> Result<RawObjectHandle, RemoteError> {
        let request = UploadRequest {
            object_name: object_name.to_string(),
            display_name: display_name.to_string(),
            mime_type: mime_type.to_string(),
            content,
        };
        let object = self
            .call_with("upload", true, self.config.max_retries, trial, || {
                self.api.upload_file(request.clone())
            })
            .await?;
        debug!(object = %object.name, state = ?object.state, "raw object uploaded");
        Ok(RawObjectHandle::from_remote(object))
    }

    /// Look up a raw object by name. `None` when it does not exist.
    pub async fn find_object(&self, name: &str) -> Result<Option<RawObjectHandle>, RemoteError> {
        let object = self.call("get_file", false, || self.api.get_file(name)).await?;
        Ok(object.map(RawObjectHandle::from_remote))
    }

    /// Poll until the object is `ACTIVE`. Only an [`ActiveObject`] can be
    /// imported.
    pub async fn wait_until_active(
        &self,
        handle: RawObjectHandle,
    ) -> Result<ActiveObject, RemoteError> {
        let name = handle.name().to_string();
        match handle.state() {
            ObjectState::Active => return Ok(handle.activate()),
            ObjectState::Failed => {
                return Err(RemoteError::Permanent(format!("{} failed processing", name)))
            }
            ObjectState::Processing => {}
        }

        let deadline = Instant::now() + self.config.poll.activation_timeout;
        let mut delay = self.config.poll.initial;
        loop {
            if !sleep_within(delay, deadline).await {
                return Err(RemoteError::Transient(format!(
                    "{} not active within {:?}",
                    name, self.config.poll.activation_timeout
                )));
            }
            match self.find_object(&name).await {
                Ok(Some(h)) if h.state() == ObjectState::Active => return Ok(h.activate()),
                Ok(Some(h)) if h.state() == ObjectState::Failed => {
                    return Err(RemoteError::Permanent(format!("{} failed processing", name)))
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(RemoteError::Transient(format!(
                        "{} disappeared before activation",
                        name
                    )))
                }
                Err(e) if e.is_retryable() => debug!(object = %name, error = %e, "activation poll failed"),
                Err(e) => return Err(e),
            }
            delay = (delay * 2).min(self.config.poll.max);
        }
    }

    pub async fn delete_object(&self, name: &str) -> Result<(), RemoteError> {
        self.call("delete_file", true, || self.api.delete_file(name))
            .await
    }

    // ─── Import ───────────────────────────────────────────────────────

    /// Start an import. Sent exactly once: a `Transient` error means the
    /// outcome is unknown, not that nothing happened. An operation that
    /// already carries an error still yields a handle; polling reports it.
    pub async fn import_to_store(
        &self,
        object: &ActiveObject,
        metadata: &[MetadataEntry],
    ) -> Result<OperationHandle, RemoteError> {
        let op = self
            .call_with("import_file", true, 0, None, || {
                self.api.import_file(object.name(), metadata)
            })
            .await?;
        match &op.error {
            Some(err) => debug!(operation = %op.name, error = %err, "import rejected"),
            None => debug!(operation = %op.name, object = object.name(), "import started"),
        }
        Ok(OperationHandle { name: op.name })
    }

    /// One status check. `None` when the operation is unknown remotely.
    pub async fn check_operation(
        &self,
        op: &OperationHandle,
    ) -> Result<Option<OperationStatus>, RemoteError> {
        let Some(remote) = self
            .call("get_operation", false, || self.api.get_operation(op.name()))
            .await?
        else {
            return Ok(None);
        };
        if !remote.done {
            return Ok(Some(OperationStatus::Pending));
        }
        if let Some(err) = remote.error {
            return Ok(Some(OperationStatus::Failed(err)));
        }
        match remote.document_name {
            Some(doc) => Ok(Some(OperationStatus::Done(DocumentId::from_persisted(doc)))),
            None => Err(RemoteError::Inconsistent(format!(
                "{} finished without a document",
                op.name()
            ))),
        }
    }

    /// Poll with exponential backoff until the operation finishes, or
    /// until `deadline` (default: now + operation timeout) passes, in
    /// which case `Pending` is returned.
    pub async fn poll_operation(
        &self,
        op: &OperationHandle,
        deadline: Option<Instant>,
    ) -> Result<OperationStatus, RemoteError> {
        let ceiling = Instant::now() + self.config.poll.operation_timeout;
        let deadline = deadline.map_or(ceiling, |d| d.min(ceiling));
        let mut delay = self.config.poll.initial;
        loop {
            match self.check_operation(op).await {
                Ok(Some(OperationStatus::Pending)) => {}
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    return Ok(OperationStatus::Failed(format!(
                        "{} is unknown to the remote",
                        op.name()
                    )))
                }
                Err(e) if e.is_retryable() => {
                    debug!(operation = op.name(), error = %e, "operation poll failed")
                }
                Err(e) => return Err(e),
            }
            if !sleep_within(delay, deadline).await {
                return Ok(OperationStatus::Pending);
            }
            delay = (delay * 2).min(self.config.poll.max);
        }
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Apply the configured confirmation assumption to a finished import.
    pub async fn confirm(&self, doc: DocumentId) -> Result<DocumentId, RemoteError> {
        let timeout = match self.config.confirmation {
            ConfirmationMode::Operation => return Ok(doc),
            ConfirmationMode::Visible { timeout } => timeout,
        };
        let deadline = Instant::now() + timeout;
        let mut delay = self.config.poll.initial;
        loop {
            match self
                .call("get_document", false, || self.api.get_document(doc.as_str()))
                .await
            {
                Ok(Some(_)) => return Ok(doc),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    debug!(document = %doc, error = %e, "visibility check failed")
                }
                Err(e) => return Err(e),
            }
            if !sleep_within(delay, deadline).await {
                return Err(RemoteError::Inconsistent(format!(
                    "{} reported done but not visible within {:?}",
                    doc, timeout
                )));
            }
            delay = (delay * 2).min(self.config.poll.max);
        }
    }

    pub async fn delete_document(&self, doc: &DocumentId) -> Result<(), RemoteError> {
        self.call("delete_document", true, || {
            self.api.delete_document(doc.as_str())
        })
        .await
    }

    /// Every document in the store, following pagination.
    pub async fn list_documents(&self) -> Result<Vec<RemoteDocument>, RemoteError> {
        let mut documents = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .call("list_documents", true, || {
                    self.api.list_documents(token.as_deref())
                })
                .await?;
            documents.extend(page.documents);
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(documents)
    }
}

/// `min(cap, base * 2^attempt)`, with the upper half jittered.
fn backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16)).min(cap);
    let ms = exp.as_millis() as u64;
    let half = ms / 2;
    let jitter = if half > 0 {
        rand::thread_rng().gen_range(0..=half)
    } else {
        0
    };
    Duration::from_millis(ms - half + jitter)
}

/// Sleep for `delay`, cut short at `deadline`. Returns `false` when the
/// deadline has already passed.
async fn sleep_within(delay: Duration, deadline: Instant) -> bool {
    let now = Instant::now();
    if now >= deadline {
        return false;
    }
    tokio::time::sleep_until((now + delay).min(deadline)).await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::limiter::LimiterConfig;
    use crate::remote::memory::{ApiCall, FaultPlan, InMemoryFileSearch};

    fn fast_config(confirmation: ConfirmationMode) -> ClientConfig {
        ClientConfig {
            max_retries: 2,
            retry_base: Duration::from_millis(1),
            retry_cap: Duration::from_millis(4),
            poll: PollConfig {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                operation_timeout: Duration::from_millis(200),
                activation_timeout: Duration::from_millis(200),
            },
            confirmation,
        }
    }

    fn client(api: Arc<InMemoryFileSearch>, confirmation: ConfirmationMode) -> RemoteClient {
        let breaker = Arc::new(CircuitBreaker::new("test", BreakerConfig::default()));
        let limiter = Arc::new(RateLimiter::new(
            LimiterConfig {
                base_interval: Duration::ZERO,
                min_concurrency: 1,
                max_concurrency: 4,
                ramp_successes: 2,
            },
            breaker,
        ));
        RemoteClient::new(api, limiter, fast_config(confirmation))
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(1000);
        let d0 = backoff(base, cap, 0);
        assert!(d0 >= Duration::from_millis(50) && d0 <= base);
        for _ in 0..20 {
            let d = backoff(base, cap, 10);
            assert!(d >= Duration::from_millis(500) && d <= cap);
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let api = Arc::new(InMemoryFileSearch::default());
        api.fail_next(ApiCall::Upload, RemoteError::Transient("HTTP 503".into()));
        let c = client(api.clone(), ConfirmationMode::Operation);
        let handle = c.upload("files/a-1", "a.md", "text/plain", b"x".to_vec()).await.unwrap();
        assert_eq!(handle.name(), "files/a-1");
        assert_eq!(api.calls(ApiCall::Upload), 2);
    }

    #[tokio::test]
    async fn rate_limits_are_returned_and_recorded() {
        let api = Arc::new(InMemoryFileSearch::default());
        api.fail_next(ApiCall::Upload, RemoteError::RateLimited("HTTP 429".into()));
        let c = client(api.clone(), ConfirmationMode::Operation);
        let err = c
            .upload("files/a-1", "a.md", "text/plain", b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::RateLimited(_)));
        assert_eq!(api.calls(ApiCall::Upload), 1);
        assert_eq!(c.breaker().snapshot().rate_limited_in_window, 1);
    }

    #[tokio::test]
    async fn imports_are_sent_once() {
        let api = Arc::new(InMemoryFileSearch::default());
        let c = client(api.clone(), ConfirmationMode::Operation);
        let raw = c.upload("files/a-1", "a.md", "text/plain", b"x".to_vec()).await.unwrap();
        let active = c.wait_until_active(raw).await.unwrap();
        api.fail_next(ApiCall::Import, RemoteError::Transient("request timed out".into()));
        let err = c.import_to_store(&active, &[]).await.unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_)));
        assert_eq!(api.calls(ApiCall::Import), 1);
    }

    #[tokio::test]
    async fn only_the_trial_upload_closes_a_half_open_breaker() {
        let api = Arc::new(InMemoryFileSearch::default().with_faults(FaultPlan {
            operation_polls: 5,
            ..Default::default()
        }));
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
                max_concurrency: 4,
                ramp_successes: 2,
            },
            breaker.clone(),
        ));
        let c = RemoteClient::new(api.clone(), limiter, fast_config(ConfirmationMode::Operation));

        // Another file's import is already running.
        let raw = c.upload("files/b-1", "b.md", "text/plain", b"b".to_vec()).await.unwrap();
        let active = c.wait_until_active(raw).await.unwrap();
        let op = c.import_to_store(&active, &[]).await.unwrap();

        for _ in 0..3 {
            breaker.record(CallOutcome::RateLimited);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let crate::breaker::Admission::Trial(ticket) = breaker.admit() else {
            panic!("expected a trial");
        };

        assert_eq!(c.check_operation(&op).await.unwrap(), Some(OperationStatus::Pending));
        assert_eq!(breaker.state(), crate::breaker::CircuitState::HalfOpen);

        c.upload_as("files/a-1", "a.md", "text/plain", b"a".to_vec(), Some(ticket))
            .await
            .unwrap();
        assert_eq!(breaker.state(), crate::breaker::CircuitState::Closed);
    }

    #[tokio::test]
    async fn full_path_yields_a_document() {
        let api = Arc::new(InMemoryFileSearch::default().with_faults(FaultPlan {
            activation_polls: 2,
            operation_polls: 3,
            ..Default::default()
        }));
        let c = client(api.clone(), ConfirmationMode::Operation);
        let raw = c.upload("files/a-1", "a.md", "text/plain", b"x".to_vec()).await.unwrap();
        let active = c.wait_until_active(raw).await.unwrap();
        let op = c.import_to_store(&active, &[]).await.unwrap();
        let status = c.poll_operation(&op, None).await.unwrap();
        let OperationStatus::Done(doc) = status else {
            panic!("expected done, got {:?}", status);
        };
        assert!(api.has_document(doc.as_str()));
        assert_eq!(c.confirm(doc.clone()).await.unwrap(), doc);
    }

    #[tokio::test]
    async fn stuck_operation_reports_pending_at_deadline() {
        let api = Arc::new(InMemoryFileSearch::default().with_faults(FaultPlan {
            operations_stuck: true,
            ..Default::default()
        }));
        let c = client(api.clone(), ConfirmationMode::Operation);
        let raw = c.upload("files/a-1", "a.md", "text/plain", b"x".to_vec()).await.unwrap();
        let active = c.wait_until_active(raw).await.unwrap();
        let op = c.import_to_store(&active, &[]).await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(
            c.poll_operation(&op, Some(deadline)).await.unwrap(),
            OperationStatus::Pending
        );
    }

    #[tokio::test]
    async fn unknown_operation_counts_as_failed() {
        let api = Arc::new(InMemoryFileSearch::default());
        let c = client(api, ConfirmationMode::Operation);
        let status = c
            .poll_operation(&OperationHandle::from_persisted("ops/missing"), None)
            .await
            .unwrap();
        assert!(matches!(status, OperationStatus::Failed(_)));
    }

    #[tokio::test]
    async fn visible_mode_flags_invisible_documents() {
        let api = Arc::new(InMemoryFileSearch::default().with_faults(FaultPlan {
            hide_documents: true,
            ..Default::default()
        }));
        let c = client(
            api,
            ConfirmationMode::Visible {
                timeout: Duration::from_millis(20),
            },
        );
        assert_eq!(c.confirmation_tag(), "visible-v1");
        let err = c
            .confirm(DocumentId::from_persisted("docs/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Inconsistent(_)));
    }

    #[tokio::test]
    async fn listing_follows_pages() {
        let api = Arc::new(InMemoryFileSearch::default());
        for i in 0..25 {
            api.insert_document(&format!("d{}", i), Some(&format!("k{}", i)));
        }
        let c = client(api, ConfirmationMode::Operation);
        assert_eq!(c.list_documents().await.unwrap().len(), 25);
    }
}
