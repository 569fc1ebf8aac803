//! HTTP transport for the Gemini File Search REST API.
//!
//! Raw objects go through the resumable upload protocol:
//!
//! 1. `POST /upload/v1beta/files` with `X-Goog-Upload-Command: start` and the
//!    object's name and display name; the response carries the session URL
//!    in `x-goog-upload-url`.
//! 2. `POST <session url>` with `X-Goog-Upload-Command: upload, finalize`
//!    and the bytes.
//!
//! Imports are `POST /v1beta/{store}:importFile` and return a long-running
//! operation. Authentication is the `x-goog-api-key` header, read from the
//! environment variable named in config.
//!
//! Status mapping: 429 → rate limited, 408/5xx → transient, other 4xx →
//! permanent. A 403 or 404 on a delete or lookup means "gone".

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    DocumentPage, FileSearchApi, ObjectState, RemoteDocument, RemoteObject, RemoteOperation,
    UploadRequest,
};
use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::metadata::{MetadataEntry, MetadataValue, SOURCE_KEY};

const API_KEY_HEADER: &str = "x-goog-api-key";
const LIST_PAGE_SIZE: u32 = 20;

pub struct HttpFileSearch {
    base_url: String,
    store_name: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpFileSearch {
    /// Build from config. Fails if the API key variable is not set.
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("{} environment variable not set", config.api_key_env),
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self::new(&config.base_url, &config.store_name, api_key, http))
    }

    pub fn new(base_url: &str, store_name: &str, api_key: String, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            store_name: store_name.to_string(),
            api_key,
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1beta/{}", self.base_url, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header(API_KEY_HEADER, &self.api_key)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, RemoteError> {
        let resp = self.authed(req).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status.as_u16(), &body))
    }

    /// Like [`send`](Self::send), but 403/404 become `None`.
    async fn send_optional(&self, req: RequestBuilder) -> Result<Option<Response>, RemoteError> {
        let resp = self.authed(req).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(Some(resp));
        }
        if is_gone(status) {
            return Ok(None);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status.as_u16(), &body))
    }
}

fn is_gone(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN
}

// ─── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileJson {
    name: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    expiration_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponseJson {
    file: FileJson,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationJson {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<StatusJson>,
    #[serde(default)]
    response: Option<ImportResponseJson>,
}

#[derive(Debug, Deserialize)]
struct StatusJson {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportResponseJson {
    #[serde(default)]
    document_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomMetadataJson {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    string_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    numeric_value: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentJson {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    custom_metadata: Vec<CustomMetadataJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsJson {
    #[serde(default)]
    documents: Vec<DocumentJson>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl From<FileJson> for RemoteObject {
    fn from(file: FileJson) -> Self {
        let state = match file.state.as_deref() {
            Some("ACTIVE") => ObjectState::Active,
            Some("FAILED") => ObjectState::Failed,
            _ => ObjectState::Processing,
        };
        let expires_at = file
            .expiration_time
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp());
        RemoteObject {
            name: file.name,
            state,
            expires_at,
        }
    }
}

impl From<OperationJson> for RemoteOperation {
    fn from(op: OperationJson) -> Self {
        RemoteOperation {
            name: op.name,
            done: op.done,
            document_name: op.response.and_then(|r| r.document_name),
            error: op.error.map(|e| format!("code {}: {}", e.code, e.message)),
        }
    }
}

impl From<DocumentJson> for RemoteDocument {
    fn from(doc: DocumentJson) -> Self {
        let source_key = doc
            .custom_metadata
            .into_iter()
            .find(|m| m.key == SOURCE_KEY)
            .and_then(|m| m.string_value);
        RemoteDocument {
            name: doc.name,
            display_name: doc.display_name,
            source_key,
        }
    }
}

fn metadata_json(entries: &[MetadataEntry]) -> Vec<CustomMetadataJson> {
    entries
        .iter()
        .map(|e| match &e.value {
            MetadataValue::String(s) => CustomMetadataJson {
                key: e.key.clone(),
                string_value: Some(s.clone()),
                numeric_value: None,
            },
            MetadataValue::Numeric(n) => CustomMetadataJson {
                key: e.key.clone(),
                string_value: None,
                numeric_value: Some(*n),
            },
        })
        .collect()
}

async fn decode<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, RemoteError> {
    let text = resp.text().await?;
    serde_json::from_str(&text)
        .map_err(|e| RemoteError::Inconsistent(format!("unexpected response body: {}", e)))
}

// ─── Transport ────────────────────────────────────────────────────────────

#[async_trait]
impl FileSearchApi for HttpFileSearch {
    async fn upload_file(&self, request: UploadRequest) -> Result<RemoteObject, RemoteError> {
        let start_url = format!("{}/upload/v1beta/files", self.base_url);
        let body = serde_json::json!({
            "file": {
                "name": request.object_name,
                "displayName": request.display_name,
            }
        });
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-upload-protocol", HeaderValue::from_static("resumable"));
        headers.insert("x-goog-upload-command", HeaderValue::from_static("start"));
        headers.insert(
            "x-goog-upload-header-content-length",
            HeaderValue::from(request.content.len() as u64),
        );
        if let Ok(mime) = HeaderValue::from_str(&request.mime_type) {
            headers.insert("x-goog-upload-header-content-type", mime);
        }

        let resp = self
            .authed(self.http.post(&start_url))
            .headers(headers)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::CONFLICT {
            debug!(object = %request.object_name, "raw object already exists");
            return self.get_file(&request.object_name).await?.ok_or_else(|| {
                RemoteError::Inconsistent(format!(
                    "{} reported as existing but cannot be read",
                    request.object_name
                ))
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status.as_u16(), &body));
        }
        let session_url = resp
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                RemoteError::Inconsistent("upload start returned no session url".into())
            })?;

        let resp = self
            .send(
                self.http
                    .post(&session_url)
                    .header("x-goog-upload-offset", "0")
                    .header("x-goog-upload-command", "upload, finalize")
                    .header(CONTENT_TYPE, request.mime_type.as_str())
                    .body(request.content),
            )
            .await?;
        let uploaded: UploadResponseJson = decode(resp).await?;
        Ok(uploaded.file.into())
    }

    async fn get_file(&self, name: &str) -> Result<Option<RemoteObject>, RemoteError> {
        match self.send_optional(self.http.get(self.url(name))).await? {
            Some(resp) => Ok(Some(decode::<FileJson>(resp).await?.into())),
            None => Ok(None),
        }
    }

    async fn import_file(
        &self,
        object_name: &str,
        metadata: &[MetadataEntry],
    ) -> Result<RemoteOperation, RemoteError> {
        let url = self.url(&format!("{}:importFile", self.store_name));
        let body = serde_json::json!({
            "fileName": object_name,
            "customMetadata": metadata_json(metadata),
        });
        let resp = self.send(self.http.post(url).json(&body)).await?;
        Ok(decode::<OperationJson>(resp).await?.into())
    }

    async fn get_operation(&self, name: &str) -> Result<Option<RemoteOperation>, RemoteError> {
        match self.send_optional(self.http.get(self.url(name))).await? {
            Some(resp) => Ok(Some(decode::<OperationJson>(resp).await?.into())),
            None => Ok(None),
        }
    }

    async fn delete_file(&self, name: &str) -> Result<(), RemoteError> {
        self.send_optional(self.http.delete(self.url(name))).await?;
        Ok(())
    }

    async fn get_document(&self, name: &str) -> Result<Option<RemoteDocument>, RemoteError> {
        match self.send_optional(self.http.get(self.url(name))).await? {
            Some(resp) => Ok(Some(decode::<DocumentJson>(resp).await?.into())),
            None => Ok(None),
        }
    }

    async fn delete_document(&self, name: &str) -> Result<(), RemoteError> {
        let req = self
            .http
            .delete(self.url(name))
            .query(&[("force", "true")]);
        self.send_optional(req).await?;
        Ok(())
    }

    async fn list_documents(&self, page_token: Option<&str>) -> Result<DocumentPage, RemoteError> {
        let mut req = self
            .http
            .get(self.url(&format!("{}/documents", self.store_name)))
            .query(&[("pageSize", LIST_PAGE_SIZE.to_string())]);
        if let Some(token) = page_token {
            req = req.query(&[("pageToken", token)]);
        }
        let resp = self.send(req).await?;
        let page: ListDocumentsJson = decode(resp).await?;
        Ok(DocumentPage {
            documents: page.documents.into_iter().map(Into::into).collect(),
            next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}
