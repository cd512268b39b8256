//! Google Drive v3 store over REST.
//!
//! Uploads use the resumable protocol: a session is opened with the file
//! metadata, then the content is sent in chunks with `Content-Range`. A 308
//! acknowledges a chunk, 200/201 completes the file. Transient chunk failures
//! are retried after asking the session how much it has received.

use super::{ListQuery, RemoteFile, RemoteStore, UploadRequest, UploadTarget};
use crate::config::RemoteConfig;
use crate::transfer::ProgressCallback;
use crate::utils::errors::{GBackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FILE_FIELDS: &str = "id,name,parents,createdTime,size,appProperties";
const DIGEST_PROPERTY: &str = "sha256";
const PAGE_SIZE: &str = "1000";
const MAX_BACKOFF: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    parents: Vec<String>,
    created_time: DateTime<Utc>,
    /// int64 values are serialized as strings
    size: Option<String>,
    #[serde(default)]
    app_properties: HashMap<String, String>,
}

impl DriveFile {
    fn into_remote(mut self, fallback_parent: &str) -> RemoteFile {
        RemoteFile {
            parent_id: self
                .parents
                .first()
                .cloned()
                .unwrap_or_else(|| fallback_parent.to_string()),
            size: self.size.as_deref().and_then(|s| s.parse().ok()),
            sha256: self.app_properties.remove(DIGEST_PROPERTY),
            id: self.id,
            name: self.name,
            created_time: self.created_time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorItem {
    reason: Option<String>,
}

/// What a failing request was addressing, for error classification.
#[derive(Debug, Clone, Copy)]
enum Scope<'a> {
    Folder(&'a str),
    Target(&'a str),
    Service,
}

enum ChunkStep {
    Continue(u64),
    Done(DriveFile),
}

pub struct DriveStore {
    client: Client,
    api_url: String,
    upload_url: String,
    token: String,
    chunk_size: usize,
    max_chunk_retries: u32,
}

impl DriveStore {
    pub fn new(config: &RemoteConfig, token: impl Into<String>) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(GBackupError::Config("remote chunk size must be non-zero".to_string()));
        }
        // The resumable protocol answers 308 without a Location; never follow it.
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            upload_url: config.upload_url.trim_end_matches('/').to_string(),
            token: token.into(),
            chunk_size: config.chunk_size,
            max_chunk_retries: config.max_chunk_retries,
        })
    }

    /// Build the store and check that the token is accepted.
    pub async fn connect(config: &RemoteConfig, token: impl Into<String>) -> Result<Self> {
        let store = Self::new(config, token)?;
        let resp = store
            .client
            .get(format!("{}/about", store.api_url))
            .bearer_auth(&store.token)
            .query(&[("fields", "user")])
            .send()
            .await?;
        check(resp, Scope::Service).await?;
        info!("Connected to Drive at {}", store.api_url);
        Ok(store)
    }

    async fn start_session(&self, request: &UploadRequest<'_>, total: u64) -> Result<String> {
        let mut metadata = serde_json::json!({ "name": request.name });
        if let Some(digest) = request.sha256 {
            let mut properties = serde_json::Map::new();
            properties.insert(DIGEST_PROPERTY.to_string(), digest.into());
            metadata["appProperties"] = serde_json::Value::Object(properties);
        }

        let (builder, scope) = match &request.target {
            UploadTarget::Create => {
                metadata["parents"] = serde_json::json!([request.folder]);
                (
                    self.client.post(format!("{}/files", self.upload_url)),
                    Scope::Folder(request.folder),
                )
            }
            UploadTarget::Replace(id) => (
                self.client.patch(format!("{}/files/{}", self.upload_url, id)),
                Scope::Target(id.as_str()),
            ),
        };

        let resp = builder
            .bearer_auth(&self.token)
            .query(&[
                ("uploadType", "resumable"),
                ("supportsAllDrives", "true"),
                ("fields", FILE_FIELDS),
            ])
            .header("X-Upload-Content-Type", "application/octet-stream")
            .header("X-Upload-Content-Length", total.to_string())
            .json(&metadata)
            .send()
            .await?;
        let resp = check(resp, scope).await?;

        resp.headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| GBackupError::store(Some(resp.status().as_u16()), "resumable session has no Location"))
    }

    async fn send_chunks(
        &self,
        session: &str,
        request: &UploadRequest<'_>,
        total: u64,
        progress: &ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile> {
        let mut file = tokio::fs::File::open(request.local_path).await?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut offset = 0u64;
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(GBackupError::Cancelled);
            }
            let len = (self.chunk_size as u64).min(total - offset) as usize;
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buffer[..len]).await?;

            let send = self
                .client
                .put(session)
                .header(CONTENT_RANGE, content_range(offset, len, total))
                .body(Bytes::copy_from_slice(&buffer[..len]))
                .send();
            let sent = tokio::select! {
                r = send => r.map_err(GBackupError::from),
                _ = cancel.cancelled() => return Err(GBackupError::Cancelled),
            };
            let step = match sent {
                Ok(resp) => chunk_step(resp, request).await,
                Err(e) => Err(e),
            };

            match step {
                Ok(ChunkStep::Done(done)) => {
                    progress(total);
                    return Ok(done.into_remote(request.folder));
                }
                Ok(ChunkStep::Continue(next)) => {
                    offset = next;
                    attempts = 0;
                    progress(offset);
                }
                Err(e) if e.is_transient() && attempts < self.max_chunk_retries => {
                    attempts += 1;
                    let delay = backoff(attempts);
                    warn!(
                        "Chunk at offset {} of {} failed (attempt {}/{}), retrying in {:?}: {}",
                        offset, request.name, attempts, self.max_chunk_retries, delay, e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(GBackupError::Cancelled),
                    }
                    match self.session_status(session, request, total).await {
                        Ok(ChunkStep::Done(done)) => {
                            progress(total);
                            return Ok(done.into_remote(request.folder));
                        }
                        Ok(ChunkStep::Continue(next)) => offset = next,
                        Err(e) => debug!("Session status query failed, resending from {}: {}", offset, e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ask the session how many bytes it has persisted.
    async fn session_status(&self, session: &str, request: &UploadRequest<'_>, total: u64) -> Result<ChunkStep> {
        let resp = self
            .client
            .put(session)
            .header(CONTENT_RANGE, format!("bytes */{total}"))
            .body(Vec::new())
            .send()
            .await?;
        chunk_step(resp, request).await
    }

    async fn abort_session(&self, session: &str) {
        match self.client.delete(session).send().await {
            Ok(resp) => debug!("Aborted upload session ({})", resp.status()),
            Err(e) => debug!("Failed to abort upload session: {}", e),
        }
    }
}

#[async_trait]
impl RemoteStore for DriveStore {
    fn supports_update_in_place(&self) -> bool {
        true
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<RemoteFile>> {
        let q = list_query(query);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("q", q.clone()),
                ("fields", format!("nextPageToken,files({FILE_FIELDS})")),
                ("orderBy", "createdTime".to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
                ("supportsAllDrives", "true".to_string()),
                ("includeItemsFromAllDrives", "true".to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let resp = self
                .client
                .get(format!("{}/files", self.api_url))
                .bearer_auth(&self.token)
                .query(&params)
                .send()
                .await?;
            let page: FileList = check(resp, Scope::Folder(&query.folder)).await?.json().await?;
            files.extend(page.files.into_iter().map(|f| f.into_remote(&query.folder)));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        files.sort_by_key(|f| f.created_time);
        Ok(files)
    }

    async fn get(&self, file_id: &str) -> Result<RemoteFile> {
        let resp = self
            .client
            .get(format!("{}/files/{}", self.api_url, file_id))
            .bearer_auth(&self.token)
            .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
            .send()
            .await?;
        let file: DriveFile = check(resp, Scope::Target(file_id)).await?.json().await?;
        Ok(file.into_remote(""))
    }

    async fn upload(
        &self,
        request: &UploadRequest<'_>,
        progress: ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile> {
        let total = tokio::fs::metadata(request.local_path).await?.len();
        let session = self.start_session(request, total).await?;
        debug!("Opened upload session for {} ({} bytes)", request.name, total);

        match self.send_chunks(&session, request, total, &progress, cancel).await {
            Ok(file) => Ok(file),
            Err(e) => {
                self.abort_session(&session).await;
                Err(e)
            }
        }
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{}/files/{}", self.api_url, file_id))
            .bearer_auth(&self.token)
            .query(&[("supportsAllDrives", "true")])
            .send()
            .await?;
        check(resp, Scope::Target(file_id)).await?;
        Ok(())
    }

    async fn download(&self, file_id: &str, dest: &Path, cancel: &CancellationToken) -> Result<u64> {
        let resp = self
            .client
            .get(format!("{}/files/{}", self.api_url, file_id))
            .bearer_auth(&self.token)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .send()
            .await?;
        let resp = check(resp, Scope::Target(file_id)).await?;

        let mut staging = dest.as_os_str().to_os_string();
        staging.push(".partial");
        let staging = std::path::PathBuf::from(staging);

        let written = async {
            let mut out = tokio::fs::File::create(&staging).await?;
            let mut stream = resp.bytes_stream();
            let mut written = 0u64;
            loop {
                let chunk = tokio::select! {
                    c = stream.next() => c,
                    _ = cancel.cancelled() => return Err(GBackupError::Cancelled),
                };
                match chunk {
                    Some(bytes) => {
                        let bytes = bytes?;
                        out.write_all(&bytes).await?;
                        written += bytes.len() as u64;
                    }
                    None => break,
                }
            }
            out.flush().await?;
            out.sync_all().await?;
            Ok::<u64, GBackupError>(written)
        }
        .await;

        match written {
            Ok(n) => {
                tokio::fs::rename(&staging, dest).await?;
                info!("Downloaded {} ({} bytes) to {}", file_id, n, dest.display());
                Ok(n)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }
}

async fn check(resp: Response, scope: Scope<'_>) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify(status, &body, scope))
}

async fn chunk_step(resp: Response, request: &UploadRequest<'_>) -> Result<ChunkStep> {
    let status = resp.status();
    if status == StatusCode::PERMANENT_REDIRECT {
        let next = resp
            .headers()
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(next_offset)
            .unwrap_or(0);
        return Ok(ChunkStep::Continue(next));
    }
    let scope = match &request.target {
        UploadTarget::Create => Scope::Folder(request.folder),
        UploadTarget::Replace(id) => Scope::Target(id.as_str()),
    };
    let resp = check(resp, scope).await?;
    Ok(ChunkStep::Done(resp.json().await?))
}

fn classify(status: StatusCode, body: &str, scope: Scope<'_>) -> GBackupError {
    let parsed: Option<ErrorEnvelope> = serde_json::from_str(body).ok();
    let message = match &parsed {
        Some(env) => format!("{} ({})", env.error.message, status.as_u16()),
        None if body.trim().is_empty() => format!("HTTP {}", status.as_u16()),
        None => format!("{} ({})", body.trim(), status.as_u16()),
    };
    let rate_limited = parsed.as_ref().is_some_and(|env| {
        env.error
            .errors
            .iter()
            .filter_map(|e| e.reason.as_deref())
            .any(|r| r.ends_with("RateLimitExceeded") || r == "rateLimitExceeded")
    });
    if rate_limited {
        return GBackupError::store(Some(StatusCode::TOO_MANY_REQUESTS.as_u16()), message);
    }

    match (status, scope) {
        (StatusCode::FORBIDDEN | StatusCode::NOT_FOUND, Scope::Folder(folder)) => GBackupError::InvalidFolder {
            folder: folder.to_string(),
            message,
        },
        (StatusCode::FORBIDDEN | StatusCode::NOT_FOUND, Scope::Target(target)) => GBackupError::InvalidTarget {
            target: target.to_string(),
            message,
        },
        _ => GBackupError::store(Some(status.as_u16()), message),
    }
}

/// Drive query string literal escaping.
fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn list_query(query: &ListQuery) -> String {
    let mut q = format!("'{}' in parents and trashed = false", escape_literal(&query.folder));
    if let Some(name) = &query.name {
        q.push_str(&format!(" and name = '{}'", escape_literal(name)));
    }
    q
}

fn content_range(offset: u64, len: usize, total: u64) -> String {
    if len == 0 {
        format!("bytes */{total}")
    } else {
        format!("bytes {}-{}/{}", offset, offset + len as u64 - 1, total)
    }
}

/// `Range: bytes=0-N` means N+1 bytes are persisted.
fn next_offset(range: &str) -> Option<u64> {
    let (_, end) = range.strip_prefix("bytes=")?.split_once('-')?;
    end.trim().parse::<u64>().ok().map(|n| n + 1)
}

fn backoff(attempt: u32) -> Duration {
    let millis = 500u64.saturating_mul(1 << attempt.saturating_sub(1).min(16));
    Duration::from_millis(millis).min(MAX_BACKOFF)
}
