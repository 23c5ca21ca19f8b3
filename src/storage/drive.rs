//! Google Drive relay using the v3 REST API.

use super::StorageRelay;
use crate::{
    error::TransferError, progress::ProgressSink, reference::Reference, task::Uploaded, utils,
};

use std::{io::SeekFrom, path::Path, time::Duration};

use async_trait::async_trait;
use reqwest::{
    StatusCode,
    header::{LOCATION, RANGE},
};
use serde::Deserialize;
use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    select,
    sync::Mutex,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Resumable uploads must be sent in multiples of this.
const CHUNK_ALIGNMENT: usize = 256 * 1024;

/// Default upload chunk.
const DEFAULT_CHUNK_SIZE: usize = 32 * CHUNK_ALIGNMENT;

/// Refresh tokens this long before Google says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Chunks in a row Drive may refuse to take anything from.
const MAX_STALLED_CHUNKS: u32 = 3;

/// Fields requested for every file resource.
const FILE_FIELDS: &str = "id,name,size,mimeType,webViewLink";

/// How the relay authenticates.
#[derive(Debug, Clone)]
pub enum DriveCredentials {
    /// A ready-made access token, used as-is.
    AccessToken(String),
    /// OAuth client credentials plus a long-lived refresh token.
    RefreshToken {
        /// OAuth client id.
        client_id: String,
        /// OAuth client secret.
        client_secret: String,
        /// Refresh token granted to the client.
        refresh_token: String,
    },
}

/// Base URLs, overridable for tests.
#[derive(Debug, Clone)]
pub struct DriveEndpoints {
    /// OAuth token endpoint.
    pub token_url: String,
    /// Metadata API base.
    pub api_base: String,
    /// Upload API base.
    pub upload_base: String,
}

impl Default for DriveEndpoints {
    fn default() -> Self {
        Self {
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
        }
    }
}

/// An access token and when to stop using it.
#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// OAuth token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// Drive file resource.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: Option<String>,
    size: Option<String>,
    mime_type: Option<String>,
    web_view_link: Option<String>,
}

impl DriveFile {
    /// Convert into the relay's result type.
    fn into_uploaded(self, fallback_name: &str, fallback_size: u64) -> Uploaded {
        let link = self
            .web_view_link
            .unwrap_or_else(|| format!("https://drive.google.com/open?id={}", self.id));
        Uploaded {
            name: self.name.unwrap_or_else(|| fallback_name.to_string()),
            size: self
                .size
                .and_then(|s| s.parse().ok())
                .unwrap_or(fallback_size),
            link,
        }
    }
}

/// Extract the file id from a Drive link.
///
/// Supports `/file/d/<id>/...`, `/document/d/<id>/...` and `?id=<id>`.
pub fn drive_file_id(url: &Url) -> Option<String> {
    let segments = url.path_segments()?.collect::<Vec<_>>();
    let from_path = segments
        .windows(2)
        .find(|w| w[0] == "d")
        .map(|w| w[1].to_string());

    from_path
        .or_else(|| {
            url.query_pairs()
                .find(|(k, _)| k == "id")
                .map(|(_, v)| v.into_owned())
        })
        .filter(|id| !id.is_empty())
}

/// Uploads files into a Drive folder.
pub struct DriveRelay {
    client: reqwest::Client,
    credentials: DriveCredentials,
    parent_id: Option<String>,
    endpoints: DriveEndpoints,
    chunk_size: usize,
    token: Mutex<Option<CachedToken>>,
}

impl DriveRelay {
    /// Create a relay uploading into `parent_id` (or the drive root).
    ///
    /// `client` must not follow redirects: Drive answers `308` to partial uploads.
    pub fn new(
        client: reqwest::Client,
        credentials: DriveCredentials,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            client,
            credentials,
            parent_id,
            endpoints: DriveEndpoints::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            token: Mutex::new(None),
        }
    }

    /// Use different base URLs.
    #[must_use]
    pub fn with_endpoints(mut self, endpoints: DriveEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Use a different upload chunk, rounded down to the required alignment.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = (chunk_size / CHUNK_ALIGNMENT).max(1) * CHUNK_ALIGNMENT;
        self
    }

    /// A valid access token, refreshing it when needed.
    async fn access_token(&self) -> Result<String, TransferError> {
        let (client_id, client_secret, refresh_token) = match &self.credentials {
            DriveCredentials::AccessToken(token) => return Ok(token.clone()),
            DriveCredentials::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
            } => (client_id, client_secret, refresh_token),
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.value.clone());
        }

        let response = self
            .client
            .post(&self.endpoints.token_url)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| TransferError::upload(format!("could not reach Google: {e}")))?;
        let response: TokenResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| TransferError::upload(format!("bad token response: {e}")))?;

        let lifetime = Duration::from_secs(response.expires_in.unwrap_or(3600));
        *cached = Some(CachedToken {
            value: response.access_token.clone(),
            expires_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        });
        tracing::debug!("refreshed Drive access token");

        Ok(response.access_token)
    }

    /// Turn an unsuccessful response into `UploadFailed` with Google's message.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransferError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v["error"]["message"]
                    .as_str()
                    .or_else(|| v["error_description"].as_str())
                    .map(ToString::to_string)
            })
            .unwrap_or(body);

        Err(TransferError::upload(format!("{status}: {}", message.trim())))
    }

    /// Send a request unless cancelled first.
    async fn send(
        request: reqwest::RequestBuilder,
        cancellation_token: &CancellationToken,
    ) -> Result<reqwest::Response, TransferError> {
        select! {
            biased;
            () = cancellation_token.cancelled() => Err(TransferError::Cancelled),
            response = request.send() => {
                response.map_err(|e| TransferError::upload(format!("connection error: {e}")))
            }
        }
    }

    /// Open a resumable upload session, returning its URL.
    async fn start_session(
        &self,
        token: &str,
        name: &str,
        size: u64,
        mime_type: &str,
        cancellation_token: &CancellationToken,
    ) -> Result<String, TransferError> {
        let mut metadata = json!({ "name": name, "mimeType": mime_type });
        if let Some(parent) = &self.parent_id {
            metadata["parents"] = json!([parent]);
        }

        let request = self
            .client
            .post(format!("{}/files", self.endpoints.upload_base))
            .query(&[
                ("uploadType", "resumable"),
                ("supportsAllDrives", "true"),
                ("fields", FILE_FIELDS),
            ])
            .bearer_auth(token)
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", size)
            .json(&metadata);

        let response = Self::check(Self::send(request, cancellation_token).await?).await?;

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .ok_or_else(|| TransferError::upload("Drive did not return an upload session"))
    }
}

/// Bytes Drive has persisted, from the `Range: bytes=0-N` of a `308`.
///
/// No header means nothing was kept.
fn persisted_bytes(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(_, last)| last.trim().parse::<u64>().ok())
        .map_or(0, |last| last + 1)
}

/// Read until `buf` is full or the file ends.
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[async_trait]
impl StorageRelay for DriveRelay {
    async fn upload(
        &self,
        path: &Path,
        mime_type: Option<&str>,
        progress: &ProgressSink,
        cancellation_token: &CancellationToken,
    ) -> Result<Uploaded, TransferError> {
        let name = path
            .file_name()
            .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned());
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::upload(format!("could not open local file: {e}")))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| TransferError::upload(format!("could not stat local file: {e}")))?
            .len();
        if size == 0 {
            return Err(TransferError::upload("refusing to upload an empty file"));
        }

        let mime_type = mime_type.unwrap_or("application/octet-stream");
        let token = self.access_token().await?;
        let session = self
            .start_session(&token, &name, size, mime_type, cancellation_token)
            .await?;

        tracing::debug!("uploading {name} ({})", utils::human_bytes(size));

        let mut buf = vec![0u8; self.chunk_size];
        let mut offset: u64 = 0;
        let mut stalled_chunks = 0;

        while offset < size {
            let n = read_chunk(&mut file, &mut buf)
                .await
                .map_err(|e| TransferError::upload(format!("could not read local file: {e}")))?;
            if n == 0 {
                return Err(TransferError::upload("local file shrank during upload"));
            }
            let end = offset + n as u64 - 1;

            let request = self
                .client
                .put(&session)
                .header("Content-Range", format!("bytes {offset}-{end}/{size}"))
                .body(buf[..n].to_vec());

            let response = match Self::send(request, cancellation_token).await {
                Err(TransferError::Cancelled) => {
                    // abandon the session so Drive frees it
                    let _ = self.client.delete(&session).send().await;
                    return Err(TransferError::Cancelled);
                }
                other => other?,
            };

            match response.status() {
                StatusCode::PERMANENT_REDIRECT => {
                    let persisted = persisted_bytes(&response).min(size);
                    if persisted <= offset {
                        stalled_chunks += 1;
                        if stalled_chunks >= MAX_STALLED_CHUNKS {
                            return Err(TransferError::upload("Drive keeps refusing the upload"));
                        }
                    } else {
                        stalled_chunks = 0;
                    }

                    if persisted != end + 1 {
                        tracing::debug!(
                            "Drive kept {persisted} of {} bytes of {name}, resending the rest",
                            end + 1
                        );
                        file.seek(SeekFrom::Start(persisted)).await.map_err(|e| {
                            TransferError::upload(format!("could not read local file: {e}"))
                        })?;
                    }
                    offset = persisted;
                    progress.report(offset, Some(size));
                }
                StatusCode::OK | StatusCode::CREATED => {
                    progress.finish(size, Some(size));
                    let file: DriveFile = response.json().await.map_err(|e| {
                        TransferError::upload(format!("bad upload response: {e}"))
                    })?;
                    tracing::debug!("stored {name} as Drive file {}", file.id);
                    return Ok(file.into_uploaded(&name, size));
                }
                _ => return Err(Self::check(response).await.err().unwrap_or_else(|| {
                    TransferError::upload("unexpected upload response")
                })),
            }
        }

        Err(TransferError::upload("Drive never confirmed the upload"))
    }

    async fn clone_remote(
        &self,
        reference: &Reference,
        cancellation_token: &CancellationToken,
    ) -> Result<Uploaded, TransferError> {
        let link = reference
            .link()
            .ok_or_else(|| TransferError::upload("reference has no link"))?;

        if link.path_segments().is_some_and(|mut s| s.any(|p| p == "folders")) {
            return Err(TransferError::upload("cloning folders is not supported"));
        }
        let id = drive_file_id(link)
            .ok_or_else(|| TransferError::upload("could not find a file id in the link"))?;

        let token = self.access_token().await?;
        let mut body = json!({});
        if let Some(parent) = &self.parent_id {
            body["parents"] = json!([parent]);
        }

        let request = self
            .client
            .post(format!("{}/files/{id}/copy", self.endpoints.api_base))
            .query(&[("supportsAllDrives", "true"), ("fields", FILE_FIELDS)])
            .bearer_auth(token)
            .json(&body);

        let file: DriveFile = Self::check(Self::send(request, cancellation_token).await?)
            .await?
            .json()
            .await
            .map_err(|e| TransferError::upload(format!("bad copy response: {e}")))?;

        if file.mime_type.as_deref() == Some("application/vnd.google-apps.folder") {
            return Err(TransferError::upload("cloning folders is not supported"));
        }

        tracing::debug!("cloned Drive file {id} as {}", file.id);
        Ok(file.into_uploaded(&id, 0))
    }
}
