//! Downloads delegated to a running aria2 instance over JSON-RPC.

use super::{SourceAdapter, WorkerPool, guess_mime};
use crate::{error::TransferError, progress::ProgressSink, reference::Reference, task::Fetched};

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::{select, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Keys requested from `aria2.tellStatus`.
const STATUS_KEYS: [&str; 6] = [
    "status",
    "totalLength",
    "completedLength",
    "errorMessage",
    "files",
    "followedBy",
];

/// A JSON-RPC response envelope.
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// A JSON-RPC error object.
#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Subset of `aria2.tellStatus`. aria2 encodes numbers as strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    status: String,
    #[serde(default)]
    total_length: String,
    #[serde(default)]
    completed_length: String,
    error_message: Option<String>,
    #[serde(default)]
    files: Vec<JobFile>,
    followed_by: Option<Vec<String>>,
}

/// One file of a job.
#[derive(Debug, Deserialize)]
struct JobFile {
    path: String,
}

/// Client for an external aria2 download manager.
pub struct Aria2Source {
    client: reqwest::Client,
    endpoint: String,
    secret: Option<String>,
    poll_interval: Duration,
    pool: WorkerPool,
}

impl Aria2Source {
    /// Create a new `Aria2Source` talking to `endpoint` (e.g. `http://localhost:6800/jsonrpc`).
    pub const fn new(
        client: reqwest::Client,
        endpoint: String,
        secret: Option<String>,
        poll_interval: Duration,
        pool: WorkerPool,
    ) -> Self {
        Self {
            client,
            endpoint,
            secret,
            poll_interval,
            pool,
        }
    }

    /// Invoke an RPC method, prepending the secret token when configured.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransferError> {
        let mut all_params = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            all_params.push(json!(format!("token:{secret}")));
        }
        all_params.extend(params);

        let body = json!({
            "jsonrpc": "2.0",
            "id": "drive_relay",
            "method": method,
            "params": all_params,
        });

        let response: RpcResponse<T> = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransferError::transfer(format!("aria2 unreachable: {e}")))?
            .json()
            .await
            .map_err(|e| TransferError::transfer(format!("bad aria2 response: {e}")))?;

        match (response.result, response.error) {
            (Some(result), _) => Ok(result),
            (None, Some(RpcError { code, message })) => Err(TransferError::transfer(format!(
                "aria2 error {code}: {message}"
            ))),
            (None, None) => Err(TransferError::transfer("empty aria2 response")),
        }
    }

    /// Poll `gid` until it reaches a terminal state.
    async fn wait(
        &self,
        mut gid: String,
        progress: &ProgressSink,
        cancellation_token: &CancellationToken,
    ) -> Result<PathBuf, TransferError> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut followed = false;

        loop {
            select! {
                biased;
                () = cancellation_token.cancelled() => {
                    self.remove(&gid).await;
                    return Err(TransferError::Cancelled);
                }
                _ = interval.tick() => {}
            }

            let status: JobStatus = self
                .call("aria2.tellStatus", vec![json!(gid), json!(STATUS_KEYS)])
                .await?;

            let completed = status.completed_length.parse().unwrap_or(0);
            let total = status.total_length.parse().ok().filter(|&t: &u64| t > 0);

            match status.status.as_str() {
                "complete" => {
                    // metalinks and torrents hand over to a follow-up job once
                    if let Some(next) = status.followed_by.and_then(|g| g.into_iter().next())
                        && !followed
                    {
                        tracing::debug!("aria2 job {gid} followed by {next}");
                        gid = next;
                        followed = true;
                        continue;
                    }

                    progress.finish(completed, total.or(Some(completed)));
                    return status
                        .files
                        .into_iter()
                        .next()
                        .map(|f| PathBuf::from(f.path))
                        .ok_or_else(|| TransferError::transfer("aria2 reported no files"));
                }
                "error" => {
                    return Err(TransferError::transfer(
                        status
                            .error_message
                            .unwrap_or_else(|| "aria2 reported an error".to_string()),
                    ));
                }
                "removed" => {
                    return Err(TransferError::transfer("download removed from aria2"));
                }
                _ => progress.report(completed, total),
            }
        }
    }

    /// Best-effort removal of a job.
    async fn remove(&self, gid: &str) {
        if let Err(e) = self
            .call::<Value>("aria2.forceRemove", vec![json!(gid)])
            .await
        {
            tracing::warn!("could not remove aria2 job {gid}: {e}");
        }
    }
}

#[async_trait]
impl SourceAdapter for Aria2Source {
    fn name(&self) -> &'static str {
        "aria2"
    }

    async fn fetch(
        &self,
        reference: &Reference,
        destination: &Path,
        progress: &ProgressSink,
        cancellation_token: &CancellationToken,
    ) -> Result<Fetched, TransferError> {
        let url = reference
            .link()
            .ok_or_else(|| TransferError::transfer("reference has no link"))?;

        let _permit = self.pool.acquire(progress, cancellation_token).await?;

        let mut options = json!({ "dir": destination.to_string_lossy() });
        if let Some(name) = reference.output_name() {
            options["out"] = json!(name);
        }

        let gid: String = self
            .call("aria2.addUri", vec![json!([url.as_str()]), options])
            .await?;
        tracing::debug!("aria2 job {gid} started for {url}");

        let path = self.wait(gid, progress, cancellation_token).await?;

        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| TransferError::transfer(format!("downloaded file missing: {e}")))?
            .len();
        if size == 0 {
            return Err(TransferError::transfer("source returned no data"));
        }

        Ok(Fetched {
            mime_type: guess_mime(&path),
            path,
            size,
        })
    }
}
