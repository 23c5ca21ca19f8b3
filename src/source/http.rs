//! Direct HTTP downloads.

use super::{SourceAdapter, choose_name, write_stream};
use crate::{
    error::TransferError, progress::ProgressSink, reference::Reference, task::Fetched, utils,
};

use std::path::Path;

use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, HeaderName};
use tokio::select;
use tokio_util::sync::CancellationToken;

/// Streams a link straight to disk over a pooled `reqwest` client.
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    /// Create a new `HttpSource` sharing `client`'s connection pool.
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceAdapter for HttpSource {
    fn name(&self) -> &'static str {
        "http"
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

        let response = select! {
            biased;
            () = cancellation_token.cancelled() => return Err(TransferError::Cancelled),
            response = self.client.get(url.clone()).send() => response,
        }
        .map_err(|e| TransferError::transfer(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::transfer(format!("HTTP status {status}")));
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        };

        let mime_type = header(CONTENT_TYPE)
            .and_then(|v| v.split(';').next().map(|s| s.trim().to_string()))
            .filter(|v| !v.is_empty() && v != "application/octet-stream");
        let disposition_name = header(CONTENT_DISPOSITION)
            .as_deref()
            .and_then(utils::file_name_from_disposition);

        // name from the final URL, after redirects
        let name = choose_name(
            reference,
            &[disposition_name, utils::file_name_from_url(response.url())],
        );
        let total = response.content_length().filter(|&len| len > 0);
        let path = destination.join(&name);

        tracing::debug!(
            "downloading {url} to {} ({})",
            path.display(),
            total.map_or_else(|| "unknown size".to_string(), utils::human_bytes)
        );

        let size = write_stream(
            response.bytes_stream(),
            &path,
            total,
            progress,
            cancellation_token,
        )
        .await?;

        Ok(Fetched {
            path,
            size,
            mime_type,
        })
    }
}
