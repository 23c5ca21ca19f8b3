//! Source adapters: turn a `Reference` into a local file.

pub mod aria2;
pub mod http;
pub mod telegram;
pub mod ytdl;

use crate::{
    error::TransferError,
    progress::ProgressSink,
    reference::{Reference, ReferenceKind},
    task::Fetched,
};

use std::{fmt::Display, path::Path, sync::Arc};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::{
    io::{AsyncWriteExt, BufWriter},
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tokio_util::sync::CancellationToken;

/// Buffer size used when writing streamed bodies to disk.
const WRITE_BUFFER: usize = 256 * 1024;

/// A backend able to produce a local file from a reference.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Fetch `reference` into `destination`, reporting progress into `progress`.
    async fn fetch(
        &self,
        reference: &Reference,
        destination: &Path,
        progress: &ProgressSink,
        cancellation_token: &CancellationToken,
    ) -> Result<Fetched, TransferError>;
}

/// The closed set of adapters the orchestrator picks from.
#[derive(Clone)]
pub struct Sources {
    /// Generic links: direct HTTP or the external download manager.
    pub direct: Arc<dyn SourceAdapter>,
    /// Media-site links.
    pub media: Arc<dyn SourceAdapter>,
    /// Chat attachments.
    pub platform: Arc<dyn SourceAdapter>,
}

impl Sources {
    /// Adapter responsible for `kind`; `None` for references that need no download.
    pub fn select(&self, kind: ReferenceKind) -> Option<&Arc<dyn SourceAdapter>> {
        match kind {
            ReferenceKind::RemoteObjectStore => None,
            ReferenceKind::GenericUrl => Some(&self.direct),
            ReferenceKind::MediaSiteUrl => Some(&self.media),
            ReferenceKind::AttachedFile => Some(&self.platform),
        }
    }
}

/// Bounded pool of slots for process and polling work.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool with `size` slots (at least one).
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Wait for a free slot; the wait does not count as a stall of `progress`.
    pub async fn acquire(
        &self,
        progress: &ProgressSink,
        cancellation_token: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, TransferError> {
        let _hold = progress.hold();
        select! {
            biased;
            () = cancellation_token.cancelled() => Err(TransferError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| TransferError::transfer("worker pool closed"))
            }
        }
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Write a byte stream to `path`, reporting progress; returns the number of bytes written.
///
/// The final progress sample is always published.
pub async fn write_stream<S, B, E>(
    stream: S,
    path: &Path,
    total: Option<u64>,
    progress: &ProgressSink,
    cancellation_token: &CancellationToken,
) -> Result<u64, TransferError>
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| TransferError::transfer(format!("could not create file: {e}")))?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);
    let mut written: u64 = 0;
    let mut stream = std::pin::pin!(stream);

    loop {
        let chunk = select! {
            biased; // always go for token first
            () = cancellation_token.cancelled() => return Err(TransferError::Cancelled),
            chunk = stream.next() => chunk,
        };

        let Some(chunk) = chunk else { break };
        let bytes = chunk.map_err(|e| TransferError::transfer(format!("connection error: {e}")))?;
        let bytes = bytes.as_ref();

        writer
            .write_all(bytes)
            .await
            .map_err(|e| TransferError::transfer(format!("could not write file: {e}")))?;
        written += bytes.len() as u64;
        progress.report(written, total);
    }

    writer
        .flush()
        .await
        .map_err(|e| TransferError::transfer(format!("could not write file: {e}")))?;

    progress.finish(written, Some(total.unwrap_or(written)));

    if written == 0 {
        return Err(TransferError::transfer("source returned no data"));
    }

    Ok(written)
}

/// Pick the name a fetched file should be stored under.
pub fn choose_name(reference: &Reference, fallbacks: &[Option<String>]) -> String {
    reference
        .output_name()
        .map(ToString::to_string)
        .or_else(|| fallbacks.iter().flatten().next().cloned())
        .unwrap_or_else(|| format!("download-{}", crate::utils::random_string(8)))
}

/// Mime type hint for a local file, from its extension.
pub fn guess_mime(path: &Path) -> Option<String> {
    mime_guess::from_path(path).first().map(|m| m.to_string())
}
