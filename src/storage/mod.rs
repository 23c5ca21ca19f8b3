//! Storage relay: places local files in the durable store.

pub mod drive;

use crate::{error::TransferError, progress::ProgressSink, reference::Reference, task::Uploaded};

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A remote store accepting local files.
#[async_trait]
pub trait StorageRelay: Send + Sync {
    /// Upload a local file, reporting progress into `progress`.
    async fn upload(
        &self,
        path: &Path,
        mime_type: Option<&str>,
        progress: &ProgressSink,
        cancellation_token: &CancellationToken,
    ) -> Result<Uploaded, TransferError>;

    /// Copy an object that already lives in the store.
    async fn clone_remote(
        &self,
        reference: &Reference,
        cancellation_token: &CancellationToken,
    ) -> Result<Uploaded, TransferError>;
}
