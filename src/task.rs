//! Types related to processing transfer tasks.

use crate::{
    error::TransferError,
    reference::Reference,
    status::StatusSlot,
    utils,
};

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use teloxide::{types::UserId, utils::html};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Process-unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a `TransferTask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for the user's worker.
    Queued,
    /// Being processed.
    Running,
    /// Stored remotely.
    Succeeded,
    /// Ended without a stored file.
    Failed,
}

/// A request created by a user, to be processed by their `Worker`.
pub struct TransferTask {
    /// Identifier used in logs and temp directory names.
    pub id: TaskId,
    /// Owner of the task.
    pub user: UserId,
    /// What to fetch.
    pub reference: Reference,
    /// When the request was accepted.
    pub created_at: DateTime<Utc>,
    /// Message edited with progress and the final outcome.
    pub status: Arc<dyn StatusSlot>,
    /// Fired on `/cancel` or shutdown.
    pub cancellation_token: CancellationToken,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Channel to send the outcome back to the sender.
    pub return_channel: Option<oneshot::Sender<TerminalStatus>>,
}

impl fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferTask")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("reference", &self.reference.raw())
            .field("created_at", &self.created_at)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A file produced by a source adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    /// Location inside the task's directory.
    pub path: PathBuf,
    /// Size on disk.
    pub size: u64,
    /// Mime type reported by the source, if any.
    pub mime_type: Option<String>,
}

impl Fetched {
    /// File name component of `path`.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned())
    }
}

/// A file placed in the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uploaded {
    /// Remote file name.
    pub name: String,
    /// Remote size in bytes (0 when the store does not say).
    pub size: u64,
    /// Shareable link.
    pub link: String,
}

/// Volume and duration of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseStats {
    /// Bytes moved.
    pub bytes: u64,
    /// Wall time spent.
    pub elapsed: Duration,
}

impl PhaseStats {
    /// Average throughput in bytes per second.
    pub fn throughput(&self) -> u64 {
        utils::bytes_per_second(self.bytes, self.elapsed)
    }

    /// `3s at 1.20 MiB/s`.
    fn describe(&self) -> String {
        format!(
            "{} at {}/s",
            utils::human_duration(self.elapsed),
            utils::human_bytes(self.throughput())
        )
    }
}

/// What a successful task produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Stored file name.
    pub file_name: String,
    /// Stored size.
    pub size: u64,
    /// Shareable link.
    pub link: String,
    /// Fetch phase, absent for remote clones.
    pub fetch: Option<PhaseStats>,
    /// Upload phase, absent for remote clones.
    pub upload: Option<PhaseStats>,
}

/// Final outcome of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    /// File is stored remotely.
    Succeeded(Summary),
    /// Nothing was stored.
    Failed {
        /// The user's original input.
        reference: String,
        /// Why.
        error: TransferError,
    },
}

impl TerminalStatus {
    /// Whether the task stored a file.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// Render the terminal status message.
    pub fn render(&self) -> String {
        match self {
            Self::Succeeded(summary) => {
                let mut lines = vec![
                    format!("✅ <b>Uploaded</b> <code>{}</code>", html::escape(&summary.file_name)),
                    format!("Size: {}", utils::human_bytes(summary.size)),
                ];
                if let Some(fetch) = &summary.fetch {
                    lines.push(format!("Download: {}", fetch.describe()));
                }
                if let Some(upload) = &summary.upload {
                    lines.push(format!("Upload: {}", upload.describe()));
                }
                lines.push(format!(
                    "<a href=\"{}\">Open in Drive</a>",
                    html::escape(&summary.link)
                ));
                lines.join("\n")
            }
            Self::Failed { reference, error } => {
                let headline = if *error == TransferError::Cancelled {
                    "🚫 <b>Cancelled</b>"
                } else {
                    "❌ <b>Failed</b>"
                };
                format!(
                    "{headline}\n{}\n\nReference: <code>{}</code>",
                    html::escape(&error.to_string()),
                    html::escape(reference)
                )
            }
        }
    }
}
