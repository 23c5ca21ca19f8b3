//! Error taxonomy of the transfer pipeline.

use std::{fmt::Display, time::Duration};

/// Reasons a transfer request can end without a stored file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// Banned user, unauthorised user or unmet forced subscription.
    #[error("{0}")]
    AccessDenied(String),
    /// The request did not contain anything that can be fetched.
    #[error("unrecognised reference: {0}")]
    UnrecognizedReference(String),
    /// A source adapter could not produce a local file.
    #[error("download failed: {reason}")]
    TransferFailed {
        /// Human-readable diagnosis.
        reason: String,
    },
    /// The storage relay could not place the file remotely.
    #[error("upload failed: {reason}")]
    UploadFailed {
        /// Human-readable diagnosis.
        reason: String,
    },
    /// The task was cancelled by the user or by shutdown.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Build a `TransferFailed` from anything printable.
    pub fn transfer(reason: impl Display) -> Self {
        Self::TransferFailed {
            reason: reason.to_string(),
        }
    }

    /// Build an `UploadFailed` from anything printable.
    pub fn upload(reason: impl Display) -> Self {
        Self::UploadFailed {
            reason: reason.to_string(),
        }
    }
}

/// The chat transport refused a status update.
///
/// Never fatal for the underlying transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Flood control; the update may be retried after the delay.
    #[error("status update rate limited for {0:?}")]
    RetryAfter(Duration),
    /// Anything else: deleted message, blocked bot, network failure...
    #[error("status update rejected: {0}")]
    Rejected(String),
}
