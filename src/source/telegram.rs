//! Files attached to chat messages, fetched through the Bot API.

use super::{SourceAdapter, choose_name, guess_mime, write_stream};
use crate::{
    error::TransferError, progress::ProgressSink, reference::Reference, task::Fetched, utils,
};

use std::path::Path;

use async_trait::async_trait;
use teloxide::{net::Download, prelude::*, types::FileId};
use tokio::select;
use tokio_util::sync::CancellationToken;

/// Downloads attachments with `getFile` and the Bot API file endpoint.
pub struct TelegramSource {
    bot: Bot,
}

impl TelegramSource {
    /// Create a new `TelegramSource`.
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl SourceAdapter for TelegramSource {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn fetch(
        &self,
        reference: &Reference,
        destination: &Path,
        progress: &ProgressSink,
        cancellation_token: &CancellationToken,
    ) -> Result<Fetched, TransferError> {
        let attachment = reference
            .attachment()
            .ok_or_else(|| TransferError::transfer("reference has no attached file"))?;

        let file = select! {
            biased;
            () = cancellation_token.cancelled() => return Err(TransferError::Cancelled),
            file = self.bot.get_file(FileId(attachment.file_id.clone())) => file,
        }
        .map_err(|e| TransferError::transfer(format!("could not locate the file: {e}")))?;

        let server_name = Path::new(&file.path)
            .file_name()
            .and_then(|n| utils::sanitize_file_name(&n.to_string_lossy()));
        let name = choose_name(
            reference,
            &[
                attachment
                    .file_name
                    .as_deref()
                    .and_then(utils::sanitize_file_name),
                server_name,
            ],
        );
        let path = destination.join(&name);

        let total = Some(attachment.size)
            .filter(|&s| s > 0)
            .or_else(|| Some(u64::from(file.meta.size)).filter(|&s| s > 0));

        let size = write_stream(
            self.bot.download_file_stream(&file.path),
            &path,
            total,
            progress,
            cancellation_token,
        )
        .await?;

        Ok(Fetched {
            mime_type: attachment.mime_type.clone().or_else(|| guess_mime(&path)),
            path,
            size,
        })
    }
}
