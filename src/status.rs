//! The single chat message a task keeps editing.

use crate::error::TransportError;

use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;
use teloxide::{
    ApiError, RequestError,
    prelude::*,
    types::{MessageId, ParseMode},
};

/// Edits a terminal message may take before falling back to a new message.
const TERMINAL_ATTEMPTS: usize = 3;

/// Longest flood-control delay we are willing to sit out.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// A message slot that can be overwritten with HTML text.
#[async_trait]
pub trait StatusSlot: Send + Sync {
    /// Replace the slot's contents.
    async fn edit(&self, text: String) -> Result<(), TransportError>;

    /// Post `text` as a new message next to the slot.
    async fn repost(&self, text: String) -> Result<(), TransportError> {
        let _ = text;
        Err(TransportError::Rejected(
            "this slot cannot post new messages".to_string(),
        ))
    }
}

/// Render a task's terminal message into `slot`.
///
/// Flood control is waited out a few times; after that, or on any other
/// refusal, the text is posted as a new message.
pub async fn deliver(slot: &dyn StatusSlot, text: String) -> Result<(), TransportError> {
    for attempt in 1..=TERMINAL_ATTEMPTS {
        match slot.edit(text.clone()).await {
            Ok(()) => return Ok(()),
            Err(TransportError::RetryAfter(delay)) if attempt < TERMINAL_ATTEMPTS => {
                tracing::debug!("terminal edit rate limited, retrying in {delay:?}");
                tokio::time::sleep(delay.min(MAX_RETRY_DELAY)).await;
            }
            Err(e) => {
                tracing::debug!("terminal edit failed ({e}), posting a new message");
                break;
            }
        }
    }

    slot.repost(text).await
}

/// Map a Bot API failure.
fn transport_error(error: RequestError) -> TransportError {
    match error {
        RequestError::RetryAfter(seconds) => TransportError::RetryAfter(seconds.duration()),
        other => TransportError::Rejected(other.to_string()),
    }
}

/// A Telegram message used as a status slot.
pub struct TelegramStatus {
    bot: Bot,
    chat_id: ChatId,
    message_id: MessageId,
    /// Telegram rejects edits that do not change anything.
    last_text: Mutex<String>,
}

impl TelegramStatus {
    /// Wrap an already sent message.
    pub fn new(bot: Bot, chat_id: ChatId, message_id: MessageId) -> Self {
        Self {
            bot,
            chat_id,
            message_id,
            last_text: Mutex::new(String::new()),
        }
    }

    /// The text the message is known to show.
    fn last_text(&self) -> std::sync::MutexGuard<'_, String> {
        self.last_text
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl StatusSlot for TelegramStatus {
    async fn edit(&self, text: String) -> Result<(), TransportError> {
        if *self.last_text() == text {
            return Ok(());
        }

        match self
            .bot
            .edit_message_text(self.chat_id, self.message_id, text.clone())
            .parse_mode(ParseMode::Html)
            .await
        {
            Ok(_) | Err(RequestError::Api(ApiError::MessageNotModified)) => {
                *self.last_text() = text;
                Ok(())
            }
            Err(e) => Err(transport_error(e)),
        }
    }

    async fn repost(&self, text: String) -> Result<(), TransportError> {
        self.bot
            .send_message(self.chat_id, text)
            .parse_mode(ParseMode::Html)
            .await
            .map(|_| ())
            .map_err(transport_error)
    }
}
