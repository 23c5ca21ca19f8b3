//! Per-transfer notices for the bot's operators.

use crate::{error::TransportError, task::Summary};

use std::time::Duration;

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{Recipient, UserId},
    utils::html,
};

/// Somewhere to post a line after each finished transfer.
#[async_trait]
pub trait StatsChannel: Send + Sync {
    /// Post `text`.
    async fn post(&self, text: String) -> Result<(), TransportError>;
}

/// Posts notices into a Telegram chat.
pub struct TelegramStats {
    bot: Bot,
    chat: Recipient,
}

impl TelegramStats {
    /// Create a channel posting into `chat`.
    pub const fn new(bot: Bot, chat: Recipient) -> Self {
        Self { bot, chat }
    }
}

#[async_trait]
impl StatsChannel for TelegramStats {
    async fn post(&self, text: String) -> Result<(), TransportError> {
        self.bot
            .send_message(self.chat.clone(), text)
            .parse_mode(teloxide::types::ParseMode::Html)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }
}

/// `📊 Process Stats: User 42 | Downloaded a.iso in 12.34s`.
pub fn render_stats(user: UserId, summary: &Summary, elapsed: Duration) -> String {
    let verb = if summary.fetch.is_some() {
        "Downloaded"
    } else {
        "Cloned"
    };
    format!(
        "📊 Process Stats: User {user} | {verb} <code>{}</code> in {:.2}s",
        html::escape(&summary.file_name),
        elapsed.as_secs_f64()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        task::PhaseStats,
        test_support::{Reply, bot, bot_message, serve},
    };

    use teloxide::types::ChatId;

    fn summary(fetched: bool) -> Summary {
        Summary {
            file_name: "a<b>.iso".to_string(),
            size: 10,
            link: "https://drive.google.com/file/d/x/view".to_string(),
            fetch: fetched.then_some(PhaseStats {
                bytes: 10,
                elapsed: Duration::from_secs(1),
            }),
            upload: None,
        }
    }

    #[test]
    fn notices_name_user_file_and_time() {
        assert_eq!(
            render_stats(UserId(42), &summary(true), Duration::from_millis(12_346)),
            "📊 Process Stats: User 42 | Downloaded <code>a&lt;b&gt;.iso</code> in 12.35s"
        );
        assert!(
            render_stats(UserId(42), &summary(false), Duration::from_secs(1))
                .contains("| Cloned ")
        );
    }

    #[tokio::test]
    async fn notices_go_to_the_configured_chat() {
        let server = serve(|_| {
            Reply::json(&serde_json::json!({
                "ok": true,
                "result": bot_message(-100_123, 1, "stats")
            }))
        })
        .await;

        TelegramStats::new(bot(&server), Recipient::Id(ChatId(-100_123)))
            .post("stats".to_string())
            .await
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].path.ends_with("/sendMessage"));
        assert_eq!(requests[0].json()["chat_id"], -100_123);
    }
}
