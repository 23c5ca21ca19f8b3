//! Who may use the bot.

use crate::error::TransferError;

use std::collections::HashSet;

use async_trait::async_trait;
use teloxide::{prelude::*, types::Recipient};

/// Access-control decisions for a user.
#[async_trait]
pub trait AccessGuard: Send + Sync {
    /// Whether `user` is banned.
    fn is_banned(&self, user: UserId) -> bool;

    /// Whether `user` may use the bot at all.
    fn is_authorized(&self, user: UserId) -> bool;

    /// Fails with `AccessDenied` when `user` has not joined the required channel.
    async fn check_forced_subscription(&self, user: UserId) -> Result<(), TransferError>;
}

/// Run every check in order: ban, authorization, subscription.
pub async fn admit(guard: &dyn AccessGuard, user: UserId) -> Result<(), TransferError> {
    if guard.is_banned(user) {
        return Err(TransferError::AccessDenied(
            "You are banned from using this bot.".to_string(),
        ));
    }
    if !guard.is_authorized(user) {
        return Err(TransferError::AccessDenied(
            "You are not authorized to use this bot.".to_string(),
        ));
    }
    guard.check_forced_subscription(user).await
}

/// Parse `123,456` into user ids, skipping garbage.
pub fn parse_user_ids(list: &str) -> HashSet<UserId> {
    list.split(',')
        .filter_map(|s| s.trim().parse().ok())
        .map(UserId)
        .collect()
}

/// Parse `@channel` or a numeric chat id.
pub fn parse_channel(channel: &str) -> Option<Recipient> {
    let channel = channel.trim();
    if channel.is_empty() {
        return None;
    }
    channel.parse::<i64>().map_or_else(
        |_| {
            let name = channel.trim_start_matches('@');
            Some(Recipient::ChannelUsername(format!("@{name}")))
        },
        |id| Some(Recipient::Id(ChatId(id))),
    )
}

/// Guard configured from lists of user ids and an optional channel.
pub struct EnvAccessGuard {
    bot: Bot,
    banned: HashSet<UserId>,
    /// Empty means everyone.
    authorized: HashSet<UserId>,
    channel: Option<Recipient>,
}

impl EnvAccessGuard {
    /// Create a new `EnvAccessGuard`.
    pub const fn new(
        bot: Bot,
        banned: HashSet<UserId>,
        authorized: HashSet<UserId>,
        channel: Option<Recipient>,
    ) -> Self {
        Self {
            bot,
            banned,
            authorized,
            channel,
        }
    }
}

#[async_trait]
impl AccessGuard for EnvAccessGuard {
    fn is_banned(&self, user: UserId) -> bool {
        self.banned.contains(&user)
    }

    fn is_authorized(&self, user: UserId) -> bool {
        self.authorized.is_empty() || self.authorized.contains(&user)
    }

    async fn check_forced_subscription(&self, user: UserId) -> Result<(), TransferError> {
        let Some(channel) = &self.channel else {
            return Ok(());
        };

        let joined = match self.bot.get_chat_member(channel.clone(), user).await {
            Ok(member) => member.kind.is_present(),
            // Telegram answers "user not found" for non-members
            Err(teloxide::RequestError::Api(e)) => {
                tracing::debug!("membership of user {user} unknown: {e}");
                false
            }
            Err(e) => {
                tracing::warn!("could not check membership of user {user}: {e}");
                return Ok(());
            }
        };

        if joined {
            Ok(())
        } else {
            Err(TransferError::AccessDenied(format!(
                "Please join {} to use this bot.",
                display_channel(channel)
            )))
        }
    }
}

/// Human-readable channel name.
fn display_channel(channel: &Recipient) -> String {
    match channel {
        Recipient::ChannelUsername(name) => name.clone(),
        Recipient::Id(id) => format!("the channel {id}"),
    }
}
