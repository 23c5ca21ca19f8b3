//! Environment variables used throughout the project.

use std::{path::PathBuf, sync::LazyLock, time::Duration};

/// Read a variable, treating empty values as unset.
fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Read a number of seconds, falling back to `default` when unset or unparseable.
fn seconds(name: &str, default: u64) -> Duration {
    Duration::from_secs(var(name).and_then(|s| s.parse().ok()).unwrap_or(default))
}

/// Where per-task directories are created.
pub static DOWNLOAD_DIRECTORY: LazyLock<PathBuf> = LazyLock::new(|| {
    var("DOWNLOAD_DIRECTORY").map_or_else(|| PathBuf::from("./downloads"), PathBuf::from)
});

/// Users allowed to use the bot; empty means everyone.
/// Env var format: `123,456`.
pub static AUTH_USERS: LazyLock<String> =
    LazyLock::new(|| var("AUTH_USERS").unwrap_or_default());

/// Users refused outright. Same format as `AUTH_USERS`.
pub static BANNED_USERS: LazyLock<String> =
    LazyLock::new(|| var("BANNED_USERS").unwrap_or_default());

/// Channel users must join first, `@name` or a numeric id.
pub static FORCE_SUB_CHANNEL: LazyLock<Option<String>> =
    LazyLock::new(|| var("FORCE_SUB_CHANNEL"));

/// Application instance's maintainer handle.
pub static MAINTAINER: LazyLock<Option<String>> =
    LazyLock::new(|| var("MAINTAINER").map(|s| format!("@{}", s.trim_start_matches('@'))));

/// Chat receiving a notice after every finished transfer, `@name` or a numeric id.
pub static STATS_CHAT: LazyLock<Option<String>> = LazyLock::new(|| var("STATS_CHAT"));

/// Sites whose links are better handled by `/ytdl`.
/// Env var format: `site1.com,site2.net`.
pub static MEDIA_SITES: LazyLock<Vec<String>> = LazyLock::new(|| {
    var("MEDIA_SITES")
        .unwrap_or_else(|| {
            "youtube.com,youtu.be,vimeo.com,twitter.com,x.com,instagram.com,tiktok.com".to_string()
        })
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
});

/// aria2 JSON-RPC endpoint; direct downloads go through it when set.
pub static ARIA2_RPC_URL: LazyLock<Option<String>> = LazyLock::new(|| var("ARIA2_RPC_URL"));

/// aria2 `--rpc-secret`.
pub static ARIA2_SECRET: LazyLock<Option<String>> = LazyLock::new(|| var("ARIA2_SECRET"));

/// Media extractor command line.
pub static YTDL_BINARY: LazyLock<String> =
    LazyLock::new(|| var("YTDL_BINARY").unwrap_or_else(|| "yt-dlp".to_string()));

/// Slots for extractor processes and aria2 polling.
pub static WORKER_POOL_SIZE: LazyLock<usize> = LazyLock::new(|| {
    var("WORKER_POOL_SIZE")
        .and_then(|s| s.parse().ok())
        .unwrap_or(4)
});

/// Minimum time between progress edits.
pub static PROGRESS_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| seconds("PROGRESS_INTERVAL", 5));

/// aria2 polling interval.
pub static POLL_INTERVAL: LazyLock<Duration> = LazyLock::new(|| seconds("POLL_INTERVAL", 2));

/// A phase without progress for this long is aborted.
pub static STALL_TIMEOUT: LazyLock<Duration> = LazyLock::new(|| seconds("STALL_TIMEOUT", 300));

/// Idle workers are dropped after this long.
pub static QUEUE_IDLE_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| seconds("QUEUE_IDLE_TIMEOUT", 600));

/// Drive folder receiving uploads; the drive root when unset.
pub static GDRIVE_PARENT_ID: LazyLock<Option<String>> =
    LazyLock::new(|| var("GDRIVE_PARENT_ID"));

/// Pre-issued Drive access token.
pub static GDRIVE_ACCESS_TOKEN: LazyLock<Option<String>> =
    LazyLock::new(|| var("GDRIVE_ACCESS_TOKEN"));

/// OAuth client id used to refresh Drive tokens.
pub static GDRIVE_CLIENT_ID: LazyLock<Option<String>> = LazyLock::new(|| var("GDRIVE_CLIENT_ID"));

/// OAuth client secret used to refresh Drive tokens.
pub static GDRIVE_CLIENT_SECRET: LazyLock<Option<String>> =
    LazyLock::new(|| var("GDRIVE_CLIENT_SECRET"));

/// Long-lived refresh token.
pub static GDRIVE_REFRESH_TOKEN: LazyLock<Option<String>> =
    LazyLock::new(|| var("GDRIVE_REFRESH_TOKEN"));
