//! Bot logic.

use crate::{
    access::{self, AccessGuard},
    env,
    reference::{AttachedFile, Classifier, Workflow},
    status::{StatusSlot, TelegramStatus},
    task_manager::TaskManager,
    utils,
};

use std::sync::Arc;

use color_eyre::eyre::Context;
use teloxide::{
    prelude::*,
    sugar::request::RequestReplyExt,
    types::{MessageKind, ParseMode},
    utils::{command::BotCommands, html},
};

#[derive(BotCommands, Clone, Debug)]
#[command(
    rename_rule = "lowercase",
    description = "Send me a link or a file and I will put it in Google Drive.\n\
    Use link|name to choose the file name.\n\n\
    The following commands are supported:"
)]
pub enum Command {
    #[command(description = "display this text.", aliases = ["start"])]
    Help,
    #[command(description = "show your queued and running transfers.")]
    Status,
    #[command(description = "download a link and upload it to Drive.")]
    Download(String),
    #[command(description = "download from a media site (YouTube, Vimeo, ...) with yt-dlp.")]
    Ytdl(String),
    #[command(description = "cancel your running and queued transfers.")]
    Cancel,
}

/// Answer a plaintext message (by wrapping it in `Command::Download`).
pub async fn answer_plaintext(
    bot: Bot,
    msg: Message,
    task_manager: TaskManager,
    guard: Arc<dyn AccessGuard>,
    classifier: Arc<Classifier>,
) -> color_eyre::Result<()> {
    let text = msg.text().unwrap_or_default().to_owned();

    // stay quiet in groups unless there is something to fetch
    if !msg.chat.is_private() && utils::find_urls(&text).is_empty() {
        return Ok(());
    }

    answer_command(bot, msg, Command::Download(text), task_manager, guard, classifier).await
}

/// Answer a message carrying a file.
pub async fn answer_attachment(
    bot: Bot,
    msg: Message,
    task_manager: TaskManager,
    guard: Arc<dyn AccessGuard>,
    classifier: Arc<Classifier>,
) -> color_eyre::Result<()> {
    let Some(attached) = attachment_of(&msg) else {
        return Ok(());
    };
    let caption = msg.caption().unwrap_or_default().to_owned();

    let answer = if is_ignored(&msg) {
        Answer::Nothing
    } else {
        Answer::StartTransfer {
            text: caption,
            workflow: Workflow::Link,
            attached: Some(attached),
        }
    };

    Box::pin(handle_answer(
        &bot,
        &msg,
        &task_manager,
        guard.as_ref(),
        &classifier,
        answer,
    ))
    .await
}

/// Whether a message should be turned into an attachment transfer.
pub fn has_attachment(msg: &Message) -> bool {
    attachment_of(msg).is_some()
}

/// Possible answers to a command.
enum Answer {
    Nothing,
    SendMessage {
        text: String,
    },
    StartTransfer {
        text: String,
        workflow: Workflow,
        attached: Option<AttachedFile>,
    },
    Cancel,
}

/// Answer a `Command`, starting with the entrypoint.
pub async fn answer_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    task_manager: TaskManager,
    guard: Arc<dyn AccessGuard>,
    classifier: Arc<Classifier>,
) -> color_eyre::Result<()> {
    let answer = answer_entrypoint(&msg, &cmd, &task_manager);
    Box::pin(handle_answer(
        &bot,
        &msg,
        &task_manager,
        guard.as_ref(),
        &classifier,
        answer,
    ))
    .await
}

/// Internal implementation of answering a `Command`.
async fn handle_answer(
    bot: &Bot,
    msg: &Message,
    task_manager: &TaskManager,
    guard: &dyn AccessGuard,
    classifier: &Classifier,
    answer: Answer,
) -> color_eyre::Result<()> {
    let send_msg = async |text: String| -> color_eyre::Result<Message> {
        bot.send_message(msg.chat.id, text)
            .reply_to(msg.id)
            .parse_mode(ParseMode::Html)
            .await
            .wrap_err("failed to send message")
    };

    let Some(user) = msg.from.as_ref().map(|u| u.id) else {
        return Ok(());
    };

    match answer {
        Answer::Nothing => Ok(()),
        Answer::SendMessage { text } => send_msg(text).await.map(|_| ()),
        Answer::Cancel => {
            let text = match task_manager.cancel(user) {
                0 => "You have no transfers to cancel.".to_string(),
                n => format!("Cancelling {n} transfer(s)."),
            };
            send_msg(text).await.map(|_| ())
        }
        Answer::StartTransfer {
            text,
            workflow,
            attached,
        } => {
            if let Err(e) = access::admit(guard, user).await {
                tracing::info!("user {user} refused: {e}");
                return send_msg(html::escape(&e.to_string())).await.map(|_| ());
            }

            let reply = send_msg("Checking link...".to_string()).await?;
            let status: Arc<dyn StatusSlot> =
                Arc::new(TelegramStatus::new(bot.clone(), msg.chat.id, reply.id));

            let reference = match classifier.classify(&text, attached, workflow) {
                Ok(reference) => reference,
                Err(e) => {
                    status
                        .edit(with_contact(&html::escape(&e.to_string())))
                        .await
                        .wrap_err("failed to report classification error")?;
                    return Ok(());
                }
            };

            let ahead = task_manager.get_user_queue_size(user);
            if ahead > 0 {
                status
                    .edit(queued_text(ahead))
                    .await
                    .wrap_err("failed to report queue position")?;
            }
            if reference.looks_like_media_site() {
                send_msg(
                    "This looks like a media site. If the download fails, try \
                    <code>/ytdl</code> with the same link."
                        .to_string(),
                )
                .await?;
            }

            let enqueued = task_manager.enqueue(user, reference, status);
            let outcome = enqueued
                .outcome
                .await
                .wrap_err("internal error: channel closed")?;
            tracing::debug!(
                "task {} of user {user} answered (success: {})",
                enqueued.id,
                outcome.is_success()
            );

            Ok(())
        }
    }
}

/// Starting point for answering a `Command`.
fn answer_entrypoint(msg: &Message, cmd: &Command, task_manager: &TaskManager) -> Answer {
    if is_ignored(msg) {
        return Answer::Nothing;
    }

    match cmd {
        Command::Help => Answer::SendMessage {
            text: html::escape(&Command::descriptions().to_string()),
        },
        Command::Status => {
            let mine = msg
                .from
                .as_ref()
                .map_or(0, |u| task_manager.get_user_queue_size(u.id));
            Answer::SendMessage {
                text: status_text(
                    mine,
                    task_manager.get_queue_size(),
                    task_manager.active_users(),
                ),
            }
        }
        Command::Cancel => Answer::Cancel,
        Command::Download(text) | Command::Ytdl(text) => {
            let workflow = if matches!(cmd, Command::Ytdl(_)) {
                Workflow::MediaSite
            } else {
                Workflow::Link
            };

            match link_text(msg, text) {
                Some(text) => Answer::StartTransfer {
                    text,
                    workflow,
                    attached: None,
                },
                None => Answer::SendMessage {
                    text: missing_link_text(workflow),
                },
            }
        }
    }
}

/// Pins, polls and group forwards are not requests.
fn is_ignored(msg: &Message) -> bool {
    !matches!(msg.kind, MessageKind::Common(_))
        || (!msg.chat.is_private() && msg.forward_date().is_some())
}

/// The command's text, or the text of the message it replies to when that has a link.
fn link_text(msg: &Message, text: &str) -> Option<String> {
    let text = text.trim();
    if !utils::find_urls(text).is_empty() {
        return Some(text.to_string());
    }

    // will not work if the bot is in privacy mode: https://core.telegram.org/bots/features#privacy-mode
    let replied = msg
        .reply_to_message()
        .and_then(|reply| reply.text())
        .filter(|t| !utils::find_urls(t).is_empty());

    match replied {
        Some(replied) => Some(replied.trim().to_string()),
        None if text.is_empty() => None,
        // let the classifier explain what is wrong
        None => Some(text.to_string()),
    }
}

/// Extract the file a message carries, if any.
pub fn attachment_of(msg: &Message) -> Option<AttachedFile> {
    if let Some(doc) = msg.document() {
        return Some(AttachedFile {
            file_id: doc.file.id.0.clone(),
            file_name: doc.file_name.clone(),
            mime_type: doc.mime_type.as_ref().map(ToString::to_string),
            size: u64::from(doc.file.size),
        });
    }
    if let Some(video) = msg.video() {
        return Some(AttachedFile {
            file_id: video.file.id.0.clone(),
            file_name: video.file_name.clone(),
            mime_type: video.mime_type.as_ref().map(ToString::to_string),
            size: u64::from(video.file.size),
        });
    }
    if let Some(audio) = msg.audio() {
        return Some(AttachedFile {
            file_id: audio.file.id.0.clone(),
            file_name: audio.file_name.clone(),
            mime_type: audio.mime_type.as_ref().map(ToString::to_string),
            size: u64::from(audio.file.size),
        });
    }

    // sizes are listed smallest first
    msg.photo().and_then(<[_]>::last).map(|photo| AttachedFile {
        file_id: photo.file.id.0.clone(),
        file_name: None,
        mime_type: Some("image/jpeg".to_string()),
        size: u64::from(photo.file.size),
    })
}

/// Append the maintainer's handle, when configured.
fn with_contact(text: &str) -> String {
    env::MAINTAINER.as_ref().map_or_else(
        || text.to_string(),
        |maintainer| format!("{text}\n\nFor more information, please contact {maintainer}."),
    )
}

/// Message shown while waiting behind other tasks.
fn queued_text(ahead: usize) -> String {
    format!("Request accepted.\nYour position in the queue: {ahead}.")
}

/// Reply to `/status`.
fn status_text(mine: usize, total: usize, users: usize) -> String {
    format!("Your transfers: {mine}.\nActive transfers on this bot: {total} (users: {users}).")
}

/// Reply to a download command without a link.
fn missing_link_text(workflow: Workflow) -> String {
    let command = match workflow {
        Workflow::Link => "/download",
        Workflow::MediaSite => "/ytdl",
    };
    format!("Please provide a link: <code>{command} &lt;link&gt;</code>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        access::EnvAccessGuard,
        orchestrator::{Orchestrator, ProgressSettings},
        source::{Sources, http::HttpSource, telegram::TelegramSource},
        storage::drive::{DriveCredentials, DriveRelay},
        task_manager::TaskManagerInner,
        test_support::{Reply, Server, bot, bot_message, serve},
    };

    use std::{collections::HashSet, time::Duration};

    /// Bot API accepting every message and edit.
    async fn chat() -> Server {
        serve(|req| {
            let text = req.json()["text"].as_str().unwrap_or_default().to_string();
            Reply::json(&serde_json::json!({
                "ok": true,
                "result": bot_message(42, 2, &text)
            }))
        })
        .await
    }

    /// A manager whose transfers would go nowhere; the tests never get that far.
    fn task_manager(bot: &Bot, download_dir: &std::path::Path) -> TaskManager {
        let client = reqwest::Client::new();
        let direct = Arc::new(HttpSource::new(client.clone()));
        let orchestrator = Orchestrator::new(
            Sources {
                direct: direct.clone(),
                media: direct,
                platform: Arc::new(TelegramSource::new(bot.clone())),
            },
            Arc::new(DriveRelay::new(
                client,
                DriveCredentials::AccessToken("unused".to_string()),
                None,
            )),
            download_dir.to_path_buf(),
            ProgressSettings {
                interval: Duration::from_secs(1),
                stall_timeout: Duration::from_secs(60),
            },
        );
        Arc::new(TaskManagerInner::new(orchestrator, Duration::from_secs(60))).into()
    }

    fn transfer(text: &str) -> Answer {
        Answer::StartTransfer {
            text: text.to_string(),
            workflow: Workflow::Link,
            attached: None,
        }
    }

    /// Bot API methods called so far.
    fn methods(server: &Server) -> Vec<String> {
        server
            .requests()
            .iter()
            .map(|r| r.path.rsplit('/').next().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn banned_users_get_one_denial_and_no_task() {
        let server = chat().await;
        let bot = bot(&server);
        let dir = tempfile::tempdir().unwrap();
        let task_manager = task_manager(&bot, dir.path());
        let guard = EnvAccessGuard::new(
            bot.clone(),
            HashSet::from([UserId(42)]),
            HashSet::new(),
            None,
        );
        let msg = message(serde_json::json!({"text": "https://example.com/a.iso"}));

        handle_answer(
            &bot,
            &msg,
            &task_manager,
            &guard,
            &Classifier::default(),
            transfer("https://example.com/a.iso"),
        )
        .await
        .unwrap();

        assert_eq!(methods(&server), vec!["sendMessage"]);
        let denial = server.requests()[0].json();
        assert_eq!(denial["text"], "You are banned from using this bot.");
        assert_eq!(denial["chat_id"], 42);
        assert_eq!(task_manager.get_queue_size(), 0);
        assert_eq!(task_manager.active_users(), 0);
    }

    #[tokio::test]
    async fn unusable_input_is_explained_in_the_status() {
        let server = chat().await;
        let bot = bot(&server);
        let dir = tempfile::tempdir().unwrap();
        let task_manager = task_manager(&bot, dir.path());
        let guard = EnvAccessGuard::new(bot.clone(), HashSet::new(), HashSet::new(), None);
        let msg = message(serde_json::json!({"text": "not a link"}));

        handle_answer(
            &bot,
            &msg,
            &task_manager,
            &guard,
            &Classifier::default(),
            transfer("not a link"),
        )
        .await
        .unwrap();

        assert_eq!(methods(&server), vec!["sendMessage", "editMessageText"]);
        let requests = server.requests();
        assert_eq!(requests[0].json()["text"], "Checking link...");
        let explained = requests[1].json();
        assert_eq!(explained["message_id"], 2);
        assert!(
            explained["text"]
                .as_str()
                .unwrap()
                .starts_with("unrecognised reference"),
            "{explained}"
        );
        assert_eq!(task_manager.get_queue_size(), 0);
    }

    fn message(extra: serde_json::Value) -> Message {
        let mut json = serde_json::json!({
            "message_id": 1,
            "date": 1_700_000_000,
            "chat": {"id": 42, "type": "private", "first_name": "Ada"},
            "from": {"id": 42, "is_bot": false, "first_name": "Ada"},
        });
        for (key, value) in extra.as_object().unwrap() {
            json[key] = value.clone();
        }
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn documents_are_attachments() {
        let msg = message(serde_json::json!({
            "document": {
                "file_id": "BQACAgIAAxkBAAI",
                "file_unique_id": "AgADBAAD",
                "file_size": 2048,
                "file_name": "report.pdf",
                "mime_type": "application/pdf"
            },
            "caption": "|renamed.pdf"
        }));

        assert!(has_attachment(&msg));
        assert_eq!(
            attachment_of(&msg),
            Some(AttachedFile {
                file_id: "BQACAgIAAxkBAAI".to_string(),
                file_name: Some("report.pdf".to_string()),
                mime_type: Some("application/pdf".to_string()),
                size: 2048,
            })
        );
    }

    #[test]
    fn largest_photo_is_taken() {
        let msg = message(serde_json::json!({
            "photo": [
                {"file_id": "small", "file_unique_id": "s", "file_size": 100, "width": 90, "height": 90},
                {"file_id": "large", "file_unique_id": "l", "file_size": 9000, "width": 1280, "height": 1280}
            ]
        }));

        let attached = attachment_of(&msg).unwrap();
        assert_eq!(attached.file_id, "large");
        assert_eq!(attached.size, 9000);
    }

    #[test]
    fn text_is_not_an_attachment() {
        let msg = message(serde_json::json!({"text": "https://example.com/a.zip"}));
        assert!(!has_attachment(&msg));
        assert_eq!(
            link_text(&msg, "https://example.com/a.zip").as_deref(),
            Some("https://example.com/a.zip")
        );
        assert_eq!(link_text(&msg, "  "), None);
        assert_eq!(link_text(&msg, "not a link").as_deref(), Some("not a link"));
    }

    #[test]
    fn replies_supply_the_link() {
        let msg = message(serde_json::json!({
            "text": "/download",
            "reply_to_message": {
                "message_id": 0,
                "date": 1_699_999_999,
                "chat": {"id": 42, "type": "private", "first_name": "Ada"},
                "text": "grab https://example.com/b.iso please"
            }
        }));
        assert_eq!(
            link_text(&msg, "").as_deref(),
            Some("grab https://example.com/b.iso please")
        );
    }

    #[test]
    fn canned_texts() {
        assert_eq!(
            missing_link_text(Workflow::MediaSite),
            "Please provide a link: <code>/ytdl &lt;link&gt;</code>"
        );
        assert!(queued_text(2).contains("position in the queue: 2"));
        assert_eq!(
            status_text(1, 3, 2),
            "Your transfers: 1.\nActive transfers on this bot: 3 (users: 2)."
        );
    }
}
