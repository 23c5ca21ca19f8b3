//! Bot startup schema.

use crate::{
    access::{self, AccessGuard, EnvAccessGuard},
    commands::{self, Command},
    env,
    orchestrator::{Orchestrator, ProgressSettings},
    reference::Classifier,
    source::{
        SourceAdapter, Sources, WorkerPool, aria2::Aria2Source, http::HttpSource,
        telegram::TelegramSource, ytdl::YtdlSource,
    },
    stats::TelegramStats,
    storage::drive::{DriveCredentials, DriveRelay},
    task_manager::{TaskManager, TaskManagerInner},
};

use std::{fmt::Debug, sync::Arc};

use color_eyre::eyre::{WrapErr, eyre};
use futures::future::BoxFuture;
use teloxide::{dispatching::UpdateHandler, error_handlers::ErrorHandler, prelude::*};

/// Start the bot.
pub async fn start() -> color_eyre::Result<()> {
    // create the main bot instance
    let bot = Bot::from_env();

    // create a task manager
    let orchestrator = orchestrator(&bot)?;
    let task_manager_inner = Arc::new(TaskManagerInner::new(
        orchestrator,
        *env::QUEUE_IDLE_TIMEOUT,
    ));
    let task_manager_public: TaskManager = task_manager_inner.clone().into();

    let guard: Arc<dyn AccessGuard> = Arc::new(EnvAccessGuard::new(
        bot.clone(),
        access::parse_user_ids(&env::BANNED_USERS),
        access::parse_user_ids(&env::AUTH_USERS),
        env::FORCE_SUB_CHANNEL
            .as_deref()
            .and_then(access::parse_channel),
    ));
    let classifier = Arc::new(Classifier::new(env::MEDIA_SITES.iter().cloned()));

    let mut dispatcher = Dispatcher::builder(bot, schema())
        .distribution_function(|_| None::<std::convert::Infallible>) // always process in parallel
        .dependencies(dptree::deps![task_manager_public, guard, classifier])
        .error_handler(TracingErrorHandler::new())
        .enable_ctrlc_handler()
        .build();

    tracing::info!("dispatcher started");
    dispatcher.dispatch().await;

    task_manager_inner.stop();
    tracing::info!("dispatcher stopped");

    Ok(())
}

/// Assemble sources and the relay from the environment.
fn orchestrator(bot: &Bot) -> color_eyre::Result<Orchestrator> {
    let client = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .wrap_err("could not build HTTP client")?;
    let pool = WorkerPool::new(*env::WORKER_POOL_SIZE);
    tracing::debug!("worker pool has {} slots", pool.available());

    let direct: Arc<dyn SourceAdapter> = match env::ARIA2_RPC_URL.as_ref() {
        Some(endpoint) => {
            tracing::info!("direct downloads go through aria2 at {endpoint}");
            Arc::new(Aria2Source::new(
                client.clone(),
                endpoint.clone(),
                env::ARIA2_SECRET.clone(),
                *env::POLL_INTERVAL,
                pool.clone(),
            ))
        }
        None => Arc::new(HttpSource::new(client.clone())),
    };

    let ytdl_program = env::YTDL_BINARY
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    if which::which(&ytdl_program).is_err() {
        tracing::warn!("{ytdl_program} not found, /ytdl will fail");
    }

    let sources = Sources {
        direct,
        media: Arc::new(YtdlSource::new(&env::YTDL_BINARY, pool)),
        platform: Arc::new(TelegramSource::new(bot.clone())),
    };

    // Drive answers 308 to partial uploads
    let drive_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .wrap_err("could not build Drive client")?;
    let relay = DriveRelay::new(
        drive_client,
        drive_credentials()?,
        env::GDRIVE_PARENT_ID.clone(),
    );

    let orchestrator = Orchestrator::new(
        sources,
        Arc::new(relay),
        env::DOWNLOAD_DIRECTORY.clone(),
        ProgressSettings {
            interval: *env::PROGRESS_INTERVAL,
            stall_timeout: *env::STALL_TIMEOUT,
        },
    );

    Ok(
        match env::STATS_CHAT.as_deref().and_then(access::parse_channel) {
            Some(chat) => {
                tracing::info!("transfer stats go to {chat:?}");
                orchestrator.with_stats(Arc::new(TelegramStats::new(bot.clone(), chat)))
            }
            None => orchestrator,
        },
    )
}

/// Pick Drive credentials from the environment.
fn drive_credentials() -> color_eyre::Result<DriveCredentials> {
    if let Some(token) = env::GDRIVE_ACCESS_TOKEN.as_ref() {
        return Ok(DriveCredentials::AccessToken(token.clone()));
    }

    match (
        env::GDRIVE_CLIENT_ID.as_ref(),
        env::GDRIVE_CLIENT_SECRET.as_ref(),
        env::GDRIVE_REFRESH_TOKEN.as_ref(),
    ) {
        (Some(client_id), Some(client_secret), Some(refresh_token)) => {
            Ok(DriveCredentials::RefreshToken {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                refresh_token: refresh_token.clone(),
            })
        }
        _ => Err(eyre!(
            "Drive credentials missing: set GDRIVE_ACCESS_TOKEN or \
            GDRIVE_CLIENT_ID, GDRIVE_CLIENT_SECRET and GDRIVE_REFRESH_TOKEN"
        )),
    }
}

/// Define routes for the bot.
fn schema() -> UpdateHandler<color_eyre::Report> {
    dptree::entry().chain(
        Update::filter_message()
            .branch(
                dptree::entry()
                    .filter_command::<Command>()
                    .endpoint(commands::answer_command),
            )
            .branch(
                dptree::filter(|msg: Message| commands::has_attachment(&msg))
                    .endpoint(commands::answer_attachment),
            )
            .branch(dptree::endpoint(commands::answer_plaintext)),
    )
}

/// A logging error handler that utilises `tracing`.
struct TracingErrorHandler {}

impl TracingErrorHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {})
    }
}

impl<E> ErrorHandler<E> for TracingErrorHandler
where
    E: Debug,
{
    fn handle_error(self: Arc<Self>, error: E) -> BoxFuture<'static, ()> {
        tracing::error!("{error:#?}");
        Box::pin(async {})
    }
}
