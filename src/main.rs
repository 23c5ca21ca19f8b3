mod access;
mod bot;
mod commands;
mod env;
mod error;
mod orchestrator;
mod progress;
mod reference;
mod source;
mod stats;
mod status;
mod storage;
mod task;
mod task_manager;
mod utils;
mod worker;

#[cfg(test)]
mod test_support;

use color_eyre::eyre::WrapErr;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{EnvFilter, fmt::time::OffsetTime};

/// Starts the application.
fn main() -> color_eyre::Result<()> {
    // a missing .env file is fine, the variables may come from the environment
    let _ = dotenvy::dotenv();
    color_eyre::install()?;

    // the local offset can only be read while the process is single-threaded
    let timer = OffsetTime::local_rfc_3339()
        .unwrap_or_else(|_| OffsetTime::new(time::UtcOffset::UTC, Rfc3339));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_timer(timer)
        .init();

    tracing::info!("application started");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("could not start the runtime")?
        .block_on(bot::start())
        .wrap_err("bot crashed")
}
