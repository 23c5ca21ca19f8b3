//! Drives one task from reference to stored file.

use crate::{
    error::TransferError,
    progress::{Phase, ProgressReporter, ProgressSink},
    source::{SourceAdapter, Sources, guess_mime},
    stats::{self, StatsChannel},
    status,
    storage::StorageRelay,
    task::{PhaseStats, Summary, TerminalStatus, TransferTask},
    utils,
};

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use teloxide::utils::html;
use tokio::{select, time::Instant};
use tokio_util::sync::CancellationToken;

/// Timing knobs for progress reporting.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSettings {
    /// Minimum time between two progress edits.
    pub interval: Duration,
    /// A phase without byte progress for this long is aborted.
    pub stall_timeout: Duration,
}

/// Sequences fetch, upload and cleanup for a task.
pub struct Orchestrator {
    sources: Sources,
    relay: Arc<dyn StorageRelay>,
    download_dir: PathBuf,
    settings: ProgressSettings,
    stats: Option<Arc<dyn StatsChannel>>,
}

impl Orchestrator {
    /// Create a new `Orchestrator` writing per-task directories under `download_dir`.
    pub fn new(
        sources: Sources,
        relay: Arc<dyn StorageRelay>,
        download_dir: PathBuf,
        settings: ProgressSettings,
    ) -> Self {
        Self {
            sources,
            relay,
            download_dir,
            settings,
            stats: None,
        }
    }

    /// Post a notice into `stats` after every successful task.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<dyn StatsChannel>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Process `task` and render its terminal message.
    pub async fn run(&self, task: &TransferTask) -> TerminalStatus {
        tracing::info!(
            "task {} of user {} started: {}",
            task.id,
            task.user,
            task.reference.raw()
        );

        let started = Instant::now();
        let status = match self.execute(task).await {
            Ok(summary) => {
                tracing::info!(
                    "task {} of user {} stored {} ({})",
                    task.id,
                    task.user,
                    summary.file_name,
                    utils::human_bytes(summary.size)
                );
                TerminalStatus::Succeeded(summary)
            }
            Err(error) => {
                if error == TransferError::Cancelled {
                    tracing::info!("task {} of user {} cancelled", task.id, task.user);
                } else {
                    tracing::warn!(
                        "task {} of user {} failed on {}: {error}",
                        task.id,
                        task.user,
                        task.reference.raw()
                    );
                }
                TerminalStatus::Failed {
                    reference: task.reference.raw().to_string(),
                    error,
                }
            }
        };

        if let Err(e) = status::deliver(task.status.as_ref(), status.render()).await {
            tracing::warn!("could not deliver outcome of task {}: {e}", task.id);
        }

        if let (TerminalStatus::Succeeded(summary), Some(channel)) = (&status, &self.stats) {
            let notice = stats::render_stats(task.user, summary, started.elapsed());
            if let Err(e) = channel.post(notice).await {
                tracing::warn!("could not post stats of task {}: {e}", task.id);
            }
        }

        status
    }

    /// Everything between accepting and reporting a task.
    async fn execute(&self, task: &TransferTask) -> Result<Summary, TransferError> {
        if task.cancellation_token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let name = task.reference.display_name();

        let Some(adapter) = self.sources.select(task.reference.kind()) else {
            announce(task, &format!("📄 Cloning <code>{}</code>", html::escape(&name))).await;
            let uploaded = self
                .relay
                .clone_remote(&task.reference, &task.cancellation_token)
                .await?;
            return Ok(Summary {
                file_name: uploaded.name,
                size: uploaded.size,
                link: uploaded.link,
                fetch: None,
                upload: None,
            });
        };

        announce(task, &format!("⏳ Starting <code>{}</code>", html::escape(&name))).await;

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| TransferError::transfer(format!("could not create download dir: {e}")))?;
        let arena = tempfile::Builder::new()
            .prefix(&format!("task-{}-", task.id.0))
            .tempdir_in(&self.download_dir)
            .map_err(|e| TransferError::transfer(format!("could not create task dir: {e}")))?;

        let result = self
            .fetch_and_upload(task, adapter.as_ref(), &name, arena.path())
            .await;

        // every exit path ends here, so the directory goes exactly once
        let arena_path = arena.path().to_path_buf();
        if let Err(e) = arena.close() {
            tracing::error!("could not remove {}: {e}", arena_path.display());
        }

        result
    }

    /// Fetch into `dir`, then hand the file to the relay.
    async fn fetch_and_upload(
        &self,
        task: &TransferTask,
        adapter: &dyn SourceAdapter,
        name: &str,
        dir: &Path,
    ) -> Result<Summary, TransferError> {
        let reporter = ProgressReporter::new(Arc::clone(&task.status), self.settings.interval);

        tracing::debug!("task {} fetching through {}", task.id, adapter.name());
        let (sink, handle) = reporter.start(Phase::Download, name);
        let token = task.cancellation_token.child_token();
        let fetched = self
            .watched(
                Phase::Download,
                adapter.fetch(&task.reference, dir, &sink, &token),
                &sink,
                &token,
            )
            .await;
        let fetch_elapsed = sink.elapsed();
        handle.finish().await;
        let fetched = fetched?;

        let fetch = PhaseStats {
            bytes: fetched.size,
            elapsed: fetch_elapsed,
        };
        let mime_type = fetched
            .mime_type
            .clone()
            .or_else(|| guess_mime(&fetched.path));

        let (sink, handle) = reporter.start(Phase::Upload, &fetched.file_name());
        let token = task.cancellation_token.child_token();
        let uploaded = self
            .watched(
                Phase::Upload,
                self.relay
                    .upload(&fetched.path, mime_type.as_deref(), &sink, &token),
                &sink,
                &token,
            )
            .await;
        let upload_elapsed = sink.elapsed();
        handle.finish().await;
        let uploaded = uploaded?;

        Ok(Summary {
            file_name: uploaded.name,
            size: fetched.size,
            link: uploaded.link,
            fetch: Some(fetch),
            upload: Some(PhaseStats {
                bytes: fetched.size,
                elapsed: upload_elapsed,
            }),
        })
    }

    /// Run a phase, aborting it when its sink sees no progress for the stall timeout.
    async fn watched<T>(
        &self,
        phase: Phase,
        work: impl Future<Output = Result<T, TransferError>>,
        sink: &ProgressSink,
        token: &CancellationToken,
    ) -> Result<T, TransferError> {
        tokio::pin!(work);

        select! {
            biased;
            result = &mut work => result,
            () = sink.stalled(self.settings.stall_timeout) => {
                token.cancel();
                // let the phase unwind its own resources
                let _ = work.await;

                let reason = format!(
                    "no progress for {}",
                    utils::human_duration(self.settings.stall_timeout)
                );
                Err(match phase {
                    Phase::Download => TransferError::transfer(reason),
                    Phase::Upload => TransferError::upload(reason),
                })
            }
        }
    }
}

/// Best-effort status edit.
async fn announce(task: &TransferTask, text: &str) {
    if let Err(e) = task.status.edit(text.to_string()).await {
        tracing::warn!("could not update task {}: {e}", task.id);
    }
}
