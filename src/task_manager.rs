//! A registry of per-user workers.

use crate::{
    orchestrator::Orchestrator,
    reference::Reference,
    status::StatusSlot,
    task::{TaskId, TaskState, TerminalStatus, TransferTask},
    worker::Worker,
};

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use teloxide::types::UserId;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Live workers, keyed by owner.
pub type Registry = Mutex<HashMap<UserId, Arc<Worker>>>;

/// A freshly queued task.
#[derive(Debug)]
pub struct Enqueued {
    /// Identifier of the new task.
    pub id: TaskId,
    /// Tasks of the same user ahead of this one (0 = starting now).
    pub position: usize,
    /// Resolves with the terminal status.
    pub outcome: oneshot::Receiver<TerminalStatus>,
}

/// Manager for `TransferTask`s.
pub struct TaskManagerInner {
    workers: Arc<Registry>,
    orchestrator: Arc<Orchestrator>,
    cancellation_token: CancellationToken,
    idle_timeout: Duration,
    next_id: AtomicU64,
}

impl TaskManagerInner {
    /// Create a manager whose workers evict themselves after `idle_timeout`.
    pub fn new(orchestrator: Orchestrator, idle_timeout: Duration) -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
            orchestrator: Arc::new(orchestrator),
            cancellation_token: CancellationToken::new(),
            idle_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Stop every worker, cancelling in-flight tasks.
    pub fn stop(&self) {
        self.cancellation_token.cancel();
        tracing::debug!("task manager stopped");
    }

    /// Lock the registry.
    fn workers(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, Arc<Worker>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Public interface for `TaskManagerInner`.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<TaskManagerInner>,
}

impl TaskManager {
    /// Get the number of queued and running tasks across all users.
    pub fn get_queue_size(&self) -> usize {
        self.inner.workers().values().map(|w| w.pending()).sum()
    }

    /// Get the number of queued and running tasks of `user`.
    pub fn get_user_queue_size(&self, user: UserId) -> usize {
        self.inner.workers().get(&user).map_or(0, |w| w.pending())
    }

    /// Number of users with a live worker.
    pub fn active_users(&self) -> usize {
        self.inner.workers().len()
    }

    /// Queue a task for `user`, starting their worker if needed.
    pub fn enqueue(
        &self,
        user: UserId,
        reference: Reference,
        status: Arc<dyn StatusSlot>,
    ) -> Enqueued {
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();

        let mut workers = self.inner.workers();
        let worker = workers
            .entry(user)
            .or_insert_with(|| {
                let worker = Arc::new(Worker::new(
                    user,
                    self.inner.cancellation_token.child_token(),
                ));
                worker.start(
                    Arc::clone(&self.inner.orchestrator),
                    Arc::clone(&self.inner.workers),
                    self.inner.idle_timeout,
                );
                worker
            })
            .clone();

        let position = worker.pending();
        worker.push(TransferTask {
            id,
            user,
            reference,
            created_at: chrono::Utc::now(),
            status,
            cancellation_token: worker.task_token(),
            state: TaskState::Queued,
            return_channel: Some(tx),
        });
        drop(workers);

        tracing::debug!("task {id} queued for user {user} at position {position}");

        Enqueued {
            id,
            position,
            outcome: rx,
        }
    }

    /// Cancel the running and queued tasks of `user`; returns how many were affected.
    pub fn cancel(&self, user: UserId) -> usize {
        let affected = self.inner.workers().get(&user).map_or(0, |w| w.cancel());
        if affected > 0 {
            tracing::info!("user {user} cancelled {affected} task(s)");
        }
        affected
    }
}

impl From<Arc<TaskManagerInner>> for TaskManager {
    fn from(inner: Arc<TaskManagerInner>) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::TransferError,
        orchestrator::ProgressSettings,
        progress::ProgressSink,
        reference::{Classifier, Workflow},
        source::{SourceAdapter, Sources},
        storage::StorageRelay,
        task::{Fetched, Uploaded},
        test_support::RecordingSlot,
    };

    use std::{
        path::Path,
        sync::atomic::AtomicUsize,
    };

    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Source that takes a while, tracking overlap and order.
    #[derive(Default)]
    struct SlowSource {
        delay: Duration,
        hang: bool,
        running: AtomicUsize,
        max_running: AtomicUsize,
        order: Mutex<Vec<String>>,
        started: Notify,
    }

    #[async_trait]
    impl SourceAdapter for SlowSource {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn fetch(
            &self,
            reference: &Reference,
            destination: &Path,
            progress: &ProgressSink,
            cancellation_token: &CancellationToken,
        ) -> Result<Fetched, TransferError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.order.lock().unwrap().push(reference.raw().to_string());
            self.started.notify_one();

            let res = if self.hang {
                cancellation_token.cancelled().await;
                Err(TransferError::Cancelled)
            } else {
                tokio::time::sleep(self.delay).await;
                let path = destination.join("out.bin");
                std::fs::write(&path, b"payload").unwrap();
                progress.finish(7, Some(7));
                Ok(Fetched {
                    path,
                    size: 7,
                    mime_type: None,
                })
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            res
        }
    }

    struct AcceptingRelay;

    #[async_trait]
    impl StorageRelay for AcceptingRelay {
        async fn upload(
            &self,
            path: &Path,
            _mime_type: Option<&str>,
            _progress: &ProgressSink,
            _cancellation_token: &CancellationToken,
        ) -> Result<Uploaded, TransferError> {
            Ok(Uploaded {
                name: path.file_name().unwrap().to_string_lossy().into_owned(),
                size: 7,
                link: "https://drive.google.com/file/d/x/view".to_string(),
            })
        }

        async fn clone_remote(
            &self,
            _reference: &Reference,
            _cancellation_token: &CancellationToken,
        ) -> Result<Uploaded, TransferError> {
            Err(TransferError::upload("not used"))
        }
    }

    fn manager(
        source: &Arc<SlowSource>,
        download_dir: &Path,
        idle_timeout: Duration,
    ) -> (Arc<TaskManagerInner>, TaskManager) {
        let orchestrator = Orchestrator::new(
            Sources {
                direct: source.clone(),
                media: source.clone(),
                platform: source.clone(),
            },
            Arc::new(AcceptingRelay),
            download_dir.to_path_buf(),
            ProgressSettings {
                interval: Duration::from_millis(10),
                stall_timeout: Duration::from_secs(60),
            },
        );
        let inner = Arc::new(TaskManagerInner::new(orchestrator, idle_timeout));
        let public: TaskManager = inner.clone().into();
        (inner, public)
    }

    fn reference(raw: &str) -> Reference {
        Classifier::default()
            .classify(raw, None, Workflow::Link)
            .unwrap()
    }

    fn slot() -> Arc<dyn StatusSlot> {
        Arc::new(RecordingSlot::default())
    }

    #[tokio::test]
    async fn one_user_runs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(SlowSource {
            delay: Duration::from_millis(30),
            ..SlowSource::default()
        });
        let (_inner, manager) = manager(&source, dir.path(), Duration::from_secs(60));
        let user = UserId(1);

        let queued = ["https://a.example/1", "https://a.example/2", "https://a.example/3"]
            .iter()
            .map(|raw| manager.enqueue(user, reference(raw), slot()))
            .collect::<Vec<_>>();

        assert_eq!(queued[0].position, 0);
        assert_eq!(queued[2].position, 2);
        assert!(queued[0].id < queued[1].id);

        for enqueued in queued {
            assert!(enqueued.outcome.await.unwrap().is_success());
        }
        assert_eq!(source.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(
            *source.order.lock().unwrap(),
            vec!["https://a.example/1", "https://a.example/2", "https://a.example/3"]
        );
    }

    #[tokio::test]
    async fn users_run_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(SlowSource {
            delay: Duration::from_millis(200),
            ..SlowSource::default()
        });
        let (_inner, manager) = manager(&source, dir.path(), Duration::from_secs(60));

        let first = manager.enqueue(UserId(1), reference("https://a.example/x"), slot());
        let second = manager.enqueue(UserId(2), reference("https://b.example/y"), slot());
        assert_eq!(second.position, 0);
        assert_eq!(manager.active_users(), 2);

        assert!(first.outcome.await.unwrap().is_success());
        assert!(second.outcome.await.unwrap().is_success());
        assert_eq!(source.max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_workers_are_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(SlowSource::default());
        let (_inner, manager) = manager(&source, dir.path(), Duration::from_millis(50));
        let user = UserId(5);

        let done = manager.enqueue(user, reference("https://a.example/1"), slot());
        assert!(done.outcome.await.unwrap().is_success());
        assert_eq!(manager.active_users(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.active_users(), 0);
        assert_eq!(manager.get_user_queue_size(user), 0);

        // a new worker is created on demand
        let again = manager.enqueue(user, reference("https://a.example/2"), slot());
        assert!(again.outcome.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn cancel_reaches_running_and_queued_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(SlowSource {
            hang: true,
            ..SlowSource::default()
        });
        let (_inner, manager) = manager(&source, dir.path(), Duration::from_secs(60));
        let user = UserId(9);

        let running = manager.enqueue(user, reference("https://a.example/1"), slot());
        let queued = manager.enqueue(user, reference("https://a.example/2"), slot());
        source.started.notified().await;

        assert_eq!(manager.get_user_queue_size(user), 2);
        assert_eq!(manager.cancel(user), 2);

        for enqueued in [running, queued] {
            match enqueued.outcome.await.unwrap() {
                TerminalStatus::Failed { error, .. } => assert_eq!(error, TransferError::Cancelled),
                other => panic!("unexpected {other:?}"),
            }
        }
        // the queued task never reached the source
        assert_eq!(source.order.lock().unwrap().len(), 1);
        assert_eq!(manager.cancel(UserId(10)), 0);
    }

    #[tokio::test]
    async fn stop_answers_everything() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(SlowSource {
            hang: true,
            ..SlowSource::default()
        });
        let (inner, manager) = manager(&source, dir.path(), Duration::from_secs(60));

        let running = manager.enqueue(UserId(1), reference("https://a.example/1"), slot());
        let queued = manager.enqueue(UserId(1), reference("https://a.example/2"), slot());
        source.started.notified().await;
        inner.stop();

        assert!(!running.outcome.await.unwrap().is_success());
        assert!(!queued.outcome.await.unwrap().is_success());
    }
}
