//! Worker module, responsible for processing one user's transfer tasks.

use crate::{
    orchestrator::Orchestrator,
    task::{TaskState, TransferTask},
    task_manager::Registry,
};

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use deadqueue::unlimited::Queue;
use teloxide::types::UserId;
use tokio::select;
use tokio_util::sync::CancellationToken;

/// A worker that processes the tasks of a single user, one at a time.
pub struct Worker {
    user: UserId,
    queue: Queue<TransferTask>,
    /// Set while a task is running.
    pub is_busy: AtomicBool,
    /// Cancelled on shutdown or when the worker evicts itself.
    cancellation_token: CancellationToken,
    /// Parent of every task token; swapped for a fresh one on `/cancel`.
    batch_token: Mutex<CancellationToken>,
}

impl Worker {
    /// Create a new `Worker` instance for `user`.
    pub fn new(user: UserId, cancellation_token: CancellationToken) -> Self {
        let batch_token = cancellation_token.child_token();
        Self {
            user,
            queue: Queue::new(),
            is_busy: AtomicBool::new(false),
            cancellation_token,
            batch_token: Mutex::new(batch_token),
        }
    }

    /// Number of tasks waiting, excluding the running one.
    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Number of tasks waiting or running.
    pub fn pending(&self) -> usize {
        self.queue_size() + usize::from(self.is_busy.load(Ordering::Acquire))
    }

    /// Token for a task about to be queued.
    pub fn task_token(&self) -> CancellationToken {
        self.batch_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token()
    }

    /// Push a task onto the queue.
    pub fn push(&self, task: TransferTask) {
        self.queue.push(task);
    }

    /// Cancel the running task and everything queued so far; returns how many were affected.
    ///
    /// Tasks pushed afterwards are not affected.
    pub fn cancel(&self) -> usize {
        let affected = self.pending();
        let mut batch_token = self
            .batch_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        batch_token.cancel();
        *batch_token = self.cancellation_token.child_token();
        affected
    }

    /// Start the worker; it stops on cancellation or after `idle_timeout` without work.
    pub fn start(
        self: &Arc<Self>,
        orchestrator: Arc<Orchestrator>,
        registry: Arc<Registry>,
        idle_timeout: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let worker = Arc::clone(self);

        tokio::spawn(async move {
            tracing::debug!("worker for user {} started", worker.user);
            loop {
                select! {
                    biased; // always go for token first
                    () = worker.cancellation_token.cancelled() => {
                        tracing::debug!("worker for user {} cancelled", worker.user);
                        break;
                    }
                    task = worker.queue.pop() => {
                        worker.is_busy.store(true, Ordering::Release);
                        Self::handle_task(&orchestrator, task).await;
                        worker.is_busy.store(false, Ordering::Release);
                    }
                    () = tokio::time::sleep(idle_timeout) => {
                        if worker.try_evict(&registry) {
                            break;
                        }
                    }
                }
            }

            // whatever is left still gets a terminal answer
            while let Some(task) = worker.queue.try_pop() {
                Self::handle_task(&orchestrator, task).await;
            }
            tracing::debug!("worker for user {} stopped", worker.user);
        })
    }

    /// Remove this worker from the registry if it has nothing to do.
    fn try_evict(self: &Arc<Self>, registry: &Registry) -> bool {
        let mut workers = registry.lock().unwrap_or_else(PoisonError::into_inner);

        // producers push under this lock, so an empty queue stays empty
        if !self.queue.is_empty() {
            return false;
        }
        if workers
            .get(&self.user)
            .is_some_and(|current| Arc::ptr_eq(current, self))
        {
            workers.remove(&self.user);
        }
        self.cancellation_token.cancel();
        tracing::debug!("worker for user {} evicted after idling", self.user);
        true
    }

    /// Handle a transfer task and send the result back to the caller.
    async fn handle_task(orchestrator: &Orchestrator, mut task: TransferTask) {
        task.state = TaskState::Running;
        let status = orchestrator.run(&task).await;
        task.state = if status.is_success() {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
        tracing::debug!("task {} finished as {:?}", task.id, task.state);

        if let Some(channel) = task.return_channel.take()
            && channel.send(status).is_err()
        {
            tracing::error!("failed to send result of task {}: channel closed", task.id);
        }
    }
}
