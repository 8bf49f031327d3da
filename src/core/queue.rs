/*!
 * Task queue and worker pool
 *
 * Tasks live in an insertion-ordered map until they are removed. Scheduling
 * hands a task to a bounded channel served by a fixed number of workers;
 * each worker runs one task at a time through a [`TaskRunner`] and then
 * emits the task's single terminal notification.
 *
 * Terminal events are decided here, after the run, by the state machine:
 * a cancelled task already emitted `OnTaskCanceled` from [`TaskQueue::cancel`]
 * and its later `finished()`/`failed()` transitions are no-ops.
 */

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{QueueFullPolicy, TransferConfig};
use crate::error::{IngestorError, Result};
use crate::notifier::ProgressNotifier;
use crate::task::{FileEntry, Status, TaskResult, TaskSnapshot, TransferMethod, TransferObjects, TransferTask};

/// Runs the ingest pipeline of one task
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: Arc<TransferTask>) -> TaskResult;
}

/// Worker pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub concurrency_limit: usize,
    pub queue_size: usize,
    pub queue_full_policy: QueueFullPolicy,
}

impl From<&TransferConfig> for QueueOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency_limit.max(1),
            queue_size: config.queue_size.max(1),
            queue_full_policy: config.queue_full_policy,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

#[derive(Default)]
struct TaskMap {
    order: Vec<Uuid>,
    tasks: HashMap<Uuid, Arc<TransferTask>>,
}

pub struct TaskQueue {
    tasks: RwLock<TaskMap>,
    sender: mpsc::Sender<Arc<TransferTask>>,
    policy: QueueFullPolicy,
    notifier: Arc<dyn ProgressNotifier>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Create the queue and spawn its workers on the current runtime
    pub fn start(
        options: QueueOptions,
        runner: Arc<dyn TaskRunner>,
        notifier: Arc<dyn ProgressNotifier>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(options.queue_size.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shutdown = CancellationToken::new();

        let workers = (0..options.concurrency_limit.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    receiver.clone(),
                    runner.clone(),
                    notifier.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        info!(
            workers = options.concurrency_limit,
            queue_size = options.queue_size,
            "task queue started"
        );

        Arc::new(Self {
            tasks: RwLock::new(TaskMap::default()),
            sender,
            policy: options.queue_full_policy,
            notifier,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    /// Insert a Waiting task
    ///
    /// Method `None` has nothing to transfer and inserts nothing.
    pub fn add(
        &self,
        id: Uuid,
        folder: PathBuf,
        files: Vec<FileEntry>,
        method: TransferMethod,
        objects: TransferObjects,
    ) -> Result<()> {
        if method == TransferMethod::None {
            debug!(%id, "transfer method None, no task added");
            return Ok(());
        }

        let folder_name = folder.display().to_string();
        {
            let mut map = self.tasks.write();
            if map.tasks.contains_key(&id) {
                return Err(IngestorError::TaskExists(id));
            }
            let task = TransferTask::new(
                id,
                folder,
                files,
                method,
                objects,
                self.shutdown.child_token(),
            );
            map.order.push(id);
            map.tasks.insert(id, Arc::new(task));
        }
        self.notifier.on_task_added(id, &folder_name);
        Ok(())
    }

    /// Submit a Waiting task to the worker pool
    ///
    /// Scheduling twice, or scheduling a task that already left Waiting, is a
    /// no-op. A full queue blocks or fails with [`IngestorError::QueueFull`]
    /// depending on the policy.
    pub async fn schedule(&self, id: Uuid) -> Result<()> {
        let task = self.task(id)?;
        if self.shutdown.is_cancelled() {
            return Err(IngestorError::Internal("task queue is shut down".into()));
        }
        if task.status() != Status::Waiting || !task.mark_scheduled() {
            debug!(%id, "task already scheduled");
            return Ok(());
        }

        let permit = match self.policy {
            QueueFullPolicy::Block => self.sender.reserve().await.map_err(|_| closed()),
            QueueFullPolicy::Reject => self.sender.try_reserve().map_err(|e| match e {
                mpsc::error::TrySendError::Full(()) => IngestorError::QueueFull,
                mpsc::error::TrySendError::Closed(()) => closed(),
            }),
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
                task.unmark_scheduled();
                return Err(e);
            }
        };

        if task.queued() {
            self.notifier.on_task_scheduled(id);
        }
        permit.send(task);
        Ok(())
    }

    /// Mark the task Cancelled, then fire its cancellation token
    ///
    /// Repeated calls and calls on finished tasks emit nothing.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let task = self.task(id)?;
        self.cancel_task(&task, "cancelled by user");
        Ok(())
    }

    fn cancel_task(&self, task: &TransferTask, msg: &str) {
        if task.cancelled(msg) {
            info!(id = %task.id(), "task cancelled");
            self.notifier.on_task_canceled(task.id());
        }
        task.cancel_token().cancel();
    }

    /// Cancel the task if it is still active and drop it
    pub fn remove(&self, id: Uuid) -> Result<()> {
        let task = self.task(id)?;
        if !task.status().is_terminal() {
            self.cancel_task(&task, "cancelled by user");
        }
        {
            let mut map = self.tasks.write();
            map.tasks.remove(&id);
            map.order.retain(|t| *t != id);
        }
        self.notifier.on_task_removed(id);
        Ok(())
    }

    /// Drop a task that never reached the worker pool
    ///
    /// Reports only the removal, since the task never started. Fails for a
    /// task that was scheduled in the meantime.
    pub fn discard(&self, id: Uuid) -> Result<()> {
        let task = self.task(id)?;
        if task.status() != Status::Waiting || !task.mark_scheduled() {
            return Err(IngestorError::Internal(format!(
                "task {} was scheduled and can't be discarded",
                id
            )));
        }
        task.cancel_token().cancel();
        {
            let mut map = self.tasks.write();
            map.tasks.remove(&id);
            map.order.retain(|t| *t != id);
        }
        debug!(%id, "unscheduled task discarded");
        self.notifier.on_task_removed(id);
        Ok(())
    }

    pub fn task(&self, id: Uuid) -> Result<Arc<TransferTask>> {
        self.tasks
            .read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(IngestorError::TaskNotFound(id))
    }

    pub fn get(&self, id: Uuid) -> Result<TaskSnapshot> {
        self.task(id).map(|t| t.snapshot())
    }

    /// Total number of tasks and the snapshots of `limit` tasks starting at `offset`
    pub fn list(&self, offset: usize, limit: usize) -> (usize, Vec<TaskSnapshot>) {
        let map = self.tasks.read();
        let page = map
            .order
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| map.tasks.get(id))
            .map(|t| t.snapshot())
            .collect();
        (map.order.len(), page)
    }

    pub fn count(&self) -> usize {
        self.tasks.read().order.len()
    }

    /// Cancel every unfinished task and wait for the workers to stop
    pub async fn shutdown(&self) {
        let active: Vec<Arc<TransferTask>> = {
            let map = self.tasks.read();
            map.order
                .iter()
                .filter_map(|id| map.tasks.get(id))
                .filter(|t| !t.status().is_terminal())
                .cloned()
                .collect()
        };
        for task in &active {
            self.cancel_task(task, "ingestor shutting down");
        }
        self.shutdown.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker ended abnormally");
            }
        }
        info!(cancelled = active.len(), "task queue stopped");
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("tasks", &self.count())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn closed() -> IngestorError {
    IngestorError::Internal("task queue is shut down".into())
}

async fn worker_loop(
    worker: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<TransferTask>>>>,
    runner: Arc<dyn TaskRunner>,
    notifier: Arc<dyn ProgressNotifier>,
    shutdown: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = next else {
            debug!(worker, "worker stopping");
            return;
        };
        run_task(task, &runner, notifier.as_ref()).await;
    }
}

async fn run_task(task: Arc<TransferTask>, runner: &Arc<dyn TaskRunner>, notifier: &dyn ProgressNotifier) {
    let id = task.id();
    if !task.transfer_started() {
        debug!(%id, status = %task.status(), "skipping task that left Waiting before it ran");
        return;
    }

    let started = Instant::now();
    let handle = {
        let runner = runner.clone();
        let task = task.clone();
        tokio::spawn(async move { runner.run(task).await })
    };
    let result = handle.await.unwrap_or_else(|e| {
        error!(%id, error = %e, "task runner panicked");
        TaskResult {
            elapsed_seconds: started.elapsed().as_secs_f64(),
            error: Some(IngestorError::Internal(format!("task runner panicked: {}", e))),
        }
    });

    complete(&task, result, notifier);
}

/// Apply the run outcome to the task and emit at most one terminal event
pub(crate) fn complete(task: &TransferTask, result: TaskResult, notifier: &dyn ProgressNotifier) {
    let id = task.id();
    match result.error {
        None => {
            if task.finished() {
                info!(%id, elapsed = result.elapsed_seconds, "task finished");
                notifier.on_task_completed(id, result.elapsed_seconds);
            }
        }
        Some(err) if err.is_cancelled() || task.cancel_token().is_cancelled() => {
            if task.cancelled(&err.to_string()) {
                notifier.on_task_canceled(id);
            }
        }
        Some(err) => {
            if task.failed(&err.to_string()) {
                warn!(%id, error = %err, "task failed");
                notifier.on_task_failed(id, &err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Notification, RecordingNotifier};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Runner that waits for a permit (or cancellation) and returns a fixed outcome
    struct GatedRunner {
        gate: Arc<Semaphore>,
        fail: Option<String>,
    }

    #[async_trait]
    impl TaskRunner for GatedRunner {
        async fn run(&self, task: Arc<TransferTask>) -> TaskResult {
            let cancelled = tokio::select! {
                _ = task.cancel_token().cancelled() => true,
                permit = self.gate.acquire() => { permit.map(|p| p.forget()).ok(); false }
            };
            let error = if cancelled {
                Some(IngestorError::Cancelled)
            } else {
                self.fail.clone().map(IngestorError::Internal)
            };
            TaskResult {
                elapsed_seconds: 0.5,
                error,
            }
        }
    }

    fn queue(
        options: QueueOptions,
        fail: Option<&str>,
    ) -> (Arc<TaskQueue>, Arc<Semaphore>, Arc<RecordingNotifier>) {
        let gate = Arc::new(Semaphore::new(0));
        let notifier = Arc::new(RecordingNotifier::default());
        let runner = Arc::new(GatedRunner {
            gate: gate.clone(),
            fail: fail.map(str::to_string),
        });
        (TaskQueue::start(options, runner, notifier.clone()), gate, notifier)
    }

    fn add(queue: &TaskQueue) -> Uuid {
        let id = Uuid::new_v4();
        queue
            .add(
                id,
                PathBuf::from("/data/ds"),
                vec![FileEntry::new("a", 10)],
                TransferMethod::S3,
                TransferObjects::default(),
            )
            .unwrap();
        id
    }

    async fn wait_for_status(queue: &TaskQueue, id: Uuid, status: Status) {
        for _ in 0..200 {
            if queue.get(id).unwrap().details.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} never reached {:?}", id, status);
    }

    fn terminal_events(notifier: &RecordingNotifier, id: Uuid) -> usize {
        notifier
            .events()
            .iter()
            .filter(|n| n.is_terminal() && n.id() == id)
            .count()
    }

    #[tokio::test]
    async fn test_success_emits_single_completed() {
        let (queue, gate, notifier) = queue(QueueOptions::default(), None);
        let id = add(&queue);
        queue.schedule(id).await.unwrap();
        wait_for_status(&queue, id, Status::Transferring).await;
        gate.add_permits(1);
        wait_for_status(&queue, id, Status::Finished).await;

        let events = notifier.events();
        assert!(events.contains(&Notification::Added(id)));
        assert!(events.contains(&Notification::Scheduled(id)));
        assert!(events.contains(&Notification::Completed(id)));
        assert_eq!(terminal_events(&notifier, id), 1);
    }

    #[tokio::test]
    async fn test_failure_emits_single_failed() {
        let (queue, gate, notifier) = queue(QueueOptions::default(), Some("boom"));
        let id = add(&queue);
        queue.schedule(id).await.unwrap();
        gate.add_permits(1);
        wait_for_status(&queue, id, Status::Failed).await;

        assert!(queue.get(id).unwrap().details.message.contains("boom"));
        assert_eq!(terminal_events(&notifier, id), 1);
        assert!(matches!(notifier.events().last(), Some(Notification::Failed(_, _))));
    }

    #[tokio::test]
    async fn test_cancel_while_running_emits_single_canceled() {
        let (queue, _gate, notifier) = queue(QueueOptions::default(), None);
        let id = add(&queue);
        queue.schedule(id).await.unwrap();
        wait_for_status(&queue, id, Status::Transferring).await;

        queue.cancel(id).unwrap();
        queue.cancel(id).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(queue.get(id).unwrap().details.status, Status::Cancelled);
        assert_eq!(terminal_events(&notifier, id), 1);
        assert!(notifier.events().contains(&Notification::Canceled(id)));
    }

    #[tokio::test]
    async fn test_cancel_before_finish_suppresses_completed() {
        let (queue, gate, notifier) = queue(QueueOptions::default(), None);
        let id = add(&queue);
        let task = queue.task(id).unwrap();
        assert!(task.transfer_started());

        // the worker has the result in hand when the cancel lands
        queue.cancel(id).unwrap();
        complete(
            &task,
            TaskResult {
                elapsed_seconds: 1.0,
                error: None,
            },
            notifier.as_ref(),
        );
        gate.add_permits(1);

        assert_eq!(task.status(), Status::Cancelled);
        assert_eq!(terminal_events(&notifier, id), 1);
        assert!(!notifier.events().contains(&Notification::Completed(id)));
    }

    #[tokio::test]
    async fn test_cancel_waiting_task_never_runs() {
        let options = QueueOptions {
            concurrency_limit: 1,
            ..QueueOptions::default()
        };
        let (queue, gate, notifier) = queue(options, None);
        let first = add(&queue);
        let second = add(&queue);
        queue.schedule(first).await.unwrap();
        queue.schedule(second).await.unwrap();
        wait_for_status(&queue, first, Status::Transferring).await;

        queue.cancel(second).unwrap();
        gate.add_permits(1);
        wait_for_status(&queue, first, Status::Finished).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(queue.get(second).unwrap().details.status, Status::Cancelled);
        assert_eq!(terminal_events(&notifier, second), 1);
    }

    #[tokio::test]
    async fn test_schedule_is_idempotent() {
        let (queue, _gate, notifier) = queue(QueueOptions::default(), None);
        let id = add(&queue);
        queue.schedule(id).await.unwrap();
        queue.schedule(id).await.unwrap();
        let scheduled = notifier
            .events()
            .iter()
            .filter(|n| **n == Notification::Scheduled(id))
            .count();
        assert_eq!(scheduled, 1);
    }

    #[tokio::test]
    async fn test_reject_policy_when_full() {
        let options = QueueOptions {
            concurrency_limit: 1,
            queue_size: 1,
            queue_full_policy: QueueFullPolicy::Reject,
        };
        let (queue, _gate, _notifier) = queue(options, None);
        let running = add(&queue);
        queue.schedule(running).await.unwrap();
        wait_for_status(&queue, running, Status::Transferring).await;

        let queued = add(&queue);
        queue.schedule(queued).await.unwrap();
        let rejected = add(&queue);
        let err = queue.schedule(rejected).await.unwrap_err();
        assert!(matches!(err, IngestorError::QueueFull));
        assert_eq!(queue.get(rejected).unwrap().details.message, "");
    }

    #[tokio::test]
    async fn test_discard_rejected_task_reports_only_removal() {
        let options = QueueOptions {
            concurrency_limit: 1,
            queue_size: 1,
            queue_full_policy: QueueFullPolicy::Reject,
        };
        let (queue, _gate, notifier) = queue(options, None);
        let running = add(&queue);
        queue.schedule(running).await.unwrap();
        wait_for_status(&queue, running, Status::Transferring).await;
        let queued = add(&queue);
        queue.schedule(queued).await.unwrap();

        let rejected = add(&queue);
        assert!(queue.schedule(rejected).await.is_err());
        queue.discard(rejected).unwrap();

        assert!(matches!(queue.get(rejected), Err(IngestorError::TaskNotFound(_))));
        let events: Vec<_> = notifier
            .events()
            .into_iter()
            .filter(|n| n.id() == rejected)
            .collect();
        assert_eq!(
            events,
            vec![Notification::Added(rejected), Notification::Removed(rejected)]
        );

        // Scheduled tasks go through remove
        assert!(queue.discard(queued).is_err());
        assert!(queue.get(queued).is_ok());
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let (queue, _gate, notifier) = queue(QueueOptions::default(), None);
        let id = add(&queue);
        assert!(matches!(
            queue.add(
                id,
                PathBuf::from("/x"),
                vec![],
                TransferMethod::S3,
                TransferObjects::default()
            ),
            Err(IngestorError::TaskExists(_))
        ));

        queue.remove(id).unwrap();
        assert!(matches!(queue.get(id), Err(IngestorError::TaskNotFound(_))));
        assert_eq!(queue.list(0, 10).0, 0);
        assert!(notifier.events().contains(&Notification::Removed(id)));
        assert!(notifier.events().contains(&Notification::Canceled(id)));
        assert!(matches!(queue.cancel(id), Err(IngestorError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_method_none_adds_nothing() {
        let (queue, _gate, _notifier) = queue(QueueOptions::default(), None);
        queue
            .add(
                Uuid::new_v4(),
                PathBuf::from("/x"),
                vec![],
                TransferMethod::None,
                TransferObjects::default(),
            )
            .unwrap();
        assert_eq!(queue.count(), 0);
    }

    #[tokio::test]
    async fn test_list_preserves_insertion_order() {
        let (queue, _gate, _notifier) = queue(QueueOptions::default(), None);
        let ids: Vec<Uuid> = (0..5).map(|_| add(&queue)).collect();
        let (total, page) = queue.list(1, 3);
        assert_eq!(total, 5);
        assert_eq!(page.iter().map(|s| s.id).collect::<Vec<_>>(), ids[1..4].to_vec());
        assert!(queue.list(10, 3).1.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_tasks() {
        let (queue, _gate, notifier) = queue(QueueOptions::default(), None);
        let id = add(&queue);
        queue.schedule(id).await.unwrap();
        wait_for_status(&queue, id, Status::Transferring).await;

        queue.shutdown().await;
        assert_eq!(queue.get(id).unwrap().details.status, Status::Cancelled);
        assert_eq!(terminal_events(&notifier, id), 1);
        assert!(queue.schedule(add(&queue)).await.is_err());
    }
}
