//! Task lifecycle and progress notifications
//!
//! The queue and the transfer code report through [`ProgressNotifier`].
//! Implementations must not block the caller: the log sink writes a tracing
//! event, the broadcast sink pushes into a bounded tokio broadcast channel
//! that drops the oldest events for slow subscribers.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::IngestorError;

/// Sink for lifecycle and progress events
pub trait ProgressNotifier: Send + Sync {
    fn on_task_scheduled(&self, id: Uuid);
    fn on_task_canceled(&self, id: Uuid);
    fn on_task_added(&self, id: Uuid, folder: &str);
    fn on_task_removed(&self, id: Uuid);
    fn on_task_failed(&self, id: Uuid, err: &IngestorError);
    fn on_task_completed(&self, id: Uuid, elapsed_seconds: f64);
    fn on_task_progress(&self, id: Uuid, percent: u8);
}

/// Serializable form of a notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TaskEvent {
    #[serde(rename_all = "camelCase")]
    Scheduled { transfer_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Canceled { transfer_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Added { transfer_id: Uuid, folder: String },
    #[serde(rename_all = "camelCase")]
    Removed { transfer_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Failed { transfer_id: Uuid, message: String },
    #[serde(rename_all = "camelCase")]
    Completed {
        transfer_id: Uuid,
        elapsed_seconds: f64,
    },
    #[serde(rename_all = "camelCase")]
    Progress { transfer_id: Uuid, percent: u8 },
}

impl TaskEvent {
    pub fn transfer_id(&self) -> Uuid {
        match self {
            TaskEvent::Scheduled { transfer_id }
            | TaskEvent::Canceled { transfer_id }
            | TaskEvent::Added { transfer_id, .. }
            | TaskEvent::Removed { transfer_id }
            | TaskEvent::Failed { transfer_id, .. }
            | TaskEvent::Completed { transfer_id, .. }
            | TaskEvent::Progress { transfer_id, .. } => *transfer_id,
        }
    }

    /// Whether this is one of the three terminal events
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::Canceled { .. } | TaskEvent::Failed { .. } | TaskEvent::Completed { .. }
        )
    }

    /// Name used for the server-sent event type
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Scheduled { .. } => "scheduled",
            TaskEvent::Canceled { .. } => "canceled",
            TaskEvent::Added { .. } => "added",
            TaskEvent::Removed { .. } => "removed",
            TaskEvent::Failed { .. } => "failed",
            TaskEvent::Completed { .. } => "completed",
            TaskEvent::Progress { .. } => "progress",
        }
    }
}

/// Writes every notification as a structured log event
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

impl ProgressNotifier for LoggingNotifier {
    fn on_task_scheduled(&self, id: Uuid) {
        info!(transfer_id = %id, "Task scheduled");
    }

    fn on_task_canceled(&self, id: Uuid) {
        info!(transfer_id = %id, "Task canceled");
    }

    fn on_task_added(&self, id: Uuid, folder: &str) {
        info!(transfer_id = %id, folder, "Task added");
    }

    fn on_task_removed(&self, id: Uuid) {
        info!(transfer_id = %id, "Task removed");
    }

    fn on_task_failed(&self, id: Uuid, err: &IngestorError) {
        warn!(transfer_id = %id, error = %err, "Task failed");
    }

    fn on_task_completed(&self, id: Uuid, elapsed_seconds: f64) {
        info!(transfer_id = %id, elapsed_seconds, "Task completed");
    }

    fn on_task_progress(&self, id: Uuid, percent: u8) {
        debug!(transfer_id = %id, percent, "Task progress");
    }
}

/// Publishes notifications on a broadcast channel for UI subscribers
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<TaskEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<TaskEvent> {
        self.tx.clone()
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

impl ProgressNotifier for BroadcastNotifier {
    fn on_task_scheduled(&self, id: Uuid) {
        self.emit(TaskEvent::Scheduled { transfer_id: id });
    }

    fn on_task_canceled(&self, id: Uuid) {
        self.emit(TaskEvent::Canceled { transfer_id: id });
    }

    fn on_task_added(&self, id: Uuid, folder: &str) {
        self.emit(TaskEvent::Added {
            transfer_id: id,
            folder: folder.to_string(),
        });
    }

    fn on_task_removed(&self, id: Uuid) {
        self.emit(TaskEvent::Removed { transfer_id: id });
    }

    fn on_task_failed(&self, id: Uuid, err: &IngestorError) {
        self.emit(TaskEvent::Failed {
            transfer_id: id,
            message: err.to_string(),
        });
    }

    fn on_task_completed(&self, id: Uuid, elapsed_seconds: f64) {
        self.emit(TaskEvent::Completed {
            transfer_id: id,
            elapsed_seconds,
        });
    }

    fn on_task_progress(&self, id: Uuid, percent: u8) {
        self.emit(TaskEvent::Progress {
            transfer_id: id,
            percent,
        });
    }
}

/// Forwards every notification to several sinks in order
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn ProgressNotifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Arc<dyn ProgressNotifier>>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: Arc<dyn ProgressNotifier>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ProgressNotifier for FanoutNotifier {
    fn on_task_scheduled(&self, id: Uuid) {
        self.sinks.iter().for_each(|s| s.on_task_scheduled(id));
    }

    fn on_task_canceled(&self, id: Uuid) {
        self.sinks.iter().for_each(|s| s.on_task_canceled(id));
    }

    fn on_task_added(&self, id: Uuid, folder: &str) {
        self.sinks.iter().for_each(|s| s.on_task_added(id, folder));
    }

    fn on_task_removed(&self, id: Uuid) {
        self.sinks.iter().for_each(|s| s.on_task_removed(id));
    }

    fn on_task_failed(&self, id: Uuid, err: &IngestorError) {
        self.sinks.iter().for_each(|s| s.on_task_failed(id, err));
    }

    fn on_task_completed(&self, id: Uuid, elapsed_seconds: f64) {
        self.sinks
            .iter()
            .for_each(|s| s.on_task_completed(id, elapsed_seconds));
    }

    fn on_task_progress(&self, id: Uuid, percent: u8) {
        self.sinks
            .iter()
            .for_each(|s| s.on_task_progress(id, percent));
    }
}
