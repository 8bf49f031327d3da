use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::types::{FileEntry, Status, TaskDetails, TaskSnapshot, TransferMethod, TransferObjects};

/// One dataset transfer
pub struct TransferTask {
    id: Uuid,
    folder: PathBuf,
    file_list: Vec<FileEntry>,
    method: TransferMethod,
    objects: TransferObjects,
    dataset_id: RwLock<String>,
    details: RwLock<TaskDetails>,
    scheduled: AtomicBool,
    cancel: CancellationToken,
}

impl TransferTask {
    /// Create a Waiting task; `cancel` should be a child of the queue's shutdown token
    pub fn new(
        id: Uuid,
        folder: PathBuf,
        file_list: Vec<FileEntry>,
        method: TransferMethod,
        objects: TransferObjects,
        cancel: CancellationToken,
    ) -> Self {
        let bytes_total = file_list.iter().map(|f| f.size).sum();
        let files_total = file_list.len() as u64;
        Self {
            id,
            folder,
            file_list,
            method,
            objects,
            dataset_id: RwLock::new(String::new()),
            details: RwLock::new(TaskDetails {
                bytes_transferred: 0,
                bytes_total,
                files_transferred: 0,
                files_total,
                status: Status::Waiting,
                message: String::new(),
            }),
            scheduled: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn file_list(&self) -> &[FileEntry] {
        &self.file_list
    }

    pub fn method(&self) -> TransferMethod {
        self.method
    }

    pub fn transfer_objects(&self) -> &TransferObjects {
        &self.objects
    }

    pub fn dataset_id(&self) -> String {
        self.dataset_id.read().clone()
    }

    pub fn set_dataset_id(&self, pid: impl Into<String>) {
        *self.dataset_id.write() = pid.into();
    }

    /// Token observed by all I/O made on behalf of this task
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn details(&self) -> TaskDetails {
        self.details.read().clone()
    }

    pub fn status(&self) -> Status {
        self.details.read().status
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            folder: self.folder.clone(),
            dataset_id: self.dataset_id(),
            method: self.method,
            details: self.details(),
        }
    }

    /// Claim the single scheduling slot; false if the task was scheduled before
    pub(crate) fn mark_scheduled(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    /// Give the scheduling slot back after a rejected submission
    pub(crate) fn unmark_scheduled(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    /// `{folder name} (pid: {dataset id}): {msg}`
    fn build_message(&self, msg: &str) -> String {
        let name = self
            .folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.folder.display().to_string());
        format!("{} (pid: {}): {}", name, self.dataset_id(), msg)
    }

    /// Waiting → Waiting with message "queued"
    pub fn queued(&self) -> bool {
        let message = self.build_message("queued");
        let mut details = self.details.write();
        if details.status != Status::Waiting {
            return false;
        }
        details.message = message;
        true
    }

    /// Waiting → Transferring
    pub fn transfer_started(&self) -> bool {
        let message = self.build_message("transferring");
        let mut details = self.details.write();
        if details.status != Status::Waiting {
            return false;
        }
        details.status = Status::Transferring;
        details.message = message;
        true
    }

    /// Raise the transferred counters while Transferring
    ///
    /// Values are clamped to the totals and never decrease. Returns the new
    /// snapshot if anything changed.
    pub fn update_progress(&self, bytes: u64, files: u64) -> Option<TaskDetails> {
        let mut details = self.details.write();
        if details.status != Status::Transferring {
            return None;
        }
        let bytes = bytes.min(details.bytes_total).max(details.bytes_transferred);
        let files = files.min(details.files_total).max(details.files_transferred);
        if bytes == details.bytes_transferred && files == details.files_transferred {
            return None;
        }
        details.bytes_transferred = bytes;
        details.files_transferred = files;
        Some(details.clone())
    }

    /// Replace the expected file count while Transferring, never below the files already done
    pub fn set_files_total(&self, files_total: u64) {
        let mut details = self.details.write();
        if details.status != Status::Transferring {
            return;
        }
        details.files_total = files_total.max(details.files_transferred);
    }

    /// Transferring → Finished
    pub fn finished(&self) -> bool {
        let message = self.build_message("transfer finished");
        let mut details = self.details.write();
        if details.status != Status::Transferring {
            return false;
        }
        details.status = Status::Finished;
        details.message = message;
        true
    }

    /// Transferring → Failed
    pub fn failed(&self, msg: &str) -> bool {
        let message = self.build_message(msg);
        let mut details = self.details.write();
        if details.status != Status::Transferring {
            return false;
        }
        details.status = Status::Failed;
        details.message = message;
        true
    }

    /// {Waiting, Transferring} → Cancelled
    pub fn cancelled(&self, msg: &str) -> bool {
        let message = self.build_message(msg);
        let mut details = self.details.write();
        if details.status.is_terminal() {
            return false;
        }
        details.status = Status::Cancelled;
        details.message = message;
        true
    }
}

impl std::fmt::Debug for TransferTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferTask")
            .field("id", &self.id)
            .field("folder", &self.folder)
            .field("method", &self.method)
            .field("files", &self.file_list.len())
            .field("details", &*self.details.read())
            .finish()
    }
}
