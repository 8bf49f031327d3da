/*!
 * Progress adapter between transfer code and the notifier
 *
 * S3 uploads report increments from many concurrent part jobs; the Globus
 * monitor reports absolute counts from each poll. Both land on the task
 * (which clamps and keeps the counters monotonic) and only a change of the
 * integer percent reaches the notifier.
 */

use std::sync::atomic::{AtomicI16, AtomicU64, Ordering};
use std::sync::Arc;

use crate::notifier::ProgressNotifier;
use crate::task::TransferTask;

pub struct TransferProgress {
    task: Arc<TransferTask>,
    notifier: Arc<dyn ProgressNotifier>,
    bytes: AtomicU64,
    files: AtomicU64,
    last_percent: AtomicI16,
}

impl TransferProgress {
    pub fn new(task: Arc<TransferTask>, notifier: Arc<dyn ProgressNotifier>) -> Self {
        Self {
            task,
            notifier,
            bytes: AtomicU64::new(0),
            files: AtomicU64::new(0),
            last_percent: AtomicI16::new(-1),
        }
    }

    /// Count `n` more bytes uploaded
    pub fn add_bytes(&self, n: u64) {
        let bytes = self.bytes.fetch_add(n, Ordering::AcqRel) + n;
        let files = self.files.load(Ordering::Acquire);
        self.publish(bytes, files);
    }

    /// Count `n` more files completed
    pub fn add_files(&self, n: u64) {
        let files = self.files.fetch_add(n, Ordering::AcqRel) + n;
        let bytes = self.bytes.load(Ordering::Acquire);
        self.publish(bytes, files);
    }

    /// Report absolute counters, optionally replacing the expected file count
    pub fn set(&self, bytes: u64, files: u64, files_total: Option<u64>) {
        if let Some(total) = files_total {
            self.task.set_files_total(total);
        }
        self.bytes.fetch_max(bytes, Ordering::AcqRel);
        self.files.fetch_max(files, Ordering::AcqRel);
        self.publish(
            self.bytes.load(Ordering::Acquire),
            self.files.load(Ordering::Acquire),
        );
    }

    fn publish(&self, bytes: u64, files: u64) {
        let Some(details) = self.task.update_progress(bytes, files) else {
            return;
        };
        let percent = details.percent();
        let previous = self.last_percent.fetch_max(percent as i16, Ordering::AcqRel);
        if (percent as i16) > previous {
            self.notifier.on_task_progress(self.task.id(), percent);
        }
    }
}
