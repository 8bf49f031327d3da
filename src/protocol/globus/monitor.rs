//! Globus transfer submission and task monitoring

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::GlobusApi;
use super::template::{posix_join, to_posix, DestinationTemplate, TemplateFields};
use super::types::{GlobusTask, TransferItem, TransferRequest};
use crate::config::GlobusTransferConfig;
use crate::core::progress::TransferProgress;
use crate::core::retry::cancellable;
use crate::error::{IngestorError, Result};
use crate::task::FileEntry;
use crate::token::TokenSource;

/// Counters reported by one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    pub files_total: u64,
}

/// Interpretation of a Globus task document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Active(Counters),
    Succeeded(Counters),
}

/// Map a polled task onto a monitor outcome
///
/// `INACTIVE`, `FAILED` and unknown statuses end the transfer as failed.
pub fn interpret(task: &GlobusTask) -> Result<PollOutcome> {
    let counters = || Counters {
        bytes_transferred: task.bytes_transferred,
        files_transferred: task.files_transferred,
        files_total: task
            .files
            .saturating_sub(task.files_skipped.unwrap_or_default()),
    };
    match task.status.as_str() {
        "ACTIVE" => Ok(PollOutcome::Active(counters())),
        "SUCCEEDED" => Ok(PollOutcome::Succeeded(counters())),
        "INACTIVE" => Err(IngestorError::RemoteTransfer(
            "globus: transfer became inactive, manual intervention required".into(),
        )),
        "FAILED" => {
            let fatal = task.fatal_error.clone().unwrap_or_default();
            Err(IngestorError::RemoteTransfer(format!(
                "globus: task failed with the following error - code: \"{}\" description: \"{}\"",
                fatal.code, fatal.description
            )))
        }
        other => Err(IngestorError::RemoteTransfer(format!(
            "globus: unknown task status: {}",
            other
        ))),
    }
}

/// Submits one transfer per dataset and follows it to a terminal state
#[derive(Clone)]
pub struct GlobusTransfer {
    api: Arc<dyn GlobusApi>,
    config: Arc<GlobusTransferConfig>,
    template: DestinationTemplate,
    poll_interval: Duration,
}

impl GlobusTransfer {
    pub fn new(api: Arc<dyn GlobusApi>, config: Arc<GlobusTransferConfig>) -> Result<Self> {
        let template = DestinationTemplate::parse(&config.destination_template)?;
        let poll_interval = config.poll_interval();
        Ok(Self {
            api,
            config,
            template,
            poll_interval,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build the transfer request for a dataset folder
    pub fn build_request(
        &self,
        folder: &Path,
        dataset_pid: &str,
        username: &str,
        files: &[FileEntry],
    ) -> TransferRequest {
        let folder = to_posix(folder);
        let relative = folder
            .strip_prefix(self.config.collection_root_path.as_str())
            .unwrap_or(&folder);
        let source_base = posix_join(&self.config.source_prefix_path, relative);
        let destination_base = self
            .template
            .render(&TemplateFields::new(&folder, dataset_pid, username));

        let items = files
            .iter()
            .map(|file| TransferItem {
                source_path: posix_join(&source_base, &file.path),
                destination_path: posix_join(&destination_base, &file.path),
                is_symlink: file.is_symlink,
            })
            .collect();

        TransferRequest {
            source_collection: self.config.source_collection_id.clone(),
            destination_collection: self.config.destination_collection_id.clone(),
            label: dataset_label(dataset_pid),
            items,
        }
    }

    /// Submit the dataset and poll until the Globus task terminates
    ///
    /// On cancellation the Globus task is cancelled as well and
    /// [`IngestorError::Cancelled`] is returned.
    #[allow(clippy::too_many_arguments)]
    pub async fn transfer_dataset(
        &self,
        folder: &Path,
        dataset_pid: &str,
        username: &str,
        files: &[FileEntry],
        token: &TokenSource,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = self.build_request(folder, dataset_pid, username, files);
        let access = cancellable(cancel, token.token()).await?;
        let submitted = cancellable(
            cancel,
            self.api.submit_transfer(&access.access_token, &request),
        )
        .await
        .map_err(|e| match e {
            IngestorError::Cancelled => e,
            e => e.context("globus: an error occurred when requesting dataset transfer"),
        })?;

        if !submitted.is_accepted() {
            return Err(IngestorError::RemoteTransfer(format!(
                "globus: transfer was not accepted - code: \"{}\", message: \"{}\"",
                submitted.code, submitted.message
            )));
        }
        let task_id = submitted.task_id;
        info!(task_id = %task_id, dataset_pid, "globus transfer accepted");

        let mut first = true;
        loop {
            if !first {
                tokio::select! {
                    _ = cancel.cancelled() => return self.cancel_remote(token, &task_id).await,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
            first = false;

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancel_remote(token, &task_id).await,
                polled = self.poll(token, &task_id) => polled?,
            };

            match interpret(&polled)? {
                PollOutcome::Active(c) => {
                    debug!(task_id = %task_id, bytes = c.bytes_transferred, files = c.files_transferred, "globus task active");
                    progress.set(c.bytes_transferred, c.files_transferred, Some(c.files_total));
                }
                PollOutcome::Succeeded(c) => {
                    progress.set(c.bytes_transferred, c.files_transferred, Some(c.files_total));
                    info!(task_id = %task_id, "globus transfer succeeded");
                    return Ok(());
                }
            }
        }
    }

    async fn poll(&self, token: &TokenSource, task_id: &str) -> Result<GlobusTask> {
        let access = token.token().await?;
        self.api
            .get_task(&access.access_token, task_id)
            .await
            .map_err(|e| {
                e.context(format!(
                    "globus: can't continue transfer because an error occurred while polling the task \"{}\"",
                    task_id
                ))
            })
    }

    async fn cancel_remote(&self, token: &TokenSource, task_id: &str) -> Result<()> {
        warn!(task_id = %task_id, "cancelling globus task");
        let access = token.token().await?;
        let result = self
            .api
            .cancel_task(&access.access_token, task_id)
            .await
            .map_err(|e| e.context("globus: couldn't cancel task"))?;
        if !result.is_canceled() {
            return Err(IngestorError::RemoteTransfer(format!(
                "globus: couldn't cancel task - code: \"{}\", message: \"{}\"",
                result.code, result.message
            )));
        }
        Err(IngestorError::Cancelled)
    }
}

fn dataset_label(pid: &str) -> String {
    // Globus labels allow letters, digits, spaces, hyphens and underscores
    pid.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
