//! In-memory fakes of the ingestor's external services
//!
//! Used by unit and integration tests; every fake records the calls it
//! receives so tests can assert on the exact protocol exchange.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{IngestorError, Result};
use crate::notifier::ProgressNotifier;
use crate::protocol::ext_globus::{ExternalTransferService, ScicatJob};
use crate::protocol::globus::{CancelResult, GlobusApi, GlobusTask, SubmitResult, TransferRequest};
use crate::protocol::s3::{
    sha256, to_base64, CompletePart, FinalizeDatasetRequest, ObjectStore, PresignedUpload,
    PresignedUrlBroker,
};
use crate::scicat::{ArchiveJobRequest, Catalog, OrigDatablock, UserInfo};
use crate::task::FileEntry;
use crate::token::{TokenRefresher, TokenSnapshot, TokenSource};

/// A notifier callback as seen by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Added(Uuid),
    Scheduled(Uuid),
    Canceled(Uuid),
    Removed(Uuid),
    Failed(Uuid, String),
    Completed(Uuid),
    Progress(Uuid, u8),
}

impl Notification {
    pub fn id(&self) -> Uuid {
        match self {
            Notification::Added(id)
            | Notification::Scheduled(id)
            | Notification::Canceled(id)
            | Notification::Removed(id)
            | Notification::Failed(id, _)
            | Notification::Completed(id)
            | Notification::Progress(id, _) => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Notification::Canceled(_) | Notification::Failed(..) | Notification::Completed(_)
        )
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().clone()
    }

    /// Terminal notifications of one task
    pub fn terminal(&self, id: Uuid) -> Vec<Notification> {
        self.events()
            .into_iter()
            .filter(|n| n.id() == id && n.is_terminal())
            .collect()
    }

    fn push(&self, n: Notification) {
        self.events.lock().push(n);
    }
}

impl ProgressNotifier for RecordingNotifier {
    fn on_task_scheduled(&self, id: Uuid) {
        self.push(Notification::Scheduled(id));
    }

    fn on_task_canceled(&self, id: Uuid) {
        self.push(Notification::Canceled(id));
    }

    fn on_task_added(&self, id: Uuid, _folder: &str) {
        self.push(Notification::Added(id));
    }

    fn on_task_removed(&self, id: Uuid) {
        self.push(Notification::Removed(id));
    }

    fn on_task_failed(&self, id: Uuid, err: &IngestorError) {
        self.push(Notification::Failed(id, err.to_string()));
    }

    fn on_task_completed(&self, id: Uuid, _elapsed_seconds: f64) {
        self.push(Notification::Completed(id));
    }

    fn on_task_progress(&self, id: Uuid, percent: u8) {
        self.push(Notification::Progress(id, percent));
    }
}

/// Refresher handing out a fixed token valid for an hour
#[derive(Debug, Default)]
pub struct StaticRefresher;

#[async_trait]
impl TokenRefresher for StaticRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSnapshot> {
        Ok(valid_token(&format!("access-for-{}", refresh_token)))
    }
}

fn valid_token(access: &str) -> TokenSnapshot {
    TokenSnapshot::new(access, "refresh", Utc::now() + ChronoDuration::hours(1))
}

/// Token source that never needs a network refresh
pub fn static_token(access: &str) -> Arc<TokenSource> {
    Arc::new(TokenSource::new(valid_token(access), Arc::new(StaticRefresher)))
}

/// A broker RPC received by [`MockBroker`]
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCall {
    PresignedUrls {
        object: String,
        parts: u64,
    },
    Complete {
        object: String,
        upload_id: String,
        parts: Vec<CompletePart>,
        checksum: String,
    },
    Abort {
        object: String,
        upload_id: String,
    },
    Finalize(FinalizeDatasetRequest),
    ServiceToken(String),
}

/// Broker answering with URLs on a fake store host
///
/// Single-part URLs are `https://store.test/<object>`, part URLs
/// `https://store.test/<object>?part=<n>`. Every multipart upload gets the
/// upload id configured with [`MockBroker::with_upload_id`] (default `U`).
#[derive(Debug)]
pub struct MockBroker {
    calls: Mutex<Vec<BrokerCall>>,
    upload_id: String,
    complete_error: Option<u16>,
    abort_error: Option<u16>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            upload_id: "U".into(),
            complete_error: None,
            abort_error: None,
        }
    }
}

impl MockBroker {
    pub fn with_upload_id(mut self, id: &str) -> Self {
        self.upload_id = id.into();
        self
    }

    pub fn failing_complete(mut self, status: u16) -> Self {
        self.complete_error = Some(status);
        self
    }

    pub fn failing_abort(mut self, status: u16) -> Self {
        self.abort_error = Some(status);
        self
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::Abort { upload_id, .. } => Some(upload_id),
                _ => None,
            })
            .collect()
    }

    pub fn completes(&self) -> Vec<BrokerCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, BrokerCall::Complete { .. }))
            .collect()
    }

    pub fn finalized(&self) -> Vec<FinalizeDatasetRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BrokerCall::Finalize(r) => Some(r),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PresignedUrlBroker for MockBroker {
    async fn presigned_urls(
        &self,
        _access_token: &str,
        object_name: &str,
        parts: u64,
    ) -> Result<PresignedUpload> {
        self.calls.lock().push(BrokerCall::PresignedUrls {
            object: object_name.into(),
            parts,
        });
        let base = format!("https://store.test/{}", object_name);
        let urls = if parts == 1 {
            vec![base]
        } else {
            (1..=parts).map(|n| format!("{}?part={}", base, n)).collect()
        };
        Ok(PresignedUpload {
            upload_id: self.upload_id.clone(),
            urls,
        })
    }

    async fn complete_upload(
        &self,
        _access_token: &str,
        object_name: &str,
        upload_id: &str,
        parts: &[CompletePart],
        checksum_sha256: &str,
    ) -> Result<()> {
        self.calls.lock().push(BrokerCall::Complete {
            object: object_name.into(),
            upload_id: upload_id.into(),
            parts: parts.to_vec(),
            checksum: checksum_sha256.into(),
        });
        match self.complete_error {
            Some(status) => Err(IngestorError::upstream("broker", status, "complete rejected")),
            None => Ok(()),
        }
    }

    async fn abort_multipart_upload(
        &self,
        _access_token: &str,
        object_name: &str,
        upload_id: &str,
    ) -> Result<()> {
        self.calls.lock().push(BrokerCall::Abort {
            object: object_name.into(),
            upload_id: upload_id.into(),
        });
        match self.abort_error {
            Some(status) => Err(IngestorError::upstream("broker", status, "abort rejected")),
            None => Ok(()),
        }
    }

    async fn finalize_dataset_upload(
        &self,
        _access_token: &str,
        request: &FinalizeDatasetRequest,
    ) -> Result<()> {
        self.calls.lock().push(BrokerCall::Finalize(request.clone()));
        Ok(())
    }

    async fn service_token(&self, user_token: &str) -> Result<TokenSnapshot> {
        self.calls
            .lock()
            .push(BrokerCall::ServiceToken(user_token.into()));
        Ok(valid_token("broker-access"))
    }
}

/// How [`MockObjectStore`] answers PUTs to a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutBehavior {
    /// Accept and return an ETag
    Accept,
    /// Answer every attempt with this HTTP status
    Fail(u16),
    /// Accept without an ETag header
    NoEtag,
    /// Never answer
    Hang,
}

/// One PUT received by [`MockObjectStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecord {
    pub url: String,
    pub len: usize,
    pub checksum: String,
}

/// Object store keyed by URL; unknown URLs accept
#[derive(Debug, Default)]
pub struct MockObjectStore {
    behaviors: Mutex<HashMap<String, PutBehavior>>,
    attempts: Mutex<HashMap<String, u32>>,
    puts: Mutex<Vec<PutRecord>>,
}

impl MockObjectStore {
    pub fn with(self, url: &str, behavior: PutBehavior) -> Self {
        self.behaviors.lock().insert(url.into(), behavior);
        self
    }

    /// Successful PUTs in arrival order
    pub fn puts(&self) -> Vec<PutRecord> {
        self.puts.lock().clone()
    }

    /// Number of attempts made against `url`, failed ones included
    pub fn attempts(&self, url: &str) -> u32 {
        self.attempts.lock().get(url).copied().unwrap_or(0)
    }

    /// ETag the store hands out for a body
    pub fn etag_for(body: &[u8]) -> String {
        format!("etag-{}", &to_base64(&sha256(body))[..12])
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn put(&self, url: &str, body: Bytes, checksum_sha256: &str) -> Result<Option<String>> {
        *self.attempts.lock().entry(url.to_string()).or_default() += 1;
        let behavior = self
            .behaviors
            .lock()
            .get(url)
            .copied()
            .unwrap_or(PutBehavior::Accept);

        match behavior {
            PutBehavior::Fail(status) => {
                Err(IngestorError::upstream("object store", status, "injected failure"))
            }
            PutBehavior::Hang => std::future::pending().await,
            PutBehavior::Accept | PutBehavior::NoEtag => {
                if checksum_sha256 != to_base64(&sha256(&body)) {
                    return Err(IngestorError::upstream("object store", 400, "BadDigest"));
                }
                self.puts.lock().push(PutRecord {
                    url: url.into(),
                    len: body.len(),
                    checksum: checksum_sha256.into(),
                });
                Ok((behavior == PutBehavior::Accept).then(|| Self::etag_for(&body)))
            }
        }
    }
}

/// Globus Transfer API double replaying scripted polls
#[derive(Debug)]
pub struct MockGlobus {
    submit: SubmitResult,
    polls: Mutex<VecDeque<GlobusTask>>,
    cancel_code: String,
    submitted: Mutex<Vec<TransferRequest>>,
    cancelled: Mutex<Vec<String>>,
}

impl MockGlobus {
    /// Accepts every submission as `task_id`; polls report SUCCEEDED
    pub fn accepting(task_id: &str) -> Self {
        Self {
            submit: SubmitResult {
                code: "Accepted".into(),
                task_id: task_id.into(),
                message: String::new(),
            },
            polls: Mutex::new(VecDeque::new()),
            cancel_code: "Canceled".into(),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(code: &str, message: &str) -> Self {
        let mut mock = Self::accepting("");
        mock.submit = SubmitResult {
            code: code.into(),
            task_id: String::new(),
            message: message.into(),
        };
        mock
    }

    /// Answers to successive polls; the last one repeats
    pub fn with_polls(self, polls: Vec<GlobusTask>) -> Self {
        *self.polls.lock() = polls.into();
        self
    }

    pub fn with_cancel_code(mut self, code: &str) -> Self {
        self.cancel_code = code.into();
        self
    }

    pub fn submitted(&self) -> Vec<TransferRequest> {
        self.submitted.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    /// Poll document with the given status and counters
    pub fn task(status: &str, bytes: u64, files: u64, files_total: u64) -> GlobusTask {
        GlobusTask {
            status: status.into(),
            bytes_transferred: bytes,
            files_transferred: files,
            files: files_total,
            files_skipped: None,
            fatal_error: None,
        }
    }
}

#[async_trait]
impl GlobusApi for MockGlobus {
    async fn submit_transfer(
        &self,
        _access_token: &str,
        request: &TransferRequest,
    ) -> Result<SubmitResult> {
        self.submitted.lock().push(request.clone());
        Ok(self.submit.clone())
    }

    async fn get_task(&self, _access_token: &str, _task_id: &str) -> Result<GlobusTask> {
        let mut polls = self.polls.lock();
        let next = if polls.len() > 1 {
            polls.pop_front()
        } else {
            polls.front().cloned()
        };
        Ok(next.unwrap_or_else(|| Self::task("SUCCEEDED", 0, 0, 0)))
    }

    async fn cancel_task(&self, _access_token: &str, task_id: &str) -> Result<CancelResult> {
        self.cancelled.lock().push(task_id.into());
        Ok(CancelResult {
            code: self.cancel_code.clone(),
            message: String::new(),
        })
    }
}

/// SciCat double storing datasets and datablocks in memory
#[derive(Debug)]
pub struct MockCatalog {
    user: UserInfo,
    pid: String,
    datasets: Mutex<Vec<Map<String, Value>>>,
    datablocks: Mutex<Vec<OrigDatablock>>,
    files_ready: Mutex<Vec<String>>,
    archive_jobs: Mutex<Vec<ArchiveJobRequest>>,
    jobs: Mutex<Vec<ScicatJob>>,
    healthy: bool,
}

impl MockCatalog {
    /// Catalog knowing `username` as a member of `groups`; datasets get `pid`
    pub fn new(username: &str, groups: &[&str], pid: &str) -> Self {
        Self {
            user: UserInfo {
                username: username.into(),
                email: format!("{}@example.org", username),
                display_name: username.into(),
                access_groups: groups.iter().map(|g| g.to_string()).collect(),
            },
            pid: pid.into(),
            datasets: Mutex::new(Vec::new()),
            datablocks: Mutex::new(Vec::new()),
            files_ready: Mutex::new(Vec::new()),
            archive_jobs: Mutex::new(Vec::new()),
            jobs: Mutex::new(Vec::new()),
            healthy: true,
        }
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn with_jobs(self, jobs: Vec<ScicatJob>) -> Self {
        *self.jobs.lock() = jobs;
        self
    }

    pub fn datasets(&self) -> Vec<Map<String, Value>> {
        self.datasets.lock().clone()
    }

    pub fn datablocks(&self) -> Vec<OrigDatablock> {
        self.datablocks.lock().clone()
    }

    pub fn files_ready(&self) -> Vec<String> {
        self.files_ready.lock().clone()
    }

    pub fn archive_jobs(&self) -> Vec<ArchiveJobRequest> {
        self.archive_jobs.lock().clone()
    }

    fn check_token(token: &str) -> Result<()> {
        if token.is_empty() {
            return Err(IngestorError::Auth("scicat: no access token was provided".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Catalog for MockCatalog {
    async fn user_info(&self, token: &str) -> Result<UserInfo> {
        Self::check_token(token)?;
        Ok(self.user.clone())
    }

    async fn create_dataset(&self, token: &str, metadata: &Map<String, Value>) -> Result<String> {
        Self::check_token(token)?;
        let mut stored = metadata.clone();
        stored.insert("pid".into(), Value::String(self.pid.clone()));
        self.datasets.lock().push(stored);
        Ok(self.pid.clone())
    }

    async fn create_orig_datablock(&self, token: &str, block: &OrigDatablock) -> Result<()> {
        Self::check_token(token)?;
        self.datablocks.lock().push(block.clone());
        Ok(())
    }

    async fn mark_files_ready(&self, token: &str, pid: &str) -> Result<()> {
        Self::check_token(token)?;
        self.files_ready.lock().push(pid.into());
        Ok(())
    }

    async fn create_archive_job(&self, token: &str, job: &ArchiveJobRequest) -> Result<()> {
        Self::check_token(token)?;
        self.archive_jobs.lock().push(job.clone());
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        if self.healthy {
            Ok(())
        } else {
            Err(IngestorError::upstream("scicat", 503, "health check failed"))
        }
    }

    async fn transfer_jobs(&self, token: &str, owner_user: &str) -> Result<Vec<ScicatJob>> {
        Self::check_token(token)?;
        Ok(self
            .jobs
            .lock()
            .iter()
            .filter(|j| j.owner_user == owner_user)
            .cloned()
            .collect())
    }
}

/// External transfer service double
#[derive(Debug, Default)]
pub struct MockExternalService {
    requested: Mutex<Vec<(String, Vec<FileEntry>)>>,
    cancelled: Mutex<Vec<(String, bool)>>,
}

impl MockExternalService {
    /// `(pid, files)` of every transfer request
    pub fn requested(&self) -> Vec<(String, Vec<FileEntry>)> {
        self.requested.lock().clone()
    }

    /// `(job id, delete)` of every cancellation
    pub fn cancelled(&self) -> Vec<(String, bool)> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl ExternalTransferService for MockExternalService {
    async fn request_transfer(
        &self,
        _scicat_token: &str,
        _source_facility: &str,
        _destination_facility: &str,
        pid: &str,
        files: &[FileEntry],
    ) -> Result<String> {
        let mut requested = self.requested.lock();
        requested.push((pid.into(), files.to_vec()));
        Ok(format!("job-{}", requested.len()))
    }

    async fn cancel_transfer(&self, _scicat_token: &str, job_id: &str, delete: bool) -> Result<()> {
        self.cancelled.lock().push((job_id.into(), delete));
        Ok(())
    }
}
