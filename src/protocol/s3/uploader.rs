//! Per-dataset, per-file and per-part upload logic

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::broker::PresignedUrlBroker;
use super::checksum::{compose_checksum, decode_presigned_url, sha256, to_base64};
use super::store::ObjectStore;
use super::types::{CompletePart, FinalizeDatasetRequest};
use crate::config::S3TransferConfig;
use crate::core::progress::TransferProgress;
use crate::core::retry::{cancellable, with_retry, RetryPolicy};
use crate::error::{IngestorError, Result};
use crate::task::{ArchivalJobInfo, FileEntry};

/// Prefix of every uploaded object name
pub const OBJECT_PREFIX: &str = "openem-network/datasets/";

/// `openem-network/datasets/{pid}/raw_files/{relative path}`
pub fn object_name(dataset_pid: &str, relative_path: &str) -> String {
    format!("{}{}/raw_files/{}", OBJECT_PREFIX, dataset_pid, relative_path)
}

static PART_POOL: OnceLock<Arc<Semaphore>> = OnceLock::new();

/// Process-wide part upload pool; the size given on first use wins
pub fn part_pool(size: usize) -> Arc<Semaphore> {
    PART_POOL
        .get_or_init(|| Arc::new(Semaphore::new(size.max(1))))
        .clone()
}

/// A part that made it to the object store
#[derive(Debug)]
struct UploadedPart {
    part_number: u32,
    etag: String,
    digest: [u8; 32],
    checksum: String,
}

/// Uploads the files of a dataset through the broker
#[derive(Clone)]
pub struct S3Uploader {
    broker: Arc<dyn PresignedUrlBroker>,
    store: Arc<dyn ObjectStore>,
    config: Arc<S3TransferConfig>,
    retry: RetryPolicy,
    pool: Arc<Semaphore>,
}

impl S3Uploader {
    pub fn new(
        broker: Arc<dyn PresignedUrlBroker>,
        store: Arc<dyn ObjectStore>,
        config: S3TransferConfig,
    ) -> Self {
        let pool = part_pool(config.pool_size);
        let retry = config.retry_policy();
        Self {
            broker,
            store,
            config: Arc::new(config),
            retry,
            pool,
        }
    }

    /// Use a dedicated part pool instead of the process-wide one
    pub fn with_pool(mut self, pool: Arc<Semaphore>) -> Self {
        self.pool = pool;
        self
    }

    pub fn broker(&self) -> &Arc<dyn PresignedUrlBroker> {
        &self.broker
    }

    /// Upload every regular file of `files`, at most `ConcurrentFiles` at a time
    ///
    /// The first failing file cancels the others. Returns
    /// [`IngestorError::Cancelled`] if `cancel` fired, whatever else failed.
    #[instrument(skip_all, fields(dataset = %dataset_pid, files = files.len()))]
    pub async fn upload_dataset(
        &self,
        dataset_pid: &str,
        folder: &Path,
        files: &[FileEntry],
        access_token: &str,
        progress: Arc<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let group = cancel.child_token();
        let limit = Arc::new(Semaphore::new(self.config.concurrent_files.max(1)));
        let mut set = JoinSet::new();

        for file in files {
            let permit = tokio::select! {
                permit = limit.clone().acquire_owned() => permit
                    .map_err(|_| IngestorError::Internal("file limiter closed".into()))?,
                _ = group.cancelled() => break,
            };

            let uploader = self.clone();
            let group = group.clone();
            let path = folder.join(&file.path);
            let object = object_name(dataset_pid, &file.path);
            let token = access_token.to_string();
            let progress = progress.clone();

            set.spawn(async move {
                let _permit = permit;
                let result = uploader
                    .upload_file(&path, &object, &token, &progress, &group)
                    .await
                    .map_err(|e| e.context(format!("uploading {}", object)));
                if result.is_err() {
                    group.cancel();
                }
                result
            });
        }

        let (_, first_error) = join_all(&mut set).await;
        if cancel.is_cancelled() {
            return Err(IngestorError::Cancelled);
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!("all files uploaded");
                Ok(())
            }
        }
    }

    /// Tell the broker the dataset is complete
    pub async fn finalize_dataset(
        &self,
        access_token: &str,
        dataset_pid: &str,
        archival: &ArchivalJobInfo,
    ) -> Result<()> {
        let request = FinalizeDatasetRequest {
            dataset_pid: dataset_pid.to_string(),
            owner_user: archival.owner_user.clone(),
            owner_group: archival.owner_group.clone(),
            contact_email: archival.contact_email.clone(),
            create_archiving_job: archival.auto_archive,
        };
        self.broker
            .finalize_dataset_upload(access_token, &request)
            .await
            .map_err(|e| e.context("finalizing dataset upload"))
    }

    async fn upload_file(
        &self,
        path: &Path,
        object: &str,
        access_token: &str,
        progress: &Arc<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.is_dir() {
            return Ok(());
        }

        let size = metadata.len();
        if size < self.config.chunk_size_bytes() {
            self.upload_single(path, object, access_token, progress, cancel)
                .await
        } else {
            self.upload_multipart(path, object, size, access_token, progress, cancel)
                .await
        }
    }

    async fn upload_single(
        &self,
        path: &Path,
        object: &str,
        access_token: &str,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let upload = cancellable(cancel, self.broker.presigned_urls(access_token, object, 1)).await?;
        let url = upload
            .urls
            .first()
            .map(|u| decode_presigned_url(u))
            .ok_or_else(|| IngestorError::Integrity("broker returned no presigned URL".into()))?;

        let body = Bytes::from(tokio::fs::read(path).await?);
        let len = body.len() as u64;
        let checksum = to_base64(&sha256(&body));
        self.put_with_retry(&url, body, &checksum, cancel).await?;

        progress.add_bytes(len);
        progress.add_files(1);
        debug!(object, bytes = len, "uploaded file");
        Ok(())
    }

    async fn upload_multipart(
        &self,
        path: &Path,
        object: &str,
        size: u64,
        access_token: &str,
        progress: &Arc<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let chunk = self.config.chunk_size_bytes();
        let part_count = size.div_ceil(chunk);

        let upload = cancellable(
            cancel,
            self.broker.presigned_urls(access_token, object, part_count),
        )
        .await?;
        if upload.upload_id.is_empty() {
            return Err(IngestorError::Integrity(format!(
                "broker returned no upload id for {}",
                object
            )));
        }
        let upload_id = upload.upload_id;

        let result = self
            .upload_parts_and_complete(
                path,
                object,
                size,
                &upload_id,
                upload.urls,
                access_token,
                progress,
                cancel,
            )
            .await;

        match result {
            Ok(()) => {
                progress.add_files(1);
                debug!(object, parts = part_count, "multipart upload completed");
                Ok(())
            }
            Err(cause) => {
                warn!(object, upload_id = %upload_id, error = %cause, "aborting multipart upload");
                match self
                    .broker
                    .abort_multipart_upload(access_token, object, &upload_id)
                    .await
                {
                    Ok(()) => Err(cause),
                    Err(abort) => Err(IngestorError::AbortFailed {
                        abort: abort.to_string(),
                        cause: Box::new(cause),
                    }),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts_and_complete(
        &self,
        path: &Path,
        object: &str,
        size: u64,
        upload_id: &str,
        urls: Vec<String>,
        access_token: &str,
        progress: &Arc<TransferProgress>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let chunk = self.config.chunk_size_bytes();
        let part_count = size.div_ceil(chunk);
        if urls.len() as u64 != part_count {
            return Err(IngestorError::Integrity(format!(
                "broker returned {} URLs for {} parts",
                urls.len(),
                part_count
            )));
        }

        // Part jobs of this file; siblings stop on the first failure
        let group = cancel.child_token();
        let mut set = JoinSet::new();
        for (index, url) in urls.into_iter().enumerate() {
            let offset = index as u64 * chunk;
            let len = chunk.min(size - offset);
            let uploader = self.clone();
            let group = group.clone();
            let path: PathBuf = path.to_path_buf();
            let progress = progress.clone();
            set.spawn(async move {
                let result = uploader
                    .upload_part(&path, index as u32 + 1, offset, len, &url, &progress, &group)
                    .await;
                if result.is_err() {
                    group.cancel();
                }
                result
            });
        }

        let (mut parts, first_error) = join_all(&mut set).await;
        if cancel.is_cancelled() {
            return Err(IngestorError::Cancelled);
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        parts.sort_by_key(|p| p.part_number);
        let composed = compose_checksum(parts.iter().map(|p| &p.digest));
        let complete_parts: Vec<CompletePart> = parts
            .into_iter()
            .map(|p| CompletePart {
                etag: p.etag,
                part_number: p.part_number,
                checksum_sha256: p.checksum,
            })
            .collect();

        // The broker client owns the retry loop for its RPCs
        cancellable(
            cancel,
            self.broker
                .complete_upload(access_token, object, upload_id, &complete_parts, &composed),
        )
        .await
        .map_err(|e| {
            if e.is_cancelled() || e.is_transient() {
                e
            } else {
                IngestorError::Integrity(format!("completing {} was rejected: {}", object, e))
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_part(
        &self,
        path: &Path,
        part_number: u32,
        offset: u64,
        len: u64,
        url: &str,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<UploadedPart> {
        let _permit = tokio::select! {
            permit = self.pool.clone().acquire_owned() => permit
                .map_err(|_| IngestorError::Internal("part pool closed".into()))?,
            _ = cancel.cancelled() => return Err(IngestorError::Cancelled),
        };

        let body = read_slice(path, offset, len).await?;
        let digest = sha256(&body);
        let checksum = to_base64(&digest);
        let url = decode_presigned_url(url);

        let etag = self
            .put_with_retry(&url, Bytes::from(body), &checksum, cancel)
            .await?
            .ok_or_else(|| {
                IngestorError::Integrity(format!("no ETag returned for part {}", part_number))
            })?;

        progress.add_bytes(len);
        Ok(UploadedPart {
            part_number,
            etag,
            digest,
            checksum,
        })
    }

    async fn put_with_retry(
        &self,
        url: &str,
        body: Bytes,
        checksum: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let store = &self.store;
        with_retry(&self.retry, cancel, "object PUT", || {
            let body = body.clone();
            async move { cancellable(cancel, store.put(url, body, checksum)).await }
        })
        .await
    }
}

async fn read_slice(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

fn flatten<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    joined.map_err(|e| IngestorError::Internal(format!("upload job panicked: {}", e)))?
}

/// Keep the error that caused the group to stop, not a sibling's cancellation
fn prefer_cause(current: Option<IngestorError>, new: IngestorError) -> IngestorError {
    match current {
        None => new,
        Some(existing) if existing.is_cancelled() && !new.is_cancelled() => new,
        Some(existing) => existing,
    }
}

/// Drain `set`, collecting successes and the causal error
async fn join_all<T: 'static>(set: &mut JoinSet<Result<T>>) -> (Vec<T>, Option<IngestorError>) {
    let mut values = Vec::new();
    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match flatten(joined) {
            Ok(value) => values.push(value),
            Err(err) => first_error = Some(prefer_cause(first_error, err)),
        }
    }
    (values, first_error)
}
