/*!
 * Ingest pipeline of one task
 *
 * Registers the dataset in SciCat, creates its datablocks, hands the file
 * list to the task's transfer method and finally marks the files as ready
 * for archiving. The queue runs it through [`TaskRunner`]; the server calls
 * [`Orchestrator::ingest_in_place`] directly for method `None`.
 */

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{Config, ExtGlobusConfig};
use crate::core::file_list::METADATA_FILE_NAME;
use crate::core::progress::TransferProgress;
use crate::core::queue::TaskRunner;
use crate::core::retry::{cancellable, RetryPolicy};
use crate::error::{IngestorError, Result};
use crate::metadata::MetadataExtractor;
use crate::notifier::ProgressNotifier;
use crate::protocol::ext_globus::{ExtGlobusClient, ExternalTransferService};
use crate::protocol::globus::{GlobusClient, GlobusTransfer};
use crate::protocol::s3::{BrokerClient, HttpObjectStore, S3Uploader};
use crate::scicat::{
    plan_datablocks, prepare_metadata, ArchiveJobRequest, Catalog, ScicatClient, UserInfo,
};
use crate::task::{ArchivalJobInfo, FileEntry, TaskResult, TransferMethod, TransferTask};
use crate::token::{OAuthRefresher, TokenRefresher, TokenSource};

/// A dataset registered in SciCat
#[derive(Debug, Clone)]
pub struct Registration {
    pub pid: String,
    pub user: UserInfo,
    /// Metadata as sent to SciCat, after completion of the missing fields
    pub metadata: Map<String, Value>,
}

impl Registration {
    fn str_field(&self, key: &str) -> String {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

struct S3Method {
    uploader: S3Uploader,
    refresher: Arc<dyn TokenRefresher>,
}

struct GlobusMethod {
    transfer: GlobusTransfer,
    token: Option<Arc<TokenSource>>,
}

struct ExtGlobusMethod {
    service: Arc<dyn ExternalTransferService>,
    config: ExtGlobusConfig,
}

/// Runs the ingest pipeline for every transfer method
pub struct Orchestrator {
    catalog: Arc<dyn Catalog>,
    notifier: Arc<dyn ProgressNotifier>,
    extractor: Option<Arc<dyn MetadataExtractor>>,
    s3: Option<S3Method>,
    globus: Option<GlobusMethod>,
    ext_globus: Option<ExtGlobusMethod>,
}

impl Orchestrator {
    pub fn new(catalog: Arc<dyn Catalog>, notifier: Arc<dyn ProgressNotifier>) -> Self {
        Self {
            catalog,
            notifier,
            extractor: None,
            s3: None,
            globus: None,
            ext_globus: None,
        }
    }

    /// Enable S3; `refresher` renews broker service tokens
    pub fn with_s3(mut self, uploader: S3Uploader, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.s3 = Some(S3Method { uploader, refresher });
        self
    }

    /// Enable Globus; `token` is used for tasks that carry no token of their own
    pub fn with_globus(mut self, transfer: GlobusTransfer, token: Option<Arc<TokenSource>>) -> Self {
        self.globus = Some(GlobusMethod { transfer, token });
        self
    }

    pub fn with_ext_globus(
        mut self,
        service: Arc<dyn ExternalTransferService>,
        config: ExtGlobusConfig,
    ) -> Self {
        self.ext_globus = Some(ExtGlobusMethod { service, config });
        self
    }

    /// Extractor consulted when a folder has no metadata file
    pub fn with_extractor(mut self, extractor: Arc<dyn MetadataExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Build HTTP clients for SciCat and every configured transfer method
    pub fn from_config(config: &Config, notifier: Arc<dyn ProgressNotifier>) -> Result<Self> {
        let scicat = ScicatClient::new(
            &config.scicat.host,
            config.scicat.request_timeout(),
            RetryPolicy::default(),
        )?;
        let mut orchestrator = Self::new(Arc::new(scicat), notifier);

        if let Some(s3) = &config.transfer.s3 {
            let broker = BrokerClient::new(&s3.endpoint, s3.request_timeout(), s3.retry_policy())?;
            let store = HttpObjectStore::shared(s3.request_timeout())?;
            let http = reqwest::Client::builder()
                .timeout(s3.request_timeout())
                .build()
                .map_err(|e| IngestorError::Config(format!("failed to build token client: {}", e)))?;
            let refresher = OAuthRefresher::new(http, &s3.token_url, &s3.client_id, None);
            let uploader = S3Uploader::new(Arc::new(broker), Arc::new(store), s3.clone());
            orchestrator = orchestrator.with_s3(uploader, Arc::new(refresher));
        }

        if let Some(globus) = &config.transfer.globus {
            let client = GlobusClient::new(
                &globus.transfer_api_url,
                config.scicat.request_timeout(),
                RetryPolicy::default(),
            )?;
            let token = globus.refresh_token.as_ref().map(|refresh| {
                let refresher = OAuthRefresher::new(
                    client.http().clone(),
                    &globus.token_url,
                    &globus.client_id,
                    globus.client_secret.clone(),
                );
                Arc::new(TokenSource::from_refresh_token(refresh.clone(), Arc::new(refresher)))
            });
            let transfer = GlobusTransfer::new(Arc::new(client), Arc::new(globus.clone()))?
                .with_poll_interval(globus.poll_interval());
            orchestrator = orchestrator.with_globus(transfer, token);
        }

        if let Some(ext) = &config.transfer.ext_globus {
            let client = ExtGlobusClient::new(&ext.transfer_service_url, config.scicat.request_timeout())?;
            orchestrator = orchestrator.with_ext_globus(Arc::new(client), ext.clone());
        }

        if let Some(extractor) = crate::metadata::CommandExtractor::from_config(&config.metadata_extractors)
            .into_iter()
            .next()
        {
            orchestrator = orchestrator.with_extractor(Arc::new(extractor));
        }
        Ok(orchestrator)
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Exchange a SciCat token for a broker service token source
    pub async fn broker_token(&self, scicat_token: &str) -> Result<Arc<TokenSource>> {
        let s3 = self.s3.as_ref().ok_or_else(|| not_configured(TransferMethod::S3))?;
        let snapshot = s3
            .uploader
            .broker()
            .service_token(scicat_token)
            .await
            .map_err(|e| IngestorError::Auth(format!("broker service token exchange failed: {}", e)))?;
        Ok(Arc::new(TokenSource::new(snapshot, s3.refresher.clone())))
    }

    /// Check the metadata, create the dataset and its datablocks
    ///
    /// `metadata` takes priority over the folder's `metadata.json`.
    pub async fn register_dataset(
        &self,
        folder: &Path,
        files: &[FileEntry],
        metadata: Option<Map<String, Value>>,
        scicat_token: &str,
        on_central_disk: bool,
        cancel: &CancellationToken,
    ) -> Result<Registration> {
        let mut metadata = match metadata {
            Some(m) => m,
            None => self.read_metadata(folder, cancel).await?,
        };

        let user = self.catalog.user_info(scicat_token).await?;
        prepare_metadata(&mut metadata, &user, folder, files, on_central_disk)?;

        let owner_group = metadata
            .get("ownerGroup")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let access_groups: Vec<String> = metadata
            .get("accessGroups")
            .and_then(Value::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(|g| g.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        // Checked before anything is created
        let mut blocks = plan_datablocks(files, "", &owner_group, &access_groups)?;

        let pid = self.catalog.create_dataset(scicat_token, &metadata).await?;
        for block in &mut blocks {
            block.dataset_id = pid.clone();
            self.catalog.create_orig_datablock(scicat_token, block).await?;
        }
        info!(pid = %pid, datablocks = blocks.len(), files = files.len(), "dataset registered");

        Ok(Registration {
            pid,
            user,
            metadata,
        })
    }

    /// Register a dataset that is not transferred, optionally requesting archival
    pub async fn ingest_in_place(
        &self,
        folder: &Path,
        files: &[FileEntry],
        metadata: Option<Map<String, Value>>,
        scicat_token: &str,
        auto_archive: bool,
    ) -> Result<Registration> {
        let never = CancellationToken::new();
        let registration = self
            .register_dataset(folder, files, metadata, scicat_token, true, &never)
            .await?;
        if auto_archive {
            let job = ArchiveJobRequest::single(
                &registration.user,
                &registration.str_field("ownerGroup"),
                &registration.pid,
            );
            self.catalog.create_archive_job(scicat_token, &job).await?;
            info!(pid = %registration.pid, "archive job created");
        }
        Ok(registration)
    }

    async fn read_metadata(&self, folder: &Path, cancel: &CancellationToken) -> Result<Map<String, Value>> {
        let path = folder.join(METADATA_FILE_NAME);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(extractor) = &self.extractor {
                    debug!(extractor = extractor.name(), "no metadata file, running extractor");
                    return extractor.extract(folder, cancel).await;
                }
                return Err(IngestorError::Preflight(format!(
                    "{} not found in {}",
                    METADATA_FILE_NAME,
                    folder.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(IngestorError::Preflight(format!(
                "{} is not a JSON object",
                path.display()
            ))),
            Err(e) => Err(IngestorError::Preflight(format!(
                "invalid {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn ingest(&self, task: &Arc<TransferTask>) -> Result<()> {
        let cancel = task.cancel_token();
        let objects = task.transfer_objects();
        let method = task.method();

        let registration = cancellable(
            cancel,
            self.register_dataset(
                task.folder(),
                task.file_list(),
                objects.metadata.clone(),
                &objects.scicat_token,
                method == TransferMethod::None,
                cancel,
            ),
        )
        .await?;
        task.set_dataset_id(&registration.pid);

        if task.file_list().is_empty() {
            info!(pid = %registration.pid, "empty dataset, nothing to transfer");
        } else {
            match method {
                TransferMethod::S3 => self.transfer_s3(task, &registration).await?,
                TransferMethod::Globus => self.transfer_globus(task, &registration).await?,
                TransferMethod::ExtGlobus => self.transfer_external(task, &registration).await?,
                TransferMethod::None => {}
            }
        }

        if matches!(method, TransferMethod::S3 | TransferMethod::Globus) {
            cancellable(
                cancel,
                self.catalog.mark_files_ready(&objects.scicat_token, &registration.pid),
            )
            .await?;
        }
        Ok(())
    }

    async fn transfer_s3(&self, task: &Arc<TransferTask>, registration: &Registration) -> Result<()> {
        let s3 = self.s3.as_ref().ok_or_else(|| not_configured(TransferMethod::S3))?;
        let cancel = task.cancel_token();
        let objects = task.transfer_objects();

        let source = match &objects.broker_token {
            Some(source) => source.clone(),
            None => cancellable(cancel, self.broker_token(&objects.scicat_token)).await?,
        };
        let access = cancellable(cancel, source.token()).await?.access_token;

        let progress = Arc::new(TransferProgress::new(task.clone(), self.notifier.clone()));
        s3.uploader
            .upload_dataset(
                &registration.pid,
                task.folder(),
                task.file_list(),
                &access,
                progress,
                cancel,
            )
            .await?;

        let archival = archival_info(&objects.archival, registration);
        cancellable(
            cancel,
            s3.uploader.finalize_dataset(&access, &registration.pid, &archival),
        )
        .await
    }

    async fn transfer_globus(&self, task: &Arc<TransferTask>, registration: &Registration) -> Result<()> {
        let globus = self
            .globus
            .as_ref()
            .ok_or_else(|| not_configured(TransferMethod::Globus))?;
        let token = task
            .transfer_objects()
            .globus_token
            .clone()
            .or_else(|| globus.token.clone())
            .ok_or_else(|| IngestorError::Auth("globus: no transfer token available".into()))?;

        let progress = TransferProgress::new(task.clone(), self.notifier.clone());
        globus
            .transfer
            .transfer_dataset(
                task.folder(),
                &registration.pid,
                &registration.user.username,
                task.file_list(),
                &token,
                &progress,
                task.cancel_token(),
            )
            .await
    }

    async fn transfer_external(&self, task: &Arc<TransferTask>, registration: &Registration) -> Result<()> {
        let ext = self
            .ext_globus
            .as_ref()
            .ok_or_else(|| not_configured(TransferMethod::ExtGlobus))?;
        let cancel = task.cancel_token();
        let token = &task.transfer_objects().scicat_token;

        let job_id = cancellable(
            cancel,
            ext.service.request_transfer(
                token,
                &ext.config.source_facility,
                &ext.config.destination_facility,
                &registration.pid,
                task.file_list(),
            ),
        )
        .await?;

        if cancel.is_cancelled() {
            warn!(job_id = %job_id, "task cancelled, withdrawing external transfer");
            ext.service.cancel_transfer(token, &job_id, true).await?;
            return Err(IngestorError::Cancelled);
        }
        info!(job_id = %job_id, pid = %registration.pid, "external transfer requested");
        Ok(())
    }
}

/// Archival info of the task, completed from the registered dataset
fn archival_info(requested: &ArchivalJobInfo, registration: &Registration) -> ArchivalJobInfo {
    let or = |value: &str, fallback: String| {
        if value.is_empty() {
            fallback
        } else {
            value.to_string()
        }
    };
    ArchivalJobInfo {
        owner_user: or(&requested.owner_user, registration.user.username.clone()),
        owner_group: or(&requested.owner_group, registration.str_field("ownerGroup")),
        contact_email: or(&requested.contact_email, registration.str_field("contactEmail")),
        auto_archive: requested.auto_archive,
    }
}

fn not_configured(method: TransferMethod) -> IngestorError {
    IngestorError::Config(format!("transfer method {} is not configured", method))
}

#[async_trait]
impl TaskRunner for Orchestrator {
    async fn run(&self, task: Arc<TransferTask>) -> TaskResult {
        let started = Instant::now();
        let span = info_span!("ingest", id = %task.id(), method = %task.method());
        let error = self.ingest(&task).instrument(span).await.err();
        TaskResult {
            elapsed_seconds: started.elapsed().as_secs_f64(),
            error,
        }
    }
}
