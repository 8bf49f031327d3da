/*!
 * Configuration types for the ingestor
 *
 * The daemon reads a single `openem-ingestor-config.yaml` (or `.toml`) file,
 * looked up beside the executable first and then in the user configuration
 * directory. Keys are PascalCase; unknown keys are rejected.
 */

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::core::retry::RetryPolicy;
use crate::error::{IngestorError, Result};
use crate::task::TransferMethod;

/// Base name of the configuration file, without extension
pub const CONFIG_FILE_NAME: &str = "openem-ingestor-config";

/// Directory under the user configuration dir holding the configuration file
pub const CONFIG_DIR_NAME: &str = "openem-ingestor";

const CONFIG_EXTENSIONS: [&str; 3] = ["yaml", "yml", "toml"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub scicat: ScicatConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub web_server: WebServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metadata_extractors: MetadataExtractorsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ScicatConfig {
    /// Base URL of the SciCat backend, e.g. `https://scicat.example.org/api/v3`
    #[serde(default)]
    pub host: String,

    /// Service token used for calls not made on behalf of a user (health checks)
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ScicatConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// What the producer does when the worker queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueFullPolicy {
    /// Wait for a free slot
    #[default]
    Block,
    /// Fail with `QueueFull`
    Reject,
}

/// How symbolic links found in a dataset folder are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymlinkPolicy {
    /// Keep links whose target stays inside the dataset folder, skip the rest
    #[default]
    KeepInternal,
    KeepAll,
    SkipAll,
    /// Fail the preflight when a link points outside the dataset folder
    RejectExternal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct TransferConfig {
    #[serde(default)]
    pub method: TransferMethod,

    /// Number of workers, each serving one task at a time
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Capacity of the channel between `schedule` and the workers
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default)]
    pub queue_full_policy: QueueFullPolicy,

    #[serde(default)]
    pub symlink_policy: SymlinkPolicy,

    /// Free-form storage location recorded with archive jobs
    #[serde(default)]
    pub storage_location: String,

    #[serde(default, rename = "S3")]
    pub s3: Option<S3TransferConfig>,

    #[serde(default)]
    pub globus: Option<GlobusTransferConfig>,

    #[serde(default)]
    pub ext_globus: Option<ExtGlobusConfig>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            method: TransferMethod::default(),
            concurrency_limit: default_concurrency_limit(),
            queue_size: default_queue_size(),
            queue_full_policy: QueueFullPolicy::default(),
            symlink_policy: SymlinkPolicy::default(),
            storage_location: String::new(),
            s3: None,
            globus: None,
            ext_globus: None,
        }
    }
}

/// S3 upload through the presigned-URL broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct S3TransferConfig {
    /// Base URL of the presigned-URL broker
    pub endpoint: String,

    /// OAuth2 token endpoint used to refresh broker service tokens
    #[serde(default)]
    pub token_url: String,

    #[serde(default, rename = "ClientID")]
    pub client_id: String,

    /// Minimum part size in MiB; smaller files are uploaded with a single PUT
    #[serde(default = "default_chunk_size_mb", rename = "ChunkSizeMB")]
    pub chunk_size_mb: u64,

    /// Files uploaded in parallel per task
    #[serde(default = "default_concurrent_files")]
    pub concurrent_files: usize,

    /// Size of the process-wide part upload pool
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl S3TransferConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token_url: String::new(),
            client_id: String::new(),
            chunk_size_mb: default_chunk_size_mb(),
            concurrent_files: default_concurrent_files(),
            pool_size: default_pool_size(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// Part size threshold in bytes
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct GlobusTransferConfig {
    #[serde(default, rename = "ClientID")]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default, rename = "RedirectURL")]
    pub redirect_url: String,

    #[serde(default)]
    pub scopes: Vec<String>,

    #[serde(rename = "SourceCollectionID")]
    pub source_collection_id: String,

    /// Path prefix of the dataset folders as seen from the source collection
    #[serde(default)]
    pub source_prefix_path: String,

    /// Local path at which the source collection is mounted; stripped from dataset folders
    #[serde(default)]
    pub collection_root_path: String,

    #[serde(rename = "DestinationCollectionID")]
    pub destination_collection_id: String,

    /// Destination path template, e.g. `/archive/{{ .Username }}/{{ .PidShort }}`
    pub destination_template: String,

    /// Refresh token seeding the process-wide Globus token source
    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default = "default_globus_transfer_api")]
    pub transfer_api_url: String,

    #[serde(default = "default_globus_token_url")]
    pub token_url: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl GlobusTransferConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for GlobusTransferConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            redirect_url: String::new(),
            scopes: Vec::new(),
            source_collection_id: String::new(),
            source_prefix_path: String::new(),
            collection_root_path: String::new(),
            destination_collection_id: String::new(),
            destination_template: String::new(),
            refresh_token: None,
            transfer_api_url: default_globus_transfer_api(),
            token_url: default_globus_token_url(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// External Globus transfer service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ExtGlobusConfig {
    pub transfer_service_url: String,

    #[serde(default)]
    pub collection_root_path: String,

    pub source_facility: String,

    pub destination_facility: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct WebServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Named collection roots; `sourceFolder` values are resolved against them
    #[serde(default)]
    pub collection_locations: BTreeMap<String, PathBuf>,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            collection_locations: BTreeMap::new(),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Write JSON logs to this file instead of stdout
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct MetadataExtractorsConfig {
    #[serde(default = "default_extractor_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub extractors: Vec<ExtractorConfig>,
}

impl Default for MetadataExtractorsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_extractor_timeout_secs(),
            extractors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ExtractorConfig {
    pub name: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_concurrency_limit() -> usize {
    2
}

fn default_queue_size() -> usize {
    100
}

fn default_chunk_size_mb() -> u64 {
    64
}

fn default_concurrent_files() -> usize {
    4
}

fn default_pool_size() -> usize {
    8
}

fn default_max_retries() -> u32 {
    10
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_globus_transfer_api() -> String {
    "https://transfer.api.globus.org/v0.10".to_string()
}

fn default_globus_token_url() -> String {
    "https://auth.globus.org/v2/oauth2/token".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_extractor_timeout_secs() -> u64 {
    3600
}

impl Config {
    /// Load the configuration, either from `explicit` or from the search path
    ///
    /// Returns the parsed configuration and the file it was read from.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, PathBuf)> {
        if let Some(path) = explicit {
            return Ok((Self::from_file(path)?, path.to_path_buf()));
        }

        for candidate in Self::search_paths() {
            if candidate.is_file() {
                return Ok((Self::from_file(&candidate)?, candidate));
            }
        }

        Err(IngestorError::Config(format!(
            "no {} file found beside the executable or in the user config directory",
            CONFIG_FILE_NAME
        )))
    }

    /// Candidate configuration files, in lookup order
    pub fn search_paths() -> Vec<PathBuf> {
        let mut dirs_to_search = Vec::new();
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            dirs_to_search.push(exe_dir);
        }
        if let Some(config_dir) = dirs::config_dir() {
            dirs_to_search.push(config_dir.join(CONFIG_DIR_NAME));
        }

        dirs_to_search
            .into_iter()
            .flat_map(|dir| {
                CONFIG_EXTENSIONS
                    .iter()
                    .map(move |ext| dir.join(format!("{}.{}", CONFIG_FILE_NAME, ext)))
            })
            .collect()
    }

    /// Parse a configuration file; `.toml` files are read as TOML, anything else as YAML
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestorError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let config = if is_toml {
            Self::from_toml_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| IngestorError::Config(format!("invalid YAML configuration: {}", e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| IngestorError::Config(format!("invalid TOML configuration: {}", e)))
    }

    /// Check that the options needed by the configured transfer method are present
    pub fn validate(&self) -> Result<()> {
        if self.scicat.host.trim().is_empty() {
            return Err(IngestorError::Config("Scicat.Host is required".into()));
        }
        if self.transfer.concurrency_limit == 0 {
            return Err(IngestorError::Config(
                "Transfer.ConcurrencyLimit must be at least 1".into(),
            ));
        }
        if self.transfer.queue_size == 0 {
            return Err(IngestorError::Config(
                "Transfer.QueueSize must be at least 1".into(),
            ));
        }

        match self.transfer.method {
            TransferMethod::S3 => {
                let s3 = self.transfer.s3.as_ref().ok_or_else(|| {
                    IngestorError::Config("Transfer.S3 is required for method S3".into())
                })?;
                if s3.endpoint.trim().is_empty() {
                    return Err(IngestorError::Config("Transfer.S3.Endpoint is required".into()));
                }
                if s3.chunk_size_mb == 0 || s3.concurrent_files == 0 || s3.pool_size == 0 {
                    return Err(IngestorError::Config(
                        "Transfer.S3.ChunkSizeMB, ConcurrentFiles and PoolSize must be positive"
                            .into(),
                    ));
                }
            }
            TransferMethod::Globus => {
                let globus = self.transfer.globus.as_ref().ok_or_else(|| {
                    IngestorError::Config("Transfer.Globus is required for method Globus".into())
                })?;
                if globus.source_collection_id.is_empty()
                    || globus.destination_collection_id.is_empty()
                {
                    return Err(IngestorError::Config(
                        "Transfer.Globus source and destination collection ids are required"
                            .into(),
                    ));
                }
                if globus.destination_template.trim().is_empty() {
                    return Err(IngestorError::Config(
                        "Transfer.Globus.DestinationTemplate is required".into(),
                    ));
                }
                if globus.poll_interval_secs == 0 {
                    return Err(IngestorError::Config(
                        "Transfer.Globus.PollIntervalSecs must be positive".into(),
                    ));
                }
            }
            TransferMethod::ExtGlobus => {
                let ext = self.transfer.ext_globus.as_ref().ok_or_else(|| {
                    IngestorError::Config(
                        "Transfer.ExtGlobus is required for method ExtGlobus".into(),
                    )
                })?;
                if ext.transfer_service_url.is_empty()
                    || ext.source_facility.is_empty()
                    || ext.destination_facility.is_empty()
                {
                    return Err(IngestorError::Config(
                        "Transfer.ExtGlobus needs TransferServiceUrl, SourceFacility and DestinationFacility"
                            .into(),
                    ));
                }
            }
            TransferMethod::None => {}
        }

        Ok(())
    }
}
