/*!
 * Metadata extraction
 *
 * Extractors turn a dataset folder into a JSON metadata object. The
 * ingestor ships one implementation that runs a configured executable as
 * `<executable> <args...> <folder> <output file>` and reads the JSON the
 * executable wrote.
 */

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ExtractorConfig, MetadataExtractorsConfig};
use crate::error::{IngestorError, Result};

#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Extract the metadata object of `folder`
    async fn extract(&self, folder: &Path, cancel: &CancellationToken) -> Result<Map<String, Value>>;
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs an external executable
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    name: String,
    executable: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    output_dir: PathBuf,
}

impl CommandExtractor {
    pub fn new(config: &ExtractorConfig, timeout: Duration) -> Self {
        Self {
            name: config.name.clone(),
            executable: config.executable.clone(),
            args: config.args.clone(),
            timeout,
            output_dir: std::env::temp_dir()
                .join("openem-ingestor")
                .join("metadata-extractor"),
        }
    }

    /// All extractors of the configuration
    pub fn from_config(config: &MetadataExtractorsConfig) -> Vec<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        config
            .extractors
            .iter()
            .map(|e| Self::new(e, timeout))
            .collect()
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    async fn run(&self, folder: &Path, output: &Path, cancel: &CancellationToken) -> Result<()> {
        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .arg(folder)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                IngestorError::Preflight(format!(
                    "failed to start extractor {} ({}): {}",
                    self.name,
                    self.executable.display(),
                    e
                ))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let name = self.name.clone();
        let out_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(extractor = %name, "{}", line);
                }
            }
        });
        let name = self.name.clone();
        let err_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(extractor = %name, "{}", line);
                }
            }
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
            status = child.wait() => Outcome::Exited(status),
        };
        let status = match outcome {
            Outcome::Exited(status) => status?,
            Outcome::TimedOut => {
                let _ = child.kill().await;
                return Err(IngestorError::Preflight(format!(
                    "extractor {} timed out after {}s",
                    self.name,
                    self.timeout.as_secs_f64()
                )));
            }
            Outcome::Cancelled => {
                let _ = child.kill().await;
                return Err(IngestorError::Cancelled);
            }
        };
        let _ = out_task.await;
        let _ = err_task.await;

        if !status.success() {
            return Err(IngestorError::Preflight(format!(
                "extractor {} exited with {}",
                self.name, status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataExtractor for CommandExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, folder: &Path, cancel: &CancellationToken) -> Result<Map<String, Value>> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let output = self.output_dir.join(format!("{}.json", Uuid::new_v4()));
        debug!(extractor = %self.name, folder = %folder.display(), "running metadata extractor");

        let result = self.run(folder, &output, cancel).await;
        let content = match result {
            Ok(()) => tokio::fs::read_to_string(&output).await.map_err(|e| {
                IngestorError::Preflight(format!(
                    "extractor {} wrote no output file: {}",
                    self.name, e
                ))
            }),
            Err(e) => Err(e),
        };
        let _ = tokio::fs::remove_file(&output).await;

        match serde_json::from_str::<Value>(&content?)? {
            Value::Object(map) => Ok(map),
            _ => Err(IngestorError::Preflight(format!(
                "extractor {} did not produce a JSON object",
                self.name
            ))),
        }
    }
}
