/*!
 * OpenEM Ingestor
 *
 * Registers scientific datasets with SciCat and transfers their files:
 * - S3 multipart uploads through a presigned-URL broker, SHA-256 per part and composed
 * - Globus transfers with task monitoring and remote cancellation
 * - Hand-off to an external Globus transfer service
 * - Bounded worker pool with cancellable tasks and progress notifications
 */

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod notifier;
pub mod protocol;
pub mod scicat;
pub mod task;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod token;

// Re-export commonly used types
pub use config::{Config, TransferConfig};
pub use crate::core::{Orchestrator, QueueOptions, TaskQueue, TaskRunner};
pub use error::{IngestorError, Result};
pub use notifier::{BroadcastNotifier, FanoutNotifier, LoggingNotifier, ProgressNotifier, TaskEvent};
pub use task::{FileEntry, Status, TaskSnapshot, TransferMethod, TransferObjects, TransferTask};
pub use token::{TokenSnapshot, TokenSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
