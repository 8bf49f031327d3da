/*!
 * Transfer orchestration: queue, ingest pipeline and their helpers
 */

pub mod file_list;
pub mod ingest;
pub mod progress;
pub mod queue;
pub mod retry;

pub use file_list::{collect_file_list, METADATA_FILE_NAME};
pub use ingest::{Orchestrator, Registration};
pub use progress::TransferProgress;
pub use queue::{QueueOptions, TaskQueue, TaskRunner};
pub use retry::{cancellable, with_retry, BackoffStrategy, RetryPolicy};
