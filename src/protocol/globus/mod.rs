//! Globus transfers
//!
//! A dataset is submitted as one file-list transfer between the source and
//! destination collections. The monitor polls the Globus task (immediately,
//! then once per poll interval), maps its counters onto the task progress and
//! cancels the Globus task when the ingestor task is cancelled.

mod client;
mod monitor;
mod template;
mod types;

pub use client::{GlobusApi, GlobusClient};
pub use monitor::{interpret, Counters, GlobusTransfer, PollOutcome};
pub use template::{posix_base, posix_dir, posix_join, to_posix, DestinationTemplate, TemplateFields};
pub use types::{CancelResult, FatalError, GlobusTask, SubmitResult, TransferItem, TransferRequest};
