//! Transfer tasks and their state machine
//!
//! A [`TransferTask`] is created by the queue for one dataset folder and
//! mutated by at most one worker between `schedule` and its terminal status.
//! All status and progress changes go through the transition methods on the
//! task; anything outside the transition table is silently ignored.
//!
//! ```text
//! Waiting ──schedule──▶ Waiting (message="queued")
//! Waiting ──workerStart──▶ Transferring
//! Transferring ──progress──▶ Transferring
//! Transferring ──finish──▶ Finished
//! Transferring ──error──▶ Failed
//! {Waiting,Transferring} ──cancel──▶ Cancelled
//! ```

mod transfer_task;
mod types;

pub use transfer_task::TransferTask;
pub use types::{
    ArchivalJobInfo, FileEntry, Status, TaskDetails, TaskResult, TaskSnapshot, TransferMethod,
    TransferObjects,
};
