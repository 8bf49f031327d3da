//! SciCat catalog client
//!
//! The orchestrator needs a narrow slice of SciCat: the caller's identity,
//! dataset and datablock creation, the "files ready" lifecycle update, health
//! and the transfer jobs written by the external Globus service.

mod client;
mod datablock;
mod metadata;
mod types;

pub use client::{Catalog, ScicatClient, GLOBUS_TRANSFER_JOB};
pub use datablock::{plan_datablocks, BLOCK_MAXBYTES, BLOCK_MAXFILES, TOTAL_MAXFILES};
pub use metadata::prepare_metadata;
pub use types::{ArchiveJobParams, ArchiveJobRequest, DataFile, JobDataset, OrigDatablock, UserInfo};
