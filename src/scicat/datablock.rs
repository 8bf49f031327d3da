//! Splitting a file list into SciCat original datablocks

use super::types::{DataFile, OrigDatablock};
use crate::error::{IngestorError, Result};
use crate::task::FileEntry;

/// Largest dataset, in files, the catalog accepts
pub const TOTAL_MAXFILES: usize = 400_000;

/// Files per datablock
pub const BLOCK_MAXFILES: usize = 20_000;

/// Bytes per datablock (200 GB)
pub const BLOCK_MAXBYTES: u64 = 200 * 1024 * 1024 * 1024;

/// Group `files` into datablocks of at most [`BLOCK_MAXFILES`] files and
/// [`BLOCK_MAXBYTES`] bytes, in file-list order
///
/// A single file larger than [`BLOCK_MAXBYTES`] gets a block of its own.
/// Datasets with more than [`TOTAL_MAXFILES`] files are rejected.
pub fn plan_datablocks(
    files: &[FileEntry],
    dataset_pid: &str,
    owner_group: &str,
    access_groups: &[String],
) -> Result<Vec<OrigDatablock>> {
    if files.len() > TOTAL_MAXFILES {
        return Err(IngestorError::Preflight(format!(
            "can't ingest: the number of files ({}) exceeds the max. allowed ({})",
            files.len(),
            TOTAL_MAXFILES
        )));
    }

    let new_block = || OrigDatablock {
        dataset_id: dataset_pid.to_string(),
        size: 0,
        data_file_list: Vec::new(),
        owner_group: owner_group.to_string(),
        access_groups: access_groups.to_vec(),
    };

    let mut blocks = Vec::new();
    let mut current = new_block();
    for file in files {
        let full = current.data_file_list.len() >= BLOCK_MAXFILES
            || current.size.saturating_add(file.size) > BLOCK_MAXBYTES;
        if full && !current.data_file_list.is_empty() {
            blocks.push(std::mem::replace(&mut current, new_block()));
        }
        current.size += file.size;
        current.data_file_list.push(DataFile {
            path: file.path.clone(),
            size: file.size,
            time: file.modified.map(|t| t.to_rfc3339()),
        });
    }
    if !current.data_file_list.is_empty() {
        blocks.push(current);
    }
    Ok(blocks)
}
