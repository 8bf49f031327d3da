/*!
 * Dataset folder enumeration
 *
 * The folder is walked once when a task is created; the resulting list is
 * fixed for the lifetime of the task. Directories are not listed, paths are
 * relative to the folder and `/`-separated, entries are sorted by path.
 */

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::SymlinkPolicy;
use crate::error::{IngestorError, Result};
use crate::task::FileEntry;

/// Name of the metadata file expected in every dataset folder
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Enumerate `folder` according to `policy`
pub fn collect_file_list(folder: &Path, policy: SymlinkPolicy) -> Result<Vec<FileEntry>> {
    if !folder.is_dir() {
        return Err(IngestorError::Preflight(format!(
            "dataset folder {} does not exist or is not a directory",
            folder.display()
        )));
    }
    let root = folder.canonicalize()?;

    let mut files = Vec::new();
    let mut illegal = Vec::new();
    let mut external_links = Vec::new();

    for entry in WalkDir::new(folder)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
    {
        let entry = entry.map_err(|e| {
            IngestorError::Preflight(format!("failed to walk {}: {}", folder.display(), e))
        })?;

        if entry.file_type().is_dir() {
            continue;
        }

        let relative = relative_posix_path(folder, entry.path())?;
        if !is_legal_file_name(&relative) {
            illegal.push(relative);
            continue;
        }

        let is_symlink = entry.path_is_symlink();
        if is_symlink {
            match policy {
                SymlinkPolicy::KeepAll => {}
                SymlinkPolicy::SkipAll => {
                    debug!(path = %relative, "skipping symlink");
                    continue;
                }
                SymlinkPolicy::KeepInternal | SymlinkPolicy::RejectExternal => {
                    if !link_stays_inside(entry.path(), &root) {
                        if policy == SymlinkPolicy::RejectExternal {
                            external_links.push(relative);
                        } else {
                            debug!(path = %relative, "skipping symlink pointing outside the dataset");
                        }
                        continue;
                    }
                }
            }
        }

        let metadata = entry.path().symlink_metadata()?;
        files.push(FileEntry {
            path: relative,
            size: metadata.len(),
            is_symlink,
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        });
    }

    if !illegal.is_empty() {
        warn!(count = illegal.len(), "illegal file names in dataset folder");
        return Err(IngestorError::Preflight(format!(
            "{} file name(s) contain '*', '\\' or three consecutive blanks: {}",
            illegal.len(),
            preview(&illegal)
        )));
    }
    if !external_links.is_empty() {
        return Err(IngestorError::Preflight(format!(
            "{} symlink(s) point outside the dataset folder: {}",
            external_links.len(),
            preview(&external_links)
        )));
    }

    Ok(files)
}

/// Total size and count of a file list
pub fn totals(files: &[FileEntry]) -> (u64, usize) {
    (files.iter().map(|f| f.size).sum(), files.len())
}

/// Rejects `*`, `\` and runs of three blanks
pub fn is_legal_file_name(path: &str) -> bool {
    !(path.contains('*') || path.contains('\\') || path.contains("   "))
}

fn preview(names: &[String]) -> String {
    const MAX_SHOWN: usize = 5;
    let mut shown = names
        .iter()
        .take(MAX_SHOWN)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if names.len() > MAX_SHOWN {
        shown.push_str(", ...");
    }
    shown
}

fn relative_posix_path(folder: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(folder).map_err(|_| {
        IngestorError::Internal(format!(
            "{} is not below {}",
            path.display(),
            folder.display()
        ))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Whether the link at `link` resolves to a path inside `root`
///
/// Dangling links are judged by their lexical target.
fn link_stays_inside(link: &Path, root: &Path) -> bool {
    let Ok(target) = std::fs::read_link(link) else {
        return false;
    };
    let target = if target.is_absolute() {
        target
    } else {
        match link.parent() {
            Some(parent) => parent.join(target),
            None => target,
        }
    };

    let resolved = target
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexically(&target));
    resolved.starts_with(root)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn dataset() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(METADATA_FILE_NAME), b"{}").unwrap();
        fs::create_dir_all(dir.path().join("raw/sub")).unwrap();
        fs::write(dir.path().join("raw/a.bin"), vec![0u8; 10]).unwrap();
        fs::write(dir.path().join("raw/sub/b.bin"), vec![0u8; 32]).unwrap();
        dir
    }

    #[test]
    fn test_lists_files_sorted_and_relative() {
        let dir = dataset();
        let files = collect_file_list(dir.path(), SymlinkPolicy::KeepInternal).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["metadata.json", "raw/a.bin", "raw/sub/b.bin"]);
        assert_eq!(totals(&files), (2 + 10 + 32, 3));
        assert!(files.iter().all(|f| !f.is_symlink && f.modified.is_some()));
    }

    #[test]
    fn test_missing_folder_is_preflight_error() {
        let err = collect_file_list(Path::new("/definitely/not/here"), SymlinkPolicy::KeepAll)
            .unwrap_err();
        assert!(matches!(err, IngestorError::Preflight(_)));
    }

    #[test]
    fn test_illegal_names() {
        assert!(is_legal_file_name("raw/ok name.bin"));
        assert!(!is_legal_file_name("raw/star*.bin"));
        assert!(!is_legal_file_name("raw/back\\slash"));
        assert!(!is_legal_file_name("raw/three   blanks"));
    }

    #[test]
    fn test_illegal_name_fails_preflight() {
        let dir = dataset();
        fs::write(dir.path().join("bad*name"), b"x").unwrap();
        let err = collect_file_list(dir.path(), SymlinkPolicy::KeepAll).unwrap_err();
        assert!(matches!(err, IngestorError::Preflight(_)));
        assert!(err.to_string().contains("bad*name"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_policies() {
        use std::os::unix::fs::symlink;

        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), b"s").unwrap();

        let dir = dataset();
        symlink("raw/a.bin", dir.path().join("inner-link")).unwrap();
        symlink(outside.path().join("secret"), dir.path().join("outer-link")).unwrap();

        let keep_internal = collect_file_list(dir.path(), SymlinkPolicy::KeepInternal).unwrap();
        let names: Vec<&str> = keep_internal.iter().map(|f| f.path.as_str()).collect();
        assert!(names.contains(&"inner-link"));
        assert!(!names.contains(&"outer-link"));
        assert!(keep_internal.iter().any(|f| f.path == "inner-link" && f.is_symlink));

        let keep_all = collect_file_list(dir.path(), SymlinkPolicy::KeepAll).unwrap();
        assert_eq!(keep_all.len(), 5);

        let skip_all = collect_file_list(dir.path(), SymlinkPolicy::SkipAll).unwrap();
        assert_eq!(skip_all.len(), 3);

        let err = collect_file_list(dir.path(), SymlinkPolicy::RejectExternal).unwrap_err();
        assert!(err.to_string().contains("outer-link"));
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }
}
