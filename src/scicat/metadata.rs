//! Dataset metadata checks and completion before registration

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use super::types::UserInfo;
use crate::error::{IngestorError, Result};
use crate::task::FileEntry;

/// Validate `metadata` and fill in the fields SciCat requires
///
/// Rejects keys SciCat cannot store (containing `.` or starting with `$`),
/// a missing `type`, and an `ownerGroup` the caller is not a member of.
/// Missing `owner`, `ownerEmail`, `contactEmail` and `creationTime` are
/// taken from the caller and the file list; `sourceFolder` is always the
/// dataset folder. The lifecycle marks the files as not yet available
/// unless they stay on central disk.
pub fn prepare_metadata(
    metadata: &mut Map<String, Value>,
    user: &UserInfo,
    folder: &Path,
    files: &[FileEntry],
    on_central_disk: bool,
) -> Result<()> {
    check_keys(metadata, "")?;

    match metadata.get("type").and_then(Value::as_str) {
        Some(t) if !t.trim().is_empty() => {}
        _ => {
            return Err(IngestorError::Preflight(
                "metadata is missing the dataset \"type\"".into(),
            ))
        }
    }

    let owner_group = metadata
        .get("ownerGroup")
        .and_then(Value::as_str)
        .ok_or_else(|| IngestorError::Preflight("metadata is missing \"ownerGroup\"".into()))?;
    if !user.access_groups.iter().any(|g| g == owner_group) {
        return Err(IngestorError::Preflight(format!(
            "user {} is not a member of owner group {}",
            user.username, owner_group
        )));
    }

    fill_missing(metadata, "owner", &user.display_name_or_username());
    fill_missing(metadata, "ownerEmail", &user.email);
    fill_missing(metadata, "contactEmail", &user.email);
    fill_missing(metadata, "creationTime", &creation_time(files));
    metadata.insert(
        "sourceFolder".into(),
        Value::String(folder.to_string_lossy().into_owned()),
    );

    metadata.insert(
        "datasetlifecycle".into(),
        if on_central_disk {
            json!({
                "isOnCentralDisk": true,
                "archiveStatusMessage": "datasetCreated",
                "archivable": true,
            })
        } else {
            json!({
                "isOnCentralDisk": false,
                "archiveStatusMessage": "filesNotYetAvailable",
                "archivable": false,
            })
        },
    );
    Ok(())
}

impl UserInfo {
    fn display_name_or_username(&self) -> String {
        if self.display_name.is_empty() {
            self.username.clone()
        } else {
            self.display_name.clone()
        }
    }
}

fn fill_missing(metadata: &mut Map<String, Value>, key: &str, value: &str) {
    let missing = match metadata.get(key) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    };
    if missing && !value.is_empty() {
        metadata.insert(key.to_string(), Value::String(value.to_string()));
    }
}

fn check_keys(map: &Map<String, Value>, parent: &str) -> Result<()> {
    for (key, value) in map {
        if key.contains('.') || key.starts_with('$') {
            return Err(IngestorError::Preflight(format!(
                "illegal metadata key \"{}{}\": keys must not contain '.' or start with '$'",
                parent, key
            )));
        }
        if let Value::Object(inner) = value {
            check_keys(inner, &format!("{}{}/", parent, key))?;
        }
    }
    Ok(())
}

/// Latest modification time of the files, or now for an empty list
fn creation_time(files: &[FileEntry]) -> String {
    let latest: Option<DateTime<Utc>> = files.iter().filter_map(|f| f.modified).max();
    latest
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user() -> UserInfo {
        UserInfo {
            username: "alice".into(),
            email: "alice@example.org".into(),
            display_name: "Alice".into(),
            access_groups: vec!["p1234".into()],
        }
    }

    fn base() -> Map<String, Value> {
        json!({"type": "raw", "ownerGroup": "p1234", "datasetName": "run"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_fills_missing_fields() {
        let mut md = base();
        let modified = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let files = vec![FileEntry {
            modified: Some(modified),
            ..FileEntry::new("a", 1)
        }];
        prepare_metadata(&mut md, &user(), Path::new("/data/run"), &files, false).unwrap();

        assert_eq!(md["owner"], "Alice");
        assert_eq!(md["ownerEmail"], "alice@example.org");
        assert_eq!(md["contactEmail"], "alice@example.org");
        assert_eq!(md["sourceFolder"], "/data/run");
        assert_eq!(md["creationTime"], "2024-05-01T12:00:00.000Z");
        assert_eq!(md["datasetlifecycle"]["archivable"], false);
        assert_eq!(
            md["datasetlifecycle"]["archiveStatusMessage"],
            "filesNotYetAvailable"
        );
    }

    #[test]
    fn test_keeps_supplied_fields() {
        let mut md = base();
        md.insert("contactEmail".into(), json!("pi@example.org"));
        prepare_metadata(&mut md, &user(), Path::new("/d"), &[], true).unwrap();
        assert_eq!(md["contactEmail"], "pi@example.org");
        assert_eq!(md["datasetlifecycle"]["isOnCentralDisk"], true);
    }

    #[test]
    fn test_illegal_keys_rejected() {
        let mut md = base();
        md.insert("scientificMetadata".into(), json!({"beam.energy": 3}));
        let err = prepare_metadata(&mut md, &user(), Path::new("/d"), &[], false).unwrap_err();
        assert!(err.to_string().contains("scientificMetadata/beam.energy"));

        let mut md = base();
        md.insert("$where".into(), json!(1));
        assert!(prepare_metadata(&mut md, &user(), Path::new("/d"), &[], false).is_err());
    }

    #[test]
    fn test_type_required() {
        let mut md = base();
        md.remove("type");
        let err = prepare_metadata(&mut md, &user(), Path::new("/d"), &[], false).unwrap_err();
        assert!(matches!(err, IngestorError::Preflight(_)));
    }

    #[test]
    fn test_owner_group_must_be_accessible() {
        let mut md = base();
        md.insert("ownerGroup".into(), json!("other"));
        let err = prepare_metadata(&mut md, &user(), Path::new("/d"), &[], false).unwrap_err();
        assert!(err.to_string().contains("not a member"));
    }
}
