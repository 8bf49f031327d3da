//! Resolution of `sourceFolder` values against the configured collections
//!
//! A source folder is written as `/<collection>/<path inside collection>`;
//! the first segment names an entry of `WebServer.CollectionLocations`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{WebError, WebResult};

const INVALID_LOCATION: &str = "sourceFolder contains an invalid path (invalid collection location)";

pub fn resolve_source_folder(
    locations: &BTreeMap<String, PathBuf>,
    source_folder: &str,
) -> WebResult<PathBuf> {
    let mut segments = source_folder.split('/').filter(|s| !s.is_empty());
    let collection = segments
        .next()
        .ok_or_else(|| WebError::BadRequest(INVALID_LOCATION.into()))?;
    let root = locations
        .get(collection)
        .ok_or_else(|| WebError::BadRequest(INVALID_LOCATION.into()))?;

    let mut folder = root.clone();
    for segment in segments {
        if segment == "." || segment == ".." {
            return Err(WebError::BadRequest(format!(
                "sourceFolder must not contain relative segments: {}",
                source_folder
            )));
        }
        folder.push(segment);
    }
    Ok(folder)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locations() -> BTreeMap<String, PathBuf> {
        let mut map = BTreeMap::new();
        map.insert("beamline".to_string(), PathBuf::from("/data/beamline"));
        map
    }

    #[test]
    fn test_resolves_first_segment() {
        let folder = resolve_source_folder(&locations(), "/beamline/2024/run-7").unwrap();
        assert_eq!(folder, PathBuf::from("/data/beamline/2024/run-7"));

        let root = resolve_source_folder(&locations(), "beamline").unwrap();
        assert_eq!(root, PathBuf::from("/data/beamline"));
    }

    #[test]
    fn test_rejects_unknown_collection_and_traversal() {
        let err = resolve_source_folder(&locations(), "/other/run").unwrap_err();
        assert!(err.to_string().contains("invalid collection location"));

        assert!(resolve_source_folder(&locations(), "/").is_err());
        assert!(resolve_source_folder(&locations(), "/beamline/../etc").is_err());
    }
}
