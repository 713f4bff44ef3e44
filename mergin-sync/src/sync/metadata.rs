use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use mergin_core::parse_version_label;

/// Location of the cached baseline, relative to the project directory.
pub const CACHED_METADATA_PATH: &str = ".mergin/mergin.json";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid metadata: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// One file entry of a project version. `chunks` is populated only while the
/// record sits in a transfer queue; on the wire it carries the chunk ids the
/// server should expect for an upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub checksum: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub mtime: Option<OffsetDateTime>,
    #[serde(default)]
    pub chunks: Vec<String>,
}

/// Server-side state of one project version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectMetadata {
    pub version: i64,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub files: Vec<FileRecord>,
}

impl ProjectMetadata {
    /// Parses a project-info or push-finish response body. The server labels
    /// the version either as an integer or as a `"v{int}"` string; a missing
    /// version counts as 0.
    pub fn from_json(data: &[u8]) -> Result<Self, MetadataError> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let version = match value.get("version") {
            Some(serde_json::Value::Number(number)) => number.as_i64().unwrap_or(0),
            Some(serde_json::Value::String(label)) => parse_version_label(label),
            _ => 0,
        };
        let files = match value.get("files") {
            Some(files) => serde_json::from_value(files.clone())?,
            None => Vec::new(),
        };
        let field = |key: &str| {
            value
                .get(key)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };
        Ok(Self {
            version,
            name: field("name"),
            namespace: field("namespace"),
            files,
        })
    }

    /// Reads a previously persisted baseline. A missing or malformed cache is
    /// the expected state before the first successful sync and yields empty
    /// metadata at version 0.
    pub fn from_cached_json(path: &Path) -> Self {
        std::fs::read(path)
            .ok()
            .and_then(|data| Self::from_json(&data).ok())
            .unwrap_or_default()
    }

    pub fn file_info(&self, path: &str) -> Option<&FileRecord> {
        self.files.iter().find(|file| file.path == path)
    }
}

/// Atomically replaces the baseline cache: the bytes land in a sibling temp
/// file first and are renamed over the target, so a crash never leaves a
/// truncated baseline behind.
pub fn write_cached_baseline(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut partial = path.as_os_str().to_os_string();
    partial.push(".partial");
    std::fs::write(&partial, data)?;
    std::fs::rename(&partial, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_numeric_and_labelled_versions() {
        let numeric = ProjectMetadata::from_json(br#"{"version": 5, "files": []}"#).unwrap();
        assert_eq!(numeric.version, 5);

        let labelled = ProjectMetadata::from_json(br#"{"version": "v12", "files": []}"#).unwrap();
        assert_eq!(labelled.version, 12);

        let missing = ProjectMetadata::from_json(br#"{"files": []}"#).unwrap();
        assert_eq!(missing.version, 0);
    }

    #[test]
    fn parses_file_records_with_wire_fields() {
        let meta = ProjectMetadata::from_json(
            br#"{
                "version": "v3",
                "name": "survey",
                "namespace": "lutra",
                "files": [
                    {
                        "path": "data/plots.gpkg",
                        "size": 4096,
                        "checksum": "da39a3ee5e6b4b0d3255bfef95601890afd80709",
                        "mtime": "2024-03-01T12:30:45.120Z"
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(meta.name.as_deref(), Some("survey"));
        assert_eq!(meta.namespace.as_deref(), Some("lutra"));
        let file = meta.file_info("data/plots.gpkg").unwrap();
        assert_eq!(file.size, 4096);
        assert!(file.mtime.is_some());
        assert!(file.chunks.is_empty());
        assert!(meta.file_info("missing.txt").is_none());
    }

    #[test]
    fn missing_or_malformed_cache_yields_empty_baseline() {
        let dir = tempdir().unwrap();
        let absent = ProjectMetadata::from_cached_json(&dir.path().join("none.json"));
        assert_eq!(absent, ProjectMetadata::default());

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, b"{not json").unwrap();
        assert_eq!(
            ProjectMetadata::from_cached_json(&broken),
            ProjectMetadata::default()
        );
    }

    #[test]
    fn baseline_write_replaces_previous_content() {
        let dir = tempdir().unwrap();
        let target = dir.path().join(".mergin/mergin.json");

        write_cached_baseline(&target, br#"{"version": 1, "files": []}"#).unwrap();
        write_cached_baseline(&target, br#"{"version": 2, "files": []}"#).unwrap();

        let meta = ProjectMetadata::from_cached_json(&target);
        assert_eq!(meta.version, 2);
        assert!(!dir.path().join(".mergin/mergin.json.partial").exists());
    }

    #[test]
    fn file_record_round_trips_mtime_as_rfc3339() {
        let record = FileRecord {
            path: "a.txt".to_string(),
            size: 1,
            checksum: "ab".to_string(),
            mtime: Some(time::macros::datetime!(2024-03-01 12:30:45.120 UTC)),
            chunks: vec!["id-1".to_string()],
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("2024-03-01T12:30:45.12"));
        let back: FileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
