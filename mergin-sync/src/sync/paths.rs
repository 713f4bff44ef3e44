use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Directory under the data dir that holds not-yet-committed downloads.
pub const TEMP_FOLDER: &str = ".temp";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("file path in project metadata is empty")]
    Empty,
    #[error("file path in project metadata is not relative: {0}")]
    Absolute(String),
    #[error("file path in project metadata contains an unsafe segment: {0}")]
    InvalidSegment(String),
}

/// Maps a file path from project metadata below a local root. On the wire
/// these paths are always relative to the project root and forward-slash
/// separated, so they are split on that separator rather than interpreted
/// with platform path rules. An absolute path, an upward traversal, or a
/// segment that a platform could read as a separator or drive prefix is
/// malformed metadata and never reaches the filesystem.
pub fn project_file_path(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }
    if relative.starts_with('/') {
        return Err(PathError::Absolute(relative.to_string()));
    }
    let mut out = root.to_path_buf();
    for segment in relative.split('/') {
        // repeated separators and no-op segments from sloppy serializers
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment == ".." || segment.contains('\\') || segment.contains(':') {
            return Err(PathError::InvalidSegment(segment.to_string()));
        }
        out.push(segment);
    }
    Ok(out)
}

/// Staging directory for one project's in-flight download,
/// `<dataDir>/.temp/<namespace>/<name>`.
pub fn temp_project_dir(data_dir: &Path, project_full_name: &str) -> PathBuf {
    let mut out = data_dir.join(TEMP_FOLDER);
    for part in project_full_name.split('/') {
        out.push(part);
    }
    out
}

/// Picks a directory for a first-time download: the project name itself, or
/// the name with a numeric suffix when that directory is already taken.
pub fn find_unique_project_directory(data_dir: &Path, name: &str) -> PathBuf {
    let plain = data_dir.join(name);
    if !plain.exists() {
        return plain;
    }
    let mut counter = 0u32;
    loop {
        let candidate = data_dir.join(format!("{name}{counter}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Rename target for a local file whose edits lost against the server copy.
pub fn conflict_file_path(original: &Path) -> PathBuf {
    let mut name = original.as_os_str().to_os_string();
    name.push("_conflict");
    PathBuf::from(name)
}

/// Recursively copies `src` over `dst`, creating directories as needed and
/// overwriting files that already exist.
pub async fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}
