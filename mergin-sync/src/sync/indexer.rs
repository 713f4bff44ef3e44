use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use sha1::{Digest, Sha1};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;

use super::metadata::FileRecord;

/// Derived working files that never travel to the server.
const IGNORED_EXTENSIONS: [&str; 6] = ["gpkg-shm", "gpkg-wal", "qgs~", "qgz~", "pyc", "swap"];
const IGNORED_FILES: [&str; 2] = ["mergin.json", ".DS_Store"];

/// Block size for streaming checksum computation.
const HASH_BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("cannot walk project directory: {0}")]
    Walk(#[from] ignore::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn is_ignored(file_name: &str) -> bool {
    if IGNORED_FILES.contains(&file_name) {
        return true;
    }
    match file_name.rsplit_once('.') {
        Some((_, extension)) => IGNORED_EXTENSIONS.contains(&extension),
        None => false,
    }
}

/// Enumerates the project directory and fingerprints every syncable file:
/// relative forward-slash path, byte size, last-modified time (millisecond
/// precision) and the SHA-1 of the full contents. The `.mergin/` baseline
/// directory and ignored working files are skipped.
pub async fn index(project_dir: &Path) -> Result<Vec<FileRecord>, IndexerError> {
    let mut paths: Vec<PathBuf> = Vec::new();
    let walker = WalkBuilder::new(project_dir)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .require_git(false)
        .filter_entry(|entry| entry.file_name() != ".mergin")
        .build();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }
        if is_ignored(&entry.file_name().to_string_lossy()) {
            continue;
        }
        paths.push(entry.into_path());
    }
    paths.sort();

    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        let Ok(relative) = path.strip_prefix(project_dir) else {
            continue;
        };
        let meta = tokio::fs::metadata(&path).await?;
        let checksum = sha1_hex(&path).await?;
        records.push(FileRecord {
            path: relative_slash_path(relative),
            size: meta.len(),
            checksum,
            mtime: meta.modified().ok().map(to_millis_utc),
            chunks: Vec::new(),
        });
    }
    Ok(records)
}

/// Lowercase hex SHA-1 of the file contents, read in fixed-size blocks.
pub async fn sha1_hex(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut block = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let read = file.read(&mut block).await?;
        if read == 0 {
            break;
        }
        hasher.update(&block[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn relative_slash_path(relative: &Path) -> String {
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

fn to_millis_utc(modified: std::time::SystemTime) -> OffsetDateTime {
    let stamp = OffsetDateTime::from(modified);
    let millis = stamp.nanosecond() / 1_000_000;
    stamp
        .replace_nanosecond(millis * 1_000_000)
        .unwrap_or(stamp)
}
