use std::collections::VecDeque;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mergin_core::{ApiVersionStatus, MerginClient, MerginError, check_api_version};

use super::chunker::generate_chunk_ids;
use super::diff::compare_project_files;
use super::indexer::{self, IndexerError};
use super::metadata::{
    self, CACHED_METADATA_PATH, FileRecord, MetadataError, ProjectMetadata,
};
use super::paths::{
    PathError, conflict_file_path, copy_dir_recursive, find_unique_project_directory,
    project_file_path, temp_project_dir,
};
use super::transaction::{SyncKind, TransactionError, TransactionHandle, TransactionStore};
use crate::registry::LocalProjectsRegistry;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("api error: {0}")]
    Client(#[from] MerginError),
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("indexing error: {0}")]
    Indexer(#[from] IndexerError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error("server api version check failed: {0:?}")]
    IncompatibleServer(ApiVersionStatus),
    #[error("project {0} is not downloaded locally")]
    NotDownloaded(String),
    #[error("server response missing field {0}")]
    MissingField(&'static str),
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Failures the presentation layer should raise as a modal dialog rather
    /// than a passive notification.
    pub fn show_as_dialog(&self) -> bool {
        matches!(self, SyncError::Client(err) if err.is_data_limit())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

/// Signals emitted while a sync is running. A `fraction` of -1.0 means the
/// sync for that project is no longer in progress.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Progress {
        project: String,
        fraction: f64,
    },
    Finished {
        project: String,
        project_dir: PathBuf,
        success: bool,
    },
}

pub fn full_project_name(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn split_full_name(full_name: &str) -> (&str, &str) {
    match full_name.rsplit_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => ("", full_name),
    }
}

/// Per-sync state. Owned by the driving task; the cancellation token lives
/// in the store handle so outside callers can reach it.
struct SyncSession {
    full_name: String,
    project_dir: PathBuf,
    /// Version applied on successful finalization, captured from the
    /// project-info reply that drives this transaction.
    version: i64,
    /// Raw metadata JSON persisted verbatim as the new baseline.
    project_metadata: Vec<u8>,
    diff: super::diff::ProjectDiff,
    total_size: u64,
    transferred_size: u64,
    first_time_download: bool,
    update_before_upload: bool,
    handle: Arc<TransactionHandle>,
}

impl SyncSession {
    fn new(full_name: String, handle: Arc<TransactionHandle>) -> Self {
        Self {
            full_name,
            project_dir: PathBuf::new(),
            version: -1,
            project_metadata: Vec::new(),
            diff: super::diff::ProjectDiff::default(),
            total_size: 0,
            transferred_size: 0,
            first_time_download: false,
            update_before_upload: false,
            handle,
        }
    }
}

/// Drives the update, upload and update-then-upload flows for one or more
/// projects. All state transitions happen as sequential awaits of one task
/// per sync; at most one request per project is outstanding at any time.
pub struct SyncCoordinator {
    client: MerginClient,
    registry: Arc<LocalProjectsRegistry>,
    transactions: TransactionStore,
    data_dir: PathBuf,
    api_status: Mutex<ApiVersionStatus>,
    events: UnboundedSender<SyncEvent>,
}

impl SyncCoordinator {
    pub fn new(
        client: MerginClient,
        registry: Arc<LocalProjectsRegistry>,
        data_dir: PathBuf,
        events: UnboundedSender<SyncEvent>,
    ) -> Self {
        Self {
            client,
            registry,
            transactions: TransactionStore::new(),
            data_dir,
            api_status: Mutex::new(ApiVersionStatus::Unknown),
            events,
        }
    }

    pub fn registry(&self) -> &Arc<LocalProjectsRegistry> {
        &self.registry
    }

    pub fn api_version_status(&self) -> ApiVersionStatus {
        *self.api_status.lock().expect("status mutex poisoned")
    }

    pub fn is_syncing(&self, project_full_name: &str) -> bool {
        self.transactions.is_active(project_full_name)
    }

    /// Probes the server once and caches the verdict; syncs refuse to start
    /// against an incompatible or unreachable server.
    pub async fn ensure_compatible(&self) -> Result<(), SyncError> {
        if self.api_version_status() == ApiVersionStatus::Ok {
            return Ok(());
        }
        *self.api_status.lock().expect("status mutex poisoned") = ApiVersionStatus::Pending;
        let status = match self.client.ping().await {
            Ok(ping) => check_api_version(&ping.version),
            Err(err) => {
                warn!(error = %err, "server ping failed");
                ApiVersionStatus::NotFound
            }
        };
        *self.api_status.lock().expect("status mutex poisoned") = status;
        if status == ApiVersionStatus::Ok {
            Ok(())
        } else {
            Err(SyncError::IncompatibleServer(status))
        }
    }

    /// Brings the local copy of a project up to the current server version.
    /// Returns the project directory (freshly created on first download).
    pub async fn pull_project(&self, namespace: &str, name: &str) -> Result<PathBuf, SyncError> {
        self.ensure_compatible().await?;
        let full_name = full_project_name(namespace, name);
        let handle = self.transactions.begin(&full_name, SyncKind::Update)?;
        self.emit_progress(&full_name, 0.0);
        let mut session = SyncSession::new(full_name, handle);
        let result = self.update_flow(&mut session).await;
        self.finish_sync(session, result).await
    }

    /// Pushes local changes to the server. When the local copy is behind the
    /// server, an update runs first and the upload re-enters from the top;
    /// a failed update does not chain into the upload.
    pub async fn push_project(&self, namespace: &str, name: &str) -> Result<PathBuf, SyncError> {
        self.ensure_compatible().await?;
        let full_name = full_project_name(namespace, name);
        loop {
            let handle = self.transactions.begin(&full_name, SyncKind::Upload)?;
            self.emit_progress(&full_name, 0.0);
            let mut session = SyncSession::new(full_name.clone(), handle);
            let result = self.upload_flow(&mut session).await;
            let updated_first = session.update_before_upload;
            let project_dir = self.finish_sync(session, result).await?;
            if updated_first {
                info!(project = %full_name, "local copy updated, continuing with upload");
                continue;
            }
            return Ok(project_dir);
        }
    }

    /// Cooperative cancellation of the project's active sync, if any. The
    /// outstanding request aborts and the failure path tears the transaction
    /// down; calling this again afterwards is a no-op.
    pub fn cancel_sync(&self, project_full_name: &str) {
        if let Some(handle) = self.transactions.get(project_full_name) {
            info!(project = project_full_name, "cancelling sync");
            handle.cancel();
        }
    }

    async fn update_flow(&self, session: &mut SyncSession) -> Result<(), SyncError> {
        let info = self.fetch_project_info(session).await?;
        self.update_with_metadata(session, info).await
    }

    /// The update pipeline: plan against the given server metadata, download
    /// into the staging dir, then finalize into the project dir.
    async fn update_with_metadata(
        &self,
        session: &mut SyncSession,
        info: Vec<u8>,
    ) -> Result<(), SyncError> {
        let server = ProjectMetadata::from_json(&info)?;

        if session.project_dir.as_os_str().is_empty() {
            if let Some(local) = self.registry.project_from_full_name(&session.full_name) {
                session.project_dir = local.project_dir;
            } else {
                let (_, name) = split_full_name(&session.full_name);
                let dir = find_unique_project_directory(&self.data_dir, name);
                tokio::fs::create_dir_all(&dir).await?;
                session.project_dir = dir;
                session.first_time_download = true;
            }
        }

        let local_files = indexer::index(&session.project_dir).await?;
        let baseline =
            ProjectMetadata::from_cached_json(&session.project_dir.join(CACHED_METADATA_PATH));
        let diff = compare_project_files(&baseline.files, &server.files, &local_files);
        info!(project = %session.full_name, version = server.version, "update {}", diff.dump());

        let chunk_size = self.client.chunk_size();
        let mut queue: VecDeque<FileRecord> = VecDeque::new();
        let mut total_size = 0;
        for path in diff.paths_to_download() {
            let Some(mut file) = server.file_info(path).cloned() else {
                continue;
            };
            // only the chunk count matters for a download
            file.chunks = generate_chunk_ids(file.size, chunk_size);
            total_size += file.size;
            queue.push_back(file);
        }

        session.version = server.version;
        session.project_metadata = info;
        session.diff = diff;
        session.total_size = total_size;

        let version_label = format!("v{}", server.version);
        self.download_queued_files(session, &mut queue, &version_label)
            .await?;
        self.finalize_update(session).await
    }

    /// Files are fetched strictly in queue order, chunk by chunk, into the
    /// staging directory. Zero-size files are created directly.
    async fn download_queued_files(
        &self,
        session: &mut SyncSession,
        queue: &mut VecDeque<FileRecord>,
        version: &str,
    ) -> Result<(), SyncError> {
        let temp_dir = temp_project_dir(&self.data_dir, &session.full_name);
        let token = session.handle.cancel_token();
        while let Some(file) = queue.pop_front() {
            let target = project_file_path(&temp_dir, &file.path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut output = tokio::fs::File::create(&target).await?;
            for chunk_no in 0..file.chunks.len() as u64 {
                let data = race_cancel(
                    &token,
                    self.client
                        .download_chunk(&session.full_name, &file.path, version, chunk_no),
                )
                .await?;
                output.write_all(&data).await?;
                session.transferred_size += data.len() as u64;
                self.emit_session_progress(session);
            }
            output.flush().await?;
        }
        Ok(())
    }

    async fn finalize_update(&self, session: &SyncSession) -> Result<(), SyncError> {
        // conflicting local edits survive under a conflict name before the
        // server copy lands
        let conflicts = session
            .diff
            .conflict_remote_updated_local_updated
            .iter()
            .chain(&session.diff.conflict_remote_added_local_added);
        for path in conflicts {
            let original = match project_file_path(&session.project_dir, path) {
                Ok(original) => original,
                Err(err) => {
                    warn!(project = %session.full_name, path = %path, error = %err,
                        "skipping conflict rename for unusable path");
                    continue;
                }
            };
            let renamed = conflict_file_path(&original);
            match tokio::fs::rename(&original, &renamed).await {
                Ok(()) => {
                    info!(project = %session.full_name, path = %path, "kept conflicting local copy")
                }
                Err(err) => {
                    warn!(project = %session.full_name, path = %path, error = %err,
                        "failed to rename conflicting file");
                }
            }
        }

        let temp_dir = temp_project_dir(&self.data_dir, &session.full_name);
        if tokio::fs::try_exists(&temp_dir).await.unwrap_or(false) {
            copy_dir_recursive(&temp_dir, &session.project_dir).await?;
            tokio::fs::remove_dir_all(&temp_dir).await?;
        }

        // past this point the downloaded files are already in place; a bad
        // path must not fail the sync and leave the directory half-applied
        for path in &session.diff.remote_deleted {
            let target = match project_file_path(&session.project_dir, path) {
                Ok(target) => target,
                Err(err) => {
                    warn!(project = %session.full_name, path = %path, error = %err,
                        "skipping server-deleted file with unusable path");
                    continue;
                }
            };
            if let Err(err) = tokio::fs::remove_file(&target).await {
                warn!(project = %session.full_name, path = %path, error = %err,
                    "failed to remove server-deleted file");
            }
        }

        if self
            .registry
            .project_from_full_name(&session.full_name)
            .is_none()
        {
            let (namespace, name) = split_full_name(&session.full_name);
            self.registry
                .add_project(session.project_dir.clone(), namespace, name);
        }
        Ok(())
    }

    async fn upload_flow(&self, session: &mut SyncSession) -> Result<(), SyncError> {
        let info = self.fetch_project_info(session).await?;
        let server = ProjectMetadata::from_json(&info)?;

        let Some(local) = self.registry.project_from_full_name(&session.full_name) else {
            return Err(SyncError::NotDownloaded(session.full_name.clone()));
        };
        session.project_dir = local.project_dir.clone();

        // an upload may only target the server's latest version
        if local.local_version != -1 && local.local_version < server.version {
            session.update_before_upload = true;
            info!(project = %session.full_name, local = local.local_version,
                server = server.version, "local copy is behind the server, updating first");
            return self.update_with_metadata(session, info).await;
        }
        self.registry
            .update_server_version(&session.project_dir, server.version);

        let local_files = indexer::index(&session.project_dir).await?;
        let baseline =
            ProjectMetadata::from_cached_json(&session.project_dir.join(CACHED_METADATA_PATH));
        let diff = compare_project_files(&baseline.files, &server.files, &local_files);
        info!(project = %session.full_name, version = server.version, "upload {}", diff.dump());

        let chunk_size = self.client.chunk_size();
        let with_chunks = |path: &String| -> Option<FileRecord> {
            let mut file = local_files.iter().find(|file| &file.path == path)?.clone();
            file.chunks = generate_chunk_ids(file.size, chunk_size);
            Some(file)
        };
        let added: Vec<FileRecord> = diff
            .local_added
            .iter()
            .filter_map(|path| with_chunks(path))
            .collect();
        let updated: Vec<FileRecord> = diff
            .local_updated
            .iter()
            .filter_map(|path| with_chunks(path))
            .collect();
        let removed: Vec<FileRecord> = diff
            .local_deleted
            .iter()
            .filter_map(|path| server.file_info(path).cloned())
            .collect();

        let changes = serde_json::json!({
            "version": format!("v{}", server.version),
            "changes": {
                "added": added,
                "removed": removed,
                "updated": updated,
                "renamed": [],
            }
        });

        session.diff = diff;
        let mut queue: VecDeque<FileRecord> = added.into_iter().chain(updated).collect();
        session.total_size = queue.iter().map(|file| file.size).sum();

        let token = session.handle.cancel_token();
        let body = race_cancel(
            &token,
            self.client.push_start(&session.full_name, &changes),
        )
        .await?;

        if queue.is_empty() {
            // delete-only push: the server created the new version right away
            let meta = ProjectMetadata::from_json(&body)?;
            session.version = meta.version;
            session.project_metadata = body;
            return Ok(());
        }

        let start: PushStartResponse =
            serde_json::from_slice(&body).map_err(MetadataError::from)?;
        if start.transaction.is_empty() {
            return Err(SyncError::MissingField("transaction"));
        }
        let transaction_uuid = start.transaction;

        if let Err(err) = self
            .upload_queued_files(session, &transaction_uuid, &mut queue)
            .await
        {
            if err.is_cancelled() {
                self.cancel_server_transaction(&transaction_uuid).await;
            }
            return Err(err);
        }

        let body = match race_cancel(&token, self.client.push_finish(&transaction_uuid)).await {
            Ok(body) => body,
            Err(err) => {
                if err.is_cancelled() {
                    self.cancel_server_transaction(&transaction_uuid).await;
                }
                return Err(err);
            }
        };
        let meta = ProjectMetadata::from_json(&body)?;
        session.version = meta.version;
        session.project_metadata = body;
        Ok(())
    }

    async fn upload_queued_files(
        &self,
        session: &mut SyncSession,
        transaction_uuid: &str,
        queue: &mut VecDeque<FileRecord>,
    ) -> Result<(), SyncError> {
        let token = session.handle.cancel_token();
        let chunk_size = self.client.chunk_size();
        while let Some(file) = queue.pop_front() {
            let source = project_file_path(&session.project_dir, &file.path)?;
            for (chunk_no, chunk_id) in file.chunks.iter().enumerate() {
                let data = read_file_chunk(&source, chunk_no as u64, chunk_size).await?;
                race_cancel(
                    &token,
                    self.client.push_chunk(transaction_uuid, chunk_id, data),
                )
                .await?;
            }
            session.transferred_size += file.size;
            self.emit_session_progress(session);
        }
        Ok(())
    }

    /// Best-effort server-side rollback of an aborted push; failures are
    /// logged and swallowed.
    async fn cancel_server_transaction(&self, transaction_uuid: &str) {
        if let Err(err) = self.client.push_cancel(transaction_uuid).await {
            warn!(transaction = transaction_uuid, error = %err, "push cancel request failed");
        }
    }

    /// The single exit path of every sync. Persists the new baseline and
    /// version bookkeeping on success; removes staging leftovers (and, for a
    /// first-time download, the created project directory) on failure.
    async fn finish_sync(
        &self,
        session: SyncSession,
        result: Result<(), SyncError>,
    ) -> Result<PathBuf, SyncError> {
        self.emit_progress(&session.full_name, -1.0);

        let result = match result {
            Ok(()) => self.commit_success(&session),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            warn!(project = %session.full_name, error = %err, "sync failed");
            let temp_dir = temp_project_dir(&self.data_dir, &session.full_name);
            let _ = tokio::fs::remove_dir_all(&temp_dir).await;
            if session.first_time_download && !session.project_dir.as_os_str().is_empty() {
                let _ = tokio::fs::remove_dir_all(&session.project_dir).await;
            }
        } else {
            info!(project = %session.full_name, version = session.version, "sync finished");
        }

        self.transactions.finish(&session.full_name);
        let _ = self.events.send(SyncEvent::Finished {
            project: session.full_name.clone(),
            project_dir: session.project_dir.clone(),
            success: result.is_ok(),
        });
        result.map(|_| session.project_dir)
    }

    fn commit_success(&self, session: &SyncSession) -> Result<(), SyncError> {
        let baseline_path = session.project_dir.join(CACHED_METADATA_PATH);
        metadata::write_cached_baseline(&baseline_path, &session.project_metadata)?;
        self.registry
            .update_local_version(&session.project_dir, session.version);
        self.registry
            .update_server_version(&session.project_dir, session.version);
        Ok(())
    }

    async fn fetch_project_info(&self, session: &SyncSession) -> Result<Vec<u8>, SyncError> {
        let token = session.handle.cancel_token();
        race_cancel(&token, self.client.project_info(&session.full_name)).await
    }

    fn emit_session_progress(&self, session: &SyncSession) {
        let fraction = if session.total_size == 0 {
            1.0
        } else {
            session.transferred_size as f64 / session.total_size as f64
        };
        self.emit_progress(&session.full_name, fraction);
    }

    fn emit_progress(&self, project: &str, fraction: f64) {
        let _ = self.events.send(SyncEvent::Progress {
            project: project.to_string(),
            fraction,
        });
    }
}

#[derive(Debug, serde::Deserialize)]
struct PushStartResponse {
    #[serde(default)]
    transaction: String,
}

/// Races an in-flight request against the transaction's cancellation token;
/// cancellation aborts the request and surfaces on the reply path.
async fn race_cancel<T>(
    token: &CancellationToken,
    request: impl Future<Output = Result<T, MerginError>>,
) -> Result<T, SyncError> {
    tokio::select! {
        _ = token.cancelled() => Err(SyncError::Cancelled),
        result = request => Ok(result?),
    }
}

async fn read_file_chunk(
    path: &Path,
    chunk_no: u64,
    chunk_size: u64,
) -> Result<Vec<u8>, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(chunk_no * chunk_size)).await?;
    let mut data = vec![0u8; chunk_size as usize];
    let mut filled = 0;
    while filled < data.len() {
        let read = file.read(&mut data[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    data.truncate(filled);
    Ok(data)
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
