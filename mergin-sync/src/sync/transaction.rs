use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Update,
    Upload,
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("a sync is already running for project {0}")]
    AlreadyRunning(String),
}

/// Shared handle of one in-flight sync. The heavyweight per-sync state lives
/// on the driving task's stack; the handle carries what outside callers
/// need, the sync kind and the cancellation token.
#[derive(Debug)]
pub struct TransactionHandle {
    kind: SyncKind,
    cancel: CancellationToken,
}

impl TransactionHandle {
    fn new(kind: SyncKind) -> Self {
        Self {
            kind,
            cancel: CancellationToken::new(),
        }
    }

    pub fn kind(&self) -> SyncKind {
        self.kind
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Process-wide map from project full name to its active sync. At most one
/// sync per project may exist at any instant.
#[derive(Debug, Default)]
pub struct TransactionStore {
    inner: Mutex<HashMap<String, Arc<TransactionHandle>>>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new sync; rejected while another one holds the slot.
    pub fn begin(
        &self,
        project_full_name: &str,
        kind: SyncKind,
    ) -> Result<Arc<TransactionHandle>, TransactionError> {
        let mut map = self.inner.lock().expect("transaction mutex poisoned");
        if map.contains_key(project_full_name) {
            return Err(TransactionError::AlreadyRunning(
                project_full_name.to_string(),
            ));
        }
        let handle = Arc::new(TransactionHandle::new(kind));
        map.insert(project_full_name.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, project_full_name: &str) -> Option<Arc<TransactionHandle>> {
        self.inner
            .lock()
            .expect("transaction mutex poisoned")
            .get(project_full_name)
            .cloned()
    }

    pub fn is_active(&self, project_full_name: &str) -> bool {
        self.get(project_full_name).is_some()
    }

    /// Removes a finished sync; removing an absent entry is a no-op.
    pub fn finish(&self, project_full_name: &str) {
        self.inner
            .lock()
            .expect("transaction mutex poisoned")
            .remove(project_full_name);
    }
}
