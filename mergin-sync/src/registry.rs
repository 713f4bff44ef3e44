use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::sync::metadata::{CACHED_METADATA_PATH, ProjectMetadata};

/// A project present in the local data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProjectInfo {
    pub project_dir: PathBuf,
    pub namespace: String,
    pub name: String,
    /// Last version fully realized on disk, -1 if never synced.
    pub local_version: i64,
    /// Last version seen on the server, -1 if unknown.
    pub server_version: i64,
}

impl LocalProjectInfo {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// In-memory registry of downloaded projects, rebuilt at startup from the
/// baseline caches found in the data directory.
#[derive(Debug, Default)]
pub struct LocalProjectsRegistry {
    projects: Mutex<Vec<LocalProjectInfo>>,
}

impl LocalProjectsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans the data directory: every child directory carrying a baseline
    /// cache that names its project is registered at the cached version.
    pub fn scan(data_dir: &Path) -> Self {
        let mut projects = Vec::new();
        let entries = match std::fs::read_dir(data_dir) {
            Ok(entries) => entries,
            Err(_) => return Self::default(),
        };
        for entry in entries.flatten() {
            let project_dir = entry.path();
            if !project_dir.is_dir() {
                continue;
            }
            let baseline = ProjectMetadata::from_cached_json(&project_dir.join(CACHED_METADATA_PATH));
            let (Some(namespace), Some(name)) = (baseline.namespace, baseline.name) else {
                continue;
            };
            debug!(dir = %project_dir.display(), namespace = %namespace, name = %name,
                version = baseline.version, "registered local project");
            projects.push(LocalProjectInfo {
                project_dir,
                namespace,
                name,
                local_version: baseline.version,
                server_version: baseline.version,
            });
        }
        Self {
            projects: Mutex::new(projects),
        }
    }

    pub fn projects(&self) -> Vec<LocalProjectInfo> {
        self.projects
            .lock()
            .expect("registry mutex poisoned")
            .clone()
    }

    pub fn project_from_full_name(&self, full_name: &str) -> Option<LocalProjectInfo> {
        self.projects
            .lock()
            .expect("registry mutex poisoned")
            .iter()
            .find(|project| project.full_name() == full_name)
            .cloned()
    }

    /// Registers a freshly downloaded project; versions start unknown and are
    /// set by the finishing sync.
    pub fn add_project(&self, project_dir: PathBuf, namespace: &str, name: &str) {
        let mut projects = self.projects.lock().expect("registry mutex poisoned");
        if projects.iter().any(|project| project.project_dir == project_dir) {
            return;
        }
        projects.push(LocalProjectInfo {
            project_dir,
            namespace: namespace.to_string(),
            name: name.to_string(),
            local_version: -1,
            server_version: -1,
        });
    }

    pub fn update_local_version(&self, project_dir: &Path, version: i64) {
        let mut projects = self.projects.lock().expect("registry mutex poisoned");
        if let Some(project) = projects
            .iter_mut()
            .find(|project| project.project_dir == project_dir)
        {
            project.local_version = version;
        }
    }

    pub fn update_server_version(&self, project_dir: &Path, version: i64) {
        let mut projects = self.projects.lock().expect("registry mutex poisoned");
        if let Some(project) = projects
            .iter_mut()
            .find(|project| project.project_dir == project_dir)
        {
            project.server_version = version;
        }
    }
}
