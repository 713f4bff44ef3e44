use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Persisted credentials and server location, the survivors of a restart.
/// Stored as a small JSON document in the user's config directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "unknown_user_id")]
    pub user_id: i64,
    #[serde(default)]
    pub token: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expire: Option<OffsetDateTime>,
    #[serde(default)]
    pub api_root: String,
}

fn unknown_user_id() -> i64 {
    -1
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            user_id: unknown_user_id(),
            token: String::new(),
            expire: None,
            api_root: String::new(),
        }
    }
}

impl AuthSettings {
    /// Default location: `<config dir>/mergin/settings.json`.
    pub fn default_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("mergin");
        path.push("settings.json");
        Some(path)
    }

    /// Loads persisted settings; a missing or malformed file yields defaults.
    pub fn load(path: &Path) -> Self {
        std::fs::read(path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut partial = path.as_os_str().to_os_string();
        partial.push(".partial");
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(&partial, data)?;
        std::fs::rename(&partial, path)
    }

    /// Removes the settings file (logout); a missing file is fine.
    pub fn delete(path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}
