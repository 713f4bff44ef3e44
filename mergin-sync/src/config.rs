use std::path::PathBuf;

use anyhow::Context;

pub const DEFAULT_API_ROOT: &str = "https://public.cloudmergin.com";
const DATA_DIR_NAME: &str = "mergin";

/// Engine configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Server root URL; persisted settings may override it.
    pub api_root: String,
    /// Directory holding the project directories and the download staging
    /// area.
    pub data_dir: PathBuf,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_root =
            std::env::var("MERGIN_API_ROOT").unwrap_or_else(|_| DEFAULT_API_ROOT.to_string());
        let data_dir = match std::env::var("MERGIN_DATA_DIR") {
            Ok(value) => PathBuf::from(value),
            Err(_) => {
                let mut dir = dirs::data_dir().context("data directory is unavailable")?;
                dir.push(DATA_DIR_NAME);
                dir.push("projects");
                dir
            }
        };
        Ok(Self { api_root, data_dir })
    }
}
