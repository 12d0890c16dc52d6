//! Engine configuration, read from a JSON file

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for the file-backed cache. In-memory when absent.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Render normally but never write to the cache.
    #[serde(default)]
    pub read_only: bool,
    /// Extra pipeline definitions (`*.json`) registered at startup.
    #[serde(default)]
    pub pipelines_dir: Option<PathBuf>,
    /// Caller-owned part of the cache version.
    #[serde(default)]
    pub local_cache_version: u16,
    #[serde(default)]
    pub skip_project_check: bool,
    /// Prefix for generated reference hrefs.
    #[serde(default)]
    pub base_path: String,
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
