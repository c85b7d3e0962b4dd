//! Engine configuration, optionally loaded from a TOML file.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Upper bound of downloads running at the same time.
    pub max_running_tasks: usize,
    /// Segments per download when the server supports ranges.
    pub thread_num: usize,
    /// Extra attempts after a network failure.
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    /// Bytes that must stay free on the data volume.
    pub min_usable_space: u64,
    pub force_redownload: bool,
    pub disable_breakpoint: bool,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Holds the SQLite database.
    pub data_dir: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_running_tasks: 3,
            thread_num: 3,
            retry_count: 3,
            retry_delay_ms: 200,
            min_usable_space: 30 * 1024 * 1024,
            force_redownload: false,
            disable_breakpoint: false,
            user_agent: format!("pumpdl/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 30,
            data_dir: default_data_dir(),
        }
    }
}

impl DownloadConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("downloads.sqlite")
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pumpdl")
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pumpdl")
        .join("config.toml")
}

/// Reads `path` when given, else the default config file if it exists,
/// else falls back to defaults.
pub fn load(path: Option<&Path>) -> anyhow::Result<DownloadConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = default_config_path();
            if !p.exists() {
                return Ok(DownloadConfig::default());
            }
            p
        }
    };
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("read config {}", path.display()))?;
    let cfg: DownloadConfig = toml::from_str(&content)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(cfg)
}
