//! Download engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bgfetch_download::{EngineSettings, DEFAULT_CHUNK_SIZE};

use crate::error::CoreError;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Writable root every destination is resolved against
    pub download_root: PathBuf,
    /// SQLite file for pending requests; `None` keeps nothing across restarts
    pub database_path: Option<PathBuf>,
    /// Read size for local copies, in bytes
    pub chunk_size: usize,
    /// Whole-request ceiling for network transfers, in seconds
    pub request_timeout_secs: Option<u64>,
    /// Transfers allowed to run at once; `None` is unbounded
    pub max_concurrent_transfers: Option<usize>,
    pub user_agent: String,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        let engine = EngineSettings::default();

        Self {
            download_root: data_dir.join("downloads"),
            database_path: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout_secs: engine.request_timeout.map(|d| d.as_secs()),
            max_concurrent_transfers: engine.max_concurrent_transfers,
            user_agent: engine.user_agent,
        }
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("bgfetch"))
            .unwrap_or_else(|| PathBuf::from(".bgfetch"))
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.download_root.as_os_str().is_empty() {
            return Err(CoreError::Config("download_root must not be empty".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(CoreError::Config("chunk_size must be positive".to_string()));
        }
        if self.request_timeout_secs == Some(0) {
            return Err(CoreError::Config(
                "request_timeout_secs must be positive when set".to_string(),
            ));
        }
        if self.max_concurrent_transfers == Some(0) {
            return Err(CoreError::Config(
                "max_concurrent_transfers must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            chunk_size: self.chunk_size,
            request_timeout: self.request_timeout_secs.map(Duration::from_secs),
            max_concurrent_transfers: self.max_concurrent_transfers,
            user_agent: self.user_agent.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

// Simple dirs implementation for common directories
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}
