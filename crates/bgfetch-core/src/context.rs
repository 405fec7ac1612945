//! Process-scoped download context
//!
//! One `FetchContext` per host process. It owns the shared HTTP client (inside
//! the `Downloader`), the runtime transfers run on, and the store used to
//! persist pending requests. Every handle is created through it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use bgfetch_download::{
    DownloadConfig, DownloadHandle, DownloadStore, Downloader, NoopStore, SqliteStore,
};
use bgfetch_storage::Database;

use crate::config::Config;
use crate::Result;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FetchContext {
    config: Config,
    downloader: Downloader,
    store: Box<dyn DownloadStore>,
    /// Present when the context built its own runtime
    runtime: Option<tokio::runtime::Runtime>,
}

impl FetchContext {
    /// Build a context with its own multi-threaded runtime.
    ///
    /// For hosts without an executor. Must not be created or dropped from
    /// inside an async context; use [`FetchContext::with_runtime`] there.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("bgfetch-worker")
            .build()?;
        let handle = runtime.handle().clone();

        Self::build(config, handle, Some(runtime))
    }

    /// Build a context that spawns transfers on a runtime the host owns.
    pub fn with_runtime(config: Config, runtime: tokio::runtime::Handle) -> Result<Self> {
        Self::build(config, runtime, None)
    }

    fn build(
        config: Config,
        handle: tokio::runtime::Handle,
        runtime: Option<tokio::runtime::Runtime>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.download_root)?;

        let downloader = Downloader::new(
            config.download_root.clone(),
            config.engine_settings(),
            handle,
        )?;

        let store: Box<dyn DownloadStore> = match &config.database_path {
            Some(path) => Box::new(SqliteStore::new(Database::open(path)?)),
            None => Box::new(NoopStore),
        };

        tracing::info!(
            download_root = %config.download_root.display(),
            persistent = config.database_path.is_some(),
            owns_runtime = runtime.is_some(),
            "Initialized fetch context"
        );

        Ok(Self {
            config,
            downloader,
            store,
            runtime,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    /// Start a transfer of `source` into `destination` under the download
    /// root. Returns without waiting; the handle is already `InProgress`.
    pub fn create_download(
        &self,
        source: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> DownloadHandle {
        let handle = self
            .downloader
            .create(DownloadConfig::new(source, destination));

        tracing::info!(
            download_id = %handle.id(),
            source = %handle.config().source,
            "Created new download"
        );

        handle
    }

    /// Requests saved by a previous process, already restarted.
    pub fn load_downloads(&self) -> Result<HashMap<String, DownloadHandle>> {
        Ok(self.store.load_all(&self.downloader)?)
    }

    pub fn save_downloads(&self, downloads: &HashMap<String, DownloadHandle>) -> Result<()> {
        Ok(self.store.save_all(downloads)?)
    }

    /// End the context's life. An owned runtime is shut down, abandoning
    /// transfers that do not finish within a short grace period.
    pub fn shutdown(mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        }
        tracing::info!("Fetch context shut down");
    }
}

impl std::fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchContext")
            .field("config", &self.config)
            .field("owns_runtime", &self.runtime.is_some())
            .finish()
    }
}
