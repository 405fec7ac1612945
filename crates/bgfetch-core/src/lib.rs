//! bgfetch core
//!
//! Process-scoped wiring for the download engine: configuration, the shared
//! transport client and runtime, and the persistence backend.

mod config;
mod context;
mod error;

pub use config::Config;
pub use context::FetchContext;
pub use error::CoreError;

// Re-export the engine surface hosts work with
pub use bgfetch_download::{
    BackgroundDownload, DownloadConfig, DownloadError, DownloadHandle, DownloadStatus,
    DownloadStore, Downloader, EngineSettings, FailureKind, NoopStore, SqliteStore,
    SourceLocator, Transfer, TransferError, TransferTask,
};
pub use bgfetch_storage::{Database, StorageError};

pub type Result<T> = std::result::Result<T, CoreError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // A host may already have installed a subscriber
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
