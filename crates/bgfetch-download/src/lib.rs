//! bgfetch download engine
//!
//! - Streams a local file or a network resource to a path under a fixed root
//! - Hands back a pollable handle: status, fractional progress, last error
//! - Cooperative cancellation observed at I/O chunk boundaries
//! - Non-succeeded output is removed when the handle is disposed

mod download;
mod engine;
mod error;
mod handle;
mod state;
mod store;

pub use download::{DownloadConfig, DownloadStatus, SourceLocator};
pub use engine::{Downloader, EngineSettings, Transfer, TransferTask, DEFAULT_CHUNK_SIZE};
pub use error::{DownloadError, FailureKind, TransferError};
pub use handle::{BackgroundDownload, DownloadHandle};
pub use store::{DownloadStore, NoopStore, SqliteStore};

pub type Result<T> = std::result::Result<T, DownloadError>;
