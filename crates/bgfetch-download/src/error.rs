//! Download error types

use thiserror::Error;

/// Errors returned directly from the crate API.
///
/// Transfer failures never surface here; they are captured into the
/// handle and observed by polling.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Storage error: {0}")]
    Storage(#[from] bgfetch_storage::StorageError),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("No tokio runtime available to schedule transfers")]
    NoRuntime,

    #[error("Invalid stored record: {0}")]
    InvalidRecord(String),
}

/// Coarse classification of a failed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Connection, DNS or TLS failure
    Transport,
    /// Remote answered with a non-success status
    Response,
    /// Missing source, permission denied, disk full
    Filesystem,
    /// Cancellation observed mid-transfer
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transport => "transport",
            FailureKind::Response => "response",
            FailureKind::Filesystem => "filesystem",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

/// Why a single transfer ended in `Failed`.
///
/// The display string is what the handle reports as its error message.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("TransportError during download: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("ResponseError during download: HTTP {0}")]
    Response(reqwest::StatusCode),

    #[error("FilesystemError during download: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("CancelledError during download: operation cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::Transport(_) => FailureKind::Transport,
            TransferError::Response(_) => FailureKind::Response,
            TransferError::Filesystem(_) => FailureKind::Filesystem,
            TransferError::Cancelled => FailureKind::Cancelled,
        }
    }

    pub(crate) fn invalid_path(detail: impl Into<String>) -> Self {
        TransferError::Filesystem(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            detail.into(),
        ))
    }
}
