//! Caller-facing download handle

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

use crate::download::{DownloadConfig, DownloadStatus};
use crate::error::FailureKind;
use crate::state::{DownloadControl, TransferState};

/// What a host needs from one in-flight or finished transfer.
///
/// Hosts poll `status`/`progress` once per tick and call `dispose` when
/// done. Implementations are picked when the host is composed.
pub trait BackgroundDownload: Send + Sync {
    fn id(&self) -> &str;

    fn config(&self) -> &DownloadConfig;

    fn status(&self) -> DownloadStatus;

    /// Last known fraction in `[0, 1]`. Only `status` is authoritative for
    /// completion.
    fn progress(&self) -> f32;

    /// Empty unless the transfer failed.
    fn error(&self) -> String;

    fn failure_kind(&self) -> Option<FailureKind>;

    fn cancel(&self);

    fn dispose(&mut self);

    /// True until the status is terminal.
    fn keep_waiting(&self) -> bool {
        !self.status().is_terminal()
    }

    fn is_in_progress(&self) -> bool {
        self.status() == DownloadStatus::InProgress
    }
}

/// Handle to one transfer started by a [`crate::Downloader`].
///
/// Dropping the handle disposes it.
pub struct DownloadHandle {
    id: String,
    config: DownloadConfig,
    destination: Option<PathBuf>,
    state: Arc<TransferState>,
    control: Arc<watch::Sender<DownloadControl>>,
    disposed: bool,
}

impl DownloadHandle {
    pub(crate) fn new(
        id: String,
        config: DownloadConfig,
        destination: Option<PathBuf>,
        state: Arc<TransferState>,
        control: Arc<watch::Sender<DownloadControl>>,
    ) -> Self {
        Self {
            id,
            config,
            destination,
            state,
            control,
            disposed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Absolute output path, or `None` when the configured destination was
    /// rejected.
    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.status()
    }

    pub fn progress(&self) -> f32 {
        self.state.progress()
    }

    pub fn error(&self) -> String {
        self.state.error_message()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.state.failure_kind()
    }

    pub fn expected_total_bytes(&self) -> Option<u64> {
        self.state.expected_total()
    }

    pub fn bytes_written(&self) -> u64 {
        self.state.bytes_written()
    }

    pub fn keep_waiting(&self) -> bool {
        !self.status().is_terminal()
    }

    pub fn is_in_progress(&self) -> bool {
        self.status() == DownloadStatus::InProgress
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Request cooperative cancellation. Returns immediately; the transfer
    /// resolves to `Failed` at its next I/O boundary.
    pub fn cancel(&self) {
        if self.status().is_terminal() {
            return;
        }
        self.control.send_replace(DownloadControl::Cancel);
        tracing::debug!(download_id = %self.id, "Cancellation requested");
    }

    /// Wait until the status is terminal.
    ///
    /// After `dispose`, a terminal status also means partial output has been
    /// removed.
    pub async fn wait(&self) -> DownloadStatus {
        let mut rx = self.state.subscribe();
        let result = rx.wait_for(|status| status.is_terminal()).await.map(|s| *s);
        result.unwrap_or_else(|_| self.status())
    }

    /// Cancel if still running and drop non-succeeded output.
    ///
    /// Never blocks on the transfer. When the transfer is still running the
    /// file is removed by the transfer itself once it has closed it. Safe to
    /// call more than once.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if self.state.dispose(self.destination.as_deref()) {
            self.control.send_replace(DownloadControl::Cancel);
        }

        tracing::debug!(
            download_id = %self.id,
            status = %self.status(),
            "Disposed download handle"
        );
    }
}

impl BackgroundDownload for DownloadHandle {
    fn id(&self) -> &str {
        DownloadHandle::id(self)
    }

    fn config(&self) -> &DownloadConfig {
        DownloadHandle::config(self)
    }

    fn status(&self) -> DownloadStatus {
        DownloadHandle::status(self)
    }

    fn progress(&self) -> f32 {
        DownloadHandle::progress(self)
    }

    fn error(&self) -> String {
        DownloadHandle::error(self)
    }

    fn failure_kind(&self) -> Option<FailureKind> {
        DownloadHandle::failure_kind(self)
    }

    fn cancel(&self) {
        DownloadHandle::cancel(self)
    }

    fn dispose(&mut self) {
        DownloadHandle::dispose(self)
    }
}

impl Drop for DownloadHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish()
    }
}
