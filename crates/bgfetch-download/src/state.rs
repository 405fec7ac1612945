//! State shared between a handle and its background transfer

use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::watch;

use crate::download::DownloadStatus;
use crate::error::{FailureKind, TransferError};

/// Signal sent from the owning handle to the running transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DownloadControl {
    Continue,
    Cancel,
}

#[derive(Debug, Default)]
struct Failure {
    kind: Option<FailureKind>,
    message: String,
}

#[derive(Debug, Default)]
struct Lifecycle {
    disposed: bool,
    /// Terminal status decided by the transfer, possibly not yet published
    outcome: Option<DownloadStatus>,
}

/// Result record written by the transfer and read by pollers.
///
/// Status only moves `Pending -> InProgress -> {Succeeded | Failed}`.
/// Progress is a single `f32` stored as bits so reads never tear.
pub(crate) struct TransferState {
    status: watch::Sender<DownloadStatus>,
    failure: RwLock<Failure>,
    progress: AtomicU32,
    expected_total: AtomicU64,
    written: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

impl TransferState {
    pub fn new() -> Self {
        let (status, _) = watch::channel(DownloadStatus::Pending);
        Self {
            status,
            failure: RwLock::new(Failure::default()),
            progress: AtomicU32::new(0f32.to_bits()),
            expected_total: AtomicU64::new(0),
            written: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn status(&self) -> DownloadStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadStatus> {
        self.status.subscribe()
    }

    pub fn error_message(&self) -> String {
        self.failure.read().message.clone()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.read().kind
    }

    pub fn progress(&self) -> f32 {
        match self.status() {
            DownloadStatus::Succeeded => 1.0,
            DownloadStatus::Pending => 0.0,
            _ => f32::from_bits(self.progress.load(Ordering::Acquire)),
        }
    }

    /// Total bytes announced by the source, if any.
    pub fn expected_total(&self) -> Option<u64> {
        match self.expected_total.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// `Pending -> InProgress`; a no-op in any other state.
    pub fn begin(&self) -> bool {
        self.status.send_if_modified(|status| {
            if *status == DownloadStatus::Pending {
                *status = DownloadStatus::InProgress;
                true
            } else {
                false
            }
        })
    }

    /// Start of a fresh pass: the destination was just truncated.
    pub fn reset_counters(&self) {
        self.written.store(0, Ordering::Release);
        self.expected_total.store(0, Ordering::Release);
        self.progress.store(0f32.to_bits(), Ordering::Release);
    }

    pub fn set_expected_total(&self, total: u64) {
        self.expected_total.store(total, Ordering::Release);
    }

    pub fn record_written(&self, bytes: u64) {
        let written = self.written.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let total = self.expected_total.load(Ordering::Acquire);
        if total > 0 {
            let fraction = (written as f64 / total as f64).clamp(0.0, 1.0) as f32;
            // Single writer, so a plain store keeps the sequence non-decreasing
            self.progress.store(fraction.to_bits(), Ordering::Release);
        }
    }

    /// Publish the terminal status.
    ///
    /// Runs after the transfer has closed the destination, or when an
    /// unfinished transfer is dropped. If the handle was already disposed and
    /// the transfer did not succeed, the partial output is removed here,
    /// before the status becomes visible. The lock only decides who deletes.
    pub fn finish(
        &self,
        destination: Option<&Path>,
        result: std::result::Result<u64, TransferError>,
    ) -> DownloadStatus {
        let status = if result.is_ok() {
            DownloadStatus::Succeeded
        } else {
            DownloadStatus::Failed
        };

        let discard = {
            let mut lifecycle = self.lifecycle.lock();
            if let Some(outcome) = lifecycle.outcome {
                return outcome;
            }
            lifecycle.outcome = Some(status);
            lifecycle.disposed && status != DownloadStatus::Succeeded
        };

        match result {
            Ok(_) => {
                self.progress.store(1f32.to_bits(), Ordering::Release);
                let mut failure = self.failure.write();
                failure.kind = None;
                failure.message.clear();
            }
            Err(e) => {
                let mut failure = self.failure.write();
                failure.kind = Some(e.kind());
                failure.message = e.to_string();
            }
        }

        if discard {
            if let Some(path) = destination {
                remove_partial(path);
            }
        }

        self.status.send_replace(status);
        status
    }

    /// Mark the owning handle as disposed.
    ///
    /// Returns `true` when the transfer is still running and must be told to
    /// stop; it will then clean up after itself in `finish`.
    pub fn dispose(&self, destination: Option<&Path>) -> bool {
        let outcome = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.disposed {
                return false;
            }
            lifecycle.disposed = true;

            match lifecycle.outcome {
                Some(outcome) => outcome,
                None => return true,
            }
        };

        if outcome != DownloadStatus::Succeeded {
            if let Some(path) = destination {
                remove_partial(path);
            }
        }
        false
    }
}

/// Best-effort removal of non-succeeded output.
pub(crate) fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "Failed to remove partial download"
        ),
    }
}
