//! Transfer engine
//!
//! Copies one source to one destination in a single pass. The destination is
//! truncated first; there is no resume and no retry.

use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::download::{DownloadConfig, DownloadStatus, SourceLocator};
use crate::error::{DownloadError, TransferError};
use crate::handle::DownloadHandle;
use crate::state::{DownloadControl, TransferState};
use crate::Result;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Engine-wide knobs shared by every transfer of one `Downloader`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Read size for local copies
    pub chunk_size: usize,
    /// Coarse ceiling on a whole remote request, headers through body
    pub request_timeout: Option<Duration>,
    /// Upper bound on transfers running at once; `None` is unbounded
    pub max_concurrent_transfers: Option<usize>,
    pub user_agent: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout: Some(Duration::from_secs(24 * 60 * 60)),
            max_concurrent_transfers: None,
            user_agent: concat!("bgfetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Entry point for starting transfers.
///
/// Owns the shared HTTP client and the runtime handle transfers are spawned
/// on. Cloning is cheap; clones share the client and the concurrency limit.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    root: PathBuf,
    settings: EngineSettings,
    limiter: Option<Arc<Semaphore>>,
    runtime: tokio::runtime::Handle,
}

impl Downloader {
    pub fn new(
        root: impl Into<PathBuf>,
        settings: EngineSettings,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(settings.user_agent.clone());
        if let Some(timeout) = settings.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        let limiter = settings
            .max_concurrent_transfers
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let root = root.into();
        tracing::debug!(
            root = %root.display(),
            chunk_size = settings.chunk_size,
            max_concurrent = ?settings.max_concurrent_transfers,
            "Created downloader"
        );

        Ok(Self {
            client,
            root,
            settings,
            limiter,
            runtime,
        })
    }

    /// Build a downloader on the runtime the caller is running in.
    pub fn from_current(root: impl Into<PathBuf>, settings: EngineSettings) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DownloadError::NoRuntime)?;
        Self::new(root, settings, runtime)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Build a handle and its unscheduled transfer. Nothing runs until the
    /// caller awaits `Transfer::run` or calls `Transfer::spawn`.
    pub fn prepare(&self, config: DownloadConfig) -> (DownloadHandle, Transfer) {
        self.prepare_with_id(Uuid::new_v4().to_string(), config)
    }

    pub fn prepare_with_id(
        &self,
        id: String,
        config: DownloadConfig,
    ) -> (DownloadHandle, Transfer) {
        let destination = config.resolve_destination(&self.root);
        let state = Arc::new(TransferState::new());
        let (control_tx, control_rx) = watch::channel(DownloadControl::Continue);
        let control_tx = Arc::new(control_tx);

        let handle = DownloadHandle::new(
            id.clone(),
            config.clone(),
            destination.as_ref().ok().cloned(),
            Arc::clone(&state),
            Arc::clone(&control_tx),
        );

        let guard = FinishGuard {
            state: Arc::clone(&state),
            target: destination.as_ref().ok().cloned(),
            done: false,
        };

        let transfer = Transfer {
            id,
            config,
            destination,
            state,
            guard,
            control_tx,
            control: control_rx,
            client: self.client.clone(),
            chunk_size: self.settings.chunk_size.max(1),
            limiter: self.limiter.clone(),
        };

        (handle, transfer)
    }

    /// Prepare and schedule a transfer; the handle is `InProgress` on return.
    pub fn start(&self, config: DownloadConfig) -> (DownloadHandle, TransferTask) {
        self.start_with_id(Uuid::new_v4().to_string(), config)
    }

    pub fn start_with_id(
        &self,
        id: String,
        config: DownloadConfig,
    ) -> (DownloadHandle, TransferTask) {
        let (handle, transfer) = self.prepare_with_id(id, config);
        let task = transfer.spawn(&self.runtime);
        (handle, task)
    }

    /// Start a transfer and detach its task; observe it through the handle.
    pub fn create(&self, config: DownloadConfig) -> DownloadHandle {
        let (handle, _task) = self.start(config);
        handle
    }
}

/// Publishes `Failed` if a transfer is dropped before it completes, so the
/// handle never waits on a task that no longer exists.
struct FinishGuard {
    state: Arc<TransferState>,
    target: Option<PathBuf>,
    done: bool,
}

impl FinishGuard {
    fn complete(mut self, result: std::result::Result<u64, TransferError>) -> DownloadStatus {
        self.done = true;
        self.state.finish(self.target.as_deref(), result)
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        tracing::warn!("Transfer dropped before completion");
        self.state
            .finish(self.target.as_deref(), Err(TransferError::Cancelled));
    }
}

/// One unscheduled transfer.
///
/// Dropping it without running it, or dropping the future returned by `run`
/// (for example when its runtime shuts down), fails the transfer as cancelled.
pub struct Transfer {
    id: String,
    config: DownloadConfig,
    destination: std::result::Result<PathBuf, TransferError>,
    state: Arc<TransferState>,
    guard: FinishGuard,
    control_tx: Arc<watch::Sender<DownloadControl>>,
    control: watch::Receiver<DownloadControl>,
    client: reqwest::Client,
    chunk_size: usize,
    limiter: Option<Arc<Semaphore>>,
}

impl Transfer {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Schedule on `runtime`. The handle reports `InProgress` before this
    /// returns.
    pub fn spawn(self, runtime: &tokio::runtime::Handle) -> TransferTask {
        self.state.begin();
        let control = Arc::clone(&self.control_tx);
        let join = runtime.spawn(self.run());
        TransferTask { join, control }
    }

    /// Drive the transfer to a terminal status on the current task.
    pub async fn run(self) -> DownloadStatus {
        let Transfer {
            id,
            config,
            destination,
            state,
            guard,
            control_tx: _control_tx,
            mut control,
            client,
            chunk_size,
            limiter,
        } = self;

        state.begin();

        let span = tracing::info_span!("transfer", download_id = %id);

        let result = async {
            tracing::info!(source = %config.source, "Starting download");
            let destination = destination?;
            let locator = config.locator()?;

            let _permit = acquire(limiter, &mut control).await?;
            ensure_not_cancelled(&control)?;

            let mut file = open_destination(&destination).await?;
            state.reset_counters();

            let copied = match &locator {
                SourceLocator::Local(path) => {
                    copy_local(path, &mut file, chunk_size, &state, &mut control).await
                }
                SourceLocator::Remote(url) => {
                    copy_remote(&client, url, &mut file, &state, &mut control).await
                }
            };

            let closed = close_destination(file, copied.is_ok()).await;
            let bytes = copied?;
            closed?;
            Ok::<u64, TransferError>(bytes)
        }
        .instrument(span.clone())
        .await;

        span.in_scope(|| match &result {
            Ok(bytes) => tracing::info!(bytes = *bytes, "Download succeeded"),
            Err(e) => tracing::warn!(error = %e, "Download failed"),
        });

        guard.complete(result)
    }
}

/// Cancel-capable handle to a scheduled transfer.
pub struct TransferTask {
    join: JoinHandle<DownloadStatus>,
    control: Arc<watch::Sender<DownloadControl>>,
}

impl TransferTask {
    /// Ask the transfer to stop at its next I/O boundary; does not wait.
    pub fn cancel(&self) {
        self.control.send_replace(DownloadControl::Cancel);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the transfer to reach a terminal status.
    pub async fn join(self) -> DownloadStatus {
        match self.join.await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(error = %e, "Transfer task did not complete");
                DownloadStatus::Failed
            }
        }
    }
}

/// Resolves once cancellation is requested or the requesting side is gone.
async fn cancelled(control: &mut watch::Receiver<DownloadControl>) {
    loop {
        if *control.borrow_and_update() == DownloadControl::Cancel {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}

fn ensure_not_cancelled(
    control: &watch::Receiver<DownloadControl>,
) -> std::result::Result<(), TransferError> {
    if *control.borrow() == DownloadControl::Cancel {
        return Err(TransferError::Cancelled);
    }
    Ok(())
}

async fn acquire(
    limiter: Option<Arc<Semaphore>>,
    control: &mut watch::Receiver<DownloadControl>,
) -> std::result::Result<Option<OwnedSemaphorePermit>, TransferError> {
    let Some(limiter) = limiter else {
        return Ok(None);
    };

    tokio::select! {
        biased;
        _ = cancelled(control) => Err(TransferError::Cancelled),
        permit = limiter.acquire_owned() => permit
            .map(Some)
            .map_err(|_| TransferError::Cancelled),
    }
}

async fn open_destination(path: &Path) -> std::result::Result<File, TransferError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    Ok(file)
}

/// Flush outstanding writes and close. Synced to disk only after a full copy.
async fn close_destination(
    mut file: File,
    complete: bool,
) -> std::result::Result<(), TransferError> {
    file.flush().await?;
    if complete {
        file.sync_all().await?;
    }
    drop(file);
    Ok(())
}

async fn copy_local(
    source: &Path,
    file: &mut File,
    chunk_size: usize,
    state: &TransferState,
    control: &mut watch::Receiver<DownloadControl>,
) -> std::result::Result<u64, TransferError> {
    let mut input = File::open(source).await?;
    if let Ok(metadata) = input.metadata().await {
        state.set_expected_total(metadata.len());
    }

    tracing::debug!(source = %source.display(), "Copying local file");

    let mut buf = vec![0u8; chunk_size];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = cancelled(control) => return Err(TransferError::Cancelled),
            read = input.read(&mut buf) => read?,
        };
        if n == 0 {
            break;
        }

        file.write_all(&buf[..n]).await?;
        copied += n as u64;
        state.record_written(n as u64);
    }

    Ok(copied)
}

async fn copy_remote(
    client: &reqwest::Client,
    url: &url::Url,
    file: &mut File,
    state: &TransferState,
    control: &mut watch::Receiver<DownloadControl>,
) -> std::result::Result<u64, TransferError> {
    // `send` resolves once headers arrive; the body is streamed below
    let response = tokio::select! {
        biased;
        _ = cancelled(control) => return Err(TransferError::Cancelled),
        response = client.get(url.clone()).send() => response?,
    };

    if !response.status().is_success() {
        return Err(TransferError::Response(response.status()));
    }

    let content_length = response.content_length();
    if let Some(len) = content_length {
        state.set_expected_total(len);
    }

    tracing::debug!(
        url = %url,
        status = %response.status(),
        content_length = ?content_length,
        "Streaming response body"
    );

    let mut stream = response.bytes_stream();
    let mut copied = 0u64;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancelled(control) => return Err(TransferError::Cancelled),
            chunk = stream.next() => chunk,
        };

        let chunk = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => return Err(e.into()),
            None => break,
        };

        file.write_all(&chunk).await?;
        copied += chunk.len() as u64;
        state.record_written(chunk.len() as u64);
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloader(root: &Path) -> Downloader {
        Downloader::from_current(root, EngineSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_prepare_does_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"payload").unwrap();

        let (handle, transfer) =
            downloader(dir.path()).prepare(DownloadConfig::new(source.to_string_lossy(), "out.bin"));

        tokio::task::yield_now().await;
        assert_eq!(handle.status(), DownloadStatus::Pending);
        assert!(!dir.path().join("out.bin").exists());

        assert_eq!(transfer.run().await, DownloadStatus::Succeeded);
        assert_eq!(handle.status(), DownloadStatus::Succeeded);
        assert_eq!(std::fs::read(dir.path().join("out.bin")).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_start_reports_in_progress_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, vec![7u8; 10_000]).unwrap();

        let (handle, task) =
            downloader(dir.path()).start(DownloadConfig::new(source.to_string_lossy(), "out.bin"));
        assert_eq!(handle.status(), DownloadStatus::InProgress);
        assert!(handle.keep_waiting());

        assert_eq!(task.join().await, DownloadStatus::Succeeded);
        assert_eq!(handle.progress(), 1.0);
        assert_eq!(handle.expected_total_bytes(), Some(10_000));
    }

    #[tokio::test]
    async fn test_existing_destination_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"short").unwrap();
        std::fs::write(dir.path().join("out.bin"), vec![1u8; 4096]).unwrap();

        let (_handle, task) =
            downloader(dir.path()).start(DownloadConfig::new(source.to_string_lossy(), "out.bin"));
        assert_eq!(task.join().await, DownloadStatus::Succeeded);
        assert_eq!(std::fs::read(dir.path().join("out.bin")).unwrap(), b"short");
    }

    #[tokio::test]
    async fn test_nested_destination_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"abc").unwrap();

        let (_handle, task) = downloader(dir.path()).start(DownloadConfig::new(
            source.to_string_lossy(),
            "packs/level1/out.bin",
        ));
        assert_eq!(task.join().await, DownloadStatus::Succeeded);
        assert!(dir.path().join("packs/level1/out.bin").exists());
    }

    #[tokio::test]
    async fn test_missing_source_fails_with_filesystem_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.bin");

        let (handle, task) =
            downloader(dir.path()).start(DownloadConfig::new(missing.to_string_lossy(), "out.bin"));
        assert_eq!(task.join().await, DownloadStatus::Failed);
        assert_eq!(handle.failure_kind(), Some(crate::FailureKind::Filesystem));
        assert!(handle.error().starts_with("FilesystemError during download"));
    }

    #[tokio::test]
    async fn test_escaping_destination_fails_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"abc").unwrap();

        let (handle, task) =
            downloader(&root).start(DownloadConfig::new(source.to_string_lossy(), "../out.bin"));
        assert_eq!(task.join().await, DownloadStatus::Failed);
        assert!(handle.error().contains("escapes the download root"));
        assert!(!dir.path().join("out.bin").exists());
    }

    #[tokio::test]
    async fn test_cancel_before_run_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"abc").unwrap();

        let (handle, transfer) =
            downloader(dir.path()).prepare(DownloadConfig::new(source.to_string_lossy(), "out.bin"));
        handle.cancel();

        assert_eq!(transfer.run().await, DownloadStatus::Failed);
        assert_eq!(handle.failure_kind(), Some(crate::FailureKind::Cancelled));
    }

    #[tokio::test]
    async fn test_dropped_transfer_fails_as_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"abc").unwrap();
        std::fs::write(dir.path().join("out.bin"), b"stale").unwrap();

        let (mut handle, transfer) =
            downloader(dir.path()).prepare(DownloadConfig::new(source.to_string_lossy(), "out.bin"));
        drop(transfer);

        assert_eq!(handle.status(), DownloadStatus::Failed);
        assert!(!handle.keep_waiting());
        assert_eq!(handle.wait().await, DownloadStatus::Failed);
        assert_eq!(handle.failure_kind(), Some(crate::FailureKind::Cancelled));

        handle.dispose();
        assert!(!dir.path().join("out.bin").exists());
    }

    #[tokio::test]
    async fn test_dropped_run_future_fails_and_cleans_up_after_dispose() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"abc").unwrap();

        let (mut handle, transfer) =
            downloader(dir.path()).prepare(DownloadConfig::new(source.to_string_lossy(), "out.bin"));
        handle.dispose();

        let run = Box::pin(transfer.run());
        drop(run);

        assert_eq!(handle.wait().await, DownloadStatus::Failed);
        assert!(!dir.path().join("out.bin").exists());
    }

    #[tokio::test]
    async fn test_concurrency_limit_still_completes_all() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, vec![3u8; 20_000]).unwrap();

        let settings = EngineSettings {
            max_concurrent_transfers: Some(1),
            ..EngineSettings::default()
        };
        let downloader = Downloader::from_current(dir.path(), settings).unwrap();

        let tasks: Vec<_> = (0..3)
            .map(|i| {
                downloader.start(DownloadConfig::new(
                    source.to_string_lossy(),
                    format!("out-{}.bin", i),
                ))
            })
            .collect();

        for (handle, task) in tasks {
            assert_eq!(task.join().await, DownloadStatus::Succeeded);
            assert_eq!(handle.bytes_written(), 20_000);
        }
    }

    #[test]
    fn test_from_current_without_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let result = Downloader::from_current(dir.path(), EngineSettings::default());
        assert!(matches!(result, Err(DownloadError::NoRuntime)));
    }
}
