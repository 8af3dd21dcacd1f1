//! Resumable, integrity-checked artifact transfer
//!
//! One sequential streamed transfer per [`Downloader::fetch`] call. Bytes
//! are appended to a staging file next to the destination and renamed into
//! place only after size (and checksum, when known) verification.

pub mod progress;
pub mod remote;
pub mod state;

pub use progress::{BarProgress, LogProgress, NoProgress, ProgressObserver};
pub use remote::{HfRemote, RemoteBody, RemoteFile, RemoteMetadata, RemoteSource, TransportError};
pub use state::{DownloadState, DownloadStatus, StagingPaths};

use crate::error::DownloadError;
use crate::storage::temp_path;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts tolerated before giving up
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// One artifact to transfer
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub remote: RemoteFile,
    pub dest: PathBuf,
    /// Reuse a compatible partial file
    pub resume: bool,
    /// State recorded by an earlier pull of the same artifact
    pub previous: Option<DownloadState>,
}

impl FetchRequest {
    pub fn new(remote: RemoteFile, dest: impl Into<PathBuf>) -> Self {
        Self {
            remote,
            dest: dest.into(),
            resume: true,
            previous: None,
        }
    }
}

enum Attempt {
    /// Stream delivered every expected byte
    Finished,
    /// Transfer stopped early; `bytes` are safely on disk
    Interrupted { bytes: u64, reason: String },
}

/// Transfers artifacts from a [`RemoteSource`]
pub struct Downloader {
    remote: Arc<dyn RemoteSource>,
    retry: RetryPolicy,
    progress: Arc<dyn ProgressObserver>,
    cancel: Option<watch::Receiver<bool>>,
    /// Sidecar is rewritten after this many new bytes
    persist_every: u64,
}

impl Downloader {
    pub fn new(remote: Arc<dyn RemoteSource>) -> Self {
        Self {
            remote,
            retry: RetryPolicy::default(),
            progress: Arc::new(NoProgress),
            cancel: None,
            persist_every: 16 * 1024 * 1024,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    /// Stop the transfer once the channel carries `true`
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_persist_interval(mut self, bytes: u64) -> Self {
        self.persist_every = bytes.max(1);
        self
    }

    /// State of an unfinished transfer for `dest`, if one is staged
    pub async fn staged_state(dest: &Path) -> Option<DownloadState> {
        load_state(&StagingPaths::for_dest(dest).sidecar).await
    }

    /// Transfer `req.remote` to `req.dest`
    pub async fn fetch(&self, req: &FetchRequest) -> Result<DownloadState, DownloadError> {
        let name = req.remote.file.clone();
        let mut cancel = self.cancel.clone();
        let meta = self.metadata_with_retry(&req.remote, &mut cancel).await?;
        let paths = StagingPaths::for_dest(&req.dest);

        if let Some(parent) = req.dest.parent() {
            fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }

        if let Some(state) = self.already_current(req, &meta).await {
            tracing::info!(file = %name, "Artifact already up to date");
            self.progress.finish(meta.size);
            return Ok(state);
        }

        if meta.size == 0 {
            fs::File::create(&paths.partial)
                .await
                .map_err(io_err(&paths.partial))?;
            return self.finalize(&paths, &meta, &name).await;
        }

        let mut offset = self.resume_offset(req, &meta, &paths).await?;
        self.progress.start(&name, offset, Some(meta.size));
        self.persist(&paths, &meta, DownloadStatus::InProgress, offset)
            .await?;

        let mut failures = 0u32;
        while offset < meta.size {
            let before = offset;
            match self
                .stream_once(req, &meta, &paths, offset, &mut cancel)
                .await?
            {
                Attempt::Finished => offset = meta.size,
                Attempt::Interrupted { bytes, reason } => {
                    offset = bytes;
                    if bytes > before {
                        failures = 0;
                    }
                    failures += 1;

                    if failures >= self.retry.max_attempts {
                        self.persist(&paths, &meta, DownloadStatus::Failed, bytes)
                            .await?;
                        tracing::warn!(
                            file = %name,
                            bytes = bytes,
                            attempts = failures,
                            error = %reason,
                            "Download failed, partial data kept for resume"
                        );
                        return Err(DownloadError::RetriesExhausted {
                            file: name,
                            attempts: failures,
                            last_error: reason,
                        });
                    }

                    let delay = self.retry.delay(failures);
                    tracing::debug!(
                        file = %name,
                        bytes = bytes,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Transient transfer failure, retrying"
                    );
                    if sleep_or_cancel(delay, &mut cancel).await {
                        return Err(DownloadError::Cancelled { file: name, bytes });
                    }
                }
            }
        }

        self.finalize(&paths, &meta, &name).await
    }

    async fn metadata_with_retry(
        &self,
        file: &RemoteFile,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> Result<RemoteMetadata, DownloadError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let reason = match self.remote.metadata(file).await {
                Ok(meta) => return Ok(meta),
                Err(TransportError::Permanent(reason)) => {
                    return Err(DownloadError::Remote {
                        file: file.file.clone(),
                        reason,
                    });
                }
                Err(e) => e.to_string(),
            };

            if attempt >= self.retry.max_attempts {
                return Err(DownloadError::RetriesExhausted {
                    file: file.file.clone(),
                    attempts: attempt,
                    last_error: reason,
                });
            }
            tracing::debug!(file = %file.file, attempt = attempt, error = %reason, "Metadata query failed, retrying");
            if sleep_or_cancel(self.retry.delay(attempt), cancel).await {
                return Err(DownloadError::Cancelled {
                    file: file.file.clone(),
                    bytes: 0,
                });
            }
        }
    }

    /// A previous completed pull matches the remote and is still on disk
    async fn already_current(
        &self,
        req: &FetchRequest,
        meta: &RemoteMetadata,
    ) -> Option<DownloadState> {
        let previous = req.previous.as_ref().filter(|p| p.is_complete())?;
        if previous.validator.is_none() || previous.validator != meta.validator {
            return None;
        }
        let len = file_len(&req.dest).await.ok().flatten()?;
        (len == meta.size).then(|| {
            DownloadState::completed(meta.size, meta.validator.clone(), meta.sha256.clone())
        })
    }

    /// Decide where to start: the partial's length when its recorded
    /// validator matches the remote, otherwise zero with a fresh file
    async fn resume_offset(
        &self,
        req: &FetchRequest,
        meta: &RemoteMetadata,
        paths: &StagingPaths,
    ) -> Result<u64, DownloadError> {
        let partial_len = file_len(&paths.partial).await?;
        let staged = load_state(&paths.sidecar).await;

        if let Some(len) = partial_len {
            let staged_validator = staged.as_ref().and_then(|s| s.validator.as_deref());
            let matches = meta.validator.is_some() && staged_validator == meta.validator.as_deref();
            if req.resume && matches && len <= meta.size {
                tracing::info!(file = %req.remote.file, offset = len, "Resuming partial download");
                return Ok(len);
            }
            tracing::info!(
                file = %req.remote.file,
                staged_validator = ?staged_validator,
                remote_validator = ?meta.validator,
                "Discarding incompatible partial download"
            );
        }

        fs::File::create(&paths.partial)
            .await
            .map_err(io_err(&paths.partial))?;
        Ok(0)
    }

    async fn stream_once(
        &self,
        req: &FetchRequest,
        meta: &RemoteMetadata,
        paths: &StagingPaths,
        offset: u64,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> Result<Attempt, DownloadError> {
        let name = &req.remote.file;
        let body = match self
            .remote
            .open(&req.remote, offset, meta.validator.as_deref())
            .await
        {
            Ok(body) => body,
            Err(TransportError::Transient(reason)) => {
                return Ok(Attempt::Interrupted {
                    bytes: offset,
                    reason,
                });
            }
            Err(TransportError::RangeRejected) => {
                fs::File::create(&paths.partial)
                    .await
                    .map_err(io_err(&paths.partial))?;
                self.persist(paths, meta, DownloadStatus::InProgress, 0)
                    .await?;
                return Ok(Attempt::Interrupted {
                    bytes: 0,
                    reason: "server rejected byte range, restarting".to_string(),
                });
            }
            Err(TransportError::Permanent(reason)) => {
                self.persist(paths, meta, DownloadStatus::Failed, offset)
                    .await?;
                return Err(DownloadError::Remote {
                    file: name.clone(),
                    reason,
                });
            }
        };

        let mut bytes = offset;
        if body.offset != offset {
            tracing::info!(file = %name, requested = offset, served = body.offset, "Server ignored range, restarting");
            fs::File::create(&paths.partial)
                .await
                .map_err(io_err(&paths.partial))?;
            bytes = body.offset;
        }

        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&paths.partial)
            .await
            .map_err(io_err(&paths.partial))?;
        let mut stream = body.stream;
        let mut unpersisted = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => {
                    file.flush().await.map_err(io_err(&paths.partial))?;
                    self.persist(paths, meta, DownloadStatus::InProgress, bytes).await?;
                    tracing::info!(file = %name, bytes = bytes, "Download cancelled, partial data kept");
                    return Err(DownloadError::Cancelled { file: name.clone(), bytes });
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let len = chunk.len() as u64;
                    if bytes + len > meta.size {
                        drop(file);
                        discard(paths).await;
                        return Err(DownloadError::Integrity {
                            file: name.clone(),
                            reason: format!("server sent more than the advertised {} bytes", meta.size),
                        });
                    }
                    file.write_all(&chunk)
                        .await
                        .map_err(io_err(&paths.partial))?;
                    bytes += len;
                    unpersisted += len;
                    self.progress.progress(bytes, Some(meta.size));

                    if unpersisted >= self.persist_every {
                        file.flush().await.map_err(io_err(&paths.partial))?;
                        self.persist(paths, meta, DownloadStatus::InProgress, bytes)
                            .await?;
                        unpersisted = 0;
                    }
                }
                Some(Err(e)) => {
                    file.flush().await.map_err(io_err(&paths.partial))?;
                    self.persist(paths, meta, DownloadStatus::InProgress, bytes)
                        .await?;
                    return Ok(Attempt::Interrupted {
                        bytes,
                        reason: e.to_string(),
                    });
                }
                None => {
                    file.flush().await.map_err(io_err(&paths.partial))?;
                    if bytes == meta.size {
                        file.sync_all().await.map_err(io_err(&paths.partial))?;
                        return Ok(Attempt::Finished);
                    }
                    self.persist(paths, meta, DownloadStatus::InProgress, bytes)
                        .await?;
                    return Ok(Attempt::Interrupted {
                        bytes,
                        reason: format!("body ended at {} of {} bytes", bytes, meta.size),
                    });
                }
            }
        }
    }

    /// Verify the staged file and move it into place
    async fn finalize(
        &self,
        paths: &StagingPaths,
        meta: &RemoteMetadata,
        name: &str,
    ) -> Result<DownloadState, DownloadError> {
        let actual = file_len(&paths.partial).await?.unwrap_or(0);
        if actual != meta.size {
            discard(paths).await;
            return Err(DownloadError::Integrity {
                file: name.to_string(),
                reason: format!("expected {} bytes, got {}", meta.size, actual),
            });
        }

        if let Some(expected) = &meta.sha256 {
            let digest = sha256_file(&paths.partial).await?;
            if !digest.eq_ignore_ascii_case(expected) {
                discard(paths).await;
                return Err(DownloadError::Integrity {
                    file: name.to_string(),
                    reason: format!("sha256 {} does not match expected {}", digest, expected),
                });
            }
        }

        fs::rename(&paths.partial, &paths.dest)
            .await
            .map_err(io_err(&paths.dest))?;
        remove_if_exists(&paths.sidecar).await;
        self.progress.finish(meta.size);

        tracing::info!(
            file = %name,
            path = ?paths.dest,
            bytes = meta.size,
            verified_checksum = meta.sha256.is_some(),
            "Download complete"
        );
        Ok(DownloadState::completed(
            meta.size,
            meta.validator.clone(),
            meta.sha256.clone(),
        ))
    }

    /// Rewrite the sidecar atomically
    async fn persist(
        &self,
        paths: &StagingPaths,
        meta: &RemoteMetadata,
        status: DownloadStatus,
        bytes: u64,
    ) -> Result<(), DownloadError> {
        let state = DownloadState {
            status,
            bytes,
            total: Some(meta.size),
            validator: meta.validator.clone(),
            sha256: meta.sha256.clone(),
        };
        let content = toml::to_string(&state).map_err(|e| DownloadError::Io {
            path: paths.sidecar.clone(),
            source: std::io::Error::other(e),
        })?;

        let temp = temp_path(&paths.sidecar);
        fs::write(&temp, content).await.map_err(io_err(&temp))?;
        fs::rename(&temp, &paths.sidecar)
            .await
            .map_err(io_err(&paths.sidecar))?;
        Ok(())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DownloadError + '_ {
    move |source| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn file_len(path: &Path) -> Result<Option<u64>, DownloadError> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path)(e)),
    }
}

async fn load_state(sidecar: &Path) -> Option<DownloadState> {
    let content = fs::read_to_string(sidecar).await.ok()?;
    match toml::from_str(&content) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!(path = ?sidecar, error = %e, "Ignoring unreadable download state");
            None
        }
    }
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = ?path, error = %e, "Failed to remove file");
    }
}

/// Drop staged bytes that failed verification
async fn discard(paths: &StagingPaths) {
    remove_if_exists(&paths.partial).await;
    remove_if_exists(&paths.sidecar).await;
}

async fn sha256_file(path: &Path) -> Result<String, DownloadError> {
    let mut file = fs::File::open(path).await.map_err(io_err(path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(io_err(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Resolves once the channel carries `true`; never without a channel
async fn wait_cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

/// Returns `true` if cancelled while waiting
async fn sleep_or_cancel(delay: Duration, cancel: &mut Option<watch::Receiver<bool>>) -> bool {
    tokio::select! {
        biased;
        _ = wait_cancelled(cancel) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::progress::mocks::RecordingProgress;
    use super::remote::mocks::MockRemote;
    use super::*;
    use tempfile::TempDir;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn request(dir: &TempDir) -> FetchRequest {
        FetchRequest::new(
            RemoteFile::new("owner/repo", "model.gguf"),
            dir.path().join("ggufs/model.gguf"),
        )
    }

    fn downloader(remote: &Arc<MockRemote>, attempts: u32) -> Downloader {
        Downloader::new(remote.clone()).with_retry(RetryPolicy::immediate(attempts))
    }

    #[test]
    fn test_retry_delay_is_bounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(10), Duration::from_secs(8));
        assert_eq!(RetryPolicy::immediate(3).delay(5), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_fresh_download() {
        let dir = TempDir::new().unwrap();
        let data = payload(100);
        let remote = Arc::new(MockRemote::new(data.clone(), "v1"));
        let progress = Arc::new(RecordingProgress::default());
        let req = request(&dir);

        let state = downloader(&remote, 3)
            .with_progress(progress.clone())
            .fetch(&req)
            .await
            .unwrap();

        assert_eq!(state.status, DownloadStatus::Completed);
        assert_eq!(state.bytes, 100);
        assert_eq!(state.validator.as_deref(), Some("v1"));
        assert_eq!(std::fs::read(&req.dest).unwrap(), data);

        let paths = StagingPaths::for_dest(&req.dest);
        assert!(!paths.partial.exists());
        assert!(!paths.sidecar.exists());
        assert_eq!(progress.updates().last(), Some(&100));
    }

    #[tokio::test]
    async fn test_transient_failure_resumes_from_partial() {
        let dir = TempDir::new().unwrap();
        let data = payload(100);
        let remote = Arc::new(MockRemote::new(data.clone(), "v1"));
        remote.fail_after(10);
        let req = request(&dir);

        downloader(&remote, 3).fetch(&req).await.unwrap();

        assert_eq!(remote.opens(), vec![0, 10]);
        assert_eq!(std::fs::read(&req.dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_resume_across_runs_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let data = payload(250);
        let remote = Arc::new(MockRemote::new(data.clone(), "v1"));
        let req = request(&dir);

        remote.fail_after(60);
        let err = downloader(&remote, 1).fetch(&req).await.unwrap_err();
        assert!(matches!(err, DownloadError::RetriesExhausted { attempts: 1, .. }));

        let staged = Downloader::staged_state(&req.dest).await.unwrap();
        assert_eq!(staged.status, DownloadStatus::Failed);
        assert_eq!(staged.bytes, 60);
        assert!(!req.dest.exists());

        downloader(&remote, 1).fetch(&req).await.unwrap();
        assert_eq!(remote.opens(), vec![0, 60]);
        assert_eq!(std::fs::read(&req.dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_validator_change_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::new(payload(120), "v1"));
        let req = request(&dir);

        remote.fail_after(50);
        downloader(&remote, 1).fetch(&req).await.unwrap_err();

        let updated: Vec<u8> = payload(120).into_iter().rev().collect();
        remote.replace(updated.clone(), "v2");
        let state = downloader(&remote, 1).fetch(&req).await.unwrap();

        assert_eq!(remote.opens(), vec![0, 0]);
        assert_eq!(state.validator.as_deref(), Some("v2"));
        assert_eq!(std::fs::read(&req.dest).unwrap(), updated);
    }

    #[tokio::test]
    async fn test_resume_disabled_restarts() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::new(payload(40), "v1"));
        let mut req = request(&dir);

        remote.fail_after(20);
        downloader(&remote, 1).fetch(&req).await.unwrap_err();

        req.resume = false;
        downloader(&remote, 1).fetch(&req).await.unwrap();
        assert_eq!(remote.opens(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_server_ignoring_range_restarts_cleanly() {
        let dir = TempDir::new().unwrap();
        let data = payload(64);
        let remote = Arc::new(MockRemote::new(data.clone(), "v1").ignoring_range());
        remote.fail_after(30);
        let req = request(&dir);

        downloader(&remote, 3).fetch(&req).await.unwrap();

        assert_eq!(remote.opens(), vec![0, 30]);
        assert_eq!(std::fs::read(&req.dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_retries_exhausted_keeps_partial() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::new(payload(80), "v1"));
        for _ in 0..3 {
            remote.fail_after(0);
        }
        let req = request(&dir);

        let err = downloader(&remote, 3).fetch(&req).await.unwrap_err();
        assert!(matches!(err, DownloadError::RetriesExhausted { attempts: 3, .. }));

        let paths = StagingPaths::for_dest(&req.dest);
        assert!(paths.partial.exists());
        assert_eq!(
            Downloader::staged_state(&req.dest).await.unwrap().status,
            DownloadStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_checksum_mismatch_discards_partial() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::new(payload(32), "v1").with_sha256(&"0".repeat(64)));
        let req = request(&dir);

        let err = downloader(&remote, 2).fetch(&req).await.unwrap_err();
        assert!(matches!(err, DownloadError::Integrity { .. }));

        let paths = StagingPaths::for_dest(&req.dest);
        assert!(!paths.partial.exists());
        assert!(!paths.sidecar.exists());
        assert!(!req.dest.exists());
    }

    #[tokio::test]
    async fn test_checksum_match() {
        let dir = TempDir::new().unwrap();
        let data = payload(32);
        let sha = format!("{:x}", Sha256::digest(&data));
        let remote = Arc::new(MockRemote::new(data, "v1").with_sha256(&sha));

        let state = downloader(&remote, 2).fetch(&request(&dir)).await.unwrap();
        assert_eq!(state.sha256, Some(sha));
    }

    #[tokio::test]
    async fn test_zero_length_completes_immediately() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::new(Vec::new(), "empty"));
        let req = request(&dir);

        let state = downloader(&remote, 1).fetch(&req).await.unwrap();
        assert_eq!(state.status, DownloadStatus::Completed);
        assert_eq!(state.bytes, 0);
        assert!(remote.opens().is_empty());
        assert_eq!(std::fs::metadata(&req.dest).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_leaves_in_progress_state() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::new(payload(50), "v1"));
        let req = request(&dir);
        let (tx, rx) = watch::channel(true);

        let err = downloader(&remote, 1)
            .with_cancel(rx)
            .fetch(&req)
            .await
            .unwrap_err();
        drop(tx);

        assert!(matches!(err, DownloadError::Cancelled { bytes: 0, .. }));
        let staged = Downloader::staged_state(&req.dest).await.unwrap();
        assert_eq!(staged.status, DownloadStatus::InProgress);
        assert_eq!(staged.bytes, 0);
        assert!(!req.dest.exists());
    }

    /// Flips the cancel channel once `after` bytes are on disk
    struct CancelAfter {
        after: u64,
        tx: watch::Sender<bool>,
    }

    impl ProgressObserver for CancelAfter {
        fn progress(&self, bytes: u64, _total: Option<u64>) {
            if bytes >= self.after {
                self.tx.send_replace(true);
            }
        }
    }

    #[tokio::test]
    async fn test_cancellation_mid_transfer_records_bytes() {
        let dir = TempDir::new().unwrap();
        let data = payload(70);
        let remote = Arc::new(MockRemote::new(data.clone(), "v1"));
        let req = request(&dir);
        let (tx, rx) = watch::channel(false);

        // Mock chunks are 7 bytes, so the third chunk lands exactly on 21
        let err = downloader(&remote, 1)
            .with_progress(Arc::new(CancelAfter { after: 21, tx }))
            .with_cancel(rx)
            .fetch(&req)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled { bytes: 21, .. }));

        let paths = StagingPaths::for_dest(&req.dest);
        let staged = Downloader::staged_state(&req.dest).await.unwrap();
        assert_eq!(staged.status, DownloadStatus::InProgress);
        assert_eq!(staged.bytes, 21);
        assert_eq!(std::fs::metadata(&paths.partial).unwrap().len(), 21);
        assert!(!req.dest.exists());

        downloader(&remote, 1).fetch(&req).await.unwrap();
        assert_eq!(remote.opens(), vec![0, 21]);
        assert_eq!(std::fs::read(&req.dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_rejected_range_resets_sidecar() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::new(payload(50), "v1").rejecting_range());
        let req = request(&dir);

        remote.fail_after(20);
        downloader(&remote, 1).fetch(&req).await.unwrap_err();
        assert_eq!(Downloader::staged_state(&req.dest).await.unwrap().bytes, 20);

        // Cancelled during the backoff that follows the rejected range
        let (_tx, rx) = watch::channel(true);
        let err = downloader(&remote, 3)
            .with_cancel(rx)
            .fetch(&req)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled { bytes: 0, .. }));
        assert_eq!(remote.opens(), vec![0, 20]);

        let paths = StagingPaths::for_dest(&req.dest);
        let staged = Downloader::staged_state(&req.dest).await.unwrap();
        assert_eq!(staged.status, DownloadStatus::InProgress);
        assert_eq!(staged.bytes, 0);
        assert_eq!(std::fs::metadata(&paths.partial).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_repull_short_circuits() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::new(payload(30), "v1"));
        let mut req = request(&dir);

        let first = downloader(&remote, 1).fetch(&req).await.unwrap();
        req.previous = Some(first);
        let second = downloader(&remote, 1).fetch(&req).await.unwrap();

        assert_eq!(second.status, DownloadStatus::Completed);
        assert_eq!(remote.opens(), vec![0]);
    }

    #[tokio::test]
    async fn test_missing_remote_is_permanent() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MockRemote::missing());

        let err = downloader(&remote, 5).fetch(&request(&dir)).await.unwrap_err();
        assert!(matches!(err, DownloadError::Remote { .. }));
    }
}
