//! # Fetch Worker
//!
//! Performs one download job: streams every target of the job from the
//! remote source into a staging directory, reports throttled progress through
//! the job store, validates the result, and moves it into final storage with
//! a single rename. The worker never finalizes the row itself; it hands a
//! [`FetchOutcome`] back to the orchestrator.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use metrics::counter;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::DownloadsConfig;
use crate::models::download_job::{FailureClass, JobKind, JobStatus, Model};
use crate::remote::{
    MediaKind, MediaSource, RemoteError, extension_for_content_type, sanitize_file_name,
};
use crate::repositories::{JobStore, JobStoreError, JobUpdate};

/// A classified worker failure
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FetchFailure {
    pub class: FailureClass,
    pub message: String,
    /// Server-provided delay hint
    pub retry_after: Option<Duration>,
}

impl FetchFailure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Local filesystem failure. Disk-full and permission problems get a
    /// message the client can act on.
    pub fn from_io(error: &io::Error, context: &str) -> Self {
        let message = if is_storage_full(error) {
            format!("{context}: disk full")
        } else if error.kind() == io::ErrorKind::PermissionDenied {
            format!("{context}: permission denied")
        } else {
            format!("{context}: {error}")
        };
        Self::new(FailureClass::LocalResource, message)
    }
}

impl From<RemoteError> for FetchFailure {
    fn from(error: RemoteError) -> Self {
        Self {
            class: error.class(),
            retry_after: error.retry_after(),
            message: error.to_string(),
        }
    }
}

fn is_storage_full(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::StorageFull || error.raw_os_error() == Some(libc::ENOSPC)
}

/// Result of one worker run
#[derive(Debug)]
pub enum FetchOutcome {
    Completed {
        file_path: PathBuf,
        total_bytes: u64,
        items_completed: u32,
    },
    Failed(FetchFailure),
    /// Aborted by a cancel signal, or the row changed under the worker. The
    /// row is left for the orchestrator to reconcile.
    Cancelled,
}

/// Storage and throttling settings shared by all workers
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub storage_dir: PathBuf,
    pub partial_dir: PathBuf,
    pub progress_interval: Duration,
    pub progress_bytes_delta: u64,
}

impl From<&DownloadsConfig> for WorkerSettings {
    fn from(config: &DownloadsConfig) -> Self {
        Self {
            storage_dir: config.storage_dir.clone(),
            partial_dir: config.partial_dir(),
            progress_interval: config.progress_interval(),
            progress_bytes_delta: config.progress_bytes_delta,
        }
    }
}

impl WorkerSettings {
    pub fn staging_dir(&self, job_id: Uuid) -> PathBuf {
        self.partial_dir.join(job_id.to_string())
    }

    pub fn final_dir(&self, job_id: Uuid) -> PathBuf {
        self.storage_dir.join(job_id.to_string())
    }
}

/// Internal stop reasons while streaming
enum Abort {
    Cancelled,
    Failed(FetchFailure),
}

impl From<FetchFailure> for Abort {
    fn from(failure: FetchFailure) -> Self {
        Abort::Failed(failure)
    }
}

/// Progress state carried across the items of one job
struct ProgressTracker {
    job_id: Uuid,
    bytes: u64,
    total: Option<u64>,
    items_completed: u32,
    reported_bytes: u64,
    reported_at: Instant,
}

#[derive(Clone)]
pub struct FetchWorker {
    store: JobStore,
    source: Arc<dyn MediaSource>,
    settings: WorkerSettings,
}

impl FetchWorker {
    pub fn new(store: JobStore, source: Arc<dyn MediaSource>, settings: WorkerSettings) -> Self {
        Self {
            store,
            source,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Fetch every target of `job`, which must already be DOWNLOADING.
    #[instrument(skip_all, fields(job_id = %job.id, kind = %job.kind))]
    pub async fn run(&self, job: Model, cancel: CancellationToken) -> FetchOutcome {
        let staging = self.settings.staging_dir(job.id);
        // Staging never outlives the run; after a successful rename it is
        // already gone and the removal is a no-op.
        let _staging_guard = scopeguard::guard(staging.clone(), |dir| {
            if let Err(e) = std::fs::remove_dir_all(&dir)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %dir.display(), error = %e, "Failed to remove staging directory");
            }
        });

        match self.fetch_all(&job, &staging, &cancel).await {
            Ok(outcome) => outcome,
            Err(Abort::Cancelled) => {
                info!("Download aborted");
                FetchOutcome::Cancelled
            }
            Err(Abort::Failed(failure)) => {
                warn!(class = %failure.class, error = %failure.message, "Download attempt failed");
                FetchOutcome::Failed(failure)
            }
        }
    }

    async fn fetch_all(
        &self,
        job: &Model,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, Abort> {
        let targets = job.fetch_targets();
        if targets.is_empty() {
            return Err(FetchFailure::new(
                FailureClass::PermanentRemote,
                "playlist contains no scenes",
            )
            .into());
        }

        let media_kind = match job.kind {
            JobKind::Image => MediaKind::Image,
            JobKind::Scene | JobKind::Playlist => MediaKind::Scene,
        };

        match fs::remove_dir_all(staging).await {
            Ok(()) => debug!("Removed leftover staging directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(FetchFailure::from_io(&e, "clear staging directory").into()),
        }
        fs::create_dir_all(staging)
            .await
            .map_err(|e| FetchFailure::from_io(&e, "create staging directory"))?;

        let mut tracker = ProgressTracker {
            job_id: job.id,
            bytes: 0,
            total: None,
            items_completed: 0,
            reported_bytes: 0,
            reported_at: Instant::now(),
        };
        let single_item = targets.len() == 1 && job.kind != JobKind::Playlist;
        let mut single_name = None;
        // Wide enough that entries list in playlist order.
        let width = targets.len().to_string().len().max(3);

        for (index, entity_id) in targets.iter().enumerate() {
            let position = (!single_item).then(|| format!("{:0width$}", index + 1));
            let name = self
                .fetch_item(
                    media_kind,
                    entity_id,
                    position.as_deref(),
                    staging,
                    &mut tracker,
                    cancel,
                )
                .await?;
            tracker.items_completed += 1;
            single_name = Some(name);
        }

        let final_dir = self.settings.final_dir(job.id);
        promote(staging, &final_dir).await?;

        let file_path = match (single_item, single_name) {
            (true, Some(name)) => final_dir.join(name),
            _ => final_dir,
        };

        info!(
            path = %file_path.display(),
            bytes = tracker.bytes,
            items = tracker.items_completed,
            "Download finished"
        );

        Ok(FetchOutcome::Completed {
            file_path,
            total_bytes: tracker.bytes,
            items_completed: tracker.items_completed,
        })
    }

    /// Streams one remote item into `staging`, returning its file name.
    /// Playlist entries are prefixed with their `position`.
    async fn fetch_item(
        &self,
        kind: MediaKind,
        entity_id: &str,
        position: Option<&str>,
        staging: &Path,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<String, Abort> {
        let remote = tokio::select! {
            _ = cancel.cancelled() => return Err(Abort::Cancelled),
            opened = self.source.open(kind, entity_id) => opened.map_err(FetchFailure::from)?,
        };

        let base_name = remote
            .file_name
            .as_deref()
            .and_then(sanitize_file_name)
            .unwrap_or_else(|| {
                format!(
                    "{kind}-{entity_id}.{}",
                    extension_for_content_type(remote.content_type.as_deref())
                )
            });
        let name = match position {
            Some(position) => format!("{position}-{base_name}"),
            None => base_name,
        };

        let item_start = tracker.bytes;
        if position.is_none() {
            tracker.total = remote.declared_size;
        }
        debug!(entity_id, declared_size = ?remote.declared_size, file = %name, "Streaming item");

        let path = staging.join(&name);
        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| FetchFailure::from_io(&e, "create staging file"))?;

        let mut body = remote.body;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(Abort::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(FetchFailure::from)?;

            file.write_all(&chunk)
                .await
                .map_err(|e| FetchFailure::from_io(&e, "write staging file"))?;

            let len = chunk.len() as u64;
            tracker.bytes += len;
            counter!("downloads_bytes_fetched_total").increment(len);

            if let Some(declared) = remote.declared_size
                && tracker.bytes - item_start > declared
            {
                return Err(FetchFailure::new(
                    FailureClass::Transient,
                    format!("remote sent more than the declared {declared} bytes"),
                )
                .into());
            }

            self.maybe_report(tracker, false).await?;
        }

        file.flush()
            .await
            .map_err(|e| FetchFailure::from_io(&e, "flush staging file"))?;
        file.sync_all()
            .await
            .map_err(|e| FetchFailure::from_io(&e, "sync staging file"))?;
        drop(file);

        let written = tracker.bytes - item_start;
        if written == 0 {
            return Err(FetchFailure::new(
                FailureClass::PermanentRemote,
                format!("remote returned an empty body for {kind} {entity_id}"),
            )
            .into());
        }
        if let Some(declared) = remote.declared_size
            && declared != written
        {
            return Err(FetchFailure::new(
                FailureClass::Transient,
                format!("size mismatch for {kind} {entity_id}: declared {declared}, received {written}"),
            )
            .into());
        }

        self.maybe_report(tracker, true).await?;
        Ok(name)
    }

    /// Pushes progress when the interval or byte delta has elapsed, or when
    /// `force` is set. A row that is gone or no longer DOWNLOADING stops the
    /// worker.
    async fn maybe_report(&self, tracker: &mut ProgressTracker, force: bool) -> Result<(), Abort> {
        let delta = tracker.bytes - tracker.reported_bytes;
        let due = force
            || delta >= self.settings.progress_bytes_delta
            || tracker.reported_at.elapsed() >= self.settings.progress_interval;
        if !due || (delta == 0 && !force) {
            return Ok(());
        }

        let update = JobUpdate::progress(tracker.bytes, tracker.total, tracker.items_completed);
        match self
            .store
            .transition(tracker.job_id, JobStatus::Downloading, update)
            .await
        {
            Ok(_) => {
                tracker.reported_bytes = tracker.bytes;
                tracker.reported_at = Instant::now();
                Ok(())
            }
            Err(JobStoreError::NotFound(_)) | Err(JobStoreError::Conflict { .. }) => {
                debug!("Job row changed during download, stopping");
                Err(Abort::Cancelled)
            }
            Err(e) => {
                // Progress is advisory; the final transition carries the totals.
                warn!(error = %e, "Failed to record download progress");
                tracker.reported_at = Instant::now();
                Ok(())
            }
        }
    }
}

/// Moves a finished staging directory into place with one rename.
async fn promote(staging: &Path, final_dir: &Path) -> Result<(), FetchFailure> {
    if let Some(parent) = final_dir.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| FetchFailure::from_io(&e, "create storage directory"))?;
    }

    match fs::remove_dir_all(final_dir).await {
        Ok(()) => warn!(path = %final_dir.display(), "Replaced stale download directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(FetchFailure::from_io(&e, "clear download directory")),
    }

    fs::rename(staging, final_dir)
        .await
        .map_err(|e| FetchFailure::from_io(&e, "move download into storage"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_class_and_hint() {
        let failure: FetchFailure = RemoteError::Status {
            status: 429,
            retry_after: Some(Duration::from_secs(30)),
        }
        .into();
        assert_eq!(failure.class, FailureClass::RateLimited);
        assert_eq!(failure.retry_after, Some(Duration::from_secs(30)));

        let failure: FetchFailure = RemoteError::Status {
            status: 404,
            retry_after: None,
        }
        .into();
        assert_eq!(failure.class, FailureClass::PermanentRemote);
    }

    #[test]
    fn io_errors_are_local_resource() {
        let full = io::Error::from_raw_os_error(libc::ENOSPC);
        let failure = FetchFailure::from_io(&full, "write staging file");
        assert_eq!(failure.class, FailureClass::LocalResource);
        assert_eq!(failure.message, "write staging file: disk full");

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        let failure = FetchFailure::from_io(&denied, "create staging file");
        assert_eq!(failure.class, FailureClass::LocalResource);
        assert!(failure.message.ends_with("permission denied"));
    }

    #[test]
    fn staging_and_final_dirs_are_per_job() {
        let settings = WorkerSettings {
            storage_dir: PathBuf::from("/data/downloads"),
            partial_dir: PathBuf::from("/data/downloads/.partial"),
            progress_interval: Duration::from_millis(500),
            progress_bytes_delta: 1024,
        };
        let id = Uuid::nil();
        assert_eq!(
            settings.staging_dir(id),
            PathBuf::from("/data/downloads/.partial/00000000-0000-0000-0000-000000000000")
        );
        assert_eq!(
            settings.final_dir(id),
            PathBuf::from("/data/downloads/00000000-0000-0000-0000-000000000000")
        );
    }

    #[tokio::test]
    async fn promote_replaces_existing_directory() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join(".partial/job");
        let final_dir = root.path().join("job");

        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("scene.mp4"), b"new").unwrap();
        std::fs::create_dir_all(&final_dir).unwrap();
        std::fs::write(final_dir.join("old.mp4"), b"old").unwrap();

        promote(&staging, &final_dir).await.unwrap();

        assert!(!staging.exists());
        assert_eq!(std::fs::read(final_dir.join("scene.mp4")).unwrap(), b"new");
        assert!(!final_dir.join("old.mp4").exists());
    }
}
