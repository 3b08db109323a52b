//! # Download Orchestrator
//!
//! Owns the bounded worker pool. Requests become PENDING rows; a dispatch
//! pass admits eligible rows into DOWNLOADING while respecting the global and
//! per-user ceilings, and every finished worker is finalized here through a
//! compare-and-swap transition. Automatic retries stay PENDING with a
//! `retry_after` deadline; the run loop sleeps until the next one is due.

use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use metrics::{counter, gauge, histogram};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{AppConfig, DownloadsConfig};
use crate::file_server::{ResolveError, resolve_file};
use crate::models::download_job::{FailureClass, JobKind, JobStatus, Model};
use crate::remote::{MediaSource, RemoteError};
use crate::repositories::{JobStore, JobStoreError, JobUpdate, NewJob};
use crate::retry_policy::RetryPolicy;
use crate::worker::{FetchFailure, FetchOutcome, FetchWorker, WorkerSettings};

const MAX_ENTITY_ID_LEN: usize = 128;

/// Errors returned by orchestrator operations
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("{0}")]
    Validation(String),
    #[error("download is {status}")]
    InvalidState { status: JobStatus },
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),
    #[error("download service is shutting down")]
    ShuttingDown,
}

struct RunningJob {
    user_id: String,
    cancel: CancellationToken,
    /// Cancelled once the worker's outcome has been recorded
    done: CancellationToken,
}

struct Inner {
    store: JobStore,
    source: Arc<dyn MediaSource>,
    worker: FetchWorker,
    policy: RetryPolicy,
    config: DownloadsConfig,
    slots: Arc<Semaphore>,
    running: Mutex<HashMap<Uuid, RunningJob>>,
    dispatch_lock: Mutex<()>,
    wake: Notify,
    shutdown: CancellationToken,
}

/// Handle to the download orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        store: JobStore,
        source: Arc<dyn MediaSource>,
        shutdown: CancellationToken,
    ) -> Self {
        let settings = WorkerSettings::from(&config.downloads);
        let worker = FetchWorker::new(store.clone(), source.clone(), settings);

        Self {
            inner: Arc::new(Inner {
                store,
                source,
                worker,
                policy: RetryPolicy::new(&config.retry_policy),
                config: config.downloads.clone(),
                slots: Arc::new(Semaphore::new(config.downloads.max_concurrent_downloads)),
                running: Mutex::new(HashMap::new()),
                dispatch_lock: Mutex::new(()),
                wake: Notify::new(),
                shutdown,
            }),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn worker_settings(&self) -> &WorkerSettings {
        self.inner.worker.settings()
    }

    /// Creates the storage and staging directories.
    pub async fn ensure_directories(&self) -> Result<(), DownloadError> {
        let settings = self.worker_settings();
        tokio::fs::create_dir_all(&settings.storage_dir).await?;
        tokio::fs::create_dir_all(&settings.partial_dir).await?;
        Ok(())
    }

    /// Queues a new download and tries to admit it right away.
    #[instrument(skip(self), fields(user_id = %user_id, kind = %kind))]
    pub async fn start(
        &self,
        user_id: &str,
        kind: JobKind,
        source_entity_id: &str,
    ) -> Result<Model, DownloadError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DownloadError::ShuttingDown);
        }
        validate_entity_id(source_entity_id)?;

        let source_entity_ids = match kind {
            JobKind::Playlist => {
                let scene_ids = self.inner.source.playlist_scene_ids(source_entity_id).await?;
                if scene_ids.is_empty() {
                    return Err(DownloadError::Validation(
                        "playlist contains no scenes".to_string(),
                    ));
                }
                for scene_id in &scene_ids {
                    validate_entity_id(scene_id)?;
                }
                Some(scene_ids)
            }
            JobKind::Scene | JobKind::Image => None,
        };

        let job = self
            .inner
            .store
            .create(NewJob {
                user_id: user_id.to_string(),
                kind,
                source_entity_id: source_entity_id.to_string(),
                source_entity_ids,
                max_attempts: self.inner.config.max_attempts,
            })
            .await?;

        counter!("downloads_jobs_started_total", "kind" => kind.as_str()).increment(1);

        if let Err(e) = self.dispatch().await {
            warn!(error = %e, "Immediate admission failed, leaving job queued");
        }

        Ok(self.inner.store.find(job.id).await?.unwrap_or(job))
    }

    /// Re-queues a terminally failed job with a fresh attempt budget. A
    /// completed job whose file is gone counts as failed.
    #[instrument(skip(self), fields(job_id = %id, user_id = %user_id))]
    pub async fn retry(&self, id: Uuid, user_id: &str) -> Result<Model, DownloadError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DownloadError::ShuttingDown);
        }

        let job = self.inner.store.get(id, user_id).await?;
        if job.status == JobStatus::Completed
            && let Err(ResolveError::Missing { .. }) = resolve_file(&job, None).await
        {
            self.mark_file_missing(&job).await?;
        } else if job.status != JobStatus::Failed {
            return Err(DownloadError::InvalidState { status: job.status });
        }

        let retried = match self
            .inner
            .store
            .transition(id, JobStatus::Failed, JobUpdate::manual_retry())
            .await
        {
            Ok(model) => model,
            Err(JobStoreError::Conflict { actual, .. }) => {
                return Err(DownloadError::InvalidState { status: actual });
            }
            Err(e) => return Err(e.into()),
        };

        counter!("downloads_jobs_retried_total", "trigger" => "manual").increment(1);
        info!("Download re-queued by user");

        if let Err(e) = self.dispatch().await {
            warn!(error = %e, "Immediate admission failed, leaving job queued");
        }

        Ok(retried)
    }

    /// Moves a COMPLETED job whose file has vanished to FAILED with the
    /// consistency class, so the ordinary retry can fetch it again.
    #[instrument(skip_all, fields(job_id = %job.id))]
    pub async fn mark_file_missing(&self, job: &Model) -> Result<(), DownloadError> {
        let update = JobUpdate::fail(
            job.attempt,
            "downloaded file is missing from storage".to_string(),
            FailureClass::Consistency,
        );
        match self
            .inner
            .store
            .transition(job.id, JobStatus::Completed, update)
            .await
        {
            Ok(_) => {
                let class = FailureClass::Consistency.as_str();
                counter!("downloads_jobs_failed_total", "class" => class).increment(1);
                warn!("Completed download lost its file, marked as failed");
                self.remove_job_files(job.id).await
            }
            // Already repaired or deleted by a concurrent request.
            Err(JobStoreError::NotFound(_)) | Err(JobStoreError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Aborts any in-flight work for the job, removes its files and deletes
    /// the row.
    #[instrument(skip(self), fields(job_id = %id, user_id = %user_id))]
    pub async fn cancel_and_delete(&self, id: Uuid, user_id: &str) -> Result<(), DownloadError> {
        let job = self.inner.store.get(id, user_id).await?;

        let running = {
            let running = self.inner.running.lock().await;
            running
                .get(&id)
                .map(|entry| (entry.cancel.clone(), entry.done.clone()))
        };

        if let Some((cancel, done)) = running {
            cancel.cancel();
            let grace = self.inner.config.cancel_grace();
            if timeout(grace, done.cancelled()).await.is_err() {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Worker did not acknowledge cancel in time, deleting anyway"
                );
            }
        }

        self.remove_job_files(job.id).await?;
        self.inner.store.delete(id, user_id).await?;

        // Frees a per-user slot if the job was downloading.
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Records a worker's outcome on the job row.
    ///
    /// `job` is the row as it was admitted. Lost compare-and-swap races are
    /// reconciled here and never surfaced.
    #[instrument(skip_all, fields(job_id = %job.id))]
    pub async fn on_worker_finished(
        &self,
        job: &Model,
        outcome: FetchOutcome,
    ) -> Result<(), DownloadError> {
        let store = &self.inner.store;

        match outcome {
            FetchOutcome::Completed {
                file_path,
                total_bytes,
                items_completed,
            } => {
                let update = JobUpdate::complete(
                    file_path.to_string_lossy().into_owned(),
                    total_bytes,
                    items_completed,
                    Utc::now(),
                );
                match store.transition(job.id, JobStatus::Downloading, update).await {
                    Ok(_) => {
                        counter!("downloads_jobs_completed_total", "kind" => job.kind.as_str())
                            .increment(1);
                        if let Some(started) = job.started_at {
                            let elapsed = Utc::now().signed_duration_since(started);
                            histogram!("downloads_job_duration_seconds")
                                .record(elapsed.num_milliseconds() as f64 / 1_000.0);
                        }
                        info!(bytes = total_bytes, "Download completed");
                        Ok(())
                    }
                    Err(e) => self.reconcile(job.id, e).await,
                }
            }
            FetchOutcome::Failed(failure) => self.record_failure(job, failure).await,
            FetchOutcome::Cancelled => {
                if self.inner.shutdown.is_cancelled() {
                    // Hand the job back to the queue for the next process.
                    match store
                        .transition(job.id, JobStatus::Downloading, JobUpdate::recover())
                        .await
                    {
                        Ok(_) => debug!("Interrupted download returned to queue"),
                        Err(JobStoreError::NotFound(_)) | Err(JobStoreError::Conflict { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
        }
    }

    async fn record_failure(&self, job: &Model, failure: FetchFailure) -> Result<(), DownloadError> {
        let attempt = job.attempt.saturating_add(1);
        let decision = self.inner.policy.should_retry(
            attempt,
            job.max_attempts,
            failure.class,
            failure.retry_after,
        );

        let update = if decision.retry {
            let delay = chrono::Duration::from_std(decision.delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
            JobUpdate::requeue(attempt, Utc::now() + delay, failure.message.clone(), failure.class)
        } else {
            JobUpdate::fail(attempt, failure.message.clone(), failure.class)
        };

        match self
            .inner
            .store
            .transition(job.id, JobStatus::Downloading, update)
            .await
        {
            Ok(_) if decision.retry => {
                counter!("downloads_jobs_retried_total", "trigger" => "auto").increment(1);
                info!(
                    attempt,
                    max_attempts = job.max_attempts,
                    delay_ms = decision.delay.as_millis() as u64,
                    class = %failure.class,
                    "Download scheduled for retry"
                );
                Ok(())
            }
            Ok(_) => {
                counter!("downloads_jobs_failed_total", "class" => failure.class.as_str())
                    .increment(1);
                warn!(
                    attempt,
                    max_attempts = job.max_attempts,
                    class = %failure.class,
                    error = %failure.message,
                    "Download failed permanently"
                );
                Ok(())
            }
            Err(e) => self.reconcile(job.id, e).await,
        }
    }

    /// Resolves a lost compare-and-swap after a worker finished.
    async fn reconcile(&self, id: Uuid, error: JobStoreError) -> Result<(), DownloadError> {
        match error {
            JobStoreError::NotFound(_) => {
                // Deleted while the worker was finishing; its files are orphans.
                debug!("Job deleted before its outcome was recorded");
                self.remove_job_files(id).await
            }
            JobStoreError::Conflict { actual, .. } => {
                let current = self.inner.store.find(id).await?;
                debug!(
                    reported = %actual,
                    current = ?current.map(|job| job.status),
                    "Job changed before its outcome was recorded, keeping current state"
                );
                Ok(())
            }
            other => Err(other.into()),
        }
    }

    async fn remove_job_files(&self, id: Uuid) -> Result<(), DownloadError> {
        let settings = self.worker_settings();
        for dir in [settings.staging_dir(id), settings.final_dir(id)] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(path = %dir.display(), "Removed download files"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Admits as many eligible PENDING jobs as the ceilings allow. Returns
    /// the number of jobs moved to DOWNLOADING.
    pub async fn dispatch(&self) -> Result<usize, DownloadError> {
        let _pass = self.inner.dispatch_lock.lock().await;
        if self.inner.shutdown.is_cancelled() {
            return Ok(0);
        }

        let free_slots = self.inner.slots.available_permits();
        if free_slots == 0 {
            return Ok(0);
        }

        let now = Utc::now();
        let per_user_cap = self.inner.config.max_concurrent_per_user;
        let counts = self.inner.store.downloading_counts().await?;
        let capped: Vec<String> = counts
            .iter()
            .filter(|(_, active)| **active >= per_user_cap)
            .map(|(user, _)| user.clone())
            .collect();

        // One round-robin round reaches at most `free_slots` users, and no
        // user can take more than its remaining room.
        let users = self
            .inner
            .store
            .waiting_users(now, &capped, free_slots as u64)
            .await?;
        let mut candidates = Vec::new();
        for user in users {
            let room = per_user_cap
                .saturating_sub(counts.get(&user).copied().unwrap_or(0))
                .min(free_slots);
            candidates.extend(
                self.inner
                    .store
                    .eligible_pending_for_user(&user, now, room as u64)
                    .await?,
            );
        }
        if candidates.is_empty() {
            return Ok(0);
        }

        let order = admission_order(candidates, counts, per_user_cap, free_slots);

        let low_space = self.low_disk_space().await;
        let mut admitted = 0;

        for job in order {
            let Ok(permit) = self.inner.slots.clone().try_acquire_owned() else {
                break;
            };

            let job = match self
                .inner
                .store
                .transition(job.id, JobStatus::Pending, JobUpdate::admit(now))
                .await
            {
                Ok(job) => job,
                Err(JobStoreError::NotFound(_)) | Err(JobStoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            };

            if let Some(available) = low_space {
                drop(permit);
                let failure = FetchFailure::new(
                    FailureClass::LocalResource,
                    format!("insufficient disk space ({available} bytes free)"),
                );
                self.record_failure(&job, failure).await?;
                continue;
            }

            admitted += 1;
            self.spawn_worker(job, permit).await;
        }

        if admitted > 0 {
            debug!(admitted, "Dispatch pass admitted jobs");
        }
        Ok(admitted)
    }

    async fn spawn_worker(&self, job: Model, permit: OwnedSemaphorePermit) {
        let cancel = self.inner.shutdown.child_token();
        let done = CancellationToken::new();

        {
            let mut running = self.inner.running.lock().await;
            running.insert(
                job.id,
                RunningJob {
                    user_id: job.user_id.clone(),
                    cancel: cancel.clone(),
                    done: done.clone(),
                },
            );
            gauge!("downloads_active").set(running.len() as f64);
        }

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(this.inner.worker.run(job.clone(), cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(job_id = %job.id, "Fetch worker panicked");
                    FetchOutcome::Failed(FetchFailure::new(
                        FailureClass::Transient,
                        "download worker crashed",
                    ))
                });

            match AssertUnwindSafe(this.on_worker_finished(&job, outcome))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(job_id = %job.id, error = %e, "Failed to record download outcome");
                }
                Err(_) => {
                    error!(job_id = %job.id, "Recording download outcome panicked");
                    this.fail_unrecorded(&job).await;
                }
            }

            {
                let mut running = this.inner.running.lock().await;
                running.remove(&job.id);
                gauge!("downloads_active").set(running.len() as f64);
            }
            drop(permit);
            done.cancel();
            this.inner.wake.notify_one();
        });
    }

    /// Moves a job whose outcome could not be recorded out of DOWNLOADING so
    /// it does not hold a per-user slot forever.
    async fn fail_unrecorded(&self, job: &Model) {
        let update = JobUpdate::fail(
            job.attempt.saturating_add(1),
            "download outcome could not be recorded".to_string(),
            FailureClass::Transient,
        );
        match self
            .inner
            .store
            .transition(job.id, JobStatus::Downloading, update)
            .await
        {
            Ok(_) | Err(JobStoreError::NotFound(_)) | Err(JobStoreError::Conflict { .. }) => {}
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to mark download as failed"),
        }
    }

    /// Available bytes when below the configured floor, `None` otherwise.
    async fn low_disk_space(&self) -> Option<u64> {
        let floor = self.inner.config.min_free_space_bytes;
        if floor == 0 {
            return None;
        }

        let dir = self.worker_settings().partial_dir.clone();
        let probe = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            available_space(&dir)
        })
        .await;

        match probe {
            Ok(Ok(available)) if available < floor => {
                warn!(available, floor, "Free disk space below admission floor");
                Some(available)
            }
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to query free disk space");
                None
            }
            Err(e) => {
                warn!(error = %e, "Free space probe task failed");
                None
            }
        }
    }

    /// Returns DOWNLOADING rows not owned by this process to PENDING and
    /// removes their staging files.
    #[instrument(skip(self))]
    pub async fn recover_interrupted(&self) -> Result<usize, DownloadError> {
        let stranded = self.inner.store.list_by_status(JobStatus::Downloading).await?;
        let mut recovered = 0;

        for job in stranded {
            if self.inner.running.lock().await.contains_key(&job.id) {
                continue;
            }

            match self
                .inner
                .store
                .transition(job.id, JobStatus::Downloading, JobUpdate::recover())
                .await
            {
                Ok(_) => recovered += 1,
                Err(JobStoreError::NotFound(_)) | Err(JobStoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }

            let staging = self.worker_settings().staging_dir(job.id);
            match tokio::fs::remove_dir_all(&staging).await {
                Ok(()) => debug!(job_id = %job.id, "Removed stale staging directory"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to remove staging directory"),
            }
        }

        if recovered > 0 {
            info!(recovered, "Returned interrupted downloads to the queue");
        }
        Ok(recovered)
    }

    /// Number of workers currently running in this process.
    pub async fn active_count(&self) -> usize {
        self.inner.running.lock().await.len()
    }

    /// Number of running workers owned by `user_id`.
    pub async fn active_count_for_user(&self, user_id: &str) -> usize {
        self.inner
            .running
            .lock()
            .await
            .values()
            .filter(|entry| entry.user_id == user_id)
            .count()
    }

    /// Waits until no worker is running, up to `limit`. Returns whether the
    /// pool drained.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.active_count().await == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Dispatch loop. Runs until the shutdown token fires, then waits for
    /// in-flight workers to wind down.
    #[instrument(skip_all)]
    pub async fn run(self) -> Result<(), DownloadError> {
        info!(
            max_concurrent = self.inner.config.max_concurrent_downloads,
            max_per_user = self.inner.config.max_concurrent_per_user,
            "Starting download orchestrator"
        );

        self.ensure_directories().await?;
        self.recover_interrupted().await?;

        let tick = self.inner.config.dispatch_tick();
        loop {
            if let Err(e) = self.dispatch().await {
                error!(error = %e, "Dispatch pass failed");
            }

            let pause = match self.inner.store.next_retry_at().await {
                Ok(Some(next)) => (next.with_timezone(&Utc) - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(tick),
                Ok(None) => tick,
                Err(e) => {
                    warn!(error = %e, "Failed to read next retry deadline");
                    tick
                }
            };

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    info!("Download orchestrator shutdown requested");
                    break;
                }
                _ = self.inner.wake.notified() => {}
                _ = sleep(pause.max(Duration::from_millis(10))) => {}
            }
        }

        let grace = self.inner.config.cancel_grace();
        if !self.wait_idle(grace).await {
            warn!("Workers still running after shutdown grace period");
        }
        info!("Download orchestrator stopped");
        Ok(())
    }
}

/// Rejects ids that cannot be a remote library identifier.
pub fn validate_entity_id(id: &str) -> Result<(), DownloadError> {
    if id.is_empty() {
        return Err(DownloadError::Validation("entity id must not be empty".into()));
    }
    if id.len() > MAX_ENTITY_ID_LEN {
        return Err(DownloadError::Validation(format!(
            "entity id exceeds {MAX_ENTITY_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DownloadError::Validation(
            "entity id may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

/// Orders candidates for admission: FIFO within each user, round-robin
/// across users by their oldest waiting job, skipping users at the per-user
/// ceiling. At most `slots` jobs are returned.
fn admission_order(
    candidates: Vec<Model>,
    mut downloading: HashMap<String, usize>,
    per_user_cap: usize,
    slots: usize,
) -> Vec<Model> {
    let mut queues: Vec<(String, VecDeque<Model>)> = Vec::new();
    for job in candidates {
        match queues.iter_mut().find(|(user, _)| *user == job.user_id) {
            Some((_, queue)) => queue.push_back(job),
            None => queues.push((job.user_id.clone(), VecDeque::from([job]))),
        }
    }

    let mut order = Vec::new();
    while order.len() < slots {
        let mut picked = false;
        for (user, queue) in queues.iter_mut() {
            if order.len() >= slots {
                break;
            }
            let active = downloading.entry(user.clone()).or_insert(0);
            if *active >= per_user_cap {
                continue;
            }
            if let Some(job) = queue.pop_front() {
                *active += 1;
                order.push(job);
                picked = true;
            }
        }
        if !picked {
            break;
        }
    }
    order
}

/// Bytes available to unprivileged writers on the filesystem holding `path`.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;

    // SAFETY: statvfs only writes into the zeroed struct we own.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    #[allow(clippy::unnecessary_cast)]
    let available = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
    Ok(available)
}
