//! # Cleanup Service
//!
//! Periodic sweep that removes terminal jobs past the retention window
//! together with their files, and deletes staging or storage directories
//! that no job row accounts for.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use metrics::{counter, histogram};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::CleanupConfig;
use crate::models::download_job::JobStatus;
use crate::repositories::{JobStore, JobStoreError};
use crate::worker::WorkerSettings;

/// Rows examined per sweep
const EXPIRED_BATCH_SIZE: u64 = 500;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub expired_rows_removed: u64,
    pub orphan_dirs_removed: u64,
    pub errors: u64,
}

pub struct CleanupService {
    store: JobStore,
    settings: WorkerSettings,
    config: CleanupConfig,
}

impl CleanupService {
    pub fn new(store: JobStore, settings: WorkerSettings, config: CleanupConfig) -> Self {
        Self {
            store,
            settings,
            config,
        }
    }

    /// Run the sweep loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_seconds = self.config.tick_interval_seconds,
            retention_seconds = self.config.retention_seconds,
            "Starting cleanup service"
        );
        let tick_interval = self.config.tick_interval();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Cleanup service shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    if let Err(err) = self.tick().await {
                        error!(error = ?err, "Cleanup tick failed");
                    }
                }
            }
        }

        info!("Cleanup service stopped");
    }

    /// One sweep: expired rows first, then orphaned directories.
    pub async fn tick(&self) -> Result<TickStats, JobStoreError> {
        let started = Instant::now();
        let mut stats = TickStats::default();

        self.remove_expired(&mut stats).await?;
        self.remove_orphans(&mut stats).await?;

        histogram!("downloads_cleanup_tick_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        counter!("downloads_cleanup_rows_removed_total").increment(stats.expired_rows_removed);
        counter!("downloads_cleanup_orphans_removed_total").increment(stats.orphan_dirs_removed);

        debug!(
            expired = stats.expired_rows_removed,
            orphans = stats.orphan_dirs_removed,
            errors = stats.errors,
            "Cleanup tick completed"
        );
        Ok(stats)
    }

    async fn remove_expired(&self, stats: &mut TickStats) -> Result<(), JobStoreError> {
        let retention = chrono::Duration::seconds(
            i64::try_from(self.config.retention_seconds).unwrap_or(i64::MAX / 1_000),
        );
        let cutoff = Utc::now() - retention;
        let expired = self
            .store
            .expired_terminal(cutoff, EXPIRED_BATCH_SIZE)
            .await?;

        for job in expired {
            // Only delete if nobody retried the job in the meantime.
            if !self.store.delete_if_status(job.id, job.status).await? {
                continue;
            }
            stats.expired_rows_removed += 1;
            info!(job_id = %job.id, status = %job.status, "Removed expired download");

            for dir in [
                self.settings.final_dir(job.id),
                self.settings.staging_dir(job.id),
            ] {
                if let Err(e) = remove_dir(&dir).await {
                    stats.errors += 1;
                    warn!(path = %dir.display(), error = %e, "Failed to remove expired files");
                }
            }
        }
        Ok(())
    }

    async fn remove_orphans(&self, stats: &mut TickStats) -> Result<(), JobStoreError> {
        let grace = Duration::from_secs(self.config.orphan_grace_seconds);
        let skip: HashSet<PathBuf> = HashSet::from([self.settings.partial_dir.clone()]);

        // Staging directories are only legitimate while their job downloads.
        let staged = job_dirs(&self.settings.partial_dir, &skip, grace).await;
        let statuses = self.store.statuses(&ids(&staged)).await?;
        for (id, path) in staged {
            if statuses.get(&id) == Some(&JobStatus::Downloading) {
                continue;
            }
            self.remove_orphan(&path, stats).await;
        }

        // Storage directories belong to completed jobs, or to a downloading
        // job between its final rename and its COMPLETED transition.
        let stored = job_dirs(&self.settings.storage_dir, &skip, grace).await;
        let statuses = self.store.statuses(&ids(&stored)).await?;
        for (id, path) in stored {
            if matches!(
                statuses.get(&id),
                Some(JobStatus::Completed) | Some(JobStatus::Downloading)
            ) {
                continue;
            }
            self.remove_orphan(&path, stats).await;
        }
        Ok(())
    }

    async fn remove_orphan(&self, path: &Path, stats: &mut TickStats) {
        match remove_dir(path).await {
            Ok(()) => {
                stats.orphan_dirs_removed += 1;
                info!(path = %path.display(), "Removed orphaned download directory");
            }
            Err(e) => {
                stats.errors += 1;
                warn!(path = %path.display(), error = %e, "Failed to remove orphaned directory");
            }
        }
    }
}

fn ids(dirs: &[(Uuid, PathBuf)]) -> Vec<Uuid> {
    dirs.iter().map(|(id, _)| *id).collect()
}

/// Job-named directories under `root` last modified more than `grace` ago.
/// Entries whose name is not a job id are left alone.
async fn job_dirs(root: &Path, skip: &HashSet<PathBuf>, grace: Duration) -> Vec<(Uuid, PathBuf)> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %root.display(), error = %e, "Failed to scan download directory");
            return Vec::new();
        }
    };

    let now = SystemTime::now();
    let mut found = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if skip.contains(&path) {
            continue;
        }
        let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(|name| Uuid::parse_str(name).ok())
        else {
            continue;
        };
        let old_enough = entry
            .metadata()
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= grace);
        if old_enough {
            found.push((id, path));
        }
    }
    found
}

async fn remove_dir(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_dirs_skip_foreign_names_and_skip_list() {
        let root = tempfile::tempdir().unwrap();
        let partial = root.path().join(".partial");
        let job = Uuid::new_v4();

        std::fs::create_dir_all(&partial).unwrap();
        std::fs::create_dir_all(root.path().join(job.to_string())).unwrap();
        std::fs::create_dir_all(root.path().join("not-a-job")).unwrap();

        let skip = HashSet::from([partial]);
        let found = job_dirs(root.path(), &skip, Duration::ZERO).await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, job);
    }

    #[tokio::test]
    async fn job_dirs_respect_grace_period() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join(Uuid::new_v4().to_string())).unwrap();

        let found = job_dirs(root.path(), &HashSet::new(), Duration::from_secs(3_600)).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let found = job_dirs(&root.path().join("nope"), &HashSet::new(), Duration::ZERO).await;
        assert!(found.is_empty());
    }
}
