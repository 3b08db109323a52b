//! Shared helpers for integration tests: in-memory SQLite with migrations,
//! a scripted media source and temporary storage.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::{StreamExt, stream};
use media_downloads::config::AppConfig;
use media_downloads::models::download_job::{JobStatus, Model};
use media_downloads::orchestrator::Orchestrator;
use media_downloads::remote::{MediaKind, MediaSource, RemoteError, RemoteStream};
use media_downloads::repositories::JobStore;
use media_downloads::server::AppState;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const TEST_TOKEN: &str = "test-token";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Configuration tuned for fast tests: tight dispatch tick, immediate
/// retries, no free-space floor.
pub fn test_config(storage: &Path) -> AppConfig {
    let mut config = AppConfig {
        operator_tokens: vec![TEST_TOKEN.to_string()],
        ..Default::default()
    };
    config.downloads.storage_dir = storage.to_path_buf();
    config.downloads.max_concurrent_downloads = 4;
    config.downloads.max_concurrent_per_user = 4;
    config.downloads.max_attempts = 3;
    config.downloads.dispatch_tick_ms = 20;
    config.downloads.progress_interval_ms = 10;
    config.downloads.progress_bytes_delta = 64 * 1024;
    config.downloads.cancel_grace_ms = 2_000;
    config.downloads.min_free_space_bytes = 0;
    config.retry_policy.base_seconds = 0;
    config.retry_policy.max_seconds = 0;
    config.retry_policy.jitter_factor = 0.0;
    config
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Scripted response for one `open` call
#[derive(Clone)]
pub enum Script {
    /// Serve the bytes with an accurate Content-Length
    Serve(Vec<u8>),
    /// Serve the bytes but announce a different size
    ServeDeclared { data: Vec<u8>, declared: u64 },
    /// Fail the open call
    Fail(RemoteError),
    /// Send one chunk, then never finish
    Stall,
    /// Serve the bytes in `chunk`-sized pieces, pausing `delay` before each
    Slow {
        data: Vec<u8>,
        chunk: usize,
        delay: Duration,
    },
}

/// In-process media source. Each entity id consumes its queued scripts in
/// order; once they run out it serves [`FakeMediaSource::default_len`] bytes.
pub struct FakeMediaSource {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    playlists: Mutex<HashMap<String, Vec<String>>>,
    opens: Mutex<HashMap<String, usize>>,
    pub default_len: usize,
}

impl Default for FakeMediaSource {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            playlists: Mutex::new(HashMap::new()),
            opens: Mutex::new(HashMap::new()),
            default_len: 4_096,
        }
    }
}

impl FakeMediaSource {
    pub fn script(&self, entity_id: &str, scripts: impl IntoIterator<Item = Script>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(entity_id.to_string())
            .or_default()
            .extend(scripts);
    }

    pub fn playlist(&self, playlist_id: &str, scene_ids: &[&str]) {
        self.playlists.lock().unwrap().insert(
            playlist_id.to_string(),
            scene_ids.iter().map(|id| id.to_string()).collect(),
        );
    }

    pub fn opens(&self, entity_id: &str) -> usize {
        self.opens
            .lock()
            .unwrap()
            .get(entity_id)
            .copied()
            .unwrap_or(0)
    }
}

fn chunked(data: Vec<u8>) -> Vec<Result<Bytes, RemoteError>> {
    data.chunks(16 * 1024)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect()
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn open(&self, kind: MediaKind, entity_id: &str) -> Result<RemoteStream, RemoteError> {
        *self
            .opens
            .lock()
            .unwrap()
            .entry(entity_id.to_string())
            .or_insert(0) += 1;

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(entity_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Script::Serve(payload(self.default_len)));

        let content_type = match kind {
            MediaKind::Scene => "video/mp4",
            MediaKind::Image => "image/jpeg",
        };

        let (declared_size, body) = match script {
            Script::Serve(data) => (
                Some(data.len() as u64),
                stream::iter(chunked(data)).boxed(),
            ),
            Script::ServeDeclared { data, declared } => {
                (Some(declared), stream::iter(chunked(data)).boxed())
            }
            Script::Fail(error) => return Err(error),
            Script::Slow { data, chunk, delay } => {
                let pieces: Vec<Result<Bytes, RemoteError>> = data
                    .chunks(chunk.max(1))
                    .map(|piece| Ok(Bytes::copy_from_slice(piece)))
                    .collect();
                (
                    Some(data.len() as u64),
                    stream::iter(pieces)
                        .then(move |piece| async move {
                            tokio::time::sleep(delay).await;
                            piece
                        })
                        .boxed(),
                )
            }
            Script::Stall => (
                None,
                stream::iter(chunked(payload(1_024)))
                    .chain(stream::pending())
                    .boxed(),
            ),
        };

        Ok(RemoteStream {
            declared_size,
            file_name: None,
            content_type: Some(content_type.to_string()),
            body,
        })
    }

    async fn playlist_scene_ids(&self, playlist_id: &str) -> Result<Vec<String>, RemoteError> {
        self.playlists
            .lock()
            .unwrap()
            .get(playlist_id)
            .cloned()
            .ok_or(RemoteError::Status {
                status: 404,
                retry_after: None,
            })
    }
}

/// A running orchestrator over temporary storage. Dropping it stops the
/// background loop.
pub struct TestApp {
    pub state: AppState,
    pub orchestrator: Orchestrator,
    pub store: JobStore,
    pub source: Arc<FakeMediaSource>,
    pub storage: TempDir,
    pub shutdown: CancellationToken,
}

impl TestApp {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(customize: impl FnOnce(&mut AppConfig)) -> Result<Self> {
        let app = Self::build(customize).await?;
        tokio::spawn(app.orchestrator.clone().run());
        Ok(app)
    }

    /// Builds the app without starting the dispatch loop.
    pub async fn build(customize: impl FnOnce(&mut AppConfig)) -> Result<Self> {
        let storage = TempDir::new()?;
        let mut config = test_config(storage.path());
        customize(&mut config);

        let db = setup_test_db().await?;
        let source = Arc::new(FakeMediaSource::default());
        let shutdown = CancellationToken::new();
        let state = AppState::new(
            Arc::new(config),
            db,
            source.clone() as Arc<dyn MediaSource>,
            shutdown.clone(),
        );
        let orchestrator = state.orchestrator.clone();
        orchestrator.ensure_directories().await?;

        Ok(Self {
            store: orchestrator.store().clone(),
            orchestrator,
            state,
            source,
            storage,
            shutdown,
        })
    }

    /// Polls until the job reaches `status`.
    pub async fn wait_for_status(&self, id: Uuid, status: JobStatus) -> Result<Model> {
        wait_for_status(&self.store, id, status, Duration::from_secs(10)).await
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn wait_for_status(
    store: &JobStore,
    id: Uuid,
    status: JobStatus,
    limit: Duration,
) -> Result<Model> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let current = store.find(id).await?;
        if let Some(job) = &current
            && job.status == status
        {
            return Ok(job.clone());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "job {id} did not reach {status} in {limit:?}; last seen {:?}",
                current.map(|job| job.status)
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Polls until `check` holds.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {limit:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
