//! # Downloads API Handlers
//!
//! Start, inspect, fetch, retry and delete download jobs. Every route is
//! scoped to the user from `X-User-Id`; jobs owned by someone else are
//! reported as not found.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header::RANGE},
    response::{Json, Response},
};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::auth::UserExtension;
use crate::error::{ApiError, validation_error};
use crate::file_server::{self, ResolveError};
use crate::models::download_job::{
    DeletedDownload, DownloadList, DownloadStatus, JobKind, RetriedDownload,
    SerializedDownloadJob, StartedDownload,
};
use crate::server::AppState;

/// Query parameters for the file endpoint
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct FileQuery {
    /// Position of the file inside a playlist download (default 0)
    pub item: Option<usize>,
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        validation_error(
            "Invalid download id",
            serde_json::json!({ "id": "Must be a valid UUID" }),
        )
    })
}

async fn start(
    state: &AppState,
    user: &str,
    kind: JobKind,
    entity_id: &str,
) -> Result<(StatusCode, Json<StartedDownload>), ApiError> {
    let job = state.orchestrator.start(user, kind, entity_id).await?;
    Ok((StatusCode::CREATED, Json(StartedDownload::from(&job))))
}

/// Start downloading a scene
#[utoipa::path(
    post,
    path = "/downloads/scenes/{scene_id}",
    security(("bearer_auth" = [])),
    params(
        ("scene_id" = String, Path, description = "Scene id in the remote library"),
        crate::auth::UserHeader
    ),
    responses(
        (status = 201, description = "Download queued", body = StartedDownload),
        (status = 400, description = "Invalid scene id", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 409, description = "An active download already exists for this scene", body = ApiError)
    ),
    tag = "downloads"
)]
pub async fn start_scene(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(scene_id): Path<String>,
) -> Result<(StatusCode, Json<StartedDownload>), ApiError> {
    start(&state, user.as_str(), JobKind::Scene, &scene_id).await
}

/// Start downloading an image
#[utoipa::path(
    post,
    path = "/downloads/images/{image_id}",
    security(("bearer_auth" = [])),
    params(
        ("image_id" = String, Path, description = "Image id in the remote library"),
        crate::auth::UserHeader
    ),
    responses(
        (status = 201, description = "Download queued", body = StartedDownload),
        (status = 400, description = "Invalid image id", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 409, description = "An active download already exists for this image", body = ApiError)
    ),
    tag = "downloads"
)]
pub async fn start_image(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(image_id): Path<String>,
) -> Result<(StatusCode, Json<StartedDownload>), ApiError> {
    start(&state, user.as_str(), JobKind::Image, &image_id).await
}

/// Start downloading every scene of a playlist as one job
#[utoipa::path(
    post,
    path = "/downloads/playlists/{playlist_id}",
    security(("bearer_auth" = [])),
    params(
        ("playlist_id" = String, Path, description = "Playlist id in the remote library"),
        crate::auth::UserHeader
    ),
    responses(
        (status = 201, description = "Download queued", body = StartedDownload),
        (status = 400, description = "Invalid or empty playlist", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 409, description = "An active download already exists for this playlist", body = ApiError),
        (status = 502, description = "The remote library could not resolve the playlist", body = ApiError)
    ),
    tag = "downloads"
)]
pub async fn start_playlist(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(playlist_id): Path<String>,
) -> Result<(StatusCode, Json<StartedDownload>), ApiError> {
    start(&state, user.as_str(), JobKind::Playlist, &playlist_id).await
}

/// List the caller's downloads, newest first
#[utoipa::path(
    get,
    path = "/downloads",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader),
    responses(
        (status = 200, description = "Downloads owned by the caller", body = DownloadList),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "downloads"
)]
pub async fn list_downloads(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
) -> Result<Json<DownloadList>, ApiError> {
    let jobs = state
        .orchestrator
        .store()
        .list_for_user(user.as_str())
        .await?;

    Ok(Json(DownloadList {
        downloads: jobs.iter().map(SerializedDownloadJob::from).collect(),
    }))
}

/// Progress and failure details of one download
#[utoipa::path(
    get,
    path = "/downloads/{id}/status",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Download id"),
        crate::auth::UserHeader
    ),
    responses(
        (status = 200, description = "Current status", body = DownloadStatus),
        (status = 404, description = "Download not found", body = ApiError)
    ),
    tag = "downloads"
)]
pub async fn download_status(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(id): Path<String>,
) -> Result<Json<DownloadStatus>, ApiError> {
    let id = parse_job_id(&id)?;
    let job = state.orchestrator.store().get(id, user.as_str()).await?;
    Ok(Json(DownloadStatus::from(&job)))
}

/// Stream a completed download; honors a single `Range`
#[utoipa::path(
    get,
    path = "/downloads/{id}/file",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Download id"),
        FileQuery,
        crate::auth::UserHeader
    ),
    responses(
        (status = 200, description = "Full file", content_type = "application/octet-stream"),
        (status = 206, description = "Requested byte range", content_type = "application/octet-stream"),
        (status = 404, description = "Download not found, not completed, or file missing (the download is then marked FAILED)", body = ApiError),
        (status = 416, description = "Range outside the file", body = ApiError)
    ),
    tag = "downloads"
)]
pub async fn download_file(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let job = state.orchestrator.store().get(id, user.as_str()).await?;
    let path = match file_server::resolve_file(&job, query.item).await {
        Ok(path) => path,
        Err(missing @ ResolveError::Missing { .. }) => {
            state.orchestrator.mark_file_missing(&job).await?;
            return Err(missing.into());
        }
        Err(e) => return Err(e.into()),
    };
    let range = headers.get(RANGE).and_then(|value| value.to_str().ok());

    file_server::serve_file(&path, range).await
}

/// Cancel if active, then remove the record and its files
#[utoipa::path(
    delete,
    path = "/downloads/{id}",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Download id"),
        crate::auth::UserHeader
    ),
    responses(
        (status = 200, description = "Download removed", body = DeletedDownload),
        (status = 404, description = "Download not found", body = ApiError)
    ),
    tag = "downloads"
)]
pub async fn delete_download(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(id): Path<String>,
) -> Result<Json<DeletedDownload>, ApiError> {
    let id = parse_job_id(&id)?;
    state
        .orchestrator
        .cancel_and_delete(id, user.as_str())
        .await?;
    Ok(Json(DeletedDownload { success: true }))
}

/// Re-queue a failed download with a fresh attempt budget
#[utoipa::path(
    post,
    path = "/downloads/{id}/retry",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Download id"),
        crate::auth::UserHeader
    ),
    responses(
        (status = 200, description = "Download re-queued", body = RetriedDownload),
        (status = 404, description = "Download not found", body = ApiError),
        (status = 409, description = "Download is not in FAILED state", body = ApiError)
    ),
    tag = "downloads"
)]
pub async fn retry_download(
    State(state): State<AppState>,
    UserExtension(user): UserExtension,
    Path(id): Path<String>,
) -> Result<Json<RetriedDownload>, ApiError> {
    let id = parse_job_id(&id)?;
    let job = state.orchestrator.retry(id, user.as_str()).await?;
    Ok(Json(RetriedDownload {
        id: job.id,
        status: job.status,
        attempt: job.attempt,
    }))
}
