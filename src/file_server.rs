//! # File Server
//!
//! Streams a completed download back to the client. Supports a single HTTP
//! byte range for seeking; multi-range requests get the full body.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use metrics::counter;
use serde_json::json;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{self, ApiError, ErrorType};
use crate::models::download_job::{JobKind, JobStatus, Model};

/// Interpretation of a `Range` request header against a file length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// Serve the whole file (no header, unsupported or multi-range)
    Full,
    /// Inclusive byte range
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

impl RangeRequest {
    pub fn parse(header: Option<&str>, len: u64) -> Self {
        let Some(spec) = header.and_then(|value| value.trim().strip_prefix("bytes=")) else {
            return RangeRequest::Full;
        };
        if spec.contains(',') {
            return RangeRequest::Full;
        }
        let Some((first, last)) = spec.trim().split_once('-') else {
            return RangeRequest::Full;
        };
        let (first, last) = (first.trim(), last.trim());

        if first.is_empty() {
            // Suffix form: the last `n` bytes.
            return match last.parse::<u64>() {
                Ok(0) => RangeRequest::Unsatisfiable,
                Ok(_) if len == 0 => RangeRequest::Unsatisfiable,
                Ok(n) => RangeRequest::Partial {
                    start: len.saturating_sub(n),
                    end: len - 1,
                },
                Err(_) => RangeRequest::Full,
            };
        }

        let Ok(start) = first.parse::<u64>() else {
            return RangeRequest::Full;
        };
        let end = if last.is_empty() {
            None
        } else {
            match last.parse::<u64>() {
                Ok(end) if end >= start => Some(end),
                _ => return RangeRequest::Full,
            }
        };

        if start >= len {
            return RangeRequest::Unsatisfiable;
        }
        RangeRequest::Partial {
            start,
            end: end.map_or(len - 1, |end| end.min(len - 1)),
        }
    }
}

/// Content type guessed from a file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Why a download cannot be served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    NotCompleted(JobStatus),
    /// The row claims completion but its bytes are gone
    Missing { id: Uuid, reason: &'static str },
    NoSuchItem { index: usize, items_total: i32 },
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotCompleted(status) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "Download is not completed",
            )
            .with_details(json!({ "status": status })),
            ResolveError::Missing { id, .. } => error::file_missing(id),
            ResolveError::NoSuchItem { index, items_total } => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Playlist item {index} not found"),
            )
            .with_details(json!({ "itemsTotal": items_total })),
        }
    }
}

/// Locates the file to serve for `job`. Playlist jobs store a directory;
/// `item` selects an entry by position (default `0`).
pub async fn resolve_file(job: &Model, item: Option<usize>) -> Result<PathBuf, ResolveError> {
    if job.status != JobStatus::Completed {
        return Err(ResolveError::NotCompleted(job.status));
    }

    let Some(stored) = job.file_path.as_deref() else {
        return Err(missing(job, "completed job has no file path"));
    };
    let stored = PathBuf::from(stored);

    if job.kind != JobKind::Playlist {
        return match tokio::fs::metadata(&stored).await {
            Ok(meta) if meta.is_file() => Ok(stored),
            _ => Err(missing(job, "file not found on disk")),
        };
    }

    let mut entries = match tokio::fs::read_dir(&stored).await {
        Ok(entries) => entries,
        Err(_) => return Err(missing(job, "playlist directory not found on disk")),
    };
    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.is_ok_and(|t| t.is_file()) {
            files.push(entry.path());
        }
    }
    if files.is_empty() {
        return Err(missing(job, "playlist directory is empty"));
    }
    files.sort_by_key(|path| playlist_position(path));

    let index = item.unwrap_or(0);
    files
        .into_iter()
        .nth(index)
        .ok_or(ResolveError::NoSuchItem {
            index,
            items_total: job.items_total,
        })
}

/// Numeric prefix of a playlist entry (`0042-scene-x.mp4` -> 42). Entries
/// without one sort last, by name.
fn playlist_position(path: &Path) -> (u64, String) {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let position = name
        .split_once('-')
        .and_then(|(prefix, _)| prefix.parse::<u64>().ok())
        .unwrap_or(u64::MAX);
    (position, name)
}

fn missing(job: &Model, reason: &'static str) -> ResolveError {
    error!(
        job_id = %job.id,
        file_path = ?job.file_path,
        reason,
        "Completed download is missing its file"
    );
    counter!("downloads_missing_files_total").increment(1);
    ResolveError::Missing { id: job.id, reason }
}

/// Builds the response for `path`, honoring `range_header`.
pub async fn serve_file(path: &Path, range_header: Option<&str>) -> Result<Response, ApiError> {
    let mut file = File::open(path).await.map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to open download file");
        ApiError::from(ErrorType::InternalServerError)
    })?;
    let len = file
        .metadata()
        .await
        .map_err(|_| ApiError::from(ErrorType::InternalServerError))?
        .len();

    let (status, start, count) = match RangeRequest::parse(range_header, len) {
        RangeRequest::Full => (StatusCode::OK, 0, len),
        RangeRequest::Partial { start, end } => {
            (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
        }
        RangeRequest::Unsatisfiable => {
            debug!(len, range = ?range_header, "Unsatisfiable range");
            let mut response = ApiError::from(ErrorType::RangeNotSatisfiable)
                .with_details(json!({ "length": len }))
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{len}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return Ok(response);
        }
    };

    if start > 0 {
        file.seek(SeekFrom::Start(start)).await.map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to seek download file");
            ApiError::from(ErrorType::InternalServerError)
        })?;
    }

    let body = Body::from_stream(ReaderStream::new(file.take(count)));
    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type_for(path))
        .header(header::CONTENT_LENGTH, count)
        .header(header::ACCEPT_RANGES, "bytes");

    if status == StatusCode::PARTIAL_CONTENT {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{}/{len}", start + count - 1),
        );
    }
    if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
        let name = name.replace('"', "");
        response = response.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        );
    }

    response.body(body).map_err(|e| {
        error!(error = %e, "Failed to build file response");
        ApiError::from(ErrorType::InternalServerError)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_ranges() {
        assert_eq!(
            RangeRequest::parse(Some("bytes=0-99"), 1_000),
            RangeRequest::Partial { start: 0, end: 99 }
        );
        assert_eq!(
            RangeRequest::parse(Some("bytes=900-"), 1_000),
            RangeRequest::Partial {
                start: 900,
                end: 999
            }
        );
        assert_eq!(
            RangeRequest::parse(Some("bytes=-100"), 1_000),
            RangeRequest::Partial {
                start: 900,
                end: 999
            }
        );
        assert_eq!(
            RangeRequest::parse(Some("bytes=500-5000"), 1_000),
            RangeRequest::Partial {
                start: 500,
                end: 999
            }
        );
    }

    #[test]
    fn suffix_longer_than_file_serves_everything() {
        assert_eq!(
            RangeRequest::parse(Some("bytes=-5000"), 1_000),
            RangeRequest::Partial { start: 0, end: 999 }
        );
    }

    #[test]
    fn unsatisfiable_ranges() {
        assert_eq!(
            RangeRequest::parse(Some("bytes=1000-"), 1_000),
            RangeRequest::Unsatisfiable
        );
        assert_eq!(
            RangeRequest::parse(Some("bytes=-0"), 1_000),
            RangeRequest::Unsatisfiable
        );
    }

    #[test]
    fn unsupported_forms_fall_back_to_full_body() {
        assert_eq!(RangeRequest::parse(None, 10), RangeRequest::Full);
        assert_eq!(
            RangeRequest::parse(Some("bytes=0-1,5-6"), 10),
            RangeRequest::Full
        );
        assert_eq!(RangeRequest::parse(Some("items=0-1"), 10), RangeRequest::Full);
        assert_eq!(RangeRequest::parse(Some("bytes=5-2"), 10), RangeRequest::Full);
        assert_eq!(RangeRequest::parse(Some("bytes=a-b"), 10), RangeRequest::Full);
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for(Path::new("scene.MP4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("cover.jpeg")), "image/jpeg");
        assert_eq!(
            content_type_for(Path::new("blob")),
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn serves_partial_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.mp4");
        let data: Vec<u8> = (0..=255u8).cycle().take(1_000).collect();
        std::fs::write(&path, &data).unwrap();

        let response = serve_file(&path, Some("bytes=10-19")).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 10-19/1000"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], &data[10..20]);
    }

    #[tokio::test]
    async fn unsatisfiable_range_reports_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.png");
        std::fs::write(&path, b"0123456789").unwrap();

        let response = serve_file(&path, Some("bytes=50-")).await.unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */10"
        );
    }

    fn completed_playlist(dir: &Path, items: i32) -> Model {
        let now = chrono::Utc::now().fixed_offset();
        Model {
            id: Uuid::new_v4(),
            user_id: "alice".into(),
            kind: JobKind::Playlist,
            source_entity_id: "p1".into(),
            source_entity_ids: None,
            status: JobStatus::Completed,
            progress_bytes: 0,
            total_bytes: None,
            items_total: items,
            items_completed: items,
            attempt: 0,
            max_attempts: 3,
            file_path: Some(dir.to_string_lossy().into_owned()),
            error_message: None,
            error_kind: None,
            retry_after: None,
            started_at: None,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
        }
    }

    #[tokio::test]
    async fn playlist_items_follow_numeric_position() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["1000-scene-c.mp4", "0101-scene-b.mp4", "0999-scene-a.mp4"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }
        let job = completed_playlist(dir.path(), 1_000);

        let first = resolve_file(&job, None).await.unwrap();
        assert!(first.ends_with("0101-scene-b.mp4"));
        let last = resolve_file(&job, Some(2)).await.unwrap();
        assert!(last.ends_with("1000-scene-c.mp4"));

        assert_eq!(
            resolve_file(&job, Some(3)).await,
            Err(ResolveError::NoSuchItem {
                index: 3,
                items_total: 1_000
            })
        );
    }

    #[tokio::test]
    async fn vanished_playlist_directory_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let job = completed_playlist(&dir.path().join("gone"), 2);

        assert!(matches!(
            resolve_file(&job, None).await,
            Err(ResolveError::Missing { id, .. }) if id == job.id
        ));

        let pending = Model {
            status: JobStatus::Pending,
            ..job
        };
        assert_eq!(
            resolve_file(&pending, None).await,
            Err(ResolveError::NotCompleted(JobStatus::Pending))
        );
    }
}
