//! Remote media library client interface
//!
//! The remote library is the authoritative origin of scene and image bytes.
//! Workers only see the [`MediaSource`] trait; [`http::HttpMediaSource`] is
//! the production implementation.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::models::download_job::FailureClass;

pub mod http;

pub use http::HttpMediaSource;

/// Byte stream of one remote item
pub type ByteStream = BoxStream<'static, Result<Bytes, RemoteError>>;

/// Kind of a single fetchable remote item. Playlists fan out into scenes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Scene,
    Image,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Scene => f.write_str("scene"),
            MediaKind::Image => f.write_str("image"),
        }
    }
}

/// An opened remote item
pub struct RemoteStream {
    /// Size announced by the remote (Content-Length), if any
    pub declared_size: Option<u64>,
    /// File name suggested by the remote (Content-Disposition), if any
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub body: ByteStream,
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("declared_size", &self.declared_size)
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Errors reported by the remote media library
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("remote returned HTTP {status}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("remote timed out: {0}")]
    Timeout(String),
    #[error("malformed remote response: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Maps the error onto the failure taxonomy: 429 is rate limiting, other
    /// 4xx and malformed descriptors are permanent, everything else transient.
    pub fn class(&self) -> FailureClass {
        match self {
            RemoteError::Status { status: 429, .. } => FailureClass::RateLimited,
            RemoteError::Status { status, .. } if (400..500).contains(status) => {
                FailureClass::PermanentRemote
            }
            RemoteError::Status { .. } => FailureClass::Transient,
            RemoteError::Network(_) | RemoteError::Timeout(_) => FailureClass::Transient,
            RemoteError::Malformed(_) => FailureClass::PermanentRemote,
        }
    }

    /// Server-provided delay hint (429 `Retry-After`)
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Source of remote media bytes
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Opens a byte stream for one scene or image.
    async fn open(&self, kind: MediaKind, entity_id: &str) -> Result<RemoteStream, RemoteError>;

    /// Resolves the ordered scene ids of a playlist.
    async fn playlist_scene_ids(&self, playlist_id: &str) -> Result<Vec<String>, RemoteError>;
}

/// File extension for a media content type; `bin` when unknown.
pub fn extension_for_content_type(content_type: Option<&str>) -> &'static str {
    let essence = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase());

    match essence.as_deref() {
        Some("video/mp4") => "mp4",
        Some("video/webm") => "webm",
        Some("video/x-matroska") => "mkv",
        Some("video/quicktime") => "mov",
        Some("video/x-msvideo") => "avi",
        Some("image/jpeg") => "jpg",
        Some("image/png") => "png",
        Some("image/gif") => "gif",
        Some("image/webp") => "webp",
        _ => "bin",
    }
}

/// Reduces a remote-supplied file name to a safe single path component.
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == ' ').to_string();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.chars().take(200).collect())
    }
}
