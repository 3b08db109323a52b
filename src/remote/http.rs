//! HTTP client for the remote media library

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode, header};
use serde::Deserialize;
use url::Url;

use super::{MediaKind, MediaSource, RemoteError, RemoteStream};
use crate::config::RemoteConfig;

const API_KEY_HEADER: &str = "ApiKey";

/// Media source backed by the remote library's HTTP API:
///
/// - `GET {base}/scene/{id}/stream`
/// - `GET {base}/image/{id}/image`
/// - `GET {base}/playlists/{id}` returning `{"scene_ids": [...]}`
#[derive(Clone)]
pub struct HttpMediaSource {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    read_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct PlaylistResponse {
    scene_ids: Vec<String>,
}

impl HttpMediaSource {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| RemoteError::Malformed(format!("invalid base url: {e}")))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .user_agent(concat!("media-downloads/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            read_timeout: Duration::from_secs(config.read_timeout_seconds),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Malformed("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<Response, RemoteError> {
        let mut request = self.client.get(url.clone());
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = tokio::time::timeout(self.read_timeout, request.send())
            .await
            .map_err(|_| RemoteError::Timeout(format!("no response from {}", url.path())))?
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
            parse_retry_after(response.headers())
        } else {
            None
        };

        tracing::warn!(
            status = status.as_u16(),
            path = %url.path(),
            retry_after = ?retry_after,
            "Remote media library returned an error status"
        );

        Err(RemoteError::Status {
            status: status.as_u16(),
            retry_after,
        })
    }
}

#[async_trait]
impl MediaSource for HttpMediaSource {
    async fn open(&self, kind: MediaKind, entity_id: &str) -> Result<RemoteStream, RemoteError> {
        let url = match kind {
            MediaKind::Scene => self.endpoint(&["scene", entity_id, "stream"])?,
            MediaKind::Image => self.endpoint(&["image", entity_id, "image"])?,
        };

        let response = self.get(url).await?;
        let declared_size = response.content_length();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let file_name = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_disposition_file_name);

        let idle = self.read_timeout;
        let inner = response.bytes_stream().boxed();
        let body = futures_util::stream::unfold(Some(inner), move |state| async move {
            let mut inner = state?;
            match tokio::time::timeout(idle, inner.next()).await {
                Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(inner))),
                Ok(Some(Err(e))) => Some((Err(map_reqwest_error(e)), None)),
                Ok(None) => None,
                Err(_) => Some((
                    Err(RemoteError::Timeout(format!(
                        "no data for {}s",
                        idle.as_secs()
                    ))),
                    None,
                )),
            }
        })
        .boxed();

        Ok(RemoteStream {
            declared_size,
            file_name,
            content_type,
            body,
        })
    }

    async fn playlist_scene_ids(&self, playlist_id: &str) -> Result<Vec<String>, RemoteError> {
        let url = self.endpoint(&["playlists", playlist_id])?;
        let response = self.get(url).await?;
        let playlist: PlaylistResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Malformed(format!("invalid playlist body: {e}")))?;
        Ok(playlist.scene_ids)
    }
}

fn map_reqwest_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout(error.to_string())
    } else if error.is_decode() {
        RemoteError::Malformed(error.to_string())
    } else if let Some(status) = error.status() {
        RemoteError::Status {
            status: status.as_u16(),
            retry_after: None,
        }
    } else {
        RemoteError::Network(error.to_string())
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn parse_disposition_file_name(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|part| {
        part.strip_prefix("filename=")
            .map(|name| name.trim_matches('"').to_string())
            .filter(|name| !name.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(base: &str) -> HttpMediaSource {
        HttpMediaSource::new(&RemoteConfig {
            base_url: base.to_string(),
            ..RemoteConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn endpoints_append_to_base_path() {
        let remote = source("http://library.local/api/");
        assert_eq!(
            remote.endpoint(&["scene", "42", "stream"]).unwrap().as_str(),
            "http://library.local/api/scene/42/stream"
        );

        let remote = source("http://library.local");
        assert_eq!(
            remote.endpoint(&["playlists", "7"]).unwrap().as_str(),
            "http://library.local/playlists/7"
        );
    }

    #[test]
    fn retry_after_seconds() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));

        headers.insert(
            header::RETRY_AFTER,
            "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn disposition_file_name() {
        assert_eq!(
            parse_disposition_file_name("attachment; filename=\"scene 1.mp4\"").as_deref(),
            Some("scene 1.mp4")
        );
        assert_eq!(parse_disposition_file_name("inline"), None);
    }
}
