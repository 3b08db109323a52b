//! HTTP media source against a mocked remote library.

use std::time::Duration;

use futures_util::StreamExt;
use media_downloads::config::RemoteConfig;
use media_downloads::models::download_job::FailureClass;
use media_downloads::remote::{HttpMediaSource, MediaKind, MediaSource, RemoteError};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn source_for(server: &MockServer, api_key: Option<&str>) -> HttpMediaSource {
    HttpMediaSource::new(&RemoteConfig {
        base_url: server.uri(),
        api_key: api_key.map(str::to_string),
        connect_timeout_seconds: 2,
        read_timeout_seconds: 2,
    })
    .expect("valid remote config")
}

async fn collect(stream: media_downloads::remote::ByteStream) -> Result<Vec<u8>, RemoteError> {
    let mut body = Vec::new();
    let mut stream = stream;
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(body)
}

#[tokio::test]
async fn scene_stream_carries_size_name_and_body() {
    let server = MockServer::start().await;
    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
    Mock::given(method("GET"))
        .and(path("/scene/42/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(body.clone(), "video/mp4")
                .insert_header("content-disposition", "attachment; filename=\"Beach Day.mp4\""),
        )
        .expect(1)
        .mount(&server)
        .await;

    let remote = source_for(&server, None)
        .open(MediaKind::Scene, "42")
        .await
        .expect("stream opens");

    assert_eq!(remote.declared_size, Some(10_000));
    assert_eq!(remote.file_name.as_deref(), Some("Beach Day.mp4"));
    assert_eq!(remote.content_type.as_deref(), Some("video/mp4"));
    assert_eq!(collect(remote.body).await.unwrap(), body);
}

#[tokio::test]
async fn image_uses_image_endpoint_and_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/image/7/image"))
        .and(header("ApiKey", "secret-key"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![1u8; 64], "image/png"))
        .expect(1)
        .mount(&server)
        .await;

    let remote = source_for(&server, Some("secret-key"))
        .open(MediaKind::Image, "7")
        .await
        .expect("image opens");

    assert_eq!(remote.content_type.as_deref(), Some("image/png"));
    assert_eq!(collect(remote.body).await.unwrap().len(), 64);
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/scene/42/stream"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
        .mount(&server)
        .await;

    let error = source_for(&server, None)
        .open(MediaKind::Scene, "42")
        .await
        .expect_err("429 is an error");

    assert_eq!(error.class(), FailureClass::RateLimited);
    assert_eq!(error.retry_after(), Some(Duration::from_secs(30)));
}

#[tokio::test]
async fn status_codes_map_to_failure_classes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/scene/missing/stream"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/scene/busy/stream"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let source = source_for(&server, None);

    let missing = source.open(MediaKind::Scene, "missing").await.unwrap_err();
    assert_eq!(missing.class(), FailureClass::PermanentRemote);
    assert_eq!(missing.upstream_status(), Some(404));

    let busy = source.open(MediaKind::Scene, "busy").await.unwrap_err();
    assert_eq!(busy.class(), FailureClass::Transient);
    assert_eq!(busy.retry_after(), None);
}

#[tokio::test]
async fn playlist_resolves_scene_ids_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/playlists/p1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "scene_ids": ["s3", "s1", "s2"] })),
        )
        .mount(&server)
        .await;

    let ids = source_for(&server, None)
        .playlist_scene_ids("p1")
        .await
        .expect("playlist resolves");
    assert_eq!(ids, vec!["s3", "s1", "s2"]);
}

#[tokio::test]
async fn malformed_playlist_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/playlists/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"scenes\": 5"))
        .mount(&server)
        .await;

    let error = source_for(&server, None)
        .playlist_scene_ids("p1")
        .await
        .unwrap_err();
    assert!(matches!(error, RemoteError::Malformed(_)));
    assert_eq!(error.class(), FailureClass::PermanentRemote);
}

#[tokio::test]
async fn unreachable_remote_is_transient() {
    let server = MockServer::start().await;
    let source = source_for(&server, None);
    drop(server);

    let error = source.open(MediaKind::Scene, "42").await.unwrap_err();
    assert_eq!(error.class(), FailureClass::Transient);
}
