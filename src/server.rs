//! # Server Configuration
//!
//! Router assembly, background service startup and graceful shutdown for the
//! media downloads service.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::cleanup::CleanupService;
use crate::config::AppConfig;
use crate::handlers::{self, downloads};
use crate::orchestrator::Orchestrator;
use crate::remote::{HttpMediaSource, MediaSource};
use crate::repositories::JobStore;
use crate::telemetry::trace_context_middleware;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub orchestrator: Orchestrator,
}

impl AppState {
    /// Wires the job store and orchestrator over `db` and `source`.
    pub fn new(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        source: Arc<dyn MediaSource>,
        shutdown: CancellationToken,
    ) -> Self {
        let store = JobStore::new(db.clone());
        let orchestrator = Orchestrator::new(&config, store, source, shutdown);
        Self {
            config,
            db,
            orchestrator,
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/downloads", get(downloads::list_downloads))
        .route("/downloads/scenes/{scene_id}", post(downloads::start_scene))
        .route("/downloads/images/{image_id}", post(downloads::start_image))
        .route(
            "/downloads/playlists/{playlist_id}",
            post(downloads::start_playlist),
        )
        .route("/downloads/{id}", delete(downloads::delete_download))
        .route("/downloads/{id}/status", get(downloads::download_status))
        .route("/downloads/{id}/file", get(downloads::download_file))
        .route("/downloads/{id}/retry", post(downloads::retry_download))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Starts the HTTP server and the background services, and runs until
/// ctrl-c.
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    let source: Arc<dyn MediaSource> = Arc::new(HttpMediaSource::new(&config.remote)?);
    let state = AppState::new(Arc::clone(&config), db.clone(), source, shutdown.clone());

    let orchestrator = state.orchestrator.clone();
    orchestrator.ensure_directories().await?;
    let orchestrator_task = tokio::spawn(orchestrator.clone().run());

    let cleanup = CleanupService::new(
        JobStore::new(db),
        orchestrator.worker_settings().clone(),
        config.cleanup.clone(),
    );
    let cleanup_task = tokio::spawn(cleanup.run(shutdown.clone()));

    let app = create_app(state);

    // Resolve the configured bind address
    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %config.profile, "Server listening");

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                }
                _ = signal_token.cancelled() => {}
            }
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    match orchestrator_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Download orchestrator exited with error"),
        Err(e) => tracing::error!(error = %e, "Download orchestrator task failed"),
    }
    if let Err(e) = cleanup_task.await {
        tracing::error!(error = %e, "Cleanup task failed");
    }

    tracing::info!("Server stopped");
    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::downloads::start_scene,
        crate::handlers::downloads::start_image,
        crate::handlers::downloads::start_playlist,
        crate::handlers::downloads::list_downloads,
        crate::handlers::downloads::download_status,
        crate::handlers::downloads::download_file,
        crate::handlers::downloads::delete_download,
        crate::handlers::downloads::retry_download,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::HealthStatus,
            crate::models::download_job::JobKind,
            crate::models::download_job::JobStatus,
            crate::models::download_job::FailureClass,
            crate::models::download_job::StartedDownload,
            crate::models::download_job::SerializedDownloadJob,
            crate::models::download_job::DownloadList,
            crate::models::download_job::DownloadStatus,
            crate::models::download_job::RetriedDownload,
            crate::models::download_job::DeletedDownload,
            crate::error::ApiError,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "downloads", description = "Offline copies of remote media"),
    ),
    info(
        title = "Media Downloads API",
        description = "Background download jobs for remote scenes, images and playlists",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
