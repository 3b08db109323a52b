//! # Data Models
//!
//! Entities and API representations used throughout the media downloads service.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod download_job;

pub use download_job::Entity as DownloadJob;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "media-downloads".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Health probe response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthStatus {
    /// `ok` or `degraded`
    pub status: String,
    /// Database reachability
    pub database: bool,
}
