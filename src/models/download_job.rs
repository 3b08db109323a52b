//! DownloadJob entity model
//!
//! SeaORM entity for the download_jobs table. Each row is one user's request
//! to materialize a remote scene, image or playlist on local storage.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// DownloadJob entity, scoped to the owning user
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "download_jobs")]
pub struct Model {
    /// Unique identifier for the job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owner; every query and mutation is scoped to this value
    pub user_id: String,

    /// What is being fetched (scene, image or playlist)
    pub kind: JobKind,

    /// Identifier of the item in the remote library
    pub source_entity_id: String,

    /// Resolved scene ids for playlist jobs (JSON array of strings)
    #[sea_orm(column_type = "JsonBinary")]
    pub source_entity_ids: Option<JsonValue>,

    /// Current state machine position
    pub status: JobStatus,

    /// Bytes written so far in the current attempt
    pub progress_bytes: i64,

    /// Expected size in bytes, once the remote source has declared it
    pub total_bytes: Option<i64>,

    /// Number of files this job produces (1 unless playlist)
    pub items_total: i32,

    /// Number of files fully fetched in the current attempt
    pub items_completed: i32,

    /// Failed attempts since creation or the last manual retry
    pub attempt: i32,

    /// Attempt ceiling for automatic retries
    pub max_attempts: i32,

    /// Final location; set only while COMPLETED
    pub file_path: Option<String>,

    /// Last failure message (FAILED, or PENDING while backing off)
    pub error_message: Option<String>,

    /// Classification of the last failure
    pub error_kind: Option<FailureClass>,

    /// Earliest time the dispatcher may pick this job up again
    pub retry_after: Option<DateTimeWithTimeZone>,

    /// When the current download attempt began
    pub started_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    /// When the job reached COMPLETED
    pub completed_at: Option<DateTimeWithTimeZone>,
}

/// Kind of remote media a job fetches
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    #[sea_orm(string_value = "scene")]
    Scene,
    #[sea_orm(string_value = "image")]
    Image,
    #[sea_orm(string_value = "playlist")]
    Playlist,
}

/// Download job state machine
///
/// `PENDING -> DOWNLOADING -> {COMPLETED, FAILED}`; `FAILED -> PENDING` on
/// manual retry; `DOWNLOADING -> PENDING` when a failed attempt is queued for
/// automatic retry or a crashed process left the row behind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "DOWNLOADING")]
    Downloading,
    #[sea_orm(string_value = "COMPLETED")]
    Completed,
    #[sea_orm(string_value = "FAILED")]
    Failed,
}

/// Failure taxonomy persisted next to `error_message`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeouts, connection resets, remote 5xx
    #[sea_orm(string_value = "transient")]
    Transient,
    /// Remote 429
    #[sea_orm(string_value = "rate_limited")]
    RateLimited,
    /// Remote 404/403/401 or a malformed media descriptor
    #[sea_orm(string_value = "permanent_remote")]
    PermanentRemote,
    /// Disk full, permission denied, not enough free space at admission
    #[sea_orm(string_value = "local_resource")]
    LocalResource,
    /// A completed download whose file has gone missing
    #[sea_orm(string_value = "consistency")]
    Consistency,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scene => "scene",
            JobKind::Image => "image",
            JobKind::Playlist => "playlist",
        }
    }
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Downloading => "DOWNLOADING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// PENDING and DOWNLOADING jobs hold the per-source uniqueness slot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Downloading)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Legal edges of the job state machine. `DOWNLOADING -> DOWNLOADING` is
    /// the progress update edge; `COMPLETED -> FAILED` records a completed
    /// file that later went missing.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Downloading)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Pending)
                | (Completed, Failed)
                | (Failed, Pending)
        )
    }
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::PermanentRemote => "permanent_remote",
            FailureClass::LocalResource => "local_resource",
            FailureClass::Consistency => "consistency",
        }
    }

    /// Whether the automatic retry policy may reschedule this class.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Transient | FailureClass::RateLimited)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Model {
    /// Remote entity ids this job fetches, in order. Playlist jobs carry the
    /// scene list resolved at creation; other kinds fetch `source_entity_id`.
    pub fn fetch_targets(&self) -> Vec<String> {
        match (self.kind, &self.source_entity_ids) {
            (JobKind::Playlist, Some(JsonValue::Array(ids))) => ids
                .iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect(),
            (JobKind::Playlist, _) => Vec::new(),
            _ => vec![self.source_entity_id.clone()],
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Response for the start endpoints
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartedDownload {
    pub id: Uuid,
    pub status: JobStatus,
    pub kind: JobKind,
    pub source_entity_id: String,
    #[schema(value_type = String, format = DateTime)]
    pub created_at: DateTimeWithTimeZone,
}

/// Full job representation used by the list endpoint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SerializedDownloadJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub source_entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_entity_ids: Option<Vec<String>>,
    pub status: JobStatus,
    pub progress_bytes: i64,
    pub total_bytes: Option<i64>,
    pub items_total: i32,
    pub items_completed: i32,
    pub attempt: i32,
    pub max_attempts: i32,
    pub file_path: Option<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<FailureClass>,
    #[schema(value_type = String, format = DateTime)]
    pub created_at: DateTimeWithTimeZone,
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: DateTimeWithTimeZone,
    #[schema(value_type = Option<String>, format = DateTime)]
    pub completed_at: Option<DateTimeWithTimeZone>,
}

/// Response for `GET /downloads`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DownloadList {
    pub downloads: Vec<SerializedDownloadJob>,
}

/// Response for `GET /downloads/{id}/status`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStatus {
    pub id: Uuid,
    pub status: JobStatus,
    pub progress_bytes: i64,
    pub total_bytes: Option<i64>,
    pub error_message: Option<String>,
    pub error_kind: Option<FailureClass>,
    pub attempt: i32,
    pub max_attempts: i32,
    pub items_total: i32,
    pub items_completed: i32,
}

/// Response for `POST /downloads/{id}/retry`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RetriedDownload {
    pub id: Uuid,
    pub status: JobStatus,
    pub attempt: i32,
}

/// Response for `DELETE /downloads/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeletedDownload {
    pub success: bool,
}

impl From<&Model> for StartedDownload {
    fn from(job: &Model) -> Self {
        Self {
            id: job.id,
            status: job.status,
            kind: job.kind,
            source_entity_id: job.source_entity_id.clone(),
            created_at: job.created_at,
        }
    }
}

impl From<&Model> for SerializedDownloadJob {
    fn from(job: &Model) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            source_entity_id: job.source_entity_id.clone(),
            source_entity_ids: (job.kind == JobKind::Playlist).then(|| job.fetch_targets()),
            status: job.status,
            progress_bytes: job.progress_bytes,
            total_bytes: job.total_bytes,
            items_total: job.items_total,
            items_completed: job.items_completed,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            file_path: job.file_path.clone(),
            error_message: job.error_message.clone(),
            error_kind: job.error_kind,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

impl From<&Model> for DownloadStatus {
    fn from(job: &Model) -> Self {
        Self {
            id: job.id,
            status: job.status,
            progress_bytes: job.progress_bytes,
            total_bytes: job.total_bytes,
            error_message: job.error_message.clone(),
            error_kind: job.error_kind,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            items_total: job.items_total,
            items_completed: job.items_completed,
        }
    }
}
