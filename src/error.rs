//! # Error Handling
//!
//! Unified HTTP error handling for the media downloads service, implementing a
//! consistent problem+json response format with trace ID propagation.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::models::download_job::{FailureClass, JobStatus};
use crate::orchestrator::DownloadError;
use crate::remote::RemoteError;
use crate::repositories::JobStoreError;
use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<C: Into<String>, M: Into<String>>(status: StatusCode, code: C, message: M) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Current request trace ID, falling back to a generated correlation ID.
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }
}

/// Returns true when the database rejected a write because of a unique index.
pub(crate) fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    if matches!(
        error.sql_err(),
        Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
    ) {
        return true;
    }

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .is_some_and(|code| code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()))
}

/// Standard error types with predefined status codes
#[derive(Debug, Error)]
pub enum ErrorType {
    #[error("Bad Request")]
    BadRequest,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Not Found")]
    NotFound,
    #[error("Download already active")]
    DuplicateDownload,
    #[error("Invalid state")]
    InvalidState,
    #[error("Range Not Satisfiable")]
    RangeNotSatisfiable,
    #[error("Internal Server Error")]
    InternalServerError,
    #[error("Bad Gateway")]
    BadGateway,
    #[error("Service Unavailable")]
    ServiceUnavailable,
}

impl ErrorType {
    /// HTTP status code for this error type
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorType::BadRequest => StatusCode::BAD_REQUEST,
            ErrorType::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorType::NotFound => StatusCode::NOT_FOUND,
            ErrorType::DuplicateDownload | ErrorType::InvalidState => StatusCode::CONFLICT,
            ErrorType::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ErrorType::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::BadGateway => StatusCode::BAD_GATEWAY,
            ErrorType::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Error code string for this error type (SCREAMING_SNAKE_CASE)
    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorType::BadRequest => "VALIDATION_FAILED",
            ErrorType::Unauthorized => "UNAUTHORIZED",
            ErrorType::NotFound => "NOT_FOUND",
            ErrorType::DuplicateDownload => "DUPLICATE_DOWNLOAD",
            ErrorType::InvalidState => "INVALID_STATE",
            ErrorType::RangeNotSatisfiable => "RANGE_NOT_SATISFIABLE",
            ErrorType::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorType::BadGateway => "PROVIDER_ERROR",
            ErrorType::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

// Error mappers for common sources

impl From<ErrorType> for ApiError {
    fn from(error_type: ErrorType) -> Self {
        Self::new(
            error_type.status_code(),
            error_type.error_code(),
            error_type.to_string(),
        )
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JobStoreError> for ApiError {
    fn from(error: JobStoreError) -> Self {
        match error {
            JobStoreError::NotFound(_) => not_found(),
            JobStoreError::Duplicate => Self::new(
                StatusCode::CONFLICT,
                "DUPLICATE_DOWNLOAD",
                "A download for this item is already in progress",
            ),
            JobStoreError::Conflict { expected, actual } => Self::new(
                StatusCode::CONFLICT,
                "INVALID_STATE",
                format!("Download is {actual}, expected {expected}"),
            ),
            JobStoreError::IllegalTransition { from, to } => Self::new(
                StatusCode::CONFLICT,
                "INVALID_STATE",
                format!("Download cannot move from {from} to {to}"),
            ),
            JobStoreError::Database(db_err) => {
                tracing::error!(error = ?db_err, "Download job store error");
                if matches!(db_err, sea_orm::DbErr::Conn(_)) {
                    Self::new(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "SERVICE_UNAVAILABLE",
                        "Database service unavailable",
                    )
                } else {
                    Self::new(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_SERVER_ERROR",
                        "Database error occurred",
                    )
                }
            }
        }
    }
}

impl From<RemoteError> for ApiError {
    fn from(error: RemoteError) -> Self {
        let status = error.upstream_status();
        let mut api_error = ApiError::new(
            StatusCode::BAD_GATEWAY,
            "PROVIDER_ERROR",
            format!("Remote media library error: {error}"),
        );
        if let Some(status) = status {
            api_error = api_error.with_details(json!({ "status": status }));
        }
        if let Some(retry_after) = error.retry_after() {
            api_error = api_error.with_retry_after(retry_after.as_secs());
        }
        api_error
    }
}

impl From<DownloadError> for ApiError {
    fn from(error: DownloadError) -> Self {
        match error {
            DownloadError::Store(store_err) => store_err.into(),
            DownloadError::Remote(remote_err) => remote_err.into(),
            DownloadError::Validation(message) => {
                ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
            }
            DownloadError::InvalidState { status } => ApiError::new(
                StatusCode::CONFLICT,
                "INVALID_STATE",
                format!("Only failed downloads can be retried; download is {status}"),
            )
            .with_details(json!({ "status": status.to_string() })),
            DownloadError::Io(io_err) => {
                tracing::error!(error = %io_err, "Download storage error");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Storage error occurred",
                )
            }
            DownloadError::ShuttingDown => ErrorType::ServiceUnavailable.into(),
        }
    }
}

/// Not found (404); used for missing jobs and jobs owned by other users alike.
pub fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "Download not found")
}

/// Completed job whose file is gone. The job is now FAILED and can be retried.
pub fn file_missing(job_id: uuid::Uuid) -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        "FILE_MISSING",
        "Downloaded file is missing; retry the download",
    )
    .with_details(json!({
        "retryable": true,
        "id": job_id,
        "status": JobStatus::Failed,
        "errorKind": FailureClass::Consistency,
    }))
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_basic() {
        let error = ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            "Test error message",
        );

        assert_eq!(error.code, Box::from("VALIDATION_FAILED"));
        assert_eq!(error.message, Box::from("Test error message"));
        assert_eq!(error.details, None);
        assert_eq!(error.retry_after, None);
    }

    #[test]
    fn test_trace_id_generation() {
        let error = ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "Test error",
        );

        let trace_id = error.trace_id.unwrap();
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }

    #[test]
    fn test_content_type_and_retry_after_headers() {
        let error = ApiError::new(
            StatusCode::BAD_GATEWAY,
            "PROVIDER_ERROR",
            "Remote media library error",
        )
        .with_retry_after(60);

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("retry-after").unwrap(), "60");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn store_errors_map_to_public_codes() {
        let not_found: ApiError = JobStoreError::NotFound(uuid::Uuid::new_v4()).into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);
        assert_eq!(not_found.code, Box::from("NOT_FOUND"));

        let duplicate: ApiError = JobStoreError::Duplicate.into();
        assert_eq!(duplicate.status, StatusCode::CONFLICT);
        assert_eq!(duplicate.code, Box::from("DUPLICATE_DOWNLOAD"));

        let conflict: ApiError = JobStoreError::Conflict {
            expected: JobStatus::Failed,
            actual: JobStatus::Downloading,
        }
        .into();
        assert_eq!(conflict.status, StatusCode::CONFLICT);
        assert_eq!(conflict.code, Box::from("INVALID_STATE"));

        let db: ApiError = JobStoreError::Database(sea_orm::DbErr::Custom("boom".into())).into();
        assert_eq!(db.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!db.message.contains("boom"));
    }

    #[test]
    fn retry_on_wrong_state_is_conflict() {
        let error: ApiError = DownloadError::InvalidState {
            status: JobStatus::Completed,
        }
        .into();
        assert_eq!(error.status, StatusCode::CONFLICT);
        assert_eq!(error.code, Box::from("INVALID_STATE"));
        assert_eq!(error.details.unwrap()["status"], "COMPLETED");
    }

    #[test]
    fn file_missing_is_retryable_not_found() {
        let id = uuid::Uuid::new_v4();
        let error = file_missing(id);
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(error.code, Box::from("FILE_MISSING"));
        let details = error.details.unwrap();
        assert_eq!(details["retryable"], true);
        assert_eq!(details["id"], id.to_string());
        assert_eq!(details["status"], "FAILED");
        assert_eq!(details["errorKind"], "consistency");
    }

    #[test]
    fn remote_errors_map_to_provider_error() {
        let error: ApiError = RemoteError::Status {
            status: 503,
            retry_after: None,
        }
        .into();
        assert_eq!(error.status, StatusCode::BAD_GATEWAY);
        assert_eq!(error.code, Box::from("PROVIDER_ERROR"));
        assert_eq!(error.details.unwrap()["status"], 503);
    }

    #[test]
    fn test_validation_error_with_details() {
        let field_errors = json!({ "sceneId": "must not be blank" });
        let error = validation_error("Validation failed", field_errors.clone());

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.code, Box::from("VALIDATION_FAILED"));
        assert_eq!(error.details, Some(Box::new(field_errors)));
    }
}
