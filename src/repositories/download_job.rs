//! # Download Job Store
//!
//! Durable, user-scoped CRUD for the download_jobs table. Status changes go
//! through [`JobStore::transition`], an atomic compare-and-swap on `status`,
//! so two writers can never both finalize the same job.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sea_orm::prelude::*;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::error::is_unique_violation;
use crate::models::download_job::{
    ActiveModel, Column, Entity, FailureClass, JobKind, JobStatus, Model,
};

/// Errors surfaced by the job store
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("download job {0} not found")]
    NotFound(Uuid),
    #[error("an active download already exists for this item")]
    Duplicate,
    #[error("download job status is {actual}, expected {expected}")]
    Conflict {
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

/// Parameters for a new job row
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: String,
    pub kind: JobKind,
    pub source_entity_id: String,
    /// Resolved scene ids (playlist jobs only)
    pub source_entity_ids: Option<Vec<String>>,
    pub max_attempts: i32,
}

/// Field changes applied together with a status compare-and-swap.
///
/// `None` leaves a column untouched; `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress_bytes: Option<i64>,
    pub total_bytes: Option<Option<i64>>,
    pub items_completed: Option<i32>,
    pub attempt: Option<i32>,
    pub file_path: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
    pub error_kind: Option<Option<FailureClass>>,
    pub retry_after: Option<Option<DateTimeWithTimeZone>>,
    pub started_at: Option<Option<DateTimeWithTimeZone>>,
    pub completed_at: Option<Option<DateTimeWithTimeZone>>,
}

impl JobUpdate {
    /// PENDING -> DOWNLOADING; progress restarts for the new attempt.
    pub fn admit(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Downloading),
            progress_bytes: Some(0),
            items_completed: Some(0),
            retry_after: Some(None),
            started_at: Some(Some(now.fixed_offset())),
            ..Self::default()
        }
    }

    /// DOWNLOADING -> DOWNLOADING progress report.
    pub fn progress(progress_bytes: u64, total_bytes: Option<u64>, items_completed: u32) -> Self {
        Self {
            status: Some(JobStatus::Downloading),
            progress_bytes: Some(to_db_bytes(progress_bytes)),
            total_bytes: Some(total_bytes.map(to_db_bytes)),
            items_completed: Some(items_completed as i32),
            ..Self::default()
        }
    }

    /// DOWNLOADING -> COMPLETED with the final location.
    pub fn complete(
        file_path: String,
        total_bytes: u64,
        items_completed: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let total = to_db_bytes(total_bytes);
        Self {
            status: Some(JobStatus::Completed),
            progress_bytes: Some(total),
            total_bytes: Some(Some(total)),
            items_completed: Some(items_completed as i32),
            file_path: Some(Some(file_path)),
            error_message: Some(None),
            error_kind: Some(None),
            retry_after: Some(None),
            completed_at: Some(Some(now.fixed_offset())),
            ..Self::default()
        }
    }

    /// DOWNLOADING -> PENDING, waiting out a backoff before the next attempt.
    pub fn requeue(
        attempt: i32,
        retry_after: DateTime<Utc>,
        message: String,
        class: FailureClass,
    ) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            attempt: Some(attempt),
            file_path: Some(None),
            error_message: Some(Some(message)),
            error_kind: Some(Some(class)),
            retry_after: Some(Some(retry_after.fixed_offset())),
            started_at: Some(None),
            ..Self::default()
        }
    }

    /// Terminal failure.
    pub fn fail(attempt: i32, message: String, class: FailureClass) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            attempt: Some(attempt),
            file_path: Some(None),
            error_message: Some(Some(message)),
            error_kind: Some(Some(class)),
            retry_after: Some(None),
            ..Self::default()
        }
    }

    /// FAILED -> PENDING on user request: fresh attempt budget, no backoff.
    pub fn manual_retry() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            progress_bytes: Some(0),
            items_completed: Some(0),
            attempt: Some(0),
            file_path: Some(None),
            error_message: Some(None),
            error_kind: Some(None),
            retry_after: Some(None),
            started_at: Some(None),
            completed_at: Some(None),
            ..Self::default()
        }
    }

    /// DOWNLOADING -> PENDING for a job orphaned by a previous process.
    pub fn recover() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            progress_bytes: Some(0),
            items_completed: Some(0),
            started_at: Some(None),
            ..Self::default()
        }
    }
}

fn to_db_bytes(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// PENDING and either never failed or past its backoff deadline.
fn eligible(now: DateTime<Utc>) -> Condition {
    Condition::all()
        .add(Column::Status.eq(JobStatus::Pending))
        .add(
            Column::RetryAfter
                .is_null()
                .or(Column::RetryAfter.lte(now.fixed_offset())),
        )
}

/// Store for download job rows
#[derive(Clone)]
pub struct JobStore {
    db: DatabaseConnection,
}

impl JobStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Inserts a new PENDING job with `attempt = 0`.
    ///
    /// Fails with [`JobStoreError::Duplicate`] when the same user already has
    /// an active job for the same `(kind, source_entity_id)`.
    pub async fn create(&self, request: NewJob) -> Result<Model, JobStoreError> {
        let now = Utc::now().fixed_offset();
        let items_total = match (&request.kind, &request.source_entity_ids) {
            (JobKind::Playlist, Some(ids)) => ids.len() as i32,
            _ => 1,
        };

        let job = ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(request.user_id.clone()),
            kind: Set(request.kind),
            source_entity_id: Set(request.source_entity_id.clone()),
            source_entity_ids: Set(request.source_entity_ids.map(JsonValue::from)),
            status: Set(JobStatus::Pending),
            progress_bytes: Set(0),
            total_bytes: Set(None),
            items_total: Set(items_total),
            items_completed: Set(0),
            attempt: Set(0),
            max_attempts: Set(request.max_attempts),
            file_path: Set(None),
            error_message: Set(None),
            error_kind: Set(None),
            retry_after: Set(None),
            started_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            completed_at: Set(None),
        };

        let created = job.insert(&self.db).await.map_err(|e| {
            if is_unique_violation(&e) {
                tracing::debug!(
                    user_id = %request.user_id,
                    kind = %request.kind,
                    source_entity_id = %request.source_entity_id,
                    "Active download already exists"
                );
                JobStoreError::Duplicate
            } else {
                tracing::error!("Failed to create download job: {}", e);
                JobStoreError::Database(e)
            }
        })?;

        tracing::info!(
            job_id = %created.id,
            user_id = %created.user_id,
            kind = %created.kind,
            source_entity_id = %created.source_entity_id,
            "Download job created"
        );

        Ok(created)
    }

    /// Atomic conditional update: applies `update` only if the row is still in
    /// `expected` status.
    ///
    /// Returns the updated row, [`JobStoreError::NotFound`] if the row is
    /// gone, or [`JobStoreError::Conflict`] carrying the actual status.
    pub async fn transition(
        &self,
        id: Uuid,
        expected: JobStatus,
        update: JobUpdate,
    ) -> Result<Model, JobStoreError> {
        if let Some(target) = update.status
            && !expected.can_transition_to(target)
        {
            return Err(JobStoreError::IllegalTransition {
                from: expected,
                to: target,
            });
        }

        let now = Utc::now().fixed_offset();
        let mut stmt = Entity::update_many()
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(expected));

        if let Some(status) = update.status {
            stmt = stmt.col_expr(Column::Status, Expr::value(status));
        }
        if let Some(progress) = update.progress_bytes {
            stmt = stmt.col_expr(Column::ProgressBytes, Expr::value(progress));
        }
        if let Some(total) = update.total_bytes {
            stmt = stmt.col_expr(Column::TotalBytes, Expr::value(total));
        }
        if let Some(items) = update.items_completed {
            stmt = stmt.col_expr(Column::ItemsCompleted, Expr::value(items));
        }
        if let Some(attempt) = update.attempt {
            stmt = stmt.col_expr(Column::Attempt, Expr::value(attempt));
        }
        if let Some(file_path) = update.file_path {
            stmt = stmt.col_expr(Column::FilePath, Expr::value(file_path));
        }
        if let Some(message) = update.error_message {
            stmt = stmt.col_expr(Column::ErrorMessage, Expr::value(message));
        }
        if let Some(kind) = update.error_kind {
            stmt = stmt.col_expr(Column::ErrorKind, Expr::value(kind));
        }
        if let Some(retry_after) = update.retry_after {
            stmt = stmt.col_expr(Column::RetryAfter, Expr::value(retry_after));
        }
        if let Some(started_at) = update.started_at {
            stmt = stmt.col_expr(Column::StartedAt, Expr::value(started_at));
        }
        if let Some(completed_at) = update.completed_at {
            stmt = stmt.col_expr(Column::CompletedAt, Expr::value(completed_at));
        }

        let result = stmt.exec(&self.db).await?;

        if result.rows_affected == 0 {
            return match self.find(id).await? {
                None => Err(JobStoreError::NotFound(id)),
                Some(current) => Err(JobStoreError::Conflict {
                    expected,
                    actual: current.status,
                }),
            };
        }

        self.find(id).await?.ok_or(JobStoreError::NotFound(id))
    }

    /// Fetch a job owned by `user_id`. Jobs owned by others are reported as
    /// not found.
    pub async fn get(&self, id: Uuid, user_id: &str) -> Result<Model, JobStoreError> {
        Entity::find_by_id(id)
            .filter(Column::UserId.eq(user_id))
            .one(&self.db)
            .await?
            .ok_or(JobStoreError::NotFound(id))
    }

    /// All jobs owned by `user_id`, newest first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Model>, JobStoreError> {
        let jobs = Entity::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .all(&self.db)
            .await?;
        Ok(jobs)
    }

    /// Removes a job owned by `user_id`. File removal is the caller's concern.
    pub async fn delete(&self, id: Uuid, user_id: &str) -> Result<(), JobStoreError> {
        let result = Entity::delete_many()
            .filter(Column::Id.eq(id))
            .filter(Column::UserId.eq(user_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(JobStoreError::NotFound(id));
        }

        tracing::info!(job_id = %id, user_id = %user_id, "Download job deleted");
        Ok(())
    }

    /// Unscoped lookup for background services.
    pub async fn find(&self, id: Uuid) -> Result<Option<Model>, JobStoreError> {
        Ok(Entity::find_by_id(id).one(&self.db).await?)
    }

    /// Users with at least one eligible PENDING job, ordered by their oldest
    /// eligible job. Users in `exclude` are skipped.
    pub async fn waiting_users(
        &self,
        now: DateTime<Utc>,
        exclude: &[String],
        limit: u64,
    ) -> Result<Vec<String>, JobStoreError> {
        let mut query = Entity::find()
            .select_only()
            .column(Column::UserId)
            .filter(eligible(now));
        if !exclude.is_empty() {
            query = query.filter(Column::UserId.is_not_in(exclude.iter().cloned()));
        }

        let users = query
            .group_by(Column::UserId)
            .order_by_asc(Expr::col(Column::CreatedAt).min())
            .order_by_asc(Column::UserId)
            .limit(limit)
            .into_tuple::<String>()
            .all(&self.db)
            .await?;
        Ok(users)
    }

    /// A user's PENDING jobs whose backoff (if any) has elapsed, oldest first.
    pub async fn eligible_pending_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Model>, JobStoreError> {
        let jobs = Entity::find()
            .filter(eligible(now))
            .filter(Column::UserId.eq(user_id))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?;
        Ok(jobs)
    }

    /// Earliest pending backoff deadline, used to size the dispatcher sleep.
    pub async fn next_retry_at(&self) -> Result<Option<DateTimeWithTimeZone>, JobStoreError> {
        let next = Entity::find()
            .select_only()
            .column(Column::RetryAfter)
            .filter(Column::Status.eq(JobStatus::Pending))
            .filter(Column::RetryAfter.is_not_null())
            .order_by_asc(Column::RetryAfter)
            .into_tuple::<Option<DateTimeWithTimeZone>>()
            .one(&self.db)
            .await?;
        Ok(next.flatten())
    }

    /// Number of DOWNLOADING jobs per user.
    pub async fn downloading_counts(&self) -> Result<HashMap<String, usize>, JobStoreError> {
        let owners: Vec<String> = Entity::find()
            .select_only()
            .column(Column::UserId)
            .filter(Column::Status.eq(JobStatus::Downloading))
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut counts = HashMap::new();
        for owner in owners {
            *counts.entry(owner).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub async fn count_by_status(&self, status: JobStatus) -> Result<u64, JobStoreError> {
        Ok(Entity::find()
            .filter(Column::Status.eq(status))
            .count(&self.db)
            .await?)
    }

    pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Model>, JobStoreError> {
        Ok(Entity::find()
            .filter(Column::Status.eq(status))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    /// Terminal jobs whose last update is older than `cutoff`.
    pub async fn expired_terminal(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Model>, JobStoreError> {
        Ok(Entity::find()
            .filter(Column::Status.is_in([JobStatus::Completed, JobStatus::Failed]))
            .filter(Column::UpdatedAt.lt(cutoff.fixed_offset()))
            .order_by_asc(Column::UpdatedAt)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// Deletes a row only if it is still in `expected` status. Returns whether
    /// a row was removed.
    pub async fn delete_if_status(
        &self,
        id: Uuid,
        expected: JobStatus,
    ) -> Result<bool, JobStoreError> {
        let result = Entity::delete_many()
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(expected))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Status of every listed job that still exists.
    pub async fn statuses(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, JobStatus>, JobStoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(Uuid, JobStatus)> = Entity::find()
            .select_only()
            .column(Column::Id)
            .column(Column::Status)
            .filter(Column::Id.is_in(ids.iter().copied()))
            .into_tuple()
            .all(&self.db)
            .await?;

        Ok(rows.into_iter().collect())
    }
}
