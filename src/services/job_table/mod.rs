//! The job table: single source of truth for job state.
//!
//! Every mutation is a conditional write keyed on the status the caller
//! expects the row to be in. A write from a stale status fails with
//! [`JobTableError::Conflict`] and leaves the row untouched. Exits from
//! `processing` are further keyed on the attempt that started the run and
//! fail with [`JobTableError::Superseded`] once that run was recovered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus, Transition};

pub mod memory;

pub use memory::MemoryJobTable;

#[async_trait]
pub trait JobTable: Send + Sync {
    /// Insert a brand new row. Fails with `Duplicate` if the id exists.
    async fn create(&self, job: &Job) -> Result<(), JobTableError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobTableError>;

    /// Apply `transition` only if the row is currently in
    /// `transition.expected()` and, when fenced, still on that attempt.
    /// Returns the updated row.
    async fn transition(&self, job_id: Uuid, transition: Transition)
        -> Result<Job, JobTableError>;

    /// Refresh `updated_at` of a row still in `expected` on `attempt`. Keeps
    /// a live run from looking stalled to the sweeper.
    async fn touch(&self, job_id: Uuid, expected: JobStatus, attempt: i32)
        -> Result<Job, JobTableError>;

    /// Newest first.
    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>, JobTableError>;

    /// Rows in `status` whose `updated_at` is before `updated_before`, oldest
    /// first. For `pending_upload` rows `updated_at` equals `created_at`.
    async fn list_stale(
        &self,
        status: JobStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, JobTableError>;

    /// Delete a row only while it is still `pending_upload`. Returns whether a
    /// row was removed.
    async fn delete_abandoned(&self, job_id: Uuid) -> Result<bool, JobTableError>;

    async fn health_check(&self) -> Result<(), JobTableError>;
}

#[derive(Debug, thiserror::Error)]
pub enum JobTableError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {0} already exists")]
    Duplicate(Uuid),

    #[error("Job {job_id} is {actual}, expected {expected}")]
    Conflict {
        job_id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Job {job_id} run from attempt {attempt} was superseded; row is on attempt {current}")]
    Superseded {
        job_id: Uuid,
        attempt: i32,
        current: i32,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt job row: {0}")]
    Corrupt(String),
}
