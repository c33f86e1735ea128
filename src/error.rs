//! Service-level error taxonomy and its HTTP rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::models::job::JobStatus;
use crate::services::job_table::JobTableError;
use crate::services::queue::QueueError;
use crate::services::storage::StorageError;

/// Stable error codes carried in every error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ErrorCode {
    InvalidRequest,
    InvalidContentType,
    JobNotFound,
    InvalidState,
    ConflictingState,
    NotReady,
    JobFailed,
    StorageUnavailable,
    QueueUnavailable,
    JobTableUnavailable,
}

impl ErrorCode {
    /// Transient infrastructure faults: the caller should retry with backoff.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorCode::StorageUnavailable
                | ErrorCode::QueueUnavailable
                | ErrorCode::JobTableUnavailable
                | ErrorCode::NotReady
        )
    }
}

/// `{error_code, message, retriable}` body returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub retriable: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Content type '{0}' is not an accepted video or image type")]
    InvalidContentType(String),

    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("Job {job_id} is {status}; the operation is not allowed in that state")]
    InvalidState { job_id: Uuid, status: JobStatus },

    #[error("Job {job_id} moved to {actual} before the write from {expected} landed")]
    ConflictingState {
        job_id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Job {job_id} is {status}; results are not ready yet")]
    NotReady { job_id: Uuid, status: JobStatus },

    #[error("Job {job_id} failed: {error}")]
    JobFailed { job_id: Uuid, error: String },

    #[error("Object store unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),

    #[error("Work queue unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),

    #[error("Job table unavailable: {0}")]
    JobTableUnavailable(String),
}

impl From<JobTableError> for PipelineError {
    fn from(err: JobTableError) -> Self {
        match err {
            JobTableError::NotFound(id) => PipelineError::JobNotFound(id.to_string()),
            JobTableError::Conflict {
                job_id,
                expected,
                actual,
            } => PipelineError::ConflictingState {
                job_id,
                expected,
                actual,
            },
            JobTableError::Superseded { job_id, .. } => PipelineError::ConflictingState {
                job_id,
                expected: JobStatus::Processing,
                actual: JobStatus::Processing,
            },
            other => PipelineError::JobTableUnavailable(other.to_string()),
        }
    }
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            PipelineError::InvalidContentType(_) => ErrorCode::InvalidContentType,
            PipelineError::JobNotFound(_) => ErrorCode::JobNotFound,
            PipelineError::InvalidState { .. } => ErrorCode::InvalidState,
            PipelineError::ConflictingState { .. } => ErrorCode::ConflictingState,
            PipelineError::NotReady { .. } => ErrorCode::NotReady,
            PipelineError::JobFailed { .. } => ErrorCode::JobFailed,
            PipelineError::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
            PipelineError::QueueUnavailable(_) => ErrorCode::QueueUnavailable,
            PipelineError::JobTableUnavailable(_) => ErrorCode::JobTableUnavailable,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.code() {
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::JobNotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidState | ErrorCode::ConflictingState => StatusCode::CONFLICT,
            ErrorCode::InvalidContentType => StatusCode::UNPROCESSABLE_ENTITY,
            // 425 Too Early
            ErrorCode::NotReady => StatusCode::from_u16(425).unwrap_or(StatusCode::ACCEPTED),
            ErrorCode::JobFailed => StatusCode::GONE,
            ErrorCode::StorageUnavailable
            | ErrorCode::QueueUnavailable
            | ErrorCode::JobTableUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error_code: self.code(),
            message: self.to_string(),
            retriable: self.code().is_retriable(),
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, error_code = %self.code(), "Request failed on infrastructure");
        } else {
            tracing::debug!(error = %self, error_code = %self.code(), "Request rejected");
        }
        (status, Json(self.envelope())).into_response()
    }
}
