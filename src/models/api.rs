use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus};
use crate::models::result::{AnalysisResult, FoodBrief, NutritionSummary};

/// Body of `POST /upload`, discriminated by its `type` field.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadRequest {
    Presigned(PresignedUploadRequest),
    Confirm(ConfirmUploadRequest),
}

/// Request a pre-signed PUT URL for a new job.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PresignedUploadRequest {
    #[garde(length(min = 1, max = 255))]
    pub filename: String,

    #[garde(length(min = 3, max = 127))]
    pub content_type: String,
}

/// Confirm that the asset was PUT to the pre-signed URL.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConfirmUploadRequest {
    #[garde(length(min = 1, max = 64))]
    pub job_id: String,
}

/// Response after issuing an upload URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignedUploadResponse {
    pub job_id: Uuid,
    pub upload_url: String,
    pub status: JobStatus,
    pub message: String,
    pub expires_at: DateTime<Utc>,
    /// Headers the PUT must carry verbatim (content type, encryption).
    pub required_headers: BTreeMap<String, String>,
}

/// Response after confirming an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmUploadResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// Response for `GET /status/{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for StatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            filename: job.filename.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            attempt_count: job.attempt_count,
            error: job.error.clone(),
        }
    }
}

/// Response for `GET /results/{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nutrition_summary: Option<NutritionSummary>,
    #[serde(default)]
    pub detected_foods: Vec<FoodBrief>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detailed_results: Option<AnalysisResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultsQuery {
    #[serde(default)]
    pub detailed: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<StatusResponse>,
    pub count: usize,
}
