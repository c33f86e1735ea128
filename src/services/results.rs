use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::api::{JobListResponse, ResultsResponse, StatusResponse};
use crate::models::job::{Job, JobStatus};
use crate::models::result::AnalysisResult;
use crate::services::job_table::JobTable;
use crate::services::parse_job_id;
use crate::services::storage::{ObjectStore, StorageError};

pub const DEFAULT_LIST_LIMIT: i64 = 20;
pub const MAX_LIST_LIMIT: i64 = 100;

/// Read-only view over the job table for clients.
pub struct StatusService {
    jobs: Arc<dyn JobTable>,
    storage: Arc<dyn ObjectStore>,
    download_url_ttl: Duration,
}

impl StatusService {
    pub fn new(jobs: Arc<dyn JobTable>, storage: Arc<dyn ObjectStore>, download_url_ttl: Duration) -> Self {
        Self {
            jobs,
            storage,
            download_url_ttl,
        }
    }

    async fn load(&self, job_id: Uuid) -> Result<Job, PipelineError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))
    }

    pub async fn get_status(&self, raw_job_id: &str) -> Result<StatusResponse, PipelineError> {
        let job_id = parse_job_id(raw_job_id)?;
        let job = self.load(job_id).await?;
        Ok(StatusResponse::from(&job))
    }

    /// Summary plus a download URL for the full document. With `detailed`,
    /// the document itself is inlined; if it cannot be read the summary is
    /// still returned with a warning.
    pub async fn get_results(
        &self,
        raw_job_id: &str,
        detailed: bool,
    ) -> Result<ResultsResponse, PipelineError> {
        let job_id = parse_job_id(raw_job_id)?;
        let job = self.load(job_id).await?;

        match job.status {
            JobStatus::Completed => {}
            JobStatus::Failed => {
                return Err(PipelineError::JobFailed {
                    job_id,
                    error: job.error.unwrap_or_else(|| "unknown error".to_string()),
                })
            }
            status => return Err(PipelineError::NotReady { job_id, status }),
        }

        let result_key = job.result_key.as_deref().ok_or_else(|| {
            PipelineError::JobTableUnavailable(format!("completed job {} has no result_key", job_id))
        })?;

        let download_url = self
            .storage
            .presign_get(result_key, self.download_url_ttl)
            .await?;

        let mut response = ResultsResponse {
            job_id,
            status: job.status,
            nutrition_summary: job.summary.as_ref().map(|s| s.nutrition.clone()),
            detected_foods: job
                .summary
                .as_ref()
                .map(|s| s.detected_foods.clone())
                .unwrap_or_default(),
            download_url: Some(download_url),
            completed_at: job.completed_at,
            detailed_results: None,
            warning: None,
        };

        if detailed {
            match self.fetch_document(result_key).await {
                Ok(document) => response.detailed_results = Some(document),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not inline result document");
                    response.warning = Some(format!("detailed results unavailable: {}", e));
                }
            }
        }

        Ok(response)
    }

    async fn fetch_document(&self, key: &str) -> Result<AnalysisResult, StorageError> {
        let bytes = self.storage.get(key).await?;
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Config(format!("malformed result document: {}", e)))
    }

    /// Newest jobs first, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<i64>,
    ) -> Result<JobListResponse, PipelineError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let jobs: Vec<StatusResponse> = self
            .jobs
            .list(status, limit)
            .await?
            .iter()
            .map(StatusResponse::from)
            .collect();
        Ok(JobListResponse {
            count: jobs.len(),
            jobs,
        })
    }
}
