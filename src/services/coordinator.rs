use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use garde::Validate;
use uuid::Uuid;

use crate::config::UploadPolicy;
use crate::error::PipelineError;
use crate::models::api::{ConfirmUploadResponse, PresignedUploadRequest, PresignedUploadResponse};
use crate::models::job::{Job, JobStatus, Transition};
use crate::services::job_table::{JobTable, JobTableError};
use crate::services::parse_job_id;
use crate::services::queue::WorkQueue;
use crate::services::storage::ObjectStore;

/// Accepted media types, each with the extension used when the filename
/// carries none.
const ALLOWED_CONTENT_TYPES: &[(&str, &str)] = &[
    ("video/mp4", "mp4"),
    ("video/quicktime", "mov"),
    ("video/x-msvideo", "avi"),
    ("video/x-matroska", "mkv"),
    ("video/webm", "webm"),
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/webp", "webp"),
    ("image/bmp", "bmp"),
    ("image/tiff", "tiff"),
];

/// Match a declared content type against the allow-list, ignoring case and
/// parameters. Returns the canonical type and its default extension.
pub fn normalize_content_type(declared: &str) -> Option<(&'static str, &'static str)> {
    let essence = declared.split(';').next()?.trim().to_ascii_lowercase();
    ALLOWED_CONTENT_TYPES
        .iter()
        .find(|(ct, _)| *ct == essence)
        .copied()
}

/// Object key for a job's input: a function of the job id and extension
/// only, so client filenames never shape storage paths.
pub fn input_key(job_id: Uuid, filename: &str, default_ext: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|e| (1..=5).contains(&e.len()) && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| default_ext.to_string());
    format!("uploads/{}/input.{}", job_id, ext)
}

/// Brokers assets into the pipeline without the bytes ever passing through it.
pub struct UploadCoordinator {
    jobs: Arc<dyn JobTable>,
    queue: Arc<dyn WorkQueue>,
    storage: Arc<dyn ObjectStore>,
    policy: UploadPolicy,
}

impl UploadCoordinator {
    pub fn new(
        jobs: Arc<dyn JobTable>,
        queue: Arc<dyn WorkQueue>,
        storage: Arc<dyn ObjectStore>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            jobs,
            queue,
            storage,
            policy,
        }
    }

    /// Create a `pending_upload` job and a short-lived PUT URL for its input.
    pub async fn request_upload(
        &self,
        request: &PresignedUploadRequest,
    ) -> Result<PresignedUploadResponse, PipelineError> {
        request
            .validate()
            .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;

        let (content_type, default_ext) = normalize_content_type(&request.content_type)
            .ok_or_else(|| PipelineError::InvalidContentType(request.content_type.clone()))?;

        let job_id = Uuid::new_v4();
        let key = input_key(job_id, &request.filename, default_ext);

        // Sign before writing the row so a storage fault leaves nothing behind.
        let upload = self
            .storage
            .presign_put(&key, content_type, self.policy.upload_url_ttl)
            .await?;

        let job = Job::new(job_id, request.filename.as_str(), content_type, key, Utc::now());
        self.jobs.create(&job).await?;

        metrics::counter!("upload_requests_total").increment(1);
        tracing::info!(
            job_id = %job_id,
            content_type = content_type,
            input_key = %job.input_key,
            "Issued pre-signed upload URL"
        );

        Ok(PresignedUploadResponse {
            job_id,
            upload_url: upload.url,
            status: JobStatus::PendingUpload,
            message: format!(
                "PUT the file to upload_url with required_headers, then confirm with {{\"type\":\"confirm\",\"job_id\":\"{}\"}}",
                job_id
            ),
            expires_at: upload.expires_at,
            required_headers: upload.required_headers,
        })
    }

    /// Move a job from `pending_upload` through `uploaded` to `queued` and
    /// publish it. Retrying after `QueueUnavailable` resumes from `uploaded`.
    ///
    /// The asset itself is not checked here; the worker's download is the
    /// real verification.
    pub async fn confirm_upload(&self, raw_job_id: &str) -> Result<ConfirmUploadResponse, PipelineError> {
        let job_id = parse_job_id(raw_job_id)?;
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))?;

        match job.status {
            JobStatus::PendingUpload => {
                self.jobs.transition(job_id, Transition::MarkUploaded).await?;
                tracing::info!(job_id = %job_id, from = "pending_upload", to = "uploaded", "Upload confirmed");
            }
            JobStatus::Uploaded => {
                tracing::info!(job_id = %job_id, "Resuming confirmation of uploaded job");
            }
            status => return Err(PipelineError::InvalidState { job_id, status }),
        }

        self.enqueue(job_id).await
    }

    async fn enqueue(&self, job_id: Uuid) -> Result<ConfirmUploadResponse, PipelineError> {
        if let Err(e) = self.queue.publish(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Publish failed; job left at uploaded");
            return Err(PipelineError::QueueUnavailable(e));
        }

        match self.jobs.transition(job_id, Transition::Enqueue).await {
            Ok(job) => {
                metrics::counter!("uploads_confirmed_total").increment(1);
                tracing::info!(job_id = %job_id, from = "uploaded", to = "queued", "Job queued");
                Ok(ConfirmUploadResponse {
                    job_id,
                    status: job.status,
                    message: "Upload confirmed and queued for processing".to_string(),
                })
            }
            // A concurrent confirmation got there first. Our extra message is
            // dropped by the worker's queued->processing guard.
            Err(JobTableError::Conflict { actual, .. }) => {
                tracing::info!(job_id = %job_id, status = %actual, "Job already queued by another confirmation");
                Ok(ConfirmUploadResponse {
                    job_id,
                    status: actual,
                    message: "Upload was already confirmed".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
