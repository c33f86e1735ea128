//! Reference client: request an upload URL, PUT the asset, confirm, poll,
//! then fetch results.

pub mod poll;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use uuid::Uuid;

use crate::error::{ErrorCode, ErrorEnvelope};
use crate::models::api::{
    ConfirmUploadResponse, PresignedUploadResponse, ResultsResponse, StatusResponse,
};
use crate::models::job::JobStatus;
use crate::models::result::AnalysisResult;

pub use poll::{ExponentialBackoff, FixedInterval, PollStrategy};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned HTTP {status}: {} ({})", envelope.message, envelope.error_code)]
    Api {
        status: u16,
        envelope: ErrorEnvelope,
    },

    #[error("Unexpected HTTP {status}: {body}")]
    Unexpected { status: u16, body: String },

    #[error("Object store rejected the upload with HTTP {status}: {body}")]
    UploadRejected { status: u16, body: String },
}

impl ClientError {
    /// Worth retrying with backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            ClientError::Http(e) => e.is_timeout() || e.is_connect(),
            ClientError::Api { envelope, .. } => envelope.retriable,
            ClientError::Unexpected { status, .. } => *status >= 500,
            ClientError::UploadRejected { .. } => false,
        }
    }

    /// The API's error code, when the server answered with an envelope.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Api { envelope, .. } => Some(envelope.error_code),
            _ => None,
        }
    }
}

/// How a wait ended, from the client's point of view.
#[derive(Debug)]
pub enum PollOutcome {
    Completed(ResultsResponse),
    /// Terminal. Resubmit the asset rather than retrying this job id.
    Failed { job_id: Uuid, error: String },
    /// The job may still finish; check again later.
    TimedOut { job_id: Uuid, last_status: JobStatus },
}

pub struct PipelineClient {
    http: Client,
    base_url: String,
}

impl PipelineClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => Err(ClientError::Api {
                status: status.as_u16(),
                envelope,
            }),
            Err(_) => Err(ClientError::Unexpected {
                status: status.as_u16(),
                body,
            }),
        }
    }

    pub async fn request_upload(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<PresignedUploadResponse, ClientError> {
        let response = self
            .http
            .post(format!("{}/upload", self.base_url))
            .json(&json!({
                "type": "presigned",
                "filename": filename,
                "content_type": content_type,
            }))
            .send()
            .await?;
        Self::decode(response).await
    }

    /// PUT the asset straight to the object store with the signed headers.
    pub async fn upload_asset(
        &self,
        upload: &PresignedUploadResponse,
        data: Vec<u8>,
    ) -> Result<(), ClientError> {
        let mut request = self.http.put(&upload.upload_url).body(data);
        for (name, value) in &upload.required_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::UploadRejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    pub async fn confirm_upload(&self, job_id: Uuid) -> Result<ConfirmUploadResponse, ClientError> {
        let response = self
            .http
            .post(format!("{}/upload", self.base_url))
            .json(&json!({ "type": "confirm", "job_id": job_id }))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<StatusResponse, ClientError> {
        let response = self
            .http
            .get(format!("{}/status/{}", self.base_url, job_id))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn get_results(&self, job_id: Uuid, detailed: bool) -> Result<ResultsResponse, ClientError> {
        let response = self
            .http
            .get(format!("{}/results/{}", self.base_url, job_id))
            .query(&[("detailed", detailed)])
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Download the full result document from a pre-signed URL.
    pub async fn fetch_result_document(&self, download_url: &str) -> Result<AnalysisResult, ClientError> {
        let response = self.http.get(download_url).send().await?;
        Self::decode(response).await
    }

    /// Poll until the job is terminal or `strategy` gives up. Retriable
    /// errors count as an unchanged status.
    pub async fn wait_for_completion(
        &self,
        job_id: Uuid,
        strategy: &dyn PollStrategy,
    ) -> Result<PollOutcome, ClientError> {
        let mut last_status = JobStatus::PendingUpload;
        let mut attempt = 0u32;

        loop {
            match self.get_status(job_id).await {
                Ok(status) => {
                    last_status = status.status;
                    match status.status {
                        JobStatus::Completed => {
                            return Ok(PollOutcome::Completed(self.get_results(job_id, false).await?))
                        }
                        JobStatus::Failed => {
                            return Ok(PollOutcome::Failed {
                                job_id,
                                error: status.error.unwrap_or_else(|| "unknown error".to_string()),
                            })
                        }
                        _ => {}
                    }
                }
                Err(e) if e.is_retriable() => {
                    tracing::warn!(job_id = %job_id, error = %e, "Status poll failed, will retry");
                }
                Err(e) => return Err(e),
            }

            let Some(delay) = strategy.next_delay(attempt) else {
                return Ok(PollOutcome::TimedOut { job_id, last_status });
            };
            if attempt > 0 && attempt % 10 == 0 {
                tracing::info!(job_id = %job_id, attempt, status = %last_status, "Still waiting");
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Confirm, retrying retriable failures with `strategy`. A retry that
    /// finds the job already past `pending_upload` means an earlier attempt
    /// landed even though its response was lost; that counts as confirmed.
    pub async fn confirm_with_retry(
        &self,
        job_id: Uuid,
        strategy: &dyn PollStrategy,
    ) -> Result<JobStatus, ClientError> {
        let mut attempt = 0u32;
        loop {
            let err = match self.confirm_upload(job_id).await {
                Ok(ack) => return Ok(ack.status),
                Err(e) => e,
            };

            let already_state = matches!(
                err.error_code(),
                Some(ErrorCode::InvalidState | ErrorCode::ConflictingState)
            );
            if attempt > 0 && already_state {
                let status = self.get_status(job_id).await?.status;
                if status != JobStatus::PendingUpload {
                    tracing::info!(job_id = %job_id, status = %status, "Earlier confirmation had landed");
                    return Ok(status);
                }
                return Err(err);
            }
            if !err.is_retriable() {
                return Err(err);
            }

            let Some(delay) = strategy.next_delay(attempt) else {
                return Err(err);
            };
            tracing::warn!(job_id = %job_id, error = %err, "Confirm failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// The whole flow. Confirmation is retried while the queue is unavailable.
    pub async fn submit(
        &self,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
        strategy: &dyn PollStrategy,
    ) -> Result<PollOutcome, ClientError> {
        let upload = self.request_upload(filename, content_type).await?;
        tracing::info!(job_id = %upload.job_id, "Upload URL issued");
        self.upload_asset(&upload, data).await?;

        self.confirm_with_retry(upload.job_id, strategy).await?;
        self.wait_for_completion(upload.job_id, strategy).await
    }
}
