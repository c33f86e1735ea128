use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::models::job::Job;
use crate::models::result::{
    AnalysisResult, DetectedItem, MediaKind, NutritionSummary, ProcessingInfo,
};

/// The opaque inference step: turns downloaded media into a result document.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, job: &Job, media: &[u8]) -> Result<AnalysisResult, AnalysisError>;
}

fn media_kind(job: &Job) -> Result<MediaKind, AnalysisError> {
    MediaKind::from_content_type(&job.content_type)
        .ok_or_else(|| AnalysisError::UnsupportedMedia(job.content_type.clone()))
}

/// Local stand-in for the GPU pipeline. Reports what it was given and
/// detects nothing.
#[derive(Debug, Default, Clone)]
pub struct ProbeAnalyzer;

#[async_trait]
impl Analyzer for ProbeAnalyzer {
    async fn analyze(&self, job: &Job, media: &[u8]) -> Result<AnalysisResult, AnalysisError> {
        if media.is_empty() {
            return Err(AnalysisError::EmptyMedia);
        }
        let media_type = media_kind(job)?;

        Ok(AnalysisResult {
            job_id: job.job_id,
            media_type,
            detected_items: Vec::new(),
            meal_summary: NutritionSummary::default(),
            processing_info: ProcessingInfo {
                analyzer: "probe".to_string(),
                input_bytes: media.len() as u64,
                frames_processed: (media_type == MediaKind::Image).then_some(1),
            },
        })
    }
}

/// Shape the inference service answers with.
#[derive(Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    detected_items: Vec<DetectedItem>,
    meal_summary: NutritionSummary,
    #[serde(default)]
    frames_processed: Option<u32>,
}

/// Client for a remote inference endpoint. Posts the raw media and reads
/// back detections and meal totals.
pub struct HttpAnalyzer {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpAnalyzer {
    pub fn new(endpoint: String, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint,
            api_token,
        }
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, job: &Job, media: &[u8]) -> Result<AnalysisResult, AnalysisError> {
        let media_type = media_kind(job)?;

        let mut request = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, &job.content_type)
            .query(&[
                ("job_id", job.job_id.to_string()),
                ("media_type", media_type.to_string()),
            ])
            .body(media.to_vec());
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(AnalysisError::Http)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Inference {
                status: status.as_u16(),
                body,
            });
        }

        let inference: InferenceResponse = response.json().await.map_err(AnalysisError::Http)?;

        Ok(AnalysisResult {
            job_id: job.job_id,
            media_type,
            detected_items: inference.detected_items,
            meal_summary: inference.meal_summary,
            processing_info: ProcessingInfo {
                analyzer: "http".to_string(),
                input_bytes: media.len() as u64,
                frames_processed: inference.frames_processed,
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference service returned HTTP {status}: {body}")]
    Inference { status: u16, body: String },

    #[error("Unsupported media type: {0}")]
    UnsupportedMedia(String),

    #[error("Downloaded media is empty")]
    EmptyMedia,

    #[error("Analysis failed: {0}")]
    Other(String),
}
