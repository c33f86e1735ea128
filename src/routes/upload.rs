use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use serde_json::Value;

use crate::app_state::AppState;
use crate::error::PipelineError;
use crate::models::api::UploadRequest;

/// Parse the `POST /upload` body. A body without `type` is a presigned
/// request.
pub(crate) fn parse_upload_request(body: &[u8]) -> Result<UploadRequest, PipelineError> {
    let mut value: Value = serde_json::from_slice(body)
        .map_err(|e| PipelineError::InvalidRequest(format!("body is not valid JSON: {}", e)))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| PipelineError::InvalidRequest("body must be a JSON object".to_string()))?;
    object
        .entry("type")
        .or_insert_with(|| Value::String("presigned".to_string()));

    serde_json::from_value(value).map_err(|e| PipelineError::InvalidRequest(e.to_string()))
}

/// POST /upload — issue a pre-signed URL, or confirm a finished upload.
pub async fn upload(State(state): State<AppState>, body: Bytes) -> Result<Response, PipelineError> {
    match parse_upload_request(&body)? {
        UploadRequest::Presigned(request) => {
            let response = state.coordinator.request_upload(&request).await?;
            Ok(Json(response).into_response())
        }
        UploadRequest::Confirm(request) => {
            request
                .validate()
                .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;
            let response = state.coordinator.confirm_upload(&request.job_id).await?;
            Ok(Json(response).into_response())
        }
    }
}
