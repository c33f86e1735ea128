//! End-to-end tests over real HTTP against a local-mode server.
//!
//! Each test binds the full router (API plus local object store) to an
//! ephemeral port with an in-process worker pool, then drives it with the
//! reference client exactly as an external caller would.
//!
//! Run with: cargo test --test e2e_test -- --nocapture

mod fixtures;
mod helpers;

use std::sync::Arc;
use std::time::Duration;

use fixtures::*;
use helpers::*;
use media_pipeline::{
    client::{ClientError, FixedInterval, PipelineClient, PollOutcome},
    error::ErrorCode,
    models::job::JobStatus,
};
use uuid::Uuid;

fn fast_polling() -> FixedInterval {
    FixedInterval {
        interval: Duration::from_millis(50),
        max_attempts: 200,
    }
}

#[tokio::test]
async fn test_e2e_health_check() {
    let server = TestServer::start(Arc::new(FlakyAnalyzer::reliable())).await;

    let response = reqwest::get(format!("{}/health", server.base_url)).await.unwrap();
    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend_mode"], "local");
    assert_eq!(body["checks"]["job_table"]["status"], "ok");

    server.stop().await;
}

/// Scenario A: upload, confirm, poll to completion, follow the download URL.
#[tokio::test]
async fn test_e2e_video_upload_to_results() {
    let server = TestServer::start(Arc::new(FlakyAnalyzer::reliable())).await;
    let client = PipelineClient::new(&server.base_url);

    let upload = client
        .request_upload(MEAL_VIDEO.filename, MEAL_VIDEO.content_type)
        .await
        .unwrap();
    assert_eq!(upload.status, JobStatus::PendingUpload);
    assert!(upload.upload_url.starts_with(&server.base_url));
    assert_eq!(upload.required_headers.get("Content-Type").map(String::as_str), Some("video/mp4"));

    client.upload_asset(&upload, MEAL_VIDEO.bytes.to_vec()).await.unwrap();
    let ack = client.confirm_upload(upload.job_id).await.unwrap();
    assert_eq!(ack.status, JobStatus::Queued);

    let results = match client.wait_for_completion(upload.job_id, &fast_polling()).await.unwrap() {
        PollOutcome::Completed(results) => results,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(results.job_id, upload.job_id);
    let summary = results.nutrition_summary.clone().expect("summary missing");
    assert!(summary.num_food_items > 0);

    let download_url = results.download_url.expect("download_url missing");
    let document = client.fetch_result_document(&download_url).await.unwrap();
    assert_eq!(document.job_id, upload.job_id);
    assert_eq!(document.meal_summary, summary);
    assert!(!document.detected_items.is_empty());

    let status = client.get_status(upload.job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.attempt_count, 1);
    assert!(status.completed_at.is_some());

    server.stop().await;
}

/// Scenario B: a non-media content type is refused and leaves no job.
#[tokio::test]
async fn test_e2e_rejects_non_media_content_type() {
    let server = TestServer::start(Arc::new(FlakyAnalyzer::reliable())).await;
    let client = PipelineClient::new(&server.base_url);

    let err = client
        .request_upload(ARCHIVE.filename, ARCHIVE.content_type)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Api { status: 422, .. }), "{:?}", err);
    assert_eq!(err.error_code(), Some(ErrorCode::InvalidContentType));
    assert!(!err.is_retriable());

    let listing: serde_json::Value = reqwest::get(format!("{}/jobs", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["count"], 0);

    server.stop().await;
}

/// Scenario C: confirming a job id that was never issued.
#[tokio::test]
async fn test_e2e_confirm_unknown_job_is_not_found() {
    let server = TestServer::start(Arc::new(FlakyAnalyzer::reliable())).await;
    let client = PipelineClient::new(&server.base_url);

    let err = client.confirm_upload(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ClientError::Api { status: 404, .. }), "{:?}", err);
    assert_eq!(err.error_code(), Some(ErrorCode::JobNotFound));

    let response = reqwest::get(format!("{}/status/not-a-job", server.base_url)).await.unwrap();
    assert_eq!(response.status().as_u16(), 404);

    server.stop().await;
}

#[tokio::test]
async fn test_e2e_upload_without_required_headers_is_rejected_by_store() {
    let server = TestServer::start(Arc::new(FlakyAnalyzer::reliable())).await;
    let client = PipelineClient::new(&server.base_url);
    let upload = client
        .request_upload(PLATE_PHOTO.filename, PLATE_PHOTO.content_type)
        .await
        .unwrap();

    // No encryption header.
    let response = reqwest::Client::new()
        .put(&upload.upload_url)
        .header("Content-Type", PLATE_PHOTO.content_type)
        .body(PLATE_PHOTO.bytes.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);

    // Content type differs from the one declared.
    let mut tampered = upload.clone();
    tampered
        .required_headers
        .insert("Content-Type".to_string(), "image/jpeg".to_string());
    let err = client
        .upload_asset(&tampered, PLATE_PHOTO.bytes.to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::UploadRejected { status: 403, .. }), "{:?}", err);

    server.stop().await;
}

#[tokio::test]
async fn test_e2e_results_before_completion_are_not_ready() {
    let server = TestServer::start(Arc::new(FlakyAnalyzer::reliable())).await;
    let client = PipelineClient::new(&server.base_url);
    let upload = client
        .request_upload(PLATE_PHOTO.filename, PLATE_PHOTO.content_type)
        .await
        .unwrap();

    let err = client.get_results(upload.job_id, false).await.unwrap_err();
    assert!(matches!(err, ClientError::Api { status: 425, .. }), "{:?}", err);
    assert_eq!(err.error_code(), Some(ErrorCode::NotReady));

    server.stop().await;
}

/// Scenario D over HTTP: two analyzer faults, success on the third attempt.
#[tokio::test]
async fn test_e2e_transient_analyzer_faults_are_retried() {
    let analyzer = Arc::new(FlakyAnalyzer::failing_first(2));
    let server = TestServer::start(analyzer.clone()).await;
    let client = PipelineClient::new(&server.base_url);

    let outcome = client
        .submit(PLATE_PHOTO.filename, PLATE_PHOTO.content_type, PLATE_PHOTO.bytes.to_vec(), &fast_polling())
        .await
        .unwrap();
    let results = match outcome {
        PollOutcome::Completed(results) => results,
        other => panic!("expected completion, got {:?}", other),
    };

    let status = client.get_status(results.job_id).await.unwrap();
    assert_eq!(status.attempt_count, 3);
    assert!(status.error.is_none());
    assert_eq!(analyzer.calls(), 3);

    server.stop().await;
}

#[tokio::test]
async fn test_e2e_exhausted_retries_surface_failure() {
    let server = TestServer::start(Arc::new(FlakyAnalyzer::always_failing())).await;
    let client = PipelineClient::new(&server.base_url);

    let outcome = client
        .submit(MEAL_VIDEO.filename, MEAL_VIDEO.content_type, MEAL_VIDEO.bytes.to_vec(), &fast_polling())
        .await
        .unwrap();
    let (job_id, error) = match outcome {
        PollOutcome::Failed { job_id, error } => (job_id, error),
        other => panic!("expected failure, got {:?}", other),
    };
    assert!(error.contains("simulated GPU fault"));

    let err = client.get_results(job_id, false).await.unwrap_err();
    assert!(matches!(err, ClientError::Api { status: 410, .. }), "{:?}", err);

    server.stop().await;
}

#[tokio::test]
async fn test_e2e_poll_timeout_is_not_failure() {
    let server = TestServer::start(Arc::new(FlakyAnalyzer::reliable())).await;
    let client = PipelineClient::new(&server.base_url);

    // Never uploaded or confirmed, so it stays pending.
    let upload = client
        .request_upload(PLATE_PHOTO.filename, PLATE_PHOTO.content_type)
        .await
        .unwrap();
    let strategy = FixedInterval {
        interval: Duration::from_millis(10),
        max_attempts: 3,
    };
    match client.wait_for_completion(upload.job_id, &strategy).await.unwrap() {
        PollOutcome::TimedOut { job_id, last_status } => {
            assert_eq!(job_id, upload.job_id);
            assert_eq!(last_status, JobStatus::PendingUpload);
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_e2e_detailed_results_and_listing() {
    let server = TestServer::start(Arc::new(FlakyAnalyzer::reliable())).await;
    let client = PipelineClient::new(&server.base_url);

    let mut completed = Vec::new();
    for media in ALL_MEDIA {
        match client
            .submit(media.filename, media.content_type, media.bytes.to_vec(), &fast_polling())
            .await
            .unwrap()
        {
            PollOutcome::Completed(results) => completed.push(results.job_id),
            other => panic!("{}: {:?}", media.description, other),
        }
    }

    let detailed = client.get_results(completed[0], true).await.unwrap();
    let document = detailed.detailed_results.expect("document not inlined");
    assert_eq!(document.job_id, completed[0]);
    assert!(detailed.warning.is_none());

    let listing: serde_json::Value = reqwest::get(format!(
        "{}/jobs?status=completed&limit=1",
        server.base_url
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(listing["count"], 1);
    assert_eq!(listing["jobs"][0]["status"], "completed");

    server.stop().await;
}

#[tokio::test]
async fn test_e2e_confirm_whose_response_was_lost_still_completes() {
    let analyzer = Arc::new(FlakyAnalyzer::reliable());
    let server = TestServer::start(analyzer.clone()).await;
    let proxy = LossyProxy::start(&server.base_url, 1).await;
    let client = PipelineClient::new(&proxy.base_url);

    // The first confirmation commits upstream but the client sees a 503; its
    // retry then meets a job that is already queued.
    let outcome = client
        .submit(PLATE_PHOTO.filename, PLATE_PHOTO.content_type, PLATE_PHOTO.bytes.to_vec(), &fast_polling())
        .await
        .unwrap();
    let results = match outcome {
        PollOutcome::Completed(results) => results,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(analyzer.calls(), 1);

    let status = client.get_status(results.job_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.attempt_count, 1);

    proxy.stop();
    server.stop().await;
}

#[tokio::test]
async fn test_e2e_first_try_double_confirm_is_reported() {
    let server = TestServer::start(Arc::new(FlakyAnalyzer::reliable())).await;
    let client = PipelineClient::new(&server.base_url);

    let upload = client
        .request_upload(PLATE_PHOTO.filename, PLATE_PHOTO.content_type)
        .await
        .unwrap();
    client.upload_asset(&upload, PLATE_PHOTO.bytes.to_vec()).await.unwrap();
    client.confirm_upload(upload.job_id).await.unwrap();

    // A first-try InvalidState is the caller's own double confirm, not a lost
    // response, and is reported as is.
    let err = client
        .confirm_with_retry(upload.job_id, &fast_polling())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::InvalidState));

    server.stop().await;
}
