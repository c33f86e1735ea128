//! Shared harness for in-process pipeline tests and local-mode HTTP tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use media_pipeline::{
    app_state::AppState,
    config::AppConfig,
    models::job::{Job, JobStatus, Transition},
    models::result::{AnalysisResult, DetectedItem, MediaKind, NutritionSummary, ProcessingInfo},
    routes,
    services::{
        analyzer::{AnalysisError, Analyzer},
        coordinator::UploadCoordinator,
        job_table::{JobTable, JobTableError, MemoryJobTable},
        queue::{Delivery, MemoryWorkQueue, QueueError, Receipt, WorkQueue},
        results::StatusService,
        storage::{MemoryObjectStore, SSE_HEADER},
        worker::{Worker, WorkerPool},
    },
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Local-mode config tuned for fast tests.
pub fn test_config() -> AppConfig {
    AppConfig {
        sse_algorithm: "AES256".to_string(),
        max_attempts: 3,
        lease_secs: 30,
        redelivery_delay_secs: 1,
        receive_wait_ms: 50,
        worker_concurrency: 2,
        pending_upload_ttl_secs: 3600,
        ..AppConfig::default()
    }
}

/// A plausible result document with one detected item.
pub fn sample_result(job: &Job, media: &[u8]) -> AnalysisResult {
    AnalysisResult {
        job_id: job.job_id,
        media_type: MediaKind::from_content_type(&job.content_type).unwrap_or(MediaKind::Image),
        detected_items: vec![DetectedItem {
            name: "fried rice".to_string(),
            volume_ml: Some(240.0),
            mass_g: Some(210.0),
            calories_kcal: Some(340.0),
            confidence: Some(0.88),
        }],
        meal_summary: NutritionSummary {
            total_food_volume_ml: 240.0,
            total_mass_g: 210.0,
            total_calories_kcal: 340.0,
            num_food_items: 1,
        },
        processing_info: ProcessingInfo {
            analyzer: "scripted".to_string(),
            input_bytes: media.len() as u64,
            frames_processed: Some(1),
        },
    }
}

/// Fails its first `failures` calls, then succeeds.
pub struct FlakyAnalyzer {
    failures: u32,
    delay: Duration,
    calls: AtomicU32,
}

impl FlakyAnalyzer {
    pub fn failing_first(failures: u32) -> Self {
        Self {
            failures,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    /// Each call takes `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn reliable() -> Self {
        Self::failing_first(0)
    }

    pub fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for FlakyAnalyzer {
    async fn analyze(&self, job: &Job, media: &[u8]) -> Result<AnalysisResult, AnalysisError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if call < self.failures {
            return Err(AnalysisError::Other(format!("simulated GPU fault #{}", call + 1)));
        }
        Ok(sample_result(job, media))
    }
}

/// Memory queue whose publish can be switched off.
#[derive(Default)]
pub struct FlakyQueue {
    inner: MemoryWorkQueue,
    fail_publish: AtomicBool,
}

impl FlakyQueue {
    pub fn set_publish_failing(&self, failing: bool) {
        self.fail_publish.store(failing, Ordering::SeqCst);
    }

    pub async fn in_flight(&self) -> usize {
        self.inner.in_flight().await
    }
}

#[async_trait]
impl WorkQueue for FlakyQueue {
    async fn publish(&self, job_id: Uuid) -> Result<(), QueueError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("simulated broker outage".to_string()));
        }
        self.inner.publish(job_id).await
    }

    async fn receive(&self, lease: Duration, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.inner.receive(lease, wait).await
    }

    async fn extend(&self, receipt: &Receipt, duration: Duration) -> Result<(), QueueError> {
        self.inner.extend(receipt, duration).await
    }

    async fn delete(&self, receipt: &Receipt) -> Result<(), QueueError> {
        self.inner.delete(receipt).await
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        self.inner.depth().await
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.inner.health_check().await
    }
}

/// One committed transition: `(from, to, attempt_count after)`.
pub type Step = (JobStatus, JobStatus, i32);

/// Memory job table that records every committed transition.
#[derive(Default)]
pub struct AuditedJobTable {
    inner: MemoryJobTable,
    log: Mutex<Vec<(Uuid, Step)>>,
}

impl AuditedJobTable {
    pub fn history(&self, job_id: Uuid) -> Vec<Step> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, step)| *step)
            .collect()
    }

    pub async fn backdate(&self, job_id: Uuid, to: DateTime<Utc>) -> bool {
        self.inner.backdate(job_id, to).await
    }
}

#[async_trait]
impl JobTable for AuditedJobTable {
    async fn create(&self, job: &Job) -> Result<(), JobTableError> {
        self.inner.create(job).await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, JobTableError> {
        self.inner.get(job_id).await
    }

    async fn transition(&self, job_id: Uuid, transition: Transition) -> Result<Job, JobTableError> {
        let from = transition.expected();
        let job = self.inner.transition(job_id, transition).await?;
        self.log
            .lock()
            .unwrap()
            .push((job_id, (from, job.status, job.attempt_count)));
        Ok(job)
    }

    async fn touch(&self, job_id: Uuid, expected: JobStatus, attempt: i32) -> Result<Job, JobTableError> {
        self.inner.touch(job_id, expected, attempt).await
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>, JobTableError> {
        self.inner.list(status, limit).await
    }

    async fn list_stale(
        &self,
        status: JobStatus,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, JobTableError> {
        self.inner.list_stale(status, updated_before, limit).await
    }

    async fn delete_abandoned(&self, job_id: Uuid) -> Result<bool, JobTableError> {
        self.inner.delete_abandoned(job_id).await
    }

    async fn health_check(&self) -> Result<(), JobTableError> {
        self.inner.health_check().await
    }
}

/// Split a local-store URL into its object key and capability token.
pub fn signed_parts(url: &str) -> (String, String) {
    let path = url.split("/local-store/").nth(1).expect("not a local-store URL");
    let (key, query) = path.split_once('?').expect("URL has no query");
    let token = query.strip_prefix("token=").expect("URL has no token");
    (key.to_string(), token.to_string())
}

/// All pipeline components wired in-process over audited memory backends.
pub struct Pipeline {
    pub config: AppConfig,
    pub jobs: Arc<AuditedJobTable>,
    pub queue: Arc<FlakyQueue>,
    pub storage: Arc<MemoryObjectStore>,
    pub coordinator: UploadCoordinator,
    pub status: StatusService,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let jobs = Arc::new(AuditedJobTable::default());
        let queue = Arc::new(FlakyQueue::default());
        let storage = Arc::new(MemoryObjectStore::new(&config.public_base_url, &config.sse_algorithm));
        let policy = config.upload_policy();
        let coordinator = UploadCoordinator::new(jobs.clone(), queue.clone(), storage.clone(), policy.clone());
        let status = StatusService::new(jobs.clone(), storage.clone(), policy.download_url_ttl);
        Self {
            config,
            jobs,
            queue,
            storage,
            coordinator,
            status,
        }
    }

    pub fn worker(&self, id: usize, analyzer: Arc<dyn Analyzer>) -> Worker {
        Worker::new(
            id,
            self.jobs.clone(),
            self.queue.clone(),
            self.storage.clone(),
            analyzer,
            self.config.worker_settings(),
        )
    }

    /// Request an upload URL and PUT `data` through it, as a client would.
    pub async fn upload(&self, filename: &str, content_type: &str, data: &[u8]) -> Uuid {
        let request = media_pipeline::models::api::PresignedUploadRequest {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
        };
        let upload = self.coordinator.request_upload(&request).await.unwrap();
        let (key, token) = signed_parts(&upload.upload_url);
        self.storage
            .accept_upload(
                &key,
                &token,
                upload.required_headers.get("Content-Type").map(String::as_str),
                upload.required_headers.get(SSE_HEADER).map(String::as_str),
                data.to_vec(),
            )
            .await
            .unwrap();
        upload.job_id
    }

    /// Upload and confirm; the job ends up `queued`.
    pub async fn submit(&self, filename: &str, content_type: &str, data: &[u8]) -> Uuid {
        let job_id = self.upload(filename, content_type, data).await;
        self.coordinator.confirm_upload(&job_id.to_string()).await.unwrap();
        job_id
    }

    pub async fn job(&self, job_id: Uuid) -> Job {
        self.jobs.get(job_id).await.unwrap().expect("job row missing")
    }
}

/// Local-mode API server with an in-process worker pool, bound to an
/// ephemeral port.
pub struct TestServer {
    pub base_url: String,
    pub state: AppState,
    shutdown: watch::Sender<bool>,
    pool: WorkerPool,
    server: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(analyzer: Arc<dyn Analyzer>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let config = AppConfig {
            public_base_url: base_url.clone(),
            ..test_config()
        };

        let store = Arc::new(MemoryObjectStore::new(&config.public_base_url, &config.sse_algorithm));
        let state = AppState::new(
            config,
            Arc::new(MemoryJobTable::new()),
            Arc::new(MemoryWorkQueue::new()),
            store.clone(),
            analyzer,
            Some(store),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let pool = WorkerPool::spawn(
            state.jobs.clone(),
            state.queue.clone(),
            state.storage.clone(),
            state.analyzer.clone(),
            state.config.worker_settings(),
            shutdown_rx,
        );

        let app = routes::router(state.clone(), None);
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            state,
            shutdown,
            pool,
            server,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.pool.join().await;
        self.server.abort();
    }
}

#[derive(Clone)]
struct ProxyState {
    upstream: String,
    http: reqwest::Client,
    lost_confirms: Arc<AtomicU32>,
}

/// HTTP proxy in front of a [`TestServer`] that forwards every request, but
/// swaps the answer to the first `lost_confirms` confirmations for a 503, as
/// if the connection dropped after the server committed.
pub struct LossyProxy {
    pub base_url: String,
    server: JoinHandle<()>,
}

impl LossyProxy {
    pub async fn start(upstream: &str, lost_confirms: u32) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let state = ProxyState {
            upstream: upstream.to_string(),
            http: reqwest::Client::new(),
            lost_confirms: Arc::new(AtomicU32::new(lost_confirms)),
        };
        let app = axum::Router::new().fallback(forward).with_state(state);
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { base_url, server }
    }

    pub fn stop(self) {
        self.server.abort();
    }
}

async fn forward(
    axum::extract::State(proxy): axum::extract::State<ProxyState>,
    method: axum::http::Method,
    uri: axum::http::Uri,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    use axum::http::header::CONTENT_TYPE;
    use axum::response::IntoResponse;

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let mut request = proxy
        .http
        .request(method, format!("{}{}", proxy.upstream, path))
        .body(body.clone());
    if let Some(content_type) = headers.get(CONTENT_TYPE) {
        request = request.header(CONTENT_TYPE, content_type.clone());
    }
    let response = request.send().await.unwrap();
    let status = response.status();
    let content_type = response.headers().get(CONTENT_TYPE).cloned();
    let bytes = response.bytes().await.unwrap();

    let is_confirm = uri.path() == "/upload"
        && serde_json::from_slice::<serde_json::Value>(&body)
            .map(|v| v["type"] == "confirm")
            .unwrap_or(false);
    let lose = is_confirm
        && proxy
            .lost_confirms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
    if lose {
        let envelope = media_pipeline::error::ErrorEnvelope {
            error_code: media_pipeline::error::ErrorCode::QueueUnavailable,
            message: "upstream connection reset".to_string(),
            retriable: true,
        };
        return (axum::http::StatusCode::SERVICE_UNAVAILABLE, axum::Json(envelope)).into_response();
    }

    let mut reply = (status, bytes).into_response();
    if let Some(content_type) = content_type {
        reply.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    reply
}
