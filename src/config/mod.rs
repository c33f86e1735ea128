use std::time::Duration;

use serde::Deserialize;
use strum::{Display, EnumString};

/// Which backends the process wires up.
///
/// `Local` keeps the job table, queue and object store in memory inside one
/// process. `Cloud` uses Postgres, Redis and S3.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendMode {
    #[default]
    Local,
    Cloud,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub backend_mode: BackendMode,

    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Externally reachable base URL; local-mode pre-signed URLs point here.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// PostgreSQL connection string (cloud)
    pub database_url: Option<String>,

    /// Redis connection string for the work queue (cloud)
    pub redis_url: Option<String>,

    /// Key prefix for the Redis work queue
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    pub s3_bucket: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    /// S3-compatible endpoint URL. When unset, `s3_region` names an AWS region.
    pub s3_endpoint: Option<String>,
    #[serde(default = "default_s3_region")]
    pub s3_region: String,
    #[serde(default)]
    pub s3_path_style: bool,

    /// Inference endpoint the cloud worker posts media to
    pub analyzer_url: Option<String>,
    pub analyzer_api_token: Option<String>,

    /// Value required in `x-amz-server-side-encryption` on every upload
    #[serde(default = "default_sse_algorithm")]
    pub sse_algorithm: String,

    #[serde(default = "default_upload_url_ttl_secs")]
    pub upload_url_ttl_secs: u64,
    #[serde(default = "default_download_url_ttl_secs")]
    pub download_url_ttl_secs: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_redelivery_delay_secs")]
    pub redelivery_delay_secs: u64,
    #[serde(default = "default_receive_wait_ms")]
    pub receive_wait_ms: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_pending_upload_ttl_secs")]
    pub pending_upload_ttl_secs: u64,
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,
    #[serde(default = "default_uploaded_grace_secs")]
    pub uploaded_grace_secs: u64,
    /// Queued rows untouched this long get a fresh message.
    #[serde(default = "default_queued_timeout_secs")]
    pub queued_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_purge_abandoned")]
    pub purge_abandoned: bool,
    /// Sweeper binary: run one pass and exit.
    #[serde(default)]
    pub sweep_once: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_queue_prefix() -> String {
    "media_pipeline".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_sse_algorithm() -> String {
    "aws:kms".to_string()
}

fn default_upload_url_ttl_secs() -> u64 {
    900
}

fn default_download_url_ttl_secs() -> u64 {
    3600
}

fn default_max_upload_bytes() -> usize {
    500 * 1024 * 1024
}

fn default_max_attempts() -> i32 {
    3
}

fn default_lease_secs() -> u64 {
    900
}

fn default_redelivery_delay_secs() -> u64 {
    5
}

fn default_receive_wait_ms() -> u64 {
    1000
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_pending_upload_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_processing_timeout_secs() -> u64 {
    3600
}

fn default_uploaded_grace_secs() -> u64 {
    300
}

fn default_queued_timeout_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_purge_abandoned() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend_mode: BackendMode::default(),
            bind_addr: default_bind_addr(),
            public_base_url: default_public_base_url(),
            database_url: None,
            redis_url: None,
            queue_prefix: default_queue_prefix(),
            s3_bucket: None,
            s3_access_key: None,
            s3_secret_key: None,
            s3_endpoint: None,
            s3_region: default_s3_region(),
            s3_path_style: false,
            analyzer_url: None,
            analyzer_api_token: None,
            sse_algorithm: default_sse_algorithm(),
            upload_url_ttl_secs: default_upload_url_ttl_secs(),
            download_url_ttl_secs: default_download_url_ttl_secs(),
            max_upload_bytes: default_max_upload_bytes(),
            max_attempts: default_max_attempts(),
            lease_secs: default_lease_secs(),
            redelivery_delay_secs: default_redelivery_delay_secs(),
            receive_wait_ms: default_receive_wait_ms(),
            worker_concurrency: default_worker_concurrency(),
            pending_upload_ttl_secs: default_pending_upload_ttl_secs(),
            processing_timeout_secs: default_processing_timeout_secs(),
            uploaded_grace_secs: default_uploaded_grace_secs(),
            queued_timeout_secs: default_queued_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            purge_abandoned: default_purge_abandoned(),
            sweep_once: false,
        }
    }
}

/// Connection settings only cloud mode needs.
#[derive(Debug, Clone)]
pub struct CloudSettings {
    pub database_url: String,
    pub redis_url: String,
    pub s3_bucket: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub analyzer_url: String,
}

/// How upload and download URLs are issued.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub upload_url_ttl: Duration,
    pub download_url_ttl: Duration,
    pub sse_algorithm: String,
}

/// Worker loop tunables.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_attempts: i32,
    pub lease: Duration,
    pub redelivery_delay: Duration,
    pub receive_wait: Duration,
    pub concurrency: usize,
}

impl WorkerSettings {
    /// Leases are extended three times per lease window.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(10))
    }
}

/// Retention and recovery thresholds for the sweeper.
#[derive(Debug, Clone)]
pub struct SweepPolicy {
    pub pending_upload_ttl: Duration,
    pub processing_timeout: Duration,
    pub uploaded_grace: Duration,
    pub queued_timeout: Duration,
    pub max_attempts: i32,
    pub purge_abandoned: bool,
    pub batch_size: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Required cloud settings, or the name of the first missing variable.
    pub fn cloud(&self) -> Result<CloudSettings, ConfigError> {
        fn required(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string)
                .ok_or(ConfigError::Missing(name))
        }

        Ok(CloudSettings {
            database_url: required(&self.database_url, "DATABASE_URL")?,
            redis_url: required(&self.redis_url, "REDIS_URL")?,
            s3_bucket: required(&self.s3_bucket, "S3_BUCKET")?,
            s3_access_key: required(&self.s3_access_key, "S3_ACCESS_KEY")?,
            s3_secret_key: required(&self.s3_secret_key, "S3_SECRET_KEY")?,
            analyzer_url: required(&self.analyzer_url, "ANALYZER_URL")?,
        })
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            upload_url_ttl: Duration::from_secs(self.upload_url_ttl_secs),
            download_url_ttl: Duration::from_secs(self.download_url_ttl_secs),
            sse_algorithm: self.sse_algorithm.clone(),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            max_attempts: self.max_attempts.max(1),
            lease: Duration::from_secs(self.lease_secs),
            redelivery_delay: Duration::from_secs(self.redelivery_delay_secs),
            receive_wait: Duration::from_millis(self.receive_wait_ms),
            concurrency: self.worker_concurrency.max(1),
        }
    }

    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            pending_upload_ttl: Duration::from_secs(self.pending_upload_ttl_secs),
            processing_timeout: Duration::from_secs(self.processing_timeout_secs),
            uploaded_grace: Duration::from_secs(self.uploaded_grace_secs),
            queued_timeout: Duration::from_secs(self.queued_timeout_secs),
            max_attempts: self.max_attempts.max(1),
            purge_abandoned: self.purge_abandoned,
            batch_size: 100,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0} for cloud mode")]
    Missing(&'static str),

    #[error("Backend initialization failed: {0}")]
    Backend(String),
}
