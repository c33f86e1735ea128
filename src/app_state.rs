use std::sync::Arc;

use crate::config::{AppConfig, ConfigError};
use crate::db::{self, PgJobTable};
use crate::services::{
    analyzer::{Analyzer, HttpAnalyzer, ProbeAnalyzer},
    coordinator::UploadCoordinator,
    job_table::{JobTable, MemoryJobTable},
    queue::{MemoryWorkQueue, RedisWorkQueue, WorkQueue},
    results::StatusService,
    storage::{MemoryObjectStore, ObjectStore, S3ObjectStore},
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub jobs: Arc<dyn JobTable>,
    pub queue: Arc<dyn WorkQueue>,
    pub storage: Arc<dyn ObjectStore>,
    pub analyzer: Arc<dyn Analyzer>,
    pub coordinator: Arc<UploadCoordinator>,
    pub status: Arc<StatusService>,
    /// Set in local mode, where this process also serves pre-signed URLs.
    pub local_store: Option<Arc<MemoryObjectStore>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        jobs: Arc<dyn JobTable>,
        queue: Arc<dyn WorkQueue>,
        storage: Arc<dyn ObjectStore>,
        analyzer: Arc<dyn Analyzer>,
        local_store: Option<Arc<MemoryObjectStore>>,
    ) -> Self {
        let policy = config.upload_policy();
        let coordinator = UploadCoordinator::new(jobs.clone(), queue.clone(), storage.clone(), policy.clone());
        let status = StatusService::new(jobs.clone(), storage.clone(), policy.download_url_ttl);
        Self {
            config: Arc::new(config),
            jobs,
            queue,
            storage,
            analyzer,
            coordinator: Arc::new(coordinator),
            status: Arc::new(status),
            local_store,
        }
    }

    /// In-memory backends and the probe analyzer, all inside this process.
    pub fn local(config: AppConfig) -> Self {
        let store = Arc::new(MemoryObjectStore::new(&config.public_base_url, &config.sse_algorithm));
        Self::new(
            config,
            Arc::new(MemoryJobTable::new()),
            Arc::new(MemoryWorkQueue::new()),
            store.clone(),
            Arc::new(ProbeAnalyzer),
            Some(store),
        )
    }

    /// Postgres, Redis, S3 and the HTTP analyzer. Runs migrations.
    pub async fn cloud(config: AppConfig) -> Result<Self, ConfigError> {
        let cloud = config.cloud()?;

        tracing::info!("Connecting to PostgreSQL");
        let pool = db::init_pool(&cloud.database_url)
            .await
            .map_err(|e| ConfigError::Backend(format!("database: {}", e)))?;
        tracing::info!("Running database migrations");
        db::run_migrations(&pool)
            .await
            .map_err(|e| ConfigError::Backend(format!("migrations: {}", e)))?;

        tracing::info!("Connecting to Redis work queue");
        let queue = RedisWorkQueue::connect(&cloud.redis_url, &config.queue_prefix)
            .await
            .map_err(|e| ConfigError::Backend(format!("redis: {}", e)))?;

        tracing::info!(bucket = %cloud.s3_bucket, "Initializing S3 storage client");
        let storage = S3ObjectStore::new(
            &cloud.s3_bucket,
            &config.s3_region,
            config.s3_endpoint.as_deref(),
            &cloud.s3_access_key,
            &cloud.s3_secret_key,
            config.s3_path_style,
            &config.sse_algorithm,
        )
        .map_err(|e| ConfigError::Backend(format!("s3: {}", e)))?;

        let analyzer = HttpAnalyzer::new(cloud.analyzer_url, config.analyzer_api_token.clone());

        Ok(Self::new(
            config,
            Arc::new(PgJobTable::new(pool)),
            Arc::new(queue),
            Arc::new(storage),
            Arc::new(analyzer),
            None,
        ))
    }
}
