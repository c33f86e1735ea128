//! Object storage for uploaded assets and result documents.
//!
//! Clients never stream media through the API: they PUT and GET directly
//! against time-limited pre-signed URLs issued here.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;
pub mod s3_store;

pub use memory::MemoryObjectStore;
pub use s3_store::S3ObjectStore;

/// Header naming the server-side encryption the store must apply.
pub const SSE_HEADER: &str = "x-amz-server-side-encryption";

/// A pre-signed PUT plus the headers the uploader must send with it.
#[derive(Debug, Clone)]
pub struct PresignedUpload {
    pub url: String,
    pub required_headers: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

impl PresignedUpload {
    pub(crate) fn required_headers(content_type: &str, sse_algorithm: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("Content-Type".to_string(), content_type.to_string()),
            (SSE_HEADER.to_string(), sse_algorithm.to_string()),
        ])
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Issue a PUT URL scoped to `key` that only accepts `content_type` with
    /// the server-side encryption header set.
    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<PresignedUpload, StorageError>;

    /// Issue a GET URL scoped to `key`.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError>;

    /// Download an object. Missing objects are `StorageError::NotFound`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn health_check(&self) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object {0} not found")]
    NotFound(String),

    #[error("Object store returned HTTP {status} for {key}")]
    Status { status: u16, key: String },

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Pre-signed request rejected: {0}")]
    Rejected(String),
}
