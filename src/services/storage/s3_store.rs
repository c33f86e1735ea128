use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use http02::{HeaderMap, HeaderName, HeaderValue};
use s3::creds::Credentials;
use s3::{Bucket, Region};

use super::{ObjectStore, PresignedUpload, StorageError};

/// Read by health checks; a 404 still proves the bucket is reachable.
const HEALTH_KEY: &str = "/.health";

/// Client for S3-compatible object storage.
pub struct S3ObjectStore {
    bucket: Box<Bucket>,
    sse_algorithm: String,
}

impl S3ObjectStore {
    pub fn new(
        bucket_name: &str,
        region: &str,
        endpoint: Option<&str>,
        access_key: &str,
        secret_key: &str,
        path_style: bool,
        sse_algorithm: &str,
    ) -> Result<Self, StorageError> {
        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                region: region.to_string(),
                endpoint: endpoint.to_string(),
            },
            None => region
                .parse::<Region>()
                .map_err(|e| StorageError::Config(e.to_string()))?,
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let mut bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;
        if path_style {
            bucket = bucket.with_path_style();
        }

        Ok(Self {
            bucket,
            sse_algorithm: sse_algorithm.to_string(),
        })
    }
}

fn expiry_secs(expires_in: Duration) -> u32 {
    expires_in.as_secs().clamp(1, 7 * 24 * 3600) as u32
}

fn check_status(status: u16, key: &str) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        _ => Err(StorageError::Status {
            status,
            key: key.to_string(),
        }),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<PresignedUpload, StorageError> {
        let required_headers = PresignedUpload::required_headers(content_type, &self.sse_algorithm);

        // Signed headers: the store rejects a PUT that omits or alters them.
        let mut signed = HeaderMap::new();
        for (name, value) in &required_headers {
            let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map_err(|e| StorageError::Config(e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| StorageError::Config(e.to_string()))?;
            signed.insert(name, value);
        }

        let url = self
            .bucket
            .presign_put(key, expiry_secs(expires_in), Some(signed), None)
            .await?;

        Ok(PresignedUpload {
            url,
            required_headers,
            expires_at: Utc::now() + chrono::Duration::seconds(expiry_secs(expires_in) as i64),
        })
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        Ok(self
            .bucket
            .presign_get(key, expiry_secs(expires_in), None)
            .await?)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        check_status(response.status_code(), key)?;
        Ok(response.to_vec())
    }

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        check_status(response.status_code(), key)
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let (_, status) = self.bucket.head_object(HEALTH_KEY).await?;
        match status {
            200..=299 | 404 => Ok(()),
            _ => Err(StorageError::Status {
                status,
                key: HEALTH_KEY.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::SSE_HEADER;

    #[test]
    fn test_expiry_is_clamped_to_sigv4_limits() {
        assert_eq!(expiry_secs(Duration::ZERO), 1);
        assert_eq!(expiry_secs(Duration::from_secs(900)), 900);
        assert_eq!(expiry_secs(Duration::from_secs(30 * 24 * 3600)), 7 * 24 * 3600);
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(200, "k").is_ok());
        assert!(matches!(check_status(404, "k"), Err(StorageError::NotFound(_))));
        assert!(matches!(
            check_status(503, "k"),
            Err(StorageError::Status { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_presigned_put_signs_sse_and_content_type() {
        let store = S3ObjectStore::new(
            "media",
            "us-east-1",
            Some("http://127.0.0.1:9000"),
            "AKIDEXAMPLE",
            "secret",
            true,
            "AES256",
        )
        .unwrap();

        let upload = store
            .presign_put("uploads/x/input.png", "image/png", Duration::from_secs(900))
            .await
            .unwrap();

        let signed = upload
            .url
            .split('&')
            .find_map(|pair| pair.split_once("X-Amz-SignedHeaders="))
            .map(|(_, value)| value.replace("%3B", ";"))
            .expect("signed headers in query");
        let signed: Vec<&str> = signed.split(';').collect();
        assert!(signed.contains(&"host"));
        assert!(signed.contains(&"content-type"));
        assert!(signed.contains(&SSE_HEADER));
        assert_eq!(
            upload.required_headers.get(SSE_HEADER).map(String::as_str),
            Some("AES256")
        );
    }
}
