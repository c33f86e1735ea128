use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ObjectStore, PresignedUpload, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantMethod {
    Put,
    Get,
}

#[derive(Debug, Clone)]
struct Grant {
    key: String,
    method: GrantMethod,
    content_type: Option<String>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<String, StoredObject>,
    grants: HashMap<String, Grant>,
}

/// In-process object store for local mode.
///
/// Pre-signed URLs carry a random capability token that the
/// `/local-store/{key}` routes check against the grant issued here, enforcing
/// the same rules S3 applies to a signed PUT: matching key, unexpired,
/// identical `Content-Type`, and the encryption header.
pub struct MemoryObjectStore {
    public_base_url: String,
    sse_algorithm: String,
    state: RwLock<StoreState>,
}

impl MemoryObjectStore {
    pub fn new(public_base_url: &str, sse_algorithm: &str) -> Self {
        Self {
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            sse_algorithm: sse_algorithm.to_string(),
            state: RwLock::new(StoreState::default()),
        }
    }

    async fn issue(
        &self,
        key: &str,
        method: GrantMethod,
        content_type: Option<&str>,
        expires_in: Duration,
    ) -> (String, DateTime<Utc>) {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(expires_in).unwrap_or_else(|_| chrono::Duration::hours(1));
        let token = Uuid::new_v4().simple().to_string();

        let mut state = self.state.write().await;
        state.grants.retain(|_, g| g.expires_at > now);
        state.grants.insert(
            token.clone(),
            Grant {
                key: key.to_string(),
                method,
                content_type: content_type.map(str::to_string),
                expires_at,
            },
        );

        let url = format!(
            "{}/local-store/{}?token={}",
            self.public_base_url, key, token
        );
        (url, expires_at)
    }

    fn check_grant(
        state: &StoreState,
        key: &str,
        token: &str,
        method: GrantMethod,
    ) -> Result<Grant, StorageError> {
        let grant = state
            .grants
            .get(token)
            .ok_or_else(|| StorageError::Rejected("unknown or revoked signature".to_string()))?;

        if grant.method != method || grant.key != key {
            return Err(StorageError::Rejected(
                "signature does not cover this request".to_string(),
            ));
        }
        if grant.expires_at <= Utc::now() {
            return Err(StorageError::Rejected("request has expired".to_string()));
        }
        Ok(grant.clone())
    }

    /// Handle a client PUT against a pre-signed upload URL.
    pub async fn accept_upload(
        &self,
        key: &str,
        token: &str,
        content_type: Option<&str>,
        sse: Option<&str>,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let grant = Self::check_grant(&state, key, token, GrantMethod::Put)?;

        let declared = grant.content_type.unwrap_or_default();
        if content_type != Some(declared.as_str()) {
            return Err(StorageError::Rejected(format!(
                "Content-Type must be exactly '{}'",
                declared
            )));
        }
        if sse != Some(self.sse_algorithm.as_str()) {
            return Err(StorageError::Rejected(format!(
                "server-side encryption header must be '{}'",
                self.sse_algorithm
            )));
        }

        state.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: declared,
            },
        );
        Ok(())
    }

    /// Handle a client GET against a pre-signed download URL. Returns the
    /// bytes and their content type.
    pub async fn serve_download(
        &self,
        key: &str,
        token: &str,
    ) -> Result<(Vec<u8>, String), StorageError> {
        let state = self.state.read().await;
        Self::check_grant(&state, key, token, GrantMethod::Get)?;
        state
            .objects
            .get(key)
            .map(|o| (o.data.clone(), o.content_type.clone()))
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<PresignedUpload, StorageError> {
        let (url, expires_at) = self
            .issue(key, GrantMethod::Put, Some(content_type), expires_in)
            .await;
        Ok(PresignedUpload {
            url,
            required_headers: PresignedUpload::required_headers(content_type, &self.sse_algorithm),
            expires_at,
        })
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        let (url, _) = self.issue(key, GrantMethod::Get, None, expires_in).await;
        Ok(url)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.state
            .read()
            .await
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.state.write().await.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn token_of(url: &str) -> &str {
        url.split("token=").nth(1).unwrap()
    }

    #[tokio::test]
    async fn test_presigned_put_enforces_content_type_and_encryption() {
        let store = MemoryObjectStore::new("http://localhost:3000/", "aws:kms");
        let upload = store
            .presign_put("uploads/a/input.mp4", "video/mp4", TTL)
            .await
            .unwrap();
        assert!(upload
            .url
            .starts_with("http://localhost:3000/local-store/uploads/a/input.mp4?token="));
        let token = token_of(&upload.url);

        let wrong_type = store
            .accept_upload("uploads/a/input.mp4", token, Some("video/webm"), Some("aws:kms"), vec![1])
            .await;
        assert!(matches!(wrong_type, Err(StorageError::Rejected(_))));

        let no_sse = store
            .accept_upload("uploads/a/input.mp4", token, Some("video/mp4"), None, vec![1])
            .await;
        assert!(matches!(no_sse, Err(StorageError::Rejected(_))));

        let other_key = store
            .accept_upload("uploads/b/input.mp4", token, Some("video/mp4"), Some("aws:kms"), vec![1])
            .await;
        assert!(matches!(other_key, Err(StorageError::Rejected(_))));

        store
            .accept_upload("uploads/a/input.mp4", token, Some("video/mp4"), Some("aws:kms"), vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(store.get("uploads/a/input.mp4").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_expired_grant_is_rejected() {
        let store = MemoryObjectStore::new("http://localhost:3000", "AES256");
        let upload = store
            .presign_put("k", "image/png", Duration::ZERO)
            .await
            .unwrap();
        let result = store
            .accept_upload("k", token_of(&upload.url), Some("image/png"), Some("AES256"), vec![])
            .await;
        assert!(matches!(result, Err(StorageError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_download_grant_cannot_be_used_to_upload() {
        let store = MemoryObjectStore::new("http://localhost:3000", "AES256");
        store.put("results/r.json", b"{}", "application/json").await.unwrap();
        let url = store.presign_get("results/r.json", TTL).await.unwrap();
        let token = token_of(&url);

        let (data, content_type) = store.serve_download("results/r.json", token).await.unwrap();
        assert_eq!(data, b"{}");
        assert_eq!(content_type, "application/json");

        let misuse = store
            .accept_upload("results/r.json", token, Some("application/json"), Some("AES256"), vec![])
            .await;
        assert!(matches!(misuse, Err(StorageError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let store = MemoryObjectStore::new("http://localhost:3000", "AES256");
        assert!(matches!(
            store.get("uploads/none/input.jpg").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
