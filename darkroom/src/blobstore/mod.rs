//! Durable blob storage for materialized outputs.
//!
//! Provider output URLs are ephemeral and inline payloads exist only in the
//! queue message; this is the `put`-only store that turns either into a
//! permanent, publicly addressable image. Backends: S3-compatible object
//! storage for production, the local filesystem for development, and an
//! in-memory map for tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use uuid::Uuid;

/// Result type for blob operations
pub type Result<T> = std::result::Result<T, BlobError>;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object storage error: {0}")]
    Storage(String),
}

/// Map a content type onto a file extension for the object key.
fn extension_for(content_type: &str) -> &str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        // PNG is what providers overwhelmingly return; also the fallback
        _ => "png",
    }
}

/// Generate a collision-free object key.
fn unique_key(content_type: &str) -> String {
    format!("generated/{}.{}", Uuid::new_v4(), extension_for(content_type))
}

/// Write-once blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the bytes under a unique key and return the public URL.
    async fn put(&self, bytes: Bytes, content_type: &str) -> Result<String>;
}

// ============================================================================
// S3-compatible implementation (S3, R2, minio)
// ============================================================================

pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_base_url: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String, public_base_url: String) -> Self {
        Self {
            client,
            bucket,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Build a client from ambient AWS configuration, with an optional
    /// custom endpoint for R2/minio.
    pub async fn from_env(bucket: String, public_base_url: String, endpoint: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket, public_base_url)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, bytes: Bytes, content_type: &str) -> Result<String> {
        let key = unique_key(content_type);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .body(aws_sdk_s3::primitives::ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| BlobError::Storage(e.to_string()))?;

        Ok(format!("{}/{}", self.public_base_url, key))
    }
}

// ============================================================================
// Local filesystem implementation
// ============================================================================

/// Local filesystem backend - useful for development and testing.
pub struct LocalBlobStore {
    base_path: PathBuf,
    public_base_url: String,
}

impl LocalBlobStore {
    pub fn new(base_path: PathBuf, public_base_url: String) -> Self {
        Self {
            base_path,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bytes: Bytes, content_type: &str) -> Result<String> {
        let key = unique_key(content_type);
        let full_path = self.base_path.join(&key);

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, &bytes).await?;

        Ok(format!("{}/{}", self.public_base_url, key))
    }
}

// ============================================================================
// In-memory implementation (tests)
// ============================================================================

/// In-memory backend recording every stored object, for assertions in tests.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn get(&self, url: &str) -> Option<Bytes> {
        self.objects.lock().get(url).cloned()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bytes: Bytes, content_type: &str) -> Result<String> {
        let url = format!("memory://{}", unique_key(content_type));
        self.objects.lock().insert(url.clone(), bytes);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_writes_and_serves_a_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(
            dir.path().to_path_buf(),
            "http://localhost:8080/files".to_string(),
        );

        let url = store
            .put(Bytes::from_static(b"imagebytes"), "image/png")
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:8080/files/generated/"));
        assert!(url.ends_with(".png"));

        let key = url.trim_start_matches("http://localhost:8080/files/");
        let on_disk = std::fs::read(dir.path().join(key)).unwrap();
        assert_eq!(on_disk, b"imagebytes");
    }

    #[tokio::test]
    async fn keys_are_unique_per_put() {
        let store = InMemoryBlobStore::new();
        let a = store.put(Bytes::from_static(b"a"), "image/png").await.unwrap();
        let b = store.put(Bytes::from_static(b"a"), "image/png").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.object_count(), 2);
    }
}
