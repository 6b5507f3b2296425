//! Artifact store client
//!
//! Source archives are read from, and build artifacts written to, an S3
//! compatible bucket (MinIO in development). The pipeline only sees the
//! [`ArtifactStore`] trait; [`ObjectStoreArtifacts`] adapts any
//! `object_store` backend to it.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Uploads larger than this switch to multipart; also the buffered part size
pub const UPLOAD_PART_SIZE: usize = 10 * 1024 * 1024;

/// Stream of object chunks
pub type ByteStream = BoxStream<'static, Result<Bytes, StoreError>>;

/// Get/put access to objects by key
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Opens the object stored under `key` as a byte stream
    async fn get(&self, key: &str) -> Result<ByteStream, StoreError>;

    /// Stores the bytes yielded by `body` under `key`, replacing any existing object
    async fn put(&self, key: &str, body: ByteStream) -> Result<(), StoreError>;
}

/// S3 connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    /// Custom endpoint (e.g. "http://127.0.0.1:9000" for MinIO)
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

/// [`ArtifactStore`] backed by an `object_store` implementation
#[derive(Clone)]
pub struct ObjectStoreArtifacts {
    store: Arc<dyn ObjectStore>,
    location: String,
}

impl std::fmt::Debug for ObjectStoreArtifacts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStoreArtifacts<{}>", self.location)
    }
}

impl ObjectStoreArtifacts {
    /// Connects to an S3 compatible bucket
    ///
    /// A custom endpoint switches to path-style requests and allows plain HTTP,
    /// which is what MinIO expects.
    pub fn s3(config: &S3Config) -> Result<Self, StoreError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_access_key_id(&config.access_key)
            .with_secret_access_key(&config.secret_key)
            .with_retry(RetryConfig::default());

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(true);
        }

        let location = match &config.endpoint {
            Some(endpoint) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket),
            None => format!("s3://{}", config.bucket),
        };

        let store = builder.build().map_err(StoreError::Config)?;

        Ok(Self {
            store: Arc::new(store),
            location,
        })
    }

    /// Process-local store, useful for tests and dry runs
    pub fn in_memory() -> Self {
        Self::from_store(Arc::new(InMemory::new()), "memory://")
    }

    /// Wraps an already configured backend
    pub fn from_store(store: Arc<dyn ObjectStore>, location: impl Into<String>) -> Self {
        Self {
            store,
            location: location.into(),
        }
    }

    /// Human readable location of the bucket
    pub fn location(&self) -> &str {
        &self.location
    }
}

#[async_trait]
impl ArtifactStore for ObjectStoreArtifacts {
    async fn get(&self, key: &str) -> Result<ByteStream, StoreError> {
        debug!("Fetching object {} from {}", key, self.location);

        let result = self
            .store
            .get(&Path::from(key))
            .await
            .map_err(|e| StoreError::from_object_store(key, e))?;

        let key = key.to_string();
        let stream = result
            .into_stream()
            .map_err(move |e| StoreError::from_object_store(&key, e));

        Ok(stream.boxed())
    }

    async fn put(&self, key: &str, mut body: ByteStream) -> Result<(), StoreError> {
        debug!("Uploading object {} to {}", key, self.location);

        // At most one part is buffered; larger bodies go up as multipart
        let mut writer =
            BufWriter::with_capacity(Arc::clone(&self.store), Path::from(key), UPLOAD_PART_SIZE);
        let mut written = 0usize;

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    abort_upload(&mut writer, key).await;
                    return Err(e);
                }
            };
            written += chunk.len();

            if let Err(e) = writer.put(chunk).await {
                abort_upload(&mut writer, key).await;
                return Err(StoreError::from_object_store(key, e));
            }
        }

        writer
            .shutdown()
            .await
            .map_err(|source| StoreError::Upload {
                key: key.to_string(),
                source,
            })?;

        debug!("Uploaded object {} ({} bytes)", key, written);
        Ok(())
    }
}

async fn abort_upload(writer: &mut BufWriter, key: &str) {
    if let Err(e) = writer.abort().await {
        warn!("Failed to abort upload of {}: {}", key, e);
    }
}

/// Streams a local file as an upload body
pub fn stream_file(file: tokio::fs::File, key: &str) -> ByteStream {
    let key = key.to_string();
    ReaderStream::new(file)
        .map_err(move |source| StoreError::Body {
            key: key.clone(),
            source,
        })
        .boxed()
}

/// Wraps in-memory bytes as an upload body
pub fn stream_bytes(bytes: impl Into<Bytes>) -> ByteStream {
    futures::stream::once(futures::future::ready(Ok(bytes.into()))).boxed()
}

/// Drains a byte stream into memory
pub async fn collect_bytes(stream: ByteStream) -> Result<Vec<u8>, StoreError> {
    stream
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
}
