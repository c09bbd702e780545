use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors raised by the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object storage unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to write object {key}: {message}")]
    Write { key: String, message: String },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object storage error: {0}")]
    Backend(String),
}

/// Readiness of the backing store, decided once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Uninitialized,
    Ready,
    Unreachable,
}

/// Outcome of a backend delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Missing,
}

/// Network-facing blob store operations
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Check the bucket exists, creating it when absent
    async fn ensure_bucket(&self) -> Result<(), StorageError>;

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StorageError>;

    async fn presigned_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    async fn delete(&self, key: &str) -> Result<DeleteOutcome, StorageError>;

    async fn list_keys(&self) -> Result<Vec<String>, StorageError>;
}

/// Readiness-gated facade over a [`BlobStore`]
pub struct StorageBridge {
    backend: Arc<dyn BlobStore>,
    readiness: OnceLock<Readiness>,
    clock: KeyClock,
}

impl StorageBridge {
    pub fn new(backend: Arc<dyn BlobStore>) -> Self {
        Self {
            backend,
            readiness: OnceLock::new(),
            clock: KeyClock::default(),
        }
    }

    /// Run the startup bucket check. Only the first call touches the backend.
    pub async fn initialize(&self) -> Readiness {
        if let Some(state) = self.readiness.get() {
            return *state;
        }

        let state = match self.backend.ensure_bucket().await {
            Ok(()) => {
                info!("Object storage ready");
                Readiness::Ready
            }
            Err(e) => {
                warn!(error = %e, "Object storage unreachable, uploads will be rejected");
                Readiness::Unreachable
            }
        };

        let _ = self.readiness.set(state);
        self.readiness.get().copied().unwrap_or(state)
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
            .get()
            .copied()
            .unwrap_or(Readiness::Uninitialized)
    }

    fn ensure_ready(&self) -> Result<(), StorageError> {
        match self.readiness() {
            Readiness::Ready => Ok(()),
            Readiness::Uninitialized => Err(StorageError::Unavailable(
                "storage readiness check has not run".to_string(),
            )),
            Readiness::Unreachable => Err(StorageError::Unavailable(
                "storage backend unreachable at startup".to_string(),
            )),
        }
    }

    /// Write `body` under a freshly generated key and return the key
    #[instrument(skip(self, body), fields(name = %name, size_bytes = body.len()))]
    pub async fn store(
        &self,
        name: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.ensure_ready()?;

        let key = storage_key(self.clock.next(Utc::now()), name);
        self.backend.put(&key, body, content_type).await?;

        debug!(storage_key = %key, "Object stored");
        Ok(key)
    }

    /// Time-limited retrieval URL for an existing object
    pub async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        self.ensure_ready()?;
        self.backend.presigned_get(key, ttl).await
    }

    /// Remove an object. Deleting a missing key succeeds.
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_ready()?;

        if self.backend.delete(key).await? == DeleteOutcome::Missing {
            debug!(storage_key = %key, "Delete of missing object ignored");
        }
        Ok(())
    }

    pub async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        self.ensure_ready()?;
        self.backend.list_keys().await
    }
}

/// Issues strictly increasing millisecond prefixes
#[derive(Debug, Default)]
struct KeyClock {
    last: AtomicI64,
}

impl KeyClock {
    fn next(&self, now: DateTime<Utc>) -> i64 {
        let now = now.timestamp_millis();
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }
}

/// Format: `{unix_millis}-{name}`
fn storage_key(millis: i64, name: &str) -> String {
    format!("{}-{}", millis, sanitize_key_component(name))
}

/// Parse the ingestion time back out of a key generated by this service
pub fn key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    let (prefix, _) = key.split_once('-')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    DateTime::from_timestamp_millis(prefix.parse().ok()?)
}

/// Keep client names from introducing path segments into object keys
fn sanitize_key_component(component: &str) -> String {
    let sanitized: String = component
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        "file".to_string()
    } else {
        sanitized
    }
}

/// S3 / MinIO implementation of [`BlobStore`]
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3BlobStore {
    /// Create a new S3 client for the configured bucket
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            s3_config_builder = s3_config_builder.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "uploads-config",
            ));
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 client initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StorageError::Backend(DisplayErrorContext(&e).to_string()))
                }
            }
        }
    }

    /// Single-part upload for small objects
    async fn simple_upload(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(body.len() as i64)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| write_error(key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    /// Multipart upload for objects above the configured threshold
    async fn multipart_upload(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| write_error(key, DisplayErrorContext(&e)))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| write_error(key, "no upload id in response"))?
            .to_string();

        match self.upload_parts(key, &upload_id, body).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| write_error(key, DisplayErrorContext(&e)))?;

                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        storage_key = %key,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: Bytes,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let part_size = self.config.part_size_bytes.max(1);
        let mut completed_parts = Vec::new();
        let mut offset = 0;
        let mut part_number = 1;

        while offset < body.len() {
            let end = (offset + part_size).min(body.len());
            let chunk = body.slice(offset..end);

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| write_error(key, DisplayErrorContext(&e)))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );

            offset = end;
            part_number += 1;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false);
                if !missing {
                    return Err(StorageError::Unavailable(
                        DisplayErrorContext(&e).to_string(),
                    ));
                }
            }
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.config.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(
                        self.config.region.as_str(),
                    ))
                    .build(),
            );
        }

        request
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(DisplayErrorContext(&e).to_string()))?;

        info!(bucket = %self.bucket, "Created storage bucket");
        Ok(())
    }

    #[instrument(skip(self, body), fields(bucket = %self.bucket, size_bytes = body.len()))]
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StorageError> {
        if body.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(key, body, content_type).await
        } else {
            self.simple_upload(key, body, content_type).await
        }
    }

    async fn presigned_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let presigning_config =
            PresigningConfig::expires_in(ttl).map_err(|e| StorageError::Backend(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn delete(&self, key: &str) -> Result<DeleteOutcome, StorageError> {
        // S3 acknowledges deletes of absent keys, so look first to report it.
        if !self.exists(key).await? {
            return Ok(DeleteOutcome::Missing);
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;

        Ok(DeleteOutcome::Deleted)
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| StorageError::Backend(DisplayErrorContext(&e).to_string()))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }
}

fn write_error(key: &str, message: impl std::fmt::Display) -> StorageError {
    StorageError::Write {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// A blob held by [`MemoryBlobStore`]
#[derive(Debug, Clone)]
pub struct MemoryBlob {
    pub body: Bytes,
    pub content_type: String,
}

/// In-process [`BlobStore`] for local runs and tests
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, MemoryBlob>>,
    unreachable: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose bucket check always fails
    pub fn unreachable() -> Self {
        let store = Self::default();
        store.unreachable.store(true, Ordering::SeqCst);
        store
    }

    /// Make subsequent writes fail with [`StorageError::Write`]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<MemoryBlob> {
        self.read().get(key).cloned()
    }

    pub fn insert(&self, key: &str, body: impl Into<Bytes>) {
        self.write().insert(
            key.to_string(),
            MemoryBlob {
                body: body.into(),
                content_type: "application/octet-stream".to_string(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, MemoryBlob>> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, MemoryBlob>> {
        self.objects.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(write_error(key, "connection reset by peer"));
        }

        self.write().insert(
            key.to_string(),
            MemoryBlob {
                body,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn presigned_get(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        if !self.read().contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(format!("memory://{}?expires_in={}", key, ttl.as_secs()))
    }

    async fn delete(&self, key: &str) -> Result<DeleteOutcome, StorageError> {
        match self.write().remove(key) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::Missing),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    async fn ready_bridge() -> (Arc<MemoryBlobStore>, StorageBridge) {
        let backend = Arc::new(MemoryBlobStore::new());
        let bridge = StorageBridge::new(backend.clone());
        assert_eq!(bridge.initialize().await, Readiness::Ready);
        (backend, bridge)
    }

    #[test]
    fn test_storage_key_format() {
        let key = storage_key(1_705_314_645_000, "report.pdf");
        assert_eq!(key, "1705314645000-report.pdf");
    }

    #[test]
    fn test_sanitize_key_component() {
        assert_eq!(sanitize_key_component("hello"), "hello");
        assert_eq!(sanitize_key_component("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_key_component("tab\there"), "tab_here");
        assert_eq!(sanitize_key_component("my file (1).txt"), "my file (1).txt");
        assert_eq!(sanitize_key_component(""), "file");
    }

    #[test]
    fn test_key_clock_is_strictly_increasing() {
        let clock = KeyClock::default();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();

        let first = clock.next(now);
        let second = clock.next(now);
        let third = clock.next(now);

        assert_eq!(first, now.timestamp_millis());
        assert_eq!(second, first + 1);
        assert_eq!(third, first + 2);
    }

    #[test]
    fn test_key_timestamp_round_trips_generated_keys() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        let key = storage_key(now.timestamp_millis(), "notes-final.txt");

        assert_eq!(key_timestamp(&key), Some(now));
        assert_eq!(key_timestamp("frames/2024-01-15/x.jpg"), None);
        assert_eq!(key_timestamp("-leading-dash"), None);
        assert_eq!(key_timestamp("nodash"), None);
    }

    #[tokio::test]
    async fn test_operations_fail_fast_before_initialize() {
        let backend = Arc::new(MemoryBlobStore::new());
        let bridge = StorageBridge::new(backend.clone());

        assert_eq!(bridge.readiness(), Readiness::Uninitialized);
        let err = bridge
            .store("hello", Bytes::from_static(b"hello"), "text/plain")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Unavailable(_)));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_backend_rejects_every_operation() {
        let backend = Arc::new(MemoryBlobStore::unreachable());
        let bridge = StorageBridge::new(backend.clone());

        assert_eq!(bridge.initialize().await, Readiness::Unreachable);

        let store = bridge
            .store("hello", Bytes::from_static(b"hello"), "text/plain")
            .await;
        assert!(matches!(store, Err(StorageError::Unavailable(_))));
        assert!(matches!(
            bridge.signed_url("k", Duration::from_secs(60)).await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(matches!(
            bridge.delete("k").await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(matches!(
            bridge.list_keys().await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let backend = Arc::new(MemoryBlobStore::new());
        let bridge = StorageBridge::new(backend);

        assert_eq!(bridge.initialize().await, Readiness::Ready);
        assert_eq!(bridge.initialize().await, Readiness::Ready);
        assert_eq!(bridge.readiness(), Readiness::Ready);
    }

    #[tokio::test]
    async fn test_store_same_name_twice_yields_distinct_keys() {
        let (backend, bridge) = ready_bridge().await;

        let first = assert_ok!(
            bridge
                .store("hello", Bytes::from_static(b"one"), "text/plain")
                .await
        );
        let second = assert_ok!(
            bridge
                .store("hello", Bytes::from_static(b"two"), "text/plain")
                .await
        );

        assert_ne!(first, second);
        assert!(first.ends_with("-hello"));
        assert_eq!(backend.len(), 2);
        assert_eq!(backend.get(&first).unwrap().body, Bytes::from_static(b"one"));
        assert_eq!(backend.get(&second).unwrap().content_type, "text/plain");
    }

    #[tokio::test]
    async fn test_write_failure_maps_to_write_error() {
        let (backend, bridge) = ready_bridge().await;
        backend.set_fail_writes(true);

        let err = assert_err!(
            bridge
                .store("hello", Bytes::from_static(b"hello"), "text/plain")
                .await
        );
        assert!(matches!(err, StorageError::Write { .. }));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (backend, bridge) = ready_bridge().await;
        let key = bridge
            .store("hello", Bytes::from_static(b"hello"), "text/plain")
            .await
            .unwrap();

        assert_ok!(bridge.delete(&key).await);
        assert_ok!(bridge.delete(&key).await);
        assert_ok!(bridge.delete("never-existed").await);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_signed_url_for_missing_key_is_not_found() {
        let (_backend, bridge) = ready_bridge().await;

        let err = bridge
            .signed_url("missing", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));

        let key = bridge
            .store("hello", Bytes::from_static(b"hello"), "text/plain")
            .await
            .unwrap();
        let url = bridge
            .signed_url(&key, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.contains(&key));
    }
}
