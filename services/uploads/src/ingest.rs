use crate::event_bus::{EventPublisher, UploadEvent, FILE_UPLOADED_TOPIC};
use crate::metadata_store::{FileRecord, MetadataError, MetadataRepository, NewFileRecord};
use crate::storage_bridge::{StorageBridge, StorageError};
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Error type carried by upload body streams. A stream may yield a boxed
/// `IngestError` to report a typed failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("Invalid upload: {0}")]
    Validation(String),

    #[error("Failed to read upload stream: {0}")]
    Stream(String),

    #[error("Upload too large: {0}")]
    TooLarge(String),

    #[error("Ingest task failed: {0}")]
    Task(String),
}

/// A resolved upload: client-declared name and type plus the raw body
pub struct IncomingFile<'a> {
    pub name: String,
    pub mime_type: String,
    pub body: BoxStream<'a, Result<Bytes, BoxError>>,
}

impl<'a> IncomingFile<'a> {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        body: BoxStream<'a, Result<Bytes, BoxError>>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            body,
        }
    }
}

impl std::fmt::Debug for IncomingFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

/// Orchestrates storage, metadata and notification for each upload.
///
/// `ingest` runs its steps strictly in this order:
///
/// ```text
/// deferred upload ──▶ drain ──▶ StorageBridge::store ──▶ MetadataRepository::insert ──▶ EventPublisher::publish
///                      │               │ fails: abort,            │ fails: abort,               │ fails: logged only
///                      │               │ nothing recorded         │ blob left for the janitor   │
///                      ▼
///            dropped here: nothing written
/// ```
///
/// Once the storage write starts, the remaining steps run on their own task.
#[derive(Clone)]
pub struct IngestService {
    storage: Arc<StorageBridge>,
    metadata: Arc<dyn MetadataRepository>,
    events: Arc<dyn EventPublisher>,
}

impl IngestService {
    pub fn new(
        storage: Arc<StorageBridge>,
        metadata: Arc<dyn MetadataRepository>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            storage,
            metadata,
            events,
        }
    }

    /// Ingest one upload for an already-authenticated owner
    #[instrument(skip(self, upload))]
    pub async fn ingest<'a, F>(&self, owner_id: i32, upload: F) -> Result<FileRecord, IngestError>
    where
        F: Future<Output = Result<IncomingFile<'a>, IngestError>> + Send + 'a,
    {
        let started = Instant::now();

        let result = async {
            let file = upload.await?;
            let (name, mime_type, body) = drain(file).await?;

            // Detached so the commit survives the caller being dropped.
            let pipeline = self.clone();
            tokio::spawn(async move { pipeline.commit(owner_id, name, mime_type, body).await })
                .await
                .map_err(|e| IngestError::Task(e.to_string()))?
        }
        .await;

        metrics::histogram!("uploads.ingest.duration_seconds")
            .record(started.elapsed().as_secs_f64());
        if let Err(ref e) = result {
            metrics::counter!("uploads.ingest.failed").increment(1);
            warn!(owner_id, error = %e, "Upload failed");
        }

        result
    }

    async fn commit(
        &self,
        owner_id: i32,
        name: String,
        mime_type: String,
        body: Bytes,
    ) -> Result<FileRecord, IngestError> {
        let size_bytes = body.len();

        let storage_key = self.storage.store(&name, body, &mime_type).await?;

        let record = self
            .metadata
            .insert(NewFileRecord {
                owner_id,
                display_name: name,
                storage_key: storage_key.clone(),
                size_bytes: size_bytes as i64,
                content_type: mime_type,
            })
            .await
            .map_err(|e| {
                error!(
                    storage_key = %storage_key,
                    error = %e,
                    "Failed to record upload, stored object is orphaned"
                );
                e
            })?;

        metrics::counter!("uploads.files.stored").increment(1);
        metrics::counter!("uploads.bytes.stored").increment(size_bytes as u64);

        info!(
            file_id = record.id,
            owner_id,
            storage_key = %record.storage_key,
            size_bytes,
            "Upload stored"
        );

        self.announce(&record).await;

        Ok(record)
    }

    /// Best effort: a failed publish never fails the upload
    async fn announce(&self, record: &FileRecord) {
        let event = UploadEvent {
            file: record.clone(),
            owner_id: record.owner_id,
        };

        match self.events.publish(FILE_UPLOADED_TOPIC, event).await {
            Ok(subscribers) => {
                debug!(file_id = record.id, subscribers, "Upload event published");
            }
            Err(e) => {
                metrics::counter!("uploads.events.publish_failed").increment(1);
                warn!(file_id = record.id, error = %e, "Failed to publish upload event");
            }
        }
    }
}

/// Read the whole body into memory. The byte count comes from what was read.
async fn drain(file: IncomingFile<'_>) -> Result<(String, String, Bytes), IngestError> {
    let IncomingFile {
        name,
        mime_type,
        mut body,
    } = file;

    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| match e.downcast::<IngestError>() {
            Ok(typed) => *typed,
            Err(e) => IngestError::Stream(e.to_string()),
        })?;
        buffer.extend_from_slice(&chunk);
    }

    debug!(name = %name, size_bytes = buffer.len(), "Upload stream drained");
    Ok((name, mime_type, buffer.freeze()))
}
