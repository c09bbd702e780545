use crate::metadata_store::{FileRecord, MetadataError, MetadataRepository};
use crate::storage_bridge::{StorageBridge, StorageError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Error, Debug)]
pub enum FileAccessError {
    #[error("File {file_id} not found")]
    NotFound { file_id: i32 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Signed URL response
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedFileUrl {
    /// Time-limited URL for fetching the object
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub file: FileRecord,
}

pub struct FileAccessService {
    storage: Arc<StorageBridge>,
    metadata: Arc<dyn MetadataRepository>,
    url_ttl: Duration,
}

impl FileAccessService {
    pub fn new(
        storage: Arc<StorageBridge>,
        metadata: Arc<dyn MetadataRepository>,
        url_ttl: Duration,
    ) -> Self {
        Self {
            storage,
            metadata,
            url_ttl,
        }
    }

    /// Signed retrieval URL for one of the owner's live files
    #[instrument(skip(self))]
    pub async fn signed_url(
        &self,
        owner_id: i32,
        file_id: i32,
    ) -> Result<SignedFileUrl, FileAccessError> {
        let file = self
            .metadata
            .find_by_owner(owner_id, file_id)
            .await?
            .ok_or(FileAccessError::NotFound { file_id })?;

        let url = self.storage.signed_url(&file.storage_key, self.url_ttl).await?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.url_ttl).unwrap_or_else(|_| chrono::Duration::zero());

        Ok(SignedFileUrl {
            url,
            expires_at,
            file,
        })
    }

    /// Remove the row, then the blob.
    ///
    /// If the blob delete fails the object is left for the janitor; the row
    /// is already gone, so the caller still sees the file as deleted.
    #[instrument(skip(self))]
    pub async fn delete(&self, owner_id: i32, file_id: i32) -> Result<FileRecord, FileAccessError> {
        let file = self
            .metadata
            .soft_delete(owner_id, file_id)
            .await?
            .ok_or(FileAccessError::NotFound { file_id })?;

        if let Err(e) = self.storage.delete(&file.storage_key).await {
            warn!(
                file_id,
                storage_key = %file.storage_key,
                error = %e,
                "Failed to delete stored object, leaving it for the janitor"
            );
        }

        info!(file_id, owner_id, storage_key = %file.storage_key, "File deleted");
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_store::tests::record;
    use crate::metadata_store::MemoryMetadataStore;
    use crate::storage_bridge::MemoryBlobStore;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        blobs: Arc<MemoryBlobStore>,
        metadata: Arc<MemoryMetadataStore>,
        service: FileAccessService,
    }

    async fn harness() -> Harness {
        let blobs = Arc::new(MemoryBlobStore::new());
        let storage = Arc::new(StorageBridge::new(blobs.clone()));
        storage.initialize().await;
        let metadata = Arc::new(MemoryMetadataStore::new());
        let service =
            FileAccessService::new(storage, metadata.clone(), Duration::from_secs(600));
        Harness {
            blobs,
            metadata,
            service,
        }
    }

    fn stored(h: &Harness, id: i32, owner_id: i32) -> FileRecord {
        let file = record(id, owner_id, 5, Utc::now());
        h.blobs.insert(&file.storage_key, &b"hello"[..]);
        h.metadata.seed(file.clone());
        file
    }

    #[tokio::test]
    async fn test_signed_url_for_owned_file() {
        let h = harness().await;
        let file = stored(&h, 1, 1);
        let before = Utc::now();

        let signed = assert_ok!(h.service.signed_url(1, 1).await);

        assert_eq!(
            signed.url,
            format!("memory://{}?expires_in=600", file.storage_key)
        );
        assert!(signed.expires_at >= before + chrono::Duration::seconds(600));
        assert_eq!(signed.file, file);

        let json = serde_json::to_value(&signed).unwrap();
        assert!(json.get("expiresAt").is_some());
        assert_eq!(json["file"]["id"], 1);
    }

    #[tokio::test]
    async fn test_signed_url_hides_other_owners_files() {
        let h = harness().await;
        stored(&h, 1, 2);

        let err = assert_err!(h.service.signed_url(1, 1).await);
        assert!(matches!(err, FileAccessError::NotFound { file_id: 1 }));
    }

    #[tokio::test]
    async fn test_signed_url_for_missing_object() {
        let h = harness().await;
        h.metadata.seed(record(1, 1, 5, Utc::now()));

        let err = assert_err!(h.service.signed_url(1, 1).await);
        assert!(matches!(err, FileAccessError::Storage(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_removes_row_then_blob() {
        let h = harness().await;
        let file = stored(&h, 1, 1);

        let deleted = assert_ok!(h.service.delete(1, 1).await);

        assert_eq!(deleted.id, file.id);
        assert!(h.blobs.get(&file.storage_key).is_none());
        assert!(h.metadata.snapshot()[0].deleted_at.is_some());
        assert!(matches!(
            h.service.signed_url(1, 1).await,
            Err(FileAccessError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_twice_is_not_found() {
        let h = harness().await;
        stored(&h, 1, 1);

        assert_ok!(h.service.delete(1, 1).await);
        let err = assert_err!(h.service.delete(1, 1).await);
        assert!(matches!(err, FileAccessError::NotFound { file_id: 1 }));
    }

    #[tokio::test]
    async fn test_delete_with_blob_already_gone() {
        let h = harness().await;
        h.metadata.seed(record(1, 1, 5, Utc::now()));

        assert_ok!(h.service.delete(1, 1).await);
        assert!(h.metadata.snapshot()[0].deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_other_owners_file_leaves_it_alone() {
        let h = harness().await;
        let file = stored(&h, 1, 2);

        assert_err!(h.service.delete(1, 1).await);
        assert!(h.blobs.get(&file.storage_key).is_some());
        assert!(h.metadata.snapshot()[0].deleted_at.is_none());
    }
}
