use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised by the metadata store
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persisted metadata for one stored upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct FileRecord {
    pub id: i32,
    /// Uploading principal
    #[sqlx(rename = "userId")]
    #[serde(rename = "userId")]
    pub owner_id: i32,
    /// Client-supplied file name, stored verbatim
    #[sqlx(rename = "fileName")]
    #[serde(rename = "fileName")]
    pub display_name: String,
    /// Object key in the storage bucket
    #[sqlx(rename = "objectKey")]
    #[serde(rename = "objectKey")]
    pub storage_key: String,
    /// Bytes actually written to storage
    #[sqlx(rename = "size")]
    #[serde(rename = "size")]
    pub size_bytes: i64,
    /// Client-declared MIME type
    #[sqlx(rename = "mimeType")]
    #[serde(rename = "mimeType")]
    pub content_type: String,
    #[sqlx(rename = "createdAt")]
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[sqlx(rename = "updatedAt")]
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[sqlx(rename = "deletedAt")]
    #[serde(rename = "deletedAt")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Values supplied by the pipeline when recording a stored upload
#[derive(Debug, Clone, PartialEq)]
pub struct NewFileRecord {
    pub owner_id: i32,
    pub display_name: String,
    pub storage_key: String,
    pub size_bytes: i64,
    pub content_type: String,
}

/// Persistence operations over file records.
///
/// Every read excludes soft-deleted rows.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Persist a new record and return it with its id and timestamps
    async fn insert(&self, record: NewFileRecord) -> Result<FileRecord, MetadataError>;

    /// One page of an owner's records, newest first, plus the owner's total count
    async fn list_by_owner(
        &self,
        owner_id: i32,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<FileRecord>, i64), MetadataError>;

    /// Every record of an owner, unpaginated
    async fn all_by_owner(&self, owner_id: i32) -> Result<Vec<FileRecord>, MetadataError>;

    async fn find_by_owner(
        &self,
        owner_id: i32,
        file_id: i32,
    ) -> Result<Option<FileRecord>, MetadataError>;

    /// Mark an owned record deleted. Returns the record as it was, or None when absent.
    async fn soft_delete(
        &self,
        owner_id: i32,
        file_id: i32,
    ) -> Result<Option<FileRecord>, MetadataError>;

    /// Storage keys referenced by any live record
    async fn live_storage_keys(&self) -> Result<HashSet<String>, MetadataError>;

    /// Cheap connectivity check for the readiness endpoint
    async fn ping(&self) -> Result<(), MetadataError>;
}

const FILE_COLUMNS: &str = r#"
    id, "userId", "fileName", "objectKey", "size", "mimeType",
    "createdAt", "updatedAt", "deletedAt"
"#;

/// Metadata store for file records in PostgreSQL
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl MetadataRepository for MetadataStore {
    #[instrument(skip(self, record), fields(owner_id = record.owner_id, storage_key = %record.storage_key))]
    async fn insert(&self, record: NewFileRecord) -> Result<FileRecord, MetadataError> {
        let sql = format!(
            r#"
            INSERT INTO files ("userId", "fileName", "objectKey", "size", "mimeType")
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {FILE_COLUMNS}
            "#
        );

        let mut tx = self.pool.begin().await?;

        let saved = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(record.owner_id)
            .bind(&record.display_name)
            .bind(&record.storage_key)
            .bind(record.size_bytes)
            .bind(&record.content_type)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(file_id = saved.id, "File record inserted");
        Ok(saved)
    }

    #[instrument(skip(self))]
    async fn list_by_owner(
        &self,
        owner_id: i32,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<FileRecord>, i64), MetadataError> {
        let sql = format!(
            r#"
            SELECT {FILE_COLUMNS}
            FROM files
            WHERE "userId" = $1 AND "deletedAt" IS NULL
            ORDER BY "createdAt" DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        );

        // Page and total read the same snapshot, so a concurrent upload
        // cannot make them disagree.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let records = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(owner_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&mut *tx)
            .await?;

        let total: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM files
            WHERE "userId" = $1 AND "deletedAt" IS NULL
            "#,
        )
        .bind(owner_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((records, total.0))
    }

    async fn all_by_owner(&self, owner_id: i32) -> Result<Vec<FileRecord>, MetadataError> {
        let sql = format!(
            r#"
            SELECT {FILE_COLUMNS}
            FROM files
            WHERE "userId" = $1 AND "deletedAt" IS NULL
            "#
        );

        let records = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn find_by_owner(
        &self,
        owner_id: i32,
        file_id: i32,
    ) -> Result<Option<FileRecord>, MetadataError> {
        let sql = format!(
            r#"
            SELECT {FILE_COLUMNS}
            FROM files
            WHERE id = $1 AND "userId" = $2 AND "deletedAt" IS NULL
            "#
        );

        let record = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(file_id)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn soft_delete(
        &self,
        owner_id: i32,
        file_id: i32,
    ) -> Result<Option<FileRecord>, MetadataError> {
        let sql = format!(
            r#"
            UPDATE files
            SET "deletedAt" = NOW(), "updatedAt" = NOW()
            WHERE id = $1 AND "userId" = $2 AND "deletedAt" IS NULL
            RETURNING {FILE_COLUMNS}
            "#
        );

        let record = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(file_id)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn live_storage_keys(&self) -> Result<HashSet<String>, MetadataError> {
        let keys: Vec<(String,)> =
            sqlx::query_as(r#"SELECT "objectKey" FROM files WHERE "deletedAt" IS NULL"#)
                .fetch_all(&self.pool)
                .await?;

        Ok(keys.into_iter().map(|(key,)| key).collect())
    }

    async fn ping(&self) -> Result<(), MetadataError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-process [`MetadataRepository`] for local runs and tests
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: Mutex<Vec<FileRecord>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as-is, bypassing id and timestamp assignment
    pub fn seed(&self, record: FileRecord) {
        self.lock().push(record);
    }

    /// Every record, soft-deleted ones included
    pub fn snapshot(&self) -> Vec<FileRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FileRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_for(records: &[FileRecord], owner_id: i32) -> Vec<FileRecord> {
        records
            .iter()
            .filter(|r| r.owner_id == owner_id && r.deleted_at.is_none())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MetadataRepository for MemoryMetadataStore {
    async fn insert(&self, record: NewFileRecord) -> Result<FileRecord, MetadataError> {
        let mut records = self.lock();
        let now = Utc::now();
        let saved = FileRecord {
            id: records.iter().map(|r| r.id).max().unwrap_or(0) + 1,
            owner_id: record.owner_id,
            display_name: record.display_name,
            storage_key: record.storage_key,
            size_bytes: record.size_bytes,
            content_type: record.content_type,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        records.push(saved.clone());
        Ok(saved)
    }

    async fn list_by_owner(
        &self,
        owner_id: i32,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<FileRecord>, i64), MetadataError> {
        let mut owned = Self::live_for(&self.lock(), owner_id);
        owned.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let total = owned.len() as i64;
        let page = owned
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();

        Ok((page, total))
    }

    async fn all_by_owner(&self, owner_id: i32) -> Result<Vec<FileRecord>, MetadataError> {
        Ok(Self::live_for(&self.lock(), owner_id))
    }

    async fn find_by_owner(
        &self,
        owner_id: i32,
        file_id: i32,
    ) -> Result<Option<FileRecord>, MetadataError> {
        Ok(Self::live_for(&self.lock(), owner_id)
            .into_iter()
            .find(|r| r.id == file_id))
    }

    async fn soft_delete(
        &self,
        owner_id: i32,
        file_id: i32,
    ) -> Result<Option<FileRecord>, MetadataError> {
        let mut records = self.lock();
        let Some(record) = records
            .iter_mut()
            .find(|r| r.id == file_id && r.owner_id == owner_id && r.deleted_at.is_none())
        else {
            return Ok(None);
        };

        let before = record.clone();
        let now = Utc::now();
        record.deleted_at = Some(now);
        record.updated_at = now;
        Ok(Some(before))
    }

    async fn live_storage_keys(&self) -> Result<HashSet<String>, MetadataError> {
        Ok(self
            .lock()
            .iter()
            .filter(|r| r.deleted_at.is_none())
            .map(|r| r.storage_key.clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn record(
        id: i32,
        owner_id: i32,
        size_bytes: i64,
        created_at: DateTime<Utc>,
    ) -> FileRecord {
        FileRecord {
            id,
            owner_id,
            display_name: format!("file-{id}.txt"),
            storage_key: format!("{}-file-{id}.txt", created_at.timestamp_millis()),
            size_bytes,
            content_type: "text/plain".to_string(),
            created_at,
            updated_at: created_at,
            deleted_at: None,
        }
    }

    fn new_record(owner_id: i32, name: &str) -> NewFileRecord {
        NewFileRecord {
            owner_id,
            display_name: name.to_string(),
            storage_key: format!("1700000000000-{name}"),
            size_bytes: 5,
            content_type: "text/plain".to_string(),
        }
    }

    #[test]
    fn test_file_record_serializes_with_schema_names() {
        let created = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        let value = serde_json::to_value(record(7, 1, 100, created)).unwrap();

        assert_eq!(value["id"], 7);
        assert_eq!(value["userId"], 1);
        assert_eq!(value["fileName"], "file-7.txt");
        assert_eq!(value["size"], 100);
        assert_eq!(value["mimeType"], "text/plain");
        assert!(value["deletedAt"].is_null());
        assert!(value.get("owner_id").is_none());
    }

    #[tokio::test]
    async fn test_memory_insert_assigns_ids_and_timestamps() {
        let store = MemoryMetadataStore::new();

        let first = store.insert(new_record(1, "a.txt")).await.unwrap();
        let second = store.insert(new_record(1, "b.txt")).await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.created_at, first.updated_at);
        assert!(first.deleted_at.is_none());
    }

    #[tokio::test]
    async fn test_memory_list_by_owner_orders_newest_first() {
        let store = MemoryMetadataStore::new();
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        store.seed(record(1, 1, 10, base));
        store.seed(record(2, 1, 20, base + chrono::Duration::hours(2)));
        store.seed(record(3, 2, 30, base + chrono::Duration::hours(3)));
        store.seed(record(4, 1, 40, base + chrono::Duration::hours(1)));

        let (page, total) = store.list_by_owner(1, 0, 2).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 4]);

        let (page, total) = store.list_by_owner(1, 2, 2).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_memory_soft_delete_hides_record() {
        let store = MemoryMetadataStore::new();
        let saved = store.insert(new_record(1, "a.txt")).await.unwrap();

        assert!(store.soft_delete(2, saved.id).await.unwrap().is_none());

        let deleted = store.soft_delete(1, saved.id).await.unwrap();
        assert_eq!(deleted.map(|r| r.id), Some(saved.id));
        assert!(store.soft_delete(1, saved.id).await.unwrap().is_none());

        assert!(store.find_by_owner(1, saved.id).await.unwrap().is_none());
        assert!(store.all_by_owner(1).await.unwrap().is_empty());
        assert!(store.live_storage_keys().await.unwrap().is_empty());
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_page_past_end_keeps_total() {
        let store = MemoryMetadataStore::new();
        store.insert(new_record(1, "a.txt")).await.unwrap();
        store.insert(new_record(1, "b.txt")).await.unwrap();

        let (page, total) = store.list_by_owner(1, 10, 10).await.unwrap();
        assert!(page.is_empty());
        assert_eq!(total, 2);
    }

    /// Runs against a real PostgreSQL named by `UPLOADS_TEST_DATABASE_URL`.
    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn test_postgres_page_and_total_agree() {
        let url = std::env::var("UPLOADS_TEST_DATABASE_URL").unwrap();
        let config: DatabaseConfig = serde_json::from_value(serde_json::json!({ "url": url })).unwrap();
        let store = MetadataStore::new(&config).await.unwrap();
        store.run_migrations().await.unwrap();

        let email = format!("page-{}@example.com", Utc::now().timestamp_nanos_opt().unwrap());
        let (owner_id,): (i32,) =
            sqlx::query_as(r#"INSERT INTO "user" (email, password) VALUES ($1, 'x') RETURNING id"#)
                .bind(&email)
                .fetch_one(&store.pool)
                .await
                .unwrap();

        for name in ["a.txt", "b.txt", "c.txt"] {
            store.insert(new_record(owner_id, name)).await.unwrap();
        }

        let (page, total) = store.list_by_owner(owner_id, 0, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(total, 3);
        assert_eq!(page[0].display_name, "c.txt");

        let (page, total) = store.list_by_owner(owner_id, 4, 2).await.unwrap();
        assert!(page.is_empty());
        assert_eq!(total, 3);
    }
}
