use crate::config::PaginationConfig;
use crate::metadata_store::{FileRecord, MetadataError, MetadataRepository};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Caller-supplied paging; missing fields take the configured defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// One page of an owner's files
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedFiles {
    pub data: Vec<FileRecord>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadsPerDay {
    /// UTC calendar date, `YYYY-MM-DD`
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetrics {
    pub total_files: i64,
    /// Sum of stored sizes in bytes
    pub total_storage: i64,
    pub uploads_per_day: Vec<UploadsPerDay>,
}

/// Pagination and metrics over the metadata store
pub struct QueryService {
    metadata: Arc<dyn MetadataRepository>,
    pagination: PaginationConfig,
}

impl QueryService {
    pub fn new(metadata: Arc<dyn MetadataRepository>, pagination: PaginationConfig) -> Self {
        Self {
            metadata,
            pagination,
        }
    }

    /// Resolve defaults, reject non-positive values and clamp the limit
    fn resolve(&self, request: Option<PageRequest>) -> Result<(i64, i64), QueryError> {
        let request = request.unwrap_or_default();
        let page = request.page.unwrap_or(self.pagination.default_page);
        let limit = request.limit.unwrap_or(self.pagination.default_limit);

        if page < 1 {
            return Err(QueryError::InvalidPagination(format!(
                "page must be at least 1, got {page}"
            )));
        }
        if limit < 1 {
            return Err(QueryError::InvalidPagination(format!(
                "limit must be at least 1, got {limit}"
            )));
        }

        Ok((page, limit.min(self.pagination.max_limit.max(1))))
    }

    /// Newest-first page of the owner's files
    #[instrument(skip(self))]
    pub async fn find_user_files(
        &self,
        owner_id: i32,
        request: Option<PageRequest>,
    ) -> Result<PaginatedFiles, QueryError> {
        let (page, limit) = self.resolve(request)?;
        let offset = (page - 1).saturating_mul(limit);

        let (data, total) = self
            .metadata
            .list_by_owner(owner_id, offset, limit)
            .await?;

        Ok(paginate(data, total, page, limit))
    }

    #[instrument(skip(self))]
    pub async fn get_user_metrics(&self, owner_id: i32) -> Result<UploadMetrics, QueryError> {
        let records = self.metadata.all_by_owner(owner_id).await?;
        Ok(compute_metrics(&records))
    }
}

fn paginate(data: Vec<FileRecord>, total: i64, page: i64, limit: i64) -> PaginatedFiles {
    let total_pages = if total <= 0 {
        0
    } else {
        (total + limit - 1) / limit
    };

    PaginatedFiles {
        data,
        total,
        page,
        limit,
        total_pages,
        has_next_page: page < total_pages,
        has_previous_page: page > 1,
    }
}

/// Totals plus per-day upload counts, ascending by date
pub fn compute_metrics(records: &[FileRecord]) -> UploadMetrics {
    let mut per_day: BTreeMap<String, i64> = BTreeMap::new();
    for record in records {
        let date = record.created_at.format("%Y-%m-%d").to_string();
        *per_day.entry(date).or_insert(0) += 1;
    }

    UploadMetrics {
        total_files: records.len() as i64,
        total_storage: records.iter().map(|r| r.size_bytes).sum(),
        uploads_per_day: per_day
            .into_iter()
            .map(|(date, count)| UploadsPerDay { date, count })
            .collect(),
    }
}
