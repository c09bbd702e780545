//! Uploads Service
//!
//! Accepts user file uploads, stores the bytes in an S3-compatible bucket
//! (MinIO in development), records per-file metadata in PostgreSQL and
//! announces each committed upload to live subscribers of the uploading user.
//!
//! ## Features
//!
//! - **Ordered Ingestion**: blob write, then metadata row, then event; a
//!   failed write leaves no row behind
//! - **Owner-Scoped Queries**: newest-first pagination and usage metrics
//!   (total bytes, uploads per UTC day)
//! - **Live Notifications**: in-process topic bus delivered over Server-Sent
//!   Events, filtered to the connection's own uploads
//! - **Signed Retrieval**: time-limited URLs and owner-checked deletes
//! - **Reconciliation**: a background janitor removes blobs no live row
//!   references
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (axum)                                         PostgreSQL
//! ┌──────────────┐    ┌──────────────┐                ┌──────────────┐
//! │ POST /files  │───▶│ Ingest       │───────────────▶│ files        │
//! └──────────────┘    │ Service      │                │ user         │
//!                     └──────────────┘                └──────────────┘
//!                        │        │                      ▲      ▲
//!                        ▼        ▼                      │      │
//!              ┌──────────────┐ ┌──────────────┐ ┌──────────────┐ │
//!              │ Storage      │ │ Event Bus    │ │ Query /      │ │
//!              │ Bridge (S3)  │ │ (broadcast)  │ │ File Access  │ │
//!              └──────────────┘ └──────────────┘ └──────────────┘ │
//!                     ▲                │                          │
//!                     │                ▼                          │
//!              ┌──────────────┐ ┌──────────────┐                  │
//!              │ Janitor      │ │ SSE /events  │                  │
//!              └──────────────┘ └──────────────┘                  │
//!                     └───────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod event_bus;
pub mod file_access;
pub mod ingest;
pub mod janitor;
pub mod metadata_store;
pub mod principal;
pub mod query;
pub mod rate_limit;
pub mod storage_bridge;

pub use api::{create_router, owner_scoped, start_api_server, AppState};
pub use config::Config;
pub use event_bus::{EventPublisher, InProcEventBus, UploadEvent, FILE_UPLOADED_TOPIC};
pub use file_access::{FileAccessService, SignedFileUrl};
pub use ingest::{IncomingFile, IngestError, IngestService};
pub use janitor::Janitor;
pub use metadata_store::{FileRecord, MetadataRepository, MetadataStore};
pub use principal::Principal;
pub use query::{PageRequest, PaginatedFiles, QueryService, UploadMetrics};
pub use rate_limit::UploadRateLimiter;
pub use storage_bridge::{BlobStore, Readiness, S3BlobStore, StorageBridge, StorageError};
