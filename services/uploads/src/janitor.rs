use crate::metadata_store::{MetadataError, MetadataRepository};
use crate::storage_bridge::{key_timestamp, StorageBridge, StorageError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum JanitorError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Deletes bucket objects no live file record references, once they are
/// older than the grace period
pub struct Janitor {
    storage: Arc<StorageBridge>,
    metadata: Arc<dyn MetadataRepository>,
    grace_period: Duration,
}

impl Janitor {
    pub fn new(
        storage: Arc<StorageBridge>,
        metadata: Arc<dyn MetadataRepository>,
        grace_period: Duration,
    ) -> Self {
        Self {
            storage,
            metadata,
            grace_period,
        }
    }

    /// Run a sweep every `period` until `shutdown` fires
    pub fn start(self: Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Janitor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(deleted) => info!(deleted, "Janitor sweep completed"),
                            Err(e) => error!(error = %e, "Janitor sweep failed"),
                        }
                    }
                }
            }
        })
    }

    /// One sweep. Returns the number of orphaned objects removed.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<usize, JanitorError> {
        self.sweep(Utc::now()).await
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, JanitorError> {
        // Keys first: a row committed after this listing still protects its blob.
        let keys = self.storage.list_keys().await?;
        let live = self.metadata.live_storage_keys().await?;

        let grace = chrono::Duration::from_std(self.grace_period)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = now - grace;

        let mut deleted = 0;
        for key in keys.iter().filter(|key| !live.contains(*key)) {
            let Some(stored_at) = key_timestamp(key) else {
                debug!(storage_key = %key, "Skipping object without a pipeline timestamp");
                continue;
            };
            if stored_at > cutoff {
                continue;
            }

            match self.storage.delete(key).await {
                Ok(()) => {
                    info!(storage_key = %key, stored_at = %stored_at, "Deleted orphaned object");
                    deleted += 1;
                }
                Err(e) => {
                    warn!(storage_key = %key, error = %e, "Failed to delete orphaned object");
                }
            }
        }

        metrics::counter!("uploads.janitor.orphans_deleted").increment(deleted as u64);
        Ok(deleted)
    }
}
