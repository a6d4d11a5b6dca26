// restore-sidecar/src/store/mod.rs
//! Persistent restore job bookkeeping consumed by the discovery loop.

#[cfg(test)]
pub(crate) mod memory;
pub(crate) mod postgres;

use std::collections::BTreeSet;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::AppError;
use crate::restore::job::{RestoreJob, RestoreJobStatus};

#[cfg(test)]
pub use memory::InMemoryRestoreJobStore;
pub use postgres::PgRestoreJobStore;

/// A slice as recorded in the job store, before it is bound to an instance's
/// staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceRecord {
    pub job_id: Uuid,
    pub slice_id: String,
    pub bucket_id: i16,
    pub upload_id: String,
    pub keyspace: String,
    pub table: String,
    pub storage_bucket: String,
    pub storage_key: String,
    pub compressed_size: u64,
    pub replicas: BTreeSet<String>,
}

#[async_trait]
pub trait RestoreJobStore: Send + Sync {
    /// Jobs created within the last `recency_days` days, in any status.
    async fn find_recent_jobs(&self, recency_days: u32) -> Result<Vec<RestoreJob>, AppError>;

    async fn find_slices(&self, job_id: Uuid) -> Result<Vec<SliceRecord>, AppError>;

    async fn update_status(&self, job_id: Uuid, status: RestoreJobStatus) -> Result<(), AppError>;
}
