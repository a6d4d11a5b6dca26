// restore-sidecar/src/restore/slice.rs
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::job::RestoreJob;
use super::tracker::RestoreSliceTracker;
use super::util;
use crate::errors::{AppError, RestoreJobError};
use crate::store::SliceRecord;

/// Identity of a slice within one instance: the same bucket of a job staged
/// into the same directory is the same piece of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SliceKey {
    pub job_id: Uuid,
    pub bucket_id: i16,
    pub target_path: PathBuf,
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.job_id, self.bucket_id, self.target_path.display())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SliceState {
    Created = 0,
    Pending = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl SliceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SliceState::Created,
            1 => SliceState::Pending,
            2 => SliceState::Completed,
            3 => SliceState::Failed,
            _ => SliceState::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SliceState::Completed | SliceState::Failed | SliceState::Cancelled
        )
    }
}

/// Outcome of a slice on one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One bucket of a restore job destined for one staging directory.
///
/// Slices are shared as `Arc<RestoreSlice>` between the tracker, the
/// dispatcher queue and the processor. All state changes are compare-and-set
/// on an atomic, so concurrent callers agree on a single winner.
pub struct RestoreSlice {
    slice_id: String,
    job_id: Uuid,
    bucket_id: i16,
    keyspace: String,
    table: String,
    storage_bucket: String,
    storage_key: String,
    compressed_size: u64,
    target_path_in_staging: PathBuf,
    replicas: BTreeSet<String>,
    replica_status: Mutex<HashMap<String, ReplicaStatus>>,
    state: AtomicU8,
    failure: Mutex<Option<RestoreJobError>>,
    tracker: OnceLock<Weak<RestoreSliceTracker>>,
    cancellation: CancellationToken,
}

impl RestoreSlice {
    pub fn builder() -> RestoreSliceBuilder {
        RestoreSliceBuilder::default()
    }

    pub fn key(&self) -> SliceKey {
        SliceKey {
            job_id: self.job_id,
            bucket_id: self.bucket_id,
            target_path: self.target_path_in_staging.clone(),
        }
    }

    pub fn slice_id(&self) -> &str {
        &self.slice_id
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn bucket_id(&self) -> i16 {
        self.bucket_id
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn storage_bucket(&self) -> &str {
        &self.storage_bucket
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    pub fn target_path_in_staging(&self) -> &Path {
        &self.target_path_in_staging
    }

    pub fn replicas(&self) -> &BTreeSet<String> {
        &self.replicas
    }

    pub fn replica_status(&self) -> HashMap<String, ReplicaStatus> {
        self.replica_status.lock().clone()
    }

    pub fn set_replica_status(&self, replica: impl Into<String>, status: ReplicaStatus) {
        self.replica_status.lock().insert(replica.into(), status);
    }

    pub fn state(&self) -> SliceState {
        SliceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn failure(&self) -> Option<RestoreJobError> {
        self.failure.lock().clone()
    }

    /// Token the processor polls to abort mid-transfer.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Current job descriptor, read through the owning tracker.
    ///
    /// `None` before registration and after the tracker has been discarded.
    pub fn job(&self) -> Option<Arc<RestoreJob>> {
        self.tracker
            .get()
            .and_then(Weak::upgrade)
            .map(|tracker| tracker.job())
    }

    /// Binds the slice to its tracker. A slice belongs to at most one tracker;
    /// returns `false` when it is already bound to a different one.
    pub fn register_tracker(&self, tracker: &Arc<RestoreSliceTracker>) -> bool {
        let candidate = Arc::downgrade(tracker);
        let registered = self.tracker.get_or_init(|| candidate.clone());
        Weak::ptr_eq(registered, &candidate)
    }

    /// Hands the slice to the processor queue of its tracker. Only the caller
    /// that moves the slice out of CREATED enqueues it.
    pub(crate) fn submit(self: &Arc<Self>) -> bool {
        let Some(tracker) = self.tracker.get().and_then(Weak::upgrade) else {
            return false;
        };
        if !self.transition(|s| s == SliceState::Created, SliceState::Pending) {
            return false;
        }
        tracker.enqueue(Arc::clone(self));
        true
    }

    /// Reopens a slice whose last attempt failed with a retriable error and
    /// queues it again. Fatal failures and cancelled slices stay final.
    pub(crate) fn retry(self: &Arc<Self>) -> bool {
        let Some(tracker) = self.tracker.get().and_then(Weak::upgrade) else {
            return false;
        };
        let mut failure = self.failure.lock();
        if !matches!(*failure, Some(RestoreJobError::Retriable { .. })) {
            return false;
        }
        if !self.transition(|s| s == SliceState::Failed, SliceState::Pending) {
            return false;
        }
        *failure = None;
        drop(failure);
        debug!(slice_key = %self.key(), "Retrying restore slice");
        tracker.enqueue(Arc::clone(self));
        true
    }

    /// Marks the slice completed. Completing twice is fine; completing a
    /// failed or cancelled slice is not.
    pub fn complete(&self) -> bool {
        if self.state() == SliceState::Completed {
            return true;
        }
        let completed = self.transition(|s| !s.is_terminal(), SliceState::Completed);
        if completed {
            debug!(slice_key = %self.key(), "Restore slice completed");
        }
        completed
    }

    /// Marks the slice failed and records the error. A fatal error is also
    /// reported to the tracker, which makes it the job's sticky failure.
    pub fn fail(&self, error: RestoreJobError) -> bool {
        let failed = {
            let mut failure = self.failure.lock();
            let failed = self.transition(|s| !s.is_terminal(), SliceState::Failed);
            if failed {
                *failure = Some(error.clone());
            }
            failed
        };
        if let RestoreJobError::Fatal(failure) = error {
            if let Some(tracker) = self.tracker.get().and_then(Weak::upgrade) {
                tracker.on_fatal_failure(failure);
            }
        }
        failed
    }

    /// Cancels a slice that has not reached a terminal state and signals the
    /// processor through the cancellation token.
    pub fn cancel(&self) -> bool {
        let cancelled = self.transition(|s| !s.is_terminal(), SliceState::Cancelled);
        if cancelled {
            self.cancellation.cancel();
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == SliceState::Cancelled
    }

    fn transition(&self, allowed_from: impl Fn(SliceState) -> bool, to: SliceState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !allowed_from(SliceState::from_u8(current)) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for RestoreSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreSlice")
            .field("slice_id", &self.slice_id)
            .field("job_id", &self.job_id)
            .field("bucket_id", &self.bucket_id)
            .field("target_path_in_staging", &self.target_path_in_staging)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct RestoreSliceBuilder {
    slice_id: Option<String>,
    job_id: Option<Uuid>,
    bucket_id: i16,
    keyspace: String,
    table: String,
    storage_bucket: String,
    storage_key: String,
    compressed_size: u64,
    staging: Option<(PathBuf, String)>,
    replicas: BTreeSet<String>,
}

impl RestoreSliceBuilder {
    /// Prefills the builder from a job store record. The staging location is
    /// instance specific and still has to be set.
    pub fn from_record(record: &SliceRecord) -> Self {
        Self::default()
            .slice_id(record.slice_id.clone())
            .job_id(record.job_id)
            .bucket_id(record.bucket_id)
            .keyspace(record.keyspace.clone())
            .table(record.table.clone())
            .storage_bucket(record.storage_bucket.clone())
            .storage_key(record.storage_key.clone())
            .compressed_size(record.compressed_size)
            .replicas(record.replicas.clone())
    }

    pub fn slice_id(mut self, slice_id: impl Into<String>) -> Self {
        self.slice_id = Some(slice_id.into());
        self
    }

    pub fn job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn bucket_id(mut self, bucket_id: i16) -> Self {
        self.bucket_id = bucket_id;
        self
    }

    pub fn keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = keyspace.into();
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn storage_bucket(mut self, storage_bucket: impl Into<String>) -> Self {
        self.storage_bucket = storage_bucket.into();
        self
    }

    pub fn storage_key(mut self, storage_key: impl Into<String>) -> Self {
        self.storage_key = storage_key.into();
        self
    }

    pub fn compressed_size(mut self, compressed_size: u64) -> Self {
        self.compressed_size = compressed_size;
        self
    }

    /// Stages the slice under `<staging_dir>/restore-<job id>/<upload_id>/<keyspace>/<table>`.
    pub fn target_path_in_staging(mut self, staging_dir: impl Into<PathBuf>, upload_id: impl Into<String>) -> Self {
        self.staging = Some((staging_dir.into(), upload_id.into()));
        self
    }

    pub fn replicas(mut self, replicas: BTreeSet<String>) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn build(self) -> Result<RestoreSlice, AppError> {
        let job_id = self
            .job_id
            .ok_or_else(|| AppError::InvalidInput("restore slice requires a job id".to_string()))?;
        let (staging_dir, upload_id) = self.staging.ok_or_else(|| {
            AppError::InvalidInput("restore slice requires a staging location".to_string())
        })?;
        let target_path_in_staging = staging_dir
            .join(util::prefixed_job_id(&job_id))
            .join(upload_id)
            .join(&self.keyspace)
            .join(&self.table);

        let replica_status = self
            .replicas
            .iter()
            .map(|replica| (replica.clone(), ReplicaStatus::Pending))
            .collect();

        Ok(RestoreSlice {
            slice_id: self
                .slice_id
                .unwrap_or_else(|| format!("{}-{}", job_id, self.bucket_id)),
            job_id,
            bucket_id: self.bucket_id,
            keyspace: self.keyspace,
            table: self.table,
            storage_bucket: self.storage_bucket,
            storage_key: self.storage_key,
            compressed_size: self.compressed_size,
            target_path_in_staging,
            replicas: self.replicas,
            replica_status: Mutex::new(replica_status),
            state: AtomicU8::new(SliceState::Created as u8),
            failure: Mutex::new(None),
            tracker: OnceLock::new(),
            cancellation: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_slice() -> RestoreSlice {
        RestoreSlice::builder()
            .job_id(util::new_time_uuid())
            .keyspace("ks")
            .table("tbl")
            .target_path_in_staging("/staging", "upload-1")
            .build()
            .expect("slice builds")
    }

    #[test]
    fn test_target_path_layout() {
        let slice = test_slice();
        let expected = PathBuf::from("/staging")
            .join(util::prefixed_job_id(&slice.job_id()))
            .join("upload-1")
            .join("ks")
            .join("tbl");
        assert_eq!(slice.target_path_in_staging(), expected.as_path());
        assert_eq!(slice.key().target_path, expected);
    }

    #[test]
    fn test_build_requires_job_id_and_staging() {
        assert!(RestoreSlice::builder().target_path_in_staging("/s", "u").build().is_err());
        assert!(RestoreSlice::builder().job_id(util::new_time_uuid()).build().is_err());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let slice = test_slice();
        assert_eq!(slice.state(), SliceState::Created);
        assert!(slice.complete());
        assert!(slice.complete(), "completing twice is idempotent");
        assert!(!slice.cancel());
        assert!(!slice.fail(RestoreJobError::retriable("late")));
        assert_eq!(slice.state(), SliceState::Completed);
        assert!(slice.failure().is_none());
    }

    #[test]
    fn test_cancel_signals_token() {
        let slice = test_slice();
        let token = slice.cancellation_token();
        assert!(!token.is_cancelled());
        assert!(slice.cancel());
        assert!(slice.is_cancelled());
        assert!(token.is_cancelled());
        assert!(!slice.complete());
        assert!(!slice.cancel(), "cancelling a terminal slice is a no-op");
    }

    #[test]
    fn test_fail_records_error() {
        let slice = test_slice();
        assert!(slice.fail(RestoreJobError::retriable("connection reset")));
        assert_eq!(slice.state(), SliceState::Failed);
        assert!(matches!(slice.failure(), Some(RestoreJobError::Retriable { .. })));
        assert!(!slice.fail(RestoreJobError::retriable("again")));
    }

    #[test]
    fn test_unregistered_slice_has_no_job_and_cannot_submit() {
        let slice = Arc::new(test_slice());
        assert!(slice.job().is_none());
        assert!(!slice.submit());
        assert_eq!(slice.state(), SliceState::Created);
    }

    #[test]
    fn test_from_record_starts_replicas_pending() {
        let record = SliceRecord {
            job_id: util::new_time_uuid(),
            slice_id: "slice-7".to_string(),
            bucket_id: 7,
            upload_id: "upload-1".to_string(),
            keyspace: "ks".to_string(),
            table: "tbl".to_string(),
            storage_bucket: "bucket".to_string(),
            storage_key: "key".to_string(),
            compressed_size: 42,
            replicas: ["10.0.0.1".to_string(), "10.0.0.2".to_string()].into_iter().collect(),
        };
        let slice = RestoreSliceBuilder::from_record(&record)
            .target_path_in_staging("/staging", record.upload_id.clone())
            .build()
            .expect("slice builds");

        assert_eq!(slice.slice_id(), "slice-7");
        assert_eq!(slice.bucket_id(), 7);
        assert_eq!(slice.compressed_size(), 42);
        assert_eq!(slice.replicas(), &record.replicas);
        assert_eq!(slice.replica_status().get("10.0.0.2"), Some(&ReplicaStatus::Pending));
        assert_eq!(slice.replica_status().len(), 2);
    }
}
