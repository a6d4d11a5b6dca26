// restore-sidecar/src/restore/tracker.rs
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::job::RestoreJob;
use super::processor::SliceQueue;
use super::slice::{RestoreSlice, SliceKey, SliceState};
use crate::errors::{RestoreJobError, RestoreJobFatalError};

/// Result of submitting a slice. Stable across repeated submissions so
/// callers can poll with the same request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// First submission; the slice was handed to the processor queue.
    Created,
    /// Already known and not completed.
    Pending,
    Completed,
}

/// Slice counts of one job on one instance, by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub created: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobProgress {
    pub fn total(&self) -> usize {
        self.created + self.pending + self.completed + self.failed + self.cancelled
    }
}

/// Tracks every slice of one restore job on one instance.
///
/// Owns the canonical job descriptor that all of its slices read, and the
/// job's sticky fatal failure.
pub struct RestoreSliceTracker {
    job: RwLock<Arc<RestoreJob>>,
    slices: DashMap<SliceKey, Arc<RestoreSlice>>,
    fatal_failure: OnceLock<Arc<RestoreJobFatalError>>,
    queue: SliceQueue,
}

impl RestoreSliceTracker {
    pub fn new(job: Arc<RestoreJob>, queue: SliceQueue) -> Arc<Self> {
        Arc::new(Self {
            job: RwLock::new(job),
            slices: DashMap::new(),
            fatal_failure: OnceLock::new(),
            queue,
        })
    }

    pub fn job(&self) -> Arc<RestoreJob> {
        Arc::clone(&self.job.read())
    }

    pub fn job_id(&self) -> Uuid {
        self.job.read().job_id
    }

    /// Swaps the job descriptor. Slices read through the tracker, so they
    /// observe the new value on their next `job()` call.
    pub fn update_job(&self, job: Arc<RestoreJob>) {
        *self.job.write() = job;
    }

    pub fn fatal_failure(&self) -> Option<Arc<RestoreJobFatalError>> {
        self.fatal_failure.get().cloned()
    }

    /// Admits a slice at most once.
    ///
    /// Once the job has a fatal failure, every submission fails with that same
    /// failure, whether or not the slice was seen before.
    pub fn try_submit(self: &Arc<Self>, slice: Arc<RestoreSlice>) -> Result<Status, RestoreJobError> {
        if let Some(failure) = self.fatal_failure.get() {
            return Err(Arc::clone(failure).into());
        }

        let existing = match self.slices.entry(slice.key()) {
            Entry::Occupied(existing) => Some(Arc::clone(existing.get())),
            Entry::Vacant(vacant) => {
                if !slice.register_tracker(self) {
                    return Err(RestoreJobError::retriable(format!(
                        "Slice {} is already registered with another tracker",
                        slice.key()
                    )));
                }
                vacant.insert(Arc::clone(&slice));
                None
            }
        };
        if let Some(existing) = existing {
            return Ok(match existing.state() {
                SliceState::Completed => Status::Completed,
                // a retriable failure goes back to the processor queue
                SliceState::Failed => {
                    existing.retry();
                    Status::Pending
                }
                _ => Status::Pending,
            });
        }

        slice.submit();
        debug!(slice_key = %slice.key(), "Restore slice admitted");

        // A fatal failure recorded while this slice was being admitted missed
        // it during the cascade.
        if let Some(failure) = self.fatal_failure.get() {
            slice.cancel();
            return Err(Arc::clone(failure).into());
        }
        Ok(Status::Created)
    }

    /// Records the job's fatal failure. The first failure wins; later ones are
    /// dropped. Slices that are still in flight are cancelled, completed ones
    /// are left alone.
    pub fn on_fatal_failure(&self, failure: Arc<RestoreJobFatalError>) {
        let recorded = self.fatal_failure.get_or_init(|| Arc::clone(&failure));
        if !Arc::ptr_eq(recorded, &failure) {
            debug!(job_id = %self.job_id(), error = %failure, "Ignoring subsequent fatal failure");
            return;
        }

        warn!(job_id = %self.job_id(), error = %failure, "Restore job failed fatally");
        let cancelled = self
            .snapshot()
            .into_iter()
            .filter(|slice| slice.cancel())
            .count();
        if cancelled > 0 {
            debug!(job_id = %self.job_id(), cancelled, "Cancelled in-flight slices of failed job");
        }
    }

    /// Cancels every slice that has not reached a terminal state. Returns the
    /// number of slices cancelled.
    pub fn cancel_all(&self) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|slice| slice.cancel())
            .count()
    }

    pub fn progress(&self) -> JobProgress {
        let mut progress = JobProgress::default();
        for slice in self.snapshot() {
            match slice.state() {
                SliceState::Created => progress.created += 1,
                SliceState::Pending => progress.pending += 1,
                SliceState::Completed => progress.completed += 1,
                SliceState::Failed => progress.failed += 1,
                SliceState::Cancelled => progress.cancelled += 1,
            }
        }
        progress
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    pub(crate) fn enqueue(&self, slice: Arc<RestoreSlice>) {
        self.queue.enqueue(slice);
    }

    fn snapshot(&self) -> Vec<Arc<RestoreSlice>> {
        self.slices.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}
