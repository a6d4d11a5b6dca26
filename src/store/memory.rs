// restore-sidecar/src/store/memory.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{RestoreJobStore, SliceRecord};
use crate::errors::AppError;
use crate::restore::job::{RestoreJob, RestoreJobStatus};

/// Job store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRestoreJobStore {
    jobs: RwLock<HashMap<Uuid, RestoreJob>>,
    slices: RwLock<HashMap<Uuid, Vec<SliceRecord>>>,
}

impl InMemoryRestoreJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&self, job: RestoreJob) {
        self.jobs.write().insert(job.job_id, job);
    }

    pub fn insert_slice(&self, slice: SliceRecord) {
        self.slices.write().entry(slice.job_id).or_default().push(slice);
    }

    pub fn job(&self, job_id: Uuid) -> Option<RestoreJob> {
        self.jobs.read().get(&job_id).cloned()
    }
}

#[async_trait]
impl RestoreJobStore for InMemoryRestoreJobStore {
    async fn find_recent_jobs(&self, recency_days: u32) -> Result<Vec<RestoreJob>, AppError> {
        let cutoff = Utc::now() - Duration::days(i64::from(recency_days));
        let mut jobs: Vec<RestoreJob> = self
            .jobs
            .read()
            .values()
            .filter(|job| job.created_at().is_some_and(|created| created >= cutoff))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at());
        Ok(jobs)
    }

    async fn find_slices(&self, job_id: Uuid) -> Result<Vec<SliceRecord>, AppError> {
        Ok(self.slices.read().get(&job_id).cloned().unwrap_or_default())
    }

    async fn update_status(&self, job_id: Uuid, status: RestoreJobStatus) -> Result<(), AppError> {
        match self.jobs.write().get_mut(&job_id) {
            Some(job) => {
                job.status = status;
                Ok(())
            }
            None => Err(AppError::InvalidInput(format!("Unknown restore job {}", job_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::util;

    #[tokio::test]
    async fn test_recent_jobs_respect_recency() -> anyhow::Result<()> {
        let store = InMemoryRestoreJobStore::new();
        let now = Utc::now();
        let recent = RestoreJob::new(util::time_uuid_at(now.timestamp_millis()), "ks", "t", now);
        let stale = RestoreJob::new(
            util::time_uuid_at((now - Duration::days(10)).timestamp_millis()),
            "ks",
            "t",
            now,
        );
        store.insert_job(recent.clone());
        store.insert_job(stale);

        let jobs = store.find_recent_jobs(5).await?;
        assert_eq!(jobs, vec![recent.clone()]);

        store.update_status(recent.job_id, RestoreJobStatus::Succeeded).await?;
        assert_eq!(store.job(recent.job_id).map(|j| j.status), Some(RestoreJobStatus::Succeeded));
        assert!(store.update_status(Uuid::new_v4(), RestoreJobStatus::Failed).await.is_err());
        Ok(())
    }
}
