// restore-sidecar/src/restore/discoverer.rs
//! Background discovery of restore work.
//!
//! Each cycle reads recent jobs from the job store, feeds their slices to the
//! instance managers and kicks off obsolete staging data cleanup. The loop
//! polls quickly while it keeps finding work and backs off once a cycle comes
//! back empty.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::{RestoreJob, RestoreJobStatus};
use super::manager_group::RestoreJobManagerGroup;
use super::slice::RestoreSliceBuilder;
use super::tracker::Status;
use crate::config::RestoreJobConfig;
use crate::errors::{AppError, RestoreJobError};
use crate::store::{RestoreJobStore, SliceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// The last cycle found work.
    Active,
    /// The last cycle found nothing.
    Idle,
}

impl DiscoveryMode {
    pub fn after_cycle(found_work: bool) -> Self {
        if found_work {
            DiscoveryMode::Active
        } else {
            DiscoveryMode::Idle
        }
    }

    pub fn delay(self, config: &RestoreJobConfig) -> Duration {
        match self {
            DiscoveryMode::Active => config.job_discovery_active_loop_delay(),
            DiscoveryMode::Idle => config.job_discovery_idle_loop_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub active_jobs: usize,
    pub removed_jobs: usize,
    pub aborted_jobs: usize,
    pub failed_jobs: usize,
    pub submitted_slices: usize,
    /// Active jobs whose slices could not be read this cycle.
    pub slice_lookup_failures: usize,
}

impl DiscoveryReport {
    pub fn found_work(&self) -> bool {
        self.active_jobs > 0
    }
}

pub struct RestoreJobDiscoverer {
    config: Arc<RestoreJobConfig>,
    store: Arc<dyn RestoreJobStore>,
    managers: Arc<RestoreJobManagerGroup>,
    mode: DiscoveryMode,
    cleanup: Option<JoinHandle<()>>,
}

impl RestoreJobDiscoverer {
    pub fn new(
        config: Arc<RestoreJobConfig>,
        store: Arc<dyn RestoreJobStore>,
        managers: Arc<RestoreJobManagerGroup>,
    ) -> Self {
        Self {
            config,
            store,
            managers,
            mode: DiscoveryMode::Idle,
            cleanup: None,
        }
    }

    pub fn mode(&self) -> DiscoveryMode {
        self.mode
    }

    /// Runs discovery cycles until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Restore job discovery started");
        loop {
            match self.run_once().await {
                Ok(report) => debug!(?report, mode = ?self.mode, "Restore job discovery cycle finished"),
                Err(e) => {
                    warn!(error = %e, "Restore job discovery cycle failed");
                    self.mode = DiscoveryMode::Idle;
                }
            }

            let delay = self.mode.delay(&self.config);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.abort();
        }
        info!("Restore job discovery stopped");
    }

    /// One discovery cycle. Switches the loop mode according to whether any
    /// job still needs attention.
    pub async fn run_once(&mut self) -> Result<DiscoveryReport, AppError> {
        let jobs = match self
            .store
            .find_recent_jobs(self.config.job_discovery_minimum_recency_days())
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                // staging data ages out even while the store is unreachable
                self.trigger_cleanup();
                return Err(e);
            }
        };
        let now = Utc::now();
        let mut report = DiscoveryReport::default();

        for job in jobs {
            let job = Arc::new(job);
            if job.is_terminal() {
                if self.managers.remove_job(job.job_id) > 0 {
                    report.removed_jobs += 1;
                }
                continue;
            }
            if job.is_expired(now) {
                info!(job_id = %job.job_id, "Aborting expired restore job");
                self.mark_job(&job, RestoreJobStatus::Aborted).await;
                self.managers.remove_job(job.job_id);
                report.aborted_jobs += 1;
                continue;
            }

            report.active_jobs += 1;
            self.managers.update_restore_job(&job);
            let records = match self.store.find_slices(job.job_id).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "Failed to read restore slices");
                    report.slice_lookup_failures += 1;
                    continue;
                }
            };
            match self.submit_slices(&job, &records) {
                Ok(submitted) => report.submitted_slices += submitted,
                Err(failure) => {
                    warn!(job_id = %job.job_id, error = %failure, "Restore job has failed, marking it FAILED");
                    self.mark_job(&job, RestoreJobStatus::Failed).await;
                    self.managers
                        .update_restore_job(&Arc::new(job.with_status(RestoreJobStatus::Failed)));
                    report.failed_jobs += 1;
                }
            }
        }

        self.mode = DiscoveryMode::after_cycle(report.found_work());
        for manager in self.managers.managers() {
            debug!(
                instance_id = manager.instance().id,
                queued = manager.queued_slices(),
                active = manager.active_slices(),
                "Restore slice backlog"
            );
        }
        self.trigger_cleanup();
        Ok(report)
    }

    /// Submits every slice of the job to each local instance holding one of
    /// its replicas. Stops at the job's fatal failure.
    fn submit_slices(&self, job: &Arc<RestoreJob>, records: &[SliceRecord]) -> Result<usize, RestoreJobError> {
        let mut submitted = 0;
        for record in records {
            for manager in self.managers.managers() {
                let instance = manager.instance();
                let is_replica = record.replicas.is_empty()
                    || record.replicas.iter().any(|replica| instance.matches_replica(replica));
                if !is_replica {
                    continue;
                }

                let slice = match RestoreSliceBuilder::from_record(record)
                    .target_path_in_staging(manager.staging_dir(), record.upload_id.clone())
                    .build()
                {
                    Ok(slice) => Arc::new(slice),
                    Err(e) => {
                        warn!(job_id = %job.job_id, slice_id = %record.slice_id, error = %e, "Skipping malformed slice");
                        continue;
                    }
                };

                match manager.try_submit(slice, Arc::clone(job)) {
                    Ok(Status::Created) => submitted += 1,
                    Ok(_) => {}
                    Err(e) if !e.is_fatal() => {
                        warn!(job_id = %job.job_id, slice_id = %record.slice_id, error = %e, "Slice submission failed");
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
        }
        Ok(submitted)
    }

    async fn mark_job(&self, job: &RestoreJob, status: RestoreJobStatus) {
        if let Err(e) = self.store.update_status(job.job_id, status).await {
            warn!(job_id = %job.job_id, %status, error = %e, "Failed to update restore job status");
        }
    }

    /// Starts an obsolete data sweep unless the previous one is still running.
    fn trigger_cleanup(&mut self) {
        if let Some(previous) = &self.cleanup {
            if !previous.is_finished() {
                debug!("Previous obsolete data cleanup still running");
                return;
            }
        }
        let managers = Arc::clone(&self.managers);
        self.cleanup = Some(tokio::spawn(async move {
            match managers.delete_obsolete_data().await {
                Ok(0) => {}
                Ok(deleted) => info!(deleted, "Deleted obsolete restore job directories"),
                Err(e) => warn!(error = %e, "Obsolete restore data cleanup failed"),
            }
        }));
    }
}
