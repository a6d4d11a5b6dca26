// restore-sidecar/src/restore/manager_group.rs
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::job::RestoreJob;
use super::manager::RestoreJobManager;
use super::processor::RestoreProcessor;
use super::slice::RestoreSlice;
use super::tracker::Status;
use crate::config::{InstanceMetadata, RestoreJobConfig};
use crate::errors::{AppError, RestoreJobError};

/// The restore job managers of every instance this sidecar manages.
pub struct RestoreJobManagerGroup {
    managers: BTreeMap<u32, Arc<RestoreJobManager>>,
}

impl RestoreJobManagerGroup {
    pub fn new(
        config: Arc<RestoreJobConfig>,
        instances: &[InstanceMetadata],
        processor: Arc<dyn RestoreProcessor>,
    ) -> Self {
        let managers = instances
            .iter()
            .map(|instance| {
                let manager = RestoreJobManager::new(
                    Arc::clone(&config),
                    instance.clone(),
                    Arc::clone(&processor),
                );
                (instance.id, Arc::new(manager))
            })
            .collect();
        Self { managers }
    }

    pub fn manager(&self, instance_id: u32) -> Option<&Arc<RestoreJobManager>> {
        self.managers.get(&instance_id)
    }

    pub fn managers(&self) -> impl Iterator<Item = &Arc<RestoreJobManager>> {
        self.managers.values()
    }

    pub fn start(&self) {
        for manager in self.managers.values() {
            manager.start();
        }
        info!(instances = self.managers.len(), "Restore job managers started");
    }

    pub fn stop(&self) {
        for manager in self.managers.values() {
            manager.stop();
        }
    }

    pub fn try_submit(
        &self,
        instance_id: u32,
        slice: Arc<RestoreSlice>,
        job: Arc<RestoreJob>,
    ) -> Result<Status, RestoreJobError> {
        match self.managers.get(&instance_id) {
            Some(manager) => manager.try_submit(slice, job),
            None => Err(RestoreJobError::retriable(format!(
                "No restore job manager for instance {}",
                instance_id
            ))),
        }
    }

    pub fn update_restore_job(&self, job: &Arc<RestoreJob>) {
        for manager in self.managers.values() {
            manager.update_restore_job(Arc::clone(job));
        }
    }

    /// Removes the job from every instance. Returns how many instances were
    /// tracking it.
    pub fn remove_job(&self, job_id: Uuid) -> usize {
        self.managers
            .values()
            .filter(|manager| manager.remove_job(job_id))
            .count()
    }

    /// Sweeps obsolete job directories of every instance concurrently.
    /// Resolves to the total number of directories deleted; the failure of
    /// one instance does not stop the others.
    pub async fn delete_obsolete_data(&self) -> Result<usize, AppError> {
        let sweeps: Vec<_> = self
            .managers
            .values()
            .map(|manager| (manager.instance().id, manager.delete_obsolete_data_async()))
            .collect();

        let mut deleted = 0;
        let mut failures = Vec::new();
        for (instance_id, sweep) in sweeps {
            match sweep.await {
                Ok(count) => deleted += count,
                Err(AppError::CleanupFailed { failures: instance_failures }) => {
                    warn!(instance_id, failed = instance_failures.len(), "Obsolete data cleanup partially failed");
                    failures.extend(instance_failures);
                }
                Err(e) => {
                    warn!(instance_id, error = %e, "Obsolete data cleanup failed");
                    return Err(e);
                }
            }
        }

        if failures.is_empty() {
            Ok(deleted)
        } else {
            Err(AppError::CleanupFailed { failures })
        }
    }
}
