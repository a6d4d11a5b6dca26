// restore-sidecar/src/restore/manager.rs
use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use super::job::RestoreJob;
use super::processor::{RestoreProcessor, SliceDispatcher};
use super::slice::RestoreSlice;
use super::tracker::{JobProgress, RestoreSliceTracker, Status};
use super::util;
use crate::config::{InstanceMetadata, RestoreJobConfig};
use crate::errors::{AppError, RestoreJobError};

type JobTrackers = DashMap<Uuid, Arc<RestoreSliceTracker>>;

/// Restore orchestration for one managed database instance.
///
/// Owns one slice tracker per job seen on this instance and the dispatcher
/// that bounds how many slices are processed at once.
pub struct RestoreJobManager {
    instance: InstanceMetadata,
    config: Arc<RestoreJobConfig>,
    jobs: Arc<JobTrackers>,
    dispatcher: SliceDispatcher,
    shutdown: CancellationToken,
}

impl RestoreJobManager {
    pub fn new(
        config: Arc<RestoreJobConfig>,
        instance: InstanceMetadata,
        processor: Arc<dyn RestoreProcessor>,
    ) -> Self {
        let dispatcher = SliceDispatcher::new(instance.clone(), &config, processor);
        Self {
            instance,
            config,
            jobs: Arc::new(DashMap::new()),
            dispatcher,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn instance(&self) -> &InstanceMetadata {
        &self.instance
    }

    pub fn staging_dir(&self) -> &Path {
        &self.instance.staging_dir
    }

    /// Starts processing admitted slices. Until then they stay queued.
    pub fn start(&self) -> bool {
        self.dispatcher.start(self.shutdown.child_token())
    }

    /// Stops the dispatcher. Slices already inside the processor are not
    /// interrupted; queued ones stay PENDING.
    pub fn stop(&self) {
        self.shutdown.cancel();
        info!(instance_id = self.instance.id, "Restore job manager stopped");
    }

    /// Submits a slice of `job`, creating the job's tracker on first use.
    pub fn try_submit(&self, slice: Arc<RestoreSlice>, job: Arc<RestoreJob>) -> Result<Status, RestoreJobError> {
        if slice.job_id() != job.job_id {
            return Err(RestoreJobError::retriable(format!(
                "Slice {} does not belong to job {}",
                slice.key(),
                job.job_id
            )));
        }
        let tracker = Arc::clone(
            self.jobs
                .entry(job.job_id)
                .or_insert_with(|| RestoreSliceTracker::new(job, self.dispatcher.queue()))
                .value(),
        );
        tracker.try_submit(slice)
    }

    /// Replaces the job descriptor seen by the job's slices. No-op for jobs
    /// without slices on this instance.
    pub fn update_restore_job(&self, job: Arc<RestoreJob>) {
        if let Some(tracker) = self.jobs.get(&job.job_id) {
            tracker.update_job(job);
        }
    }

    /// Forgets the job and cancels its slices that are still in flight.
    pub fn remove_job(&self, job_id: Uuid) -> bool {
        match self.jobs.remove(&job_id) {
            Some((_, tracker)) => {
                let cancelled = tracker.cancel_all();
                info!(
                    instance_id = self.instance.id,
                    %job_id,
                    slices = tracker.slice_count(),
                    cancelled,
                    "Removed restore job"
                );
                true
            }
            None => false,
        }
    }

    pub fn job_progress(&self, job_id: Uuid) -> Option<JobProgress> {
        self.jobs.get(&job_id).map(|tracker| tracker.progress())
    }

    pub fn tracked_job_ids(&self) -> Vec<Uuid> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }

    pub fn queued_slices(&self) -> usize {
        self.dispatcher.queued_count()
    }

    pub fn active_slices(&self) -> usize {
        self.dispatcher.active_count()
    }

    /// Whether `path` is a restore job directory old enough to be deleted.
    /// Never fails; anything unexpected is simply not obsolete.
    pub fn is_obsolete_job_directory(&self, path: &Path) -> bool {
        is_obsolete_job_dir(path, self.config.job_discovery_minimum_recency(), Utc::now())
    }

    /// Deletes every obsolete job directory under the staging root on a
    /// blocking worker thread. Resolves to the number of directories deleted.
    pub fn delete_obsolete_data_async(&self) -> impl Future<Output = Result<usize, AppError>> + Send + use<> {
        let staging_dir = self.instance.staging_dir.clone();
        let recency = self.config.job_discovery_minimum_recency();
        let jobs = Arc::clone(&self.jobs);
        let instance_id = self.instance.id;
        let handle = tokio::task::spawn_blocking(move || {
            delete_obsolete_job_dirs(instance_id, &staging_dir, recency, &jobs)
        });
        async move { handle.await? }
    }
}

/// The directory name is the only source of the job's age. The boundary is
/// exclusive: a directory exactly `recency` old is kept.
pub(crate) fn is_obsolete_job_dir(path: &Path, recency: Duration, now: DateTime<Utc>) -> bool {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return false;
    };
    if !metadata.is_dir() {
        return false;
    }
    let Some(job_id) = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(util::job_id_from_dir_name)
    else {
        return false;
    };
    let Some(created_millis) = util::unix_millis_of(&job_id) else {
        return false;
    };
    let age_millis = i128::from(now.timestamp_millis()) - i128::from(created_millis);
    age_millis > recency.as_millis() as i128
}

fn delete_obsolete_job_dirs(
    instance_id: u32,
    staging_dir: &Path,
    recency: Duration,
    jobs: &JobTrackers,
) -> Result<usize, AppError> {
    let entries = match fs::read_dir(staging_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(instance_id, path = %staging_dir.display(), "Staging directory does not exist yet");
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let now = Utc::now();
    let mut deleted = 0;
    let mut failures: Vec<(PathBuf, std::io::Error)> = Vec::new();
    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                failures.push((staging_dir.to_path_buf(), e));
                continue;
            }
        };
        if !is_obsolete_job_dir(&path, recency, now) {
            continue;
        }

        let file_count = WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .count();
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                deleted += 1;
                info!(instance_id, path = %path.display(), file_count, "Deleted obsolete restore job directory");
                let job_id = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(util::job_id_from_dir_name);
                if let Some((job_id, tracker)) = job_id.and_then(|id| jobs.remove(&id)) {
                    tracker.cancel_all();
                    debug!(instance_id, %job_id, "Dropped tracker of garbage-collected job");
                }
            }
            Err(e) => {
                warn!(instance_id, path = %path.display(), error = %e, "Failed to delete obsolete restore job directory");
                failures.push((path, e));
            }
        }
    }

    if failures.is_empty() {
        Ok(deleted)
    } else {
        Err(AppError::CleanupFailed { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RestoreJobFatalError;
    use crate::restore::processor::tests::{ScriptedProcessor, test_config, test_instance, wait_until};
    use crate::restore::slice::SliceState;
    use tempfile::TempDir;

    const JOB_RECENCY_DAYS: i64 = 1;
    const DAY_MILLIS: i64 = 24 * 60 * 60 * 1_000;

    struct Fixture {
        manager: RestoreJobManager,
        staging: TempDir,
    }

    fn fixture() -> Fixture {
        let staging = TempDir::new().expect("temp dir");
        let manager = RestoreJobManager::new(
            Arc::new(test_config(1)),
            test_instance(staging.path().to_path_buf()),
            Arc::new(ScriptedProcessor::new()),
        );
        Fixture { manager, staging }
    }

    fn new_job() -> Arc<RestoreJob> {
        Arc::new(RestoreJob::new(
            util::new_time_uuid(),
            "ks",
            "tbl",
            Utc::now() + chrono::Duration::days(1),
        ))
    }

    fn slice_of(job: &RestoreJob, staging: &Path, bucket_id: i16) -> Arc<RestoreSlice> {
        Arc::new(
            RestoreSlice::builder()
                .job_id(job.job_id)
                .bucket_id(bucket_id)
                .keyspace("ks")
                .table("tbl")
                .target_path_in_staging(staging, "uploadId")
                .build()
                .expect("slice builds"),
        )
    }

    fn job_dir_created_at(staging: &Path, unix_millis: i64) -> PathBuf {
        let dir = staging.join(util::prefixed_job_id(&util::time_uuid_at(unix_millis)));
        fs::create_dir_all(&dir).expect("create job dir");
        dir
    }

    fn create_files(dir: &Path, count: usize) {
        for i in 0..count {
            fs::write(dir.join(format!("file-{}", i)), b"data").expect("write file");
        }
        assert_eq!(fs::read_dir(dir).expect("list").count(), count);
    }

    #[test]
    fn test_try_submit() {
        let Fixture { manager, staging } = fixture();
        let job = new_job();
        let slice = slice_of(&job, staging.path(), 0);

        assert_eq!(manager.try_submit(Arc::clone(&slice), Arc::clone(&job)), Ok(Status::Created));
        assert_eq!(manager.try_submit(Arc::clone(&slice), Arc::clone(&job)), Ok(Status::Pending));

        slice.complete();
        assert_eq!(manager.try_submit(slice, job), Ok(Status::Completed));
    }

    #[test]
    fn test_try_submit_after_job_failure() {
        let Fixture { manager, staging } = fixture();
        let job = new_job();
        let slice = slice_of(&job, staging.path(), 0);
        assert_eq!(manager.try_submit(Arc::clone(&slice), Arc::clone(&job)), Ok(Status::Created));

        let failure = Arc::new(RestoreJobFatalError::new("fatal"));
        slice.fail(RestoreJobError::Fatal(Arc::clone(&failure)));
        let expected = RestoreJobError::Fatal(Arc::clone(&failure));
        assert_eq!(manager.try_submit(Arc::clone(&slice), Arc::clone(&job)), Err(expected.clone()));

        // once a slice failed fatally, no other slice of the job is admitted
        let another_slice = slice_of(&job, staging.path(), 1);
        assert_eq!(manager.try_submit(another_slice, Arc::clone(&job)), Err(expected));

        // slices of other jobs are unaffected
        let other_job = new_job();
        let other_slice = slice_of(&other_job, staging.path(), 0);
        assert_eq!(manager.try_submit(other_slice, other_job), Ok(Status::Created));
    }

    #[test]
    fn test_try_submit_rejects_slice_of_another_job() {
        let Fixture { manager, staging } = fixture();
        let slice = slice_of(&new_job(), staging.path(), 0);
        assert!(matches!(
            manager.try_submit(slice, new_job()),
            Err(RestoreJobError::Retriable { .. })
        ));
    }

    #[test]
    fn test_remove_job_cancels_in_flight_slices() {
        let Fixture { manager, staging } = fixture();
        let job = new_job();
        let in_flight = slice_of(&job, staging.path(), 0);
        let completed = slice_of(&job, staging.path(), 1);
        manager.try_submit(Arc::clone(&in_flight), Arc::clone(&job)).expect("admitted");
        manager.try_submit(Arc::clone(&completed), Arc::clone(&job)).expect("admitted");
        completed.complete();
        assert!(!in_flight.is_cancelled());

        assert!(manager.remove_job(job.job_id));

        assert!(in_flight.is_cancelled());
        assert_eq!(completed.state(), SliceState::Completed);
        assert!(manager.job_progress(job.job_id).is_none());
        assert!(!manager.remove_job(job.job_id));
    }

    #[test]
    fn test_update_restore_job_for_submitted_slice() {
        let Fixture { manager, staging } = fixture();
        let job = new_job();
        let slice = slice_of(&job, staging.path(), 0);
        assert_eq!(manager.try_submit(Arc::clone(&slice), Arc::clone(&job)), Ok(Status::Created));
        assert!(Arc::ptr_eq(&slice.job().expect("registered"), &job));

        manager.update_restore_job(Arc::clone(&job));
        assert!(Arc::ptr_eq(&slice.job().expect("registered"), &job));

        let updated_job = Arc::new(RestoreJob::new(job.job_id, "ks", "tbl", job.expire_at));
        manager.update_restore_job(Arc::clone(&updated_job));
        let seen = slice.job().expect("registered");
        assert!(!Arc::ptr_eq(&seen, &job));
        assert!(Arc::ptr_eq(&seen, &updated_job));
    }

    #[test]
    fn test_update_unknown_job_is_noop() {
        let Fixture { manager, .. } = fixture();
        manager.update_restore_job(new_job());
        assert!(manager.tracked_job_ids().is_empty());
    }

    #[test]
    fn test_check_directory_is_obsolete() -> anyhow::Result<()> {
        let Fixture { manager, staging } = fixture();
        let now = Utc::now().timestamp_millis();

        // not old enough
        let job_dir = job_dir_created_at(staging.path(), now);
        assert!(!manager.is_obsolete_job_directory(&job_dir));
        // still not old enough, 9 seconds short of a day
        let job_dir = job_dir_created_at(staging.path(), now - JOB_RECENCY_DAYS * DAY_MILLIS + 9_000);
        assert!(!manager.is_obsolete_job_directory(&job_dir));

        // missing prefix
        let job_dir = staging
            .path()
            .join(util::time_uuid_at(now - (JOB_RECENCY_DAYS + 1) * DAY_MILLIS).to_string());
        fs::create_dir_all(&job_dir)?;
        assert!(!manager.is_obsolete_job_directory(&job_dir));
        // not a job directory at all
        let job_dir = staging.path().join("foo");
        fs::create_dir_all(&job_dir)?;
        assert!(!manager.is_obsolete_job_directory(&job_dir));
        // not a time-based uuid
        let job_dir = staging.path().join(util::prefixed_job_id(&Uuid::new_v4()));
        fs::create_dir_all(&job_dir)?;
        assert!(!manager.is_obsolete_job_directory(&job_dir));
        // does not exist
        assert!(!manager.is_obsolete_job_directory(&staging.path().join("I_do_not_exist")));
        // a file, not a directory
        let file = staging
            .path()
            .join(util::prefixed_job_id(&util::time_uuid_at(now - (JOB_RECENCY_DAYS + 1) * DAY_MILLIS)));
        fs::write(&file, b"")?;
        assert!(!manager.is_obsolete_job_directory(&file));

        // older than the recency window
        let job_dir = job_dir_created_at(staging.path(), now - JOB_RECENCY_DAYS * DAY_MILLIS - 1);
        assert!(manager.is_obsolete_job_directory(&job_dir));
        Ok(())
    }

    #[test]
    fn test_obsolete_boundary_is_exclusive() {
        let staging = TempDir::new().expect("temp dir");
        let recency = Duration::from_secs(24 * 60 * 60);
        let created = Utc::now() - chrono::Duration::days(3);
        let job_dir = job_dir_created_at(staging.path(), created.timestamp_millis());

        let at_boundary = created + chrono::Duration::days(1);
        assert!(!is_obsolete_job_dir(&job_dir, recency, at_boundary));
        assert!(is_obsolete_job_dir(&job_dir, recency, at_boundary + chrono::Duration::milliseconds(1)));
    }

    #[tokio::test]
    async fn test_delete_obsolete_data() -> anyhow::Result<()> {
        let Fixture { manager, staging } = fixture();
        let now = Utc::now().timestamp_millis();

        let old_job_dir = job_dir_created_at(staging.path(), now - (JOB_RECENCY_DAYS + 1) * DAY_MILLIS);
        create_files(&old_job_dir, 5);
        let older_job_dir = job_dir_created_at(staging.path(), now - (JOB_RECENCY_DAYS + 2) * DAY_MILLIS);
        create_files(&older_job_dir, 5);
        let new_job_dir = job_dir_created_at(staging.path(), now);
        create_files(&new_job_dir, 5);
        let unrelated_dir = staging.path().join("foo");
        fs::create_dir_all(&unrelated_dir)?;

        let deleted = tokio::time::timeout(Duration::from_secs(5), manager.delete_obsolete_data_async()).await??;

        assert_eq!(deleted, 2);
        assert!(!old_job_dir.exists(), "should be deleted");
        assert!(!older_job_dir.exists(), "should be deleted");
        assert!(new_job_dir.exists(), "should survive");
        assert_eq!(fs::read_dir(&new_job_dir)?.count(), 5, "should have 5 files intact");
        assert!(unrelated_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_obsolete_data_drops_tracker_of_deleted_job() -> anyhow::Result<()> {
        let Fixture { manager, staging } = fixture();
        let created = Utc::now().timestamp_millis() - (JOB_RECENCY_DAYS + 1) * DAY_MILLIS;
        let job = Arc::new(RestoreJob::new(
            util::time_uuid_at(created),
            "ks",
            "tbl",
            Utc::now() + chrono::Duration::days(1),
        ));
        let slice = slice_of(&job, staging.path(), 0);
        manager.try_submit(Arc::clone(&slice), Arc::clone(&job))?;
        fs::create_dir_all(slice.target_path_in_staging())?;

        assert_eq!(manager.delete_obsolete_data_async().await?, 1);
        assert!(manager.tracked_job_ids().is_empty());
        assert!(slice.is_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_obsolete_data_without_staging_dir() -> anyhow::Result<()> {
        let Fixture { manager, staging } = fixture();
        let missing = RestoreJobManager::new(
            Arc::new(test_config(1)),
            test_instance(staging.path().join("missing")),
            Arc::new(ScriptedProcessor::new()),
        );
        assert_eq!(missing.delete_obsolete_data_async().await?, 0);
        assert_eq!(manager.delete_obsolete_data_async().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_retriable_failure_is_retried_until_it_completes() -> anyhow::Result<()> {
        let staging = TempDir::new()?;
        let processor = ScriptedProcessor::new();
        let processor = Arc::new(ScriptedProcessor {
            retriable_bucket: Some(0),
            retriable_attempts: std::sync::atomic::AtomicUsize::new(1),
            ..processor
        });
        let manager = RestoreJobManager::new(
            Arc::new(test_config(1)),
            test_instance(staging.path().to_path_buf()),
            processor.clone(),
        );
        assert!(manager.start());

        let job = new_job();
        let slice = slice_of(&job, staging.path(), 0);
        assert_eq!(manager.try_submit(Arc::clone(&slice), Arc::clone(&job)), Ok(Status::Created));
        wait_until(|| slice.state() == SliceState::Failed).await;
        assert!(matches!(slice.failure(), Some(RestoreJobError::Retriable { .. })));

        // the same key comes back on the next discovery cycle
        let again = slice_of(&job, staging.path(), 0);
        assert_eq!(manager.try_submit(again, Arc::clone(&job)), Ok(Status::Pending));
        wait_until(|| slice.state() == SliceState::Completed).await;

        assert_eq!(processor.invocations.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(manager.try_submit(slice, job), Ok(Status::Completed));
        manager.stop();
        Ok(())
    }
}
