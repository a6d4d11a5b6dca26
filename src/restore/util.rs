// restore-sidecar/src/restore/util.rs
use chrono::{DateTime, TimeZone, Utc};
use uuid::{NoContext, Timestamp, Uuid, Version};

/// Every restore job directory under a staging root is named `restore-<job id>`.
pub const RESTORE_JOB_DIR_PREFIX: &str = "restore-";

/// Returns the staging directory name of a restore job.
pub fn prefixed_job_id(job_id: &Uuid) -> String {
    format!("{}{}", RESTORE_JOB_DIR_PREFIX, job_id)
}

/// Parses a staging directory name back into the time-based job id it was
/// created for. Anything that is not `restore-` followed by a version 1 UUID
/// yields `None`.
pub fn job_id_from_dir_name(dir_name: &str) -> Option<Uuid> {
    let suffix = dir_name.strip_prefix(RESTORE_JOB_DIR_PREFIX)?;
    let id = Uuid::parse_str(suffix).ok()?;
    if id.get_version() != Some(Version::Mac) {
        return None;
    }
    Some(id)
}

/// Creation instant embedded in a time-based UUID, in unix milliseconds.
pub fn unix_millis_of(id: &Uuid) -> Option<i64> {
    if id.get_version() != Some(Version::Mac) {
        return None;
    }
    let (secs, nanos) = id.get_timestamp()?.to_unix();
    let millis = secs.checked_mul(1_000)? + u64::from(nanos / 1_000_000);
    i64::try_from(millis).ok()
}

/// Creation instant embedded in a time-based UUID.
pub fn created_at_of(id: &Uuid) -> Option<DateTime<Utc>> {
    unix_millis_of(id).and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}

/// Smallest time-based UUID for the given unix millisecond.
pub fn time_uuid_at(unix_millis: i64) -> Uuid {
    let millis = unix_millis.max(0) as u64;
    let ts = Timestamp::from_unix(NoContext, millis / 1_000, ((millis % 1_000) * 1_000_000) as u32);
    Uuid::new_v1(ts, &[0u8; 6])
}

/// Fresh time-based UUID for a new restore job.
pub fn new_time_uuid() -> Uuid {
    let random = Uuid::new_v4();
    let mut node_id = [0u8; 6];
    node_id.copy_from_slice(&random.as_bytes()[..6]);
    Uuid::now_v1(&node_id)
}
