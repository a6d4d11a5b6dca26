// restore-sidecar/src/restore/job.rs
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestoreJobStatus {
    Created,
    Staged,
    Succeeded,
    Failed,
    Aborted,
}

impl RestoreJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RestoreJobStatus::Succeeded | RestoreJobStatus::Failed | RestoreJobStatus::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RestoreJobStatus::Created => "CREATED",
            RestoreJobStatus::Staged => "STAGED",
            RestoreJobStatus::Succeeded => "SUCCEEDED",
            RestoreJobStatus::Failed => "FAILED",
            RestoreJobStatus::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for RestoreJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestoreJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(RestoreJobStatus::Created),
            "STAGED" => Ok(RestoreJobStatus::Staged),
            "SUCCEEDED" => Ok(RestoreJobStatus::Succeeded),
            "FAILED" => Ok(RestoreJobStatus::Failed),
            "ABORTED" => Ok(RestoreJobStatus::Aborted),
            other => Err(format!("Unknown restore job status: {}", other)),
        }
    }
}

/// Descriptor of a restore job as recorded in the job store.
///
/// Values are immutable; a status change produces a new descriptor which the
/// owning slice tracker swaps in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreJob {
    pub job_id: Uuid,
    pub keyspace_name: String,
    pub table_name: String,
    pub job_agent: Option<String>,
    pub status: RestoreJobStatus,
    pub expire_at: DateTime<Utc>,
}

impl RestoreJob {
    pub fn new(
        job_id: Uuid,
        keyspace_name: impl Into<String>,
        table_name: impl Into<String>,
        expire_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            keyspace_name: keyspace_name.into(),
            table_name: table_name.into(),
            job_agent: None,
            status: RestoreJobStatus::Created,
            expire_at,
        }
    }

    /// Creation instant embedded in the time-based job id.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        util::created_at_of(&self.job_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }

    pub fn with_status(&self, status: RestoreJobStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_parsing_and_terminal_states() {
        assert_eq!("succeeded".parse::<RestoreJobStatus>(), Ok(RestoreJobStatus::Succeeded));
        assert!("RUNNING".parse::<RestoreJobStatus>().is_err());
        assert!(!RestoreJobStatus::Created.is_terminal());
        assert!(!RestoreJobStatus::Staged.is_terminal());
        assert!(RestoreJobStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_created_at_and_expiry() {
        let now = Utc::now();
        let job_id = util::time_uuid_at(now.timestamp_millis());
        let job = RestoreJob::new(job_id, "ks", "tbl", now + Duration::days(1));
        assert_eq!(
            job.created_at().map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
        assert!(!job.is_expired(now));
        assert!(job.is_expired(now + Duration::days(2)));

        let failed = job.with_status(RestoreJobStatus::Failed);
        assert!(failed.is_terminal());
        assert_eq!(failed.job_id, job.job_id);
    }
}
