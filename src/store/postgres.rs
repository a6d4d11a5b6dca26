// restore-sidecar/src/store/postgres.rs
use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{RestoreJobStore, SliceRecord};
use crate::errors::AppError;
use crate::restore::job::{RestoreJob, RestoreJobStatus};

const CREATE_RESTORE_JOBS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS restore_jobs (
        job_id UUID PRIMARY KEY,
        keyspace_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        job_agent TEXT,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        expire_at TIMESTAMPTZ NOT NULL
    )
"#;

const CREATE_RESTORE_SLICES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS restore_slices (
        job_id UUID NOT NULL,
        slice_id TEXT NOT NULL,
        bucket_id SMALLINT NOT NULL,
        upload_id TEXT NOT NULL,
        keyspace_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        storage_bucket TEXT NOT NULL,
        storage_key TEXT NOT NULL,
        compressed_size BIGINT NOT NULL,
        replicas TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (job_id, slice_id)
    )
"#;

type JobRow = (Uuid, String, String, Option<String>, String, DateTime<Utc>);

/// Job store backed by Postgres tables.
#[derive(Debug, Clone)]
pub struct PgRestoreJobStore {
    pool: PgPool,
}

impl PgRestoreJobStore {
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), AppError> {
        sqlx::query(CREATE_RESTORE_JOBS_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_RESTORE_SLICES_TABLE).execute(&self.pool).await?;
        debug!("Restore job tables are present");
        Ok(())
    }

    /// Deletes job and slice records older than the table TTL.
    pub async fn purge_expired(&self, ttl_seconds: u64) -> Result<u64, AppError> {
        let ttl = ttl_seconds as f64;
        let slices = sqlx::query("DELETE FROM restore_slices WHERE created_at < now() - make_interval(secs => $1)")
            .bind(ttl)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let jobs = sqlx::query("DELETE FROM restore_jobs WHERE created_at < now() - make_interval(secs => $1)")
            .bind(ttl)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if jobs + slices > 0 {
            info!(jobs, slices, "Purged expired restore job records");
        }
        Ok(jobs + slices)
    }
}

fn job_from_row(row: JobRow) -> Result<RestoreJob, AppError> {
    let (job_id, keyspace_name, table_name, job_agent, status, expire_at) = row;
    let status: RestoreJobStatus = status.parse().map_err(AppError::InvalidInput)?;
    Ok(RestoreJob {
        job_id,
        keyspace_name,
        table_name,
        job_agent,
        status,
        expire_at,
    })
}

#[async_trait]
impl RestoreJobStore for PgRestoreJobStore {
    async fn find_recent_jobs(&self, recency_days: u32) -> Result<Vec<RestoreJob>, AppError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT job_id, keyspace_name, table_name, job_agent, status, expire_at \
             FROM restore_jobs \
             WHERE created_at >= now() - make_interval(days => $1) \
             ORDER BY created_at",
        )
        .bind(recency_days as i32)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(job_from_row).collect()
    }

    async fn find_slices(&self, job_id: Uuid) -> Result<Vec<SliceRecord>, AppError> {
        let rows = sqlx::query(
            "SELECT slice_id, bucket_id, upload_id, keyspace_name, table_name, \
                    storage_bucket, storage_key, compressed_size, replicas \
             FROM restore_slices WHERE job_id = $1 ORDER BY bucket_id, slice_id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<SliceRecord, AppError> {
                let compressed_size: i64 = row.try_get("compressed_size")?;
                let replicas: Vec<String> = row.try_get("replicas")?;
                Ok(SliceRecord {
                    job_id,
                    slice_id: row.try_get("slice_id")?,
                    bucket_id: row.try_get("bucket_id")?,
                    upload_id: row.try_get("upload_id")?,
                    keyspace: row.try_get("keyspace_name")?,
                    table: row.try_get("table_name")?,
                    storage_bucket: row.try_get("storage_bucket")?,
                    storage_key: row.try_get("storage_key")?,
                    compressed_size: compressed_size.max(0) as u64,
                    replicas: replicas.into_iter().collect::<BTreeSet<_>>(),
                })
            })
            .collect()
    }

    async fn update_status(&self, job_id: Uuid, status: RestoreJobStatus) -> Result<(), AppError> {
        let updated = sqlx::query("UPDATE restore_jobs SET status = $1 WHERE job_id = $2")
            .bind(status.as_str())
            .bind(job_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(AppError::InvalidInput(format!("Unknown restore job {}", job_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_from_row() {
        let job_id = crate::restore::util::new_time_uuid();
        let expire_at = Utc::now();
        let job = job_from_row((job_id, "ks".into(), "tbl".into(), None, "STAGED".into(), expire_at))
            .expect("valid row");
        assert_eq!(job.status, RestoreJobStatus::Staged);
        assert_eq!(job.expire_at, expire_at);

        let invalid = job_from_row((job_id, "ks".into(), "tbl".into(), None, "RUNNING".into(), expire_at));
        assert!(matches!(invalid, Err(AppError::InvalidInput(_))));
    }
}
