// restore-sidecar/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::errors::AppError;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

pub const MIN_RESTORE_JOB_TABLES_TTL_SECONDS: u64 = 14 * SECONDS_PER_DAY;

const DEFAULT_JOB_DISCOVERY_ACTIVE_LOOP_DELAY_MILLIS: u64 = 5 * 60 * 1_000;
const DEFAULT_JOB_DISCOVERY_IDLE_LOOP_DELAY_MILLIS: u64 = 10 * 60 * 1_000;
const DEFAULT_JOB_DISCOVERY_MINIMUM_RECENCY_DAYS: u32 = 5;
// process at most 20 slices concurrently per instance
const DEFAULT_PROCESS_MAX_CONCURRENCY: usize = 20;
const DEFAULT_RESTORE_JOB_TABLES_TTL_SECONDS: u64 = 90 * SECONDS_PER_DAY;
// a slice is slow once it has been processing for 10 minutes
const DEFAULT_SLOW_TASK_THRESHOLD_SECONDS: u64 = 10 * 60;
const DEFAULT_SLOW_TASK_REPORT_DELAY_SECONDS: u64 = 60;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonInstanceConfig {
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub staging_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreJobConfig {
    pub job_discovery_active_loop_delay_millis: Option<u64>,
    pub job_discovery_idle_loop_delay_millis: Option<u64>,
    pub job_discovery_minimum_recency_days: Option<u32>,
    pub slice_process_max_concurrency: Option<usize>,
    pub restore_job_tables_ttl_seconds: Option<u64>,
    pub slow_task_threshold_seconds: Option<u64>,
    pub slow_task_report_delay_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub instances: Option<Vec<JsonInstanceConfig>>,
    pub restore_job: Option<JsonRestoreJobConfig>,
    pub job_store_database_url: Option<String>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub log_level: Option<String>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct S3StorageConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// A database instance managed by this sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceMetadata {
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub staging_dir: PathBuf,
}

impl InstanceMetadata {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Replicas are recorded either as a bare host or as `host:port`.
    pub fn matches_replica(&self, replica: &str) -> bool {
        replica == self.host || replica == self.address()
    }
}

/// Validated settings of the restore job subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreJobConfig {
    job_discovery_active_loop_delay: Duration,
    job_discovery_idle_loop_delay: Duration,
    job_discovery_minimum_recency_days: u32,
    process_max_concurrency: usize,
    restore_job_tables_ttl_seconds: u64,
    slow_task_threshold: Duration,
    slow_task_report_delay: Duration,
}

impl RestoreJobConfig {
    pub fn builder() -> RestoreJobConfigBuilder {
        RestoreJobConfigBuilder::default()
    }

    pub fn job_discovery_active_loop_delay(&self) -> Duration {
        self.job_discovery_active_loop_delay
    }

    pub fn job_discovery_idle_loop_delay(&self) -> Duration {
        self.job_discovery_idle_loop_delay
    }

    pub fn job_discovery_minimum_recency_days(&self) -> u32 {
        self.job_discovery_minimum_recency_days
    }

    /// Minimum age of a job directory before it may be garbage-collected.
    pub fn job_discovery_minimum_recency(&self) -> Duration {
        Duration::from_secs(u64::from(self.job_discovery_minimum_recency_days) * SECONDS_PER_DAY)
    }

    pub fn process_max_concurrency(&self) -> usize {
        self.process_max_concurrency
    }

    pub fn restore_job_tables_ttl_seconds(&self) -> u64 {
        self.restore_job_tables_ttl_seconds
    }

    pub fn slow_task_threshold(&self) -> Duration {
        self.slow_task_threshold
    }

    pub fn slow_task_report_delay(&self) -> Duration {
        self.slow_task_report_delay
    }
}

impl Default for RestoreJobConfig {
    fn default() -> Self {
        let builder = RestoreJobConfigBuilder::default();
        RestoreJobConfig {
            job_discovery_active_loop_delay: Duration::from_millis(builder.job_discovery_active_loop_delay_millis),
            job_discovery_idle_loop_delay: Duration::from_millis(builder.job_discovery_idle_loop_delay_millis),
            job_discovery_minimum_recency_days: builder.job_discovery_minimum_recency_days,
            process_max_concurrency: builder.process_max_concurrency,
            restore_job_tables_ttl_seconds: builder.restore_job_tables_ttl_seconds,
            slow_task_threshold: Duration::from_secs(builder.slow_task_threshold_seconds),
            slow_task_report_delay: Duration::from_secs(builder.slow_task_report_delay_seconds),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreJobConfigBuilder {
    job_discovery_active_loop_delay_millis: u64,
    job_discovery_idle_loop_delay_millis: u64,
    job_discovery_minimum_recency_days: u32,
    process_max_concurrency: usize,
    restore_job_tables_ttl_seconds: u64,
    slow_task_threshold_seconds: u64,
    slow_task_report_delay_seconds: u64,
}

impl Default for RestoreJobConfigBuilder {
    fn default() -> Self {
        Self {
            job_discovery_active_loop_delay_millis: DEFAULT_JOB_DISCOVERY_ACTIVE_LOOP_DELAY_MILLIS,
            job_discovery_idle_loop_delay_millis: DEFAULT_JOB_DISCOVERY_IDLE_LOOP_DELAY_MILLIS,
            job_discovery_minimum_recency_days: DEFAULT_JOB_DISCOVERY_MINIMUM_RECENCY_DAYS,
            process_max_concurrency: DEFAULT_PROCESS_MAX_CONCURRENCY,
            restore_job_tables_ttl_seconds: DEFAULT_RESTORE_JOB_TABLES_TTL_SECONDS,
            slow_task_threshold_seconds: DEFAULT_SLOW_TASK_THRESHOLD_SECONDS,
            slow_task_report_delay_seconds: DEFAULT_SLOW_TASK_REPORT_DELAY_SECONDS,
        }
    }
}

impl RestoreJobConfigBuilder {
    pub fn job_discovery_active_loop_delay_millis(mut self, millis: u64) -> Self {
        self.job_discovery_active_loop_delay_millis = millis;
        self
    }

    pub fn job_discovery_idle_loop_delay_millis(mut self, millis: u64) -> Self {
        self.job_discovery_idle_loop_delay_millis = millis;
        self
    }

    pub fn job_discovery_minimum_recency_days(mut self, days: u32) -> Self {
        self.job_discovery_minimum_recency_days = days;
        self
    }

    pub fn process_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.process_max_concurrency = max_concurrency;
        self
    }

    pub fn restore_job_tables_ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.restore_job_tables_ttl_seconds = ttl_seconds;
        self
    }

    pub fn slow_task_threshold_seconds(mut self, seconds: u64) -> Self {
        self.slow_task_threshold_seconds = seconds;
        self
    }

    pub fn slow_task_report_delay_seconds(mut self, seconds: u64) -> Self {
        self.slow_task_report_delay_seconds = seconds;
        self
    }

    /// Applies the values present in config.json on top of the defaults.
    pub fn merge_json(mut self, json: &JsonRestoreJobConfig) -> Self {
        if let Some(v) = json.job_discovery_active_loop_delay_millis {
            self = self.job_discovery_active_loop_delay_millis(v);
        }
        if let Some(v) = json.job_discovery_idle_loop_delay_millis {
            self = self.job_discovery_idle_loop_delay_millis(v);
        }
        if let Some(v) = json.job_discovery_minimum_recency_days {
            self = self.job_discovery_minimum_recency_days(v);
        }
        if let Some(v) = json.slice_process_max_concurrency {
            self = self.process_max_concurrency(v);
        }
        if let Some(v) = json.restore_job_tables_ttl_seconds {
            self = self.restore_job_tables_ttl_seconds(v);
        }
        if let Some(v) = json.slow_task_threshold_seconds {
            self = self.slow_task_threshold_seconds(v);
        }
        if let Some(v) = json.slow_task_report_delay_seconds {
            self = self.slow_task_report_delay_seconds(v);
        }
        self
    }

    /// Validates and builds the configuration.
    ///
    /// Job directories must never become eligible for cleanup while their job
    /// records are still alive, so the recency window has to be strictly
    /// shorter than the table TTL, and the TTL at least 14 days.
    pub fn build(self) -> Result<RestoreJobConfig, AppError> {
        let ttl = self.restore_job_tables_ttl_seconds;
        if ttl < MIN_RESTORE_JOB_TABLES_TTL_SECONDS {
            return Err(AppError::Config(format!(
                "restore_job_tables_ttl_seconds cannot be less than {}",
                MIN_RESTORE_JOB_TABLES_TTL_SECONDS
            )));
        }
        let recency_seconds = u64::from(self.job_discovery_minimum_recency_days) * SECONDS_PER_DAY;
        if recency_seconds >= ttl {
            return Err(AppError::Config(format!(
                "job_discovery_minimum_recency_days (in seconds) must be less than restore_job_tables_ttl_seconds ({})",
                ttl
            )));
        }

        if self.process_max_concurrency == 0 || self.process_max_concurrency > Semaphore::MAX_PERMITS {
            return Err(AppError::Config(format!(
                "slice_process_max_concurrency must be between 1 and {}, got {}",
                Semaphore::MAX_PERMITS,
                self.process_max_concurrency
            )));
        }

        Ok(RestoreJobConfig {
            job_discovery_active_loop_delay: Duration::from_millis(self.job_discovery_active_loop_delay_millis),
            job_discovery_idle_loop_delay: Duration::from_millis(self.job_discovery_idle_loop_delay_millis),
            job_discovery_minimum_recency_days: self.job_discovery_minimum_recency_days,
            process_max_concurrency: self.process_max_concurrency,
            restore_job_tables_ttl_seconds: ttl,
            slow_task_threshold: Duration::from_secs(self.slow_task_threshold_seconds),
            slow_task_report_delay: Duration::from_secs(self.slow_task_report_delay_seconds),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub instances: Vec<InstanceMetadata>,
    pub restore_job: RestoreJobConfig,
    pub job_store_database_url: String,
    pub s3_storage: Option<S3StorageConfig>,
    pub log_level: String,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw_config: RawJsonConfig) -> Result<Self> {
        let instances = parse_instances(raw_config.instances.as_deref())?;

        let restore_job = RestoreJobConfig::builder()
            .merge_json(&raw_config.restore_job.clone().unwrap_or_default())
            .build()
            .context("Invalid restore_job configuration")?;

        let job_store_database_url = raw_config
            .job_store_database_url
            .as_ref()
            .filter(|s| !s.trim().is_empty())
            .context("job_store_database_url must be set in config.json")?
            .clone();
        url::Url::parse(&job_store_database_url)
            .context("job_store_database_url is not a valid URL")?;

        let s3_storage = raw_config.s3_storage.as_ref().and_then(parse_s3_storage);

        Ok(AppConfig {
            instances,
            restore_job,
            job_store_database_url,
            s3_storage,
            log_level: raw_config.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parse_instances(instances: Option<&[JsonInstanceConfig]>) -> Result<Vec<InstanceMetadata>> {
    let instances = instances
        .filter(|list| !list.is_empty())
        .context("instances must list at least one managed instance in config.json")?;

    let mut parsed: Vec<InstanceMetadata> = Vec::with_capacity(instances.len());
    for instance in instances {
        if instance.staging_dir.as_os_str().is_empty() {
            anyhow::bail!("staging_dir of instance {} cannot be empty", instance.id);
        }
        if parsed.iter().any(|existing| existing.id == instance.id) {
            anyhow::bail!("instance id {} is configured more than once", instance.id);
        }
        parsed.push(InstanceMetadata {
            id: instance.id,
            host: instance.host.clone(),
            port: instance.port,
            staging_dir: instance.staging_dir.clone(),
        });
    }
    Ok(parsed)
}

fn parse_s3_storage(s3_raw: &JsonS3StorageConfig) -> Option<S3StorageConfig> {
    if let (Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
        s3_raw.region.as_ref().filter(|s| !s.is_empty()),
        s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
        s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
        s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
    ) {
        Some(S3StorageConfig {
            region: region.clone(),
            access_key_id: key_id.clone(),
            secret_access_key: secret.clone(),
            endpoint_url: endpoint.clone(),
        })
    } else {
        tracing::warn!(
            "s3_storage is present in config.json but some required fields (region, access_key_id, secret_access_key, endpoint_url) are missing or empty. S3 downloads will be disabled."
        );
        None
    }
}
