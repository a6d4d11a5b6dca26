//! Restore Sidecar
//!
//! Stages restore job slices from S3-compatible storage onto the local
//! database instances this sidecar manages.

// restore-sidecar/src/main.rs
mod config;
mod errors;
mod restore;
mod store;

use anyhow::{Context, Result};
use config::AppConfig;
use restore::discoverer::RestoreJobDiscoverer;
use restore::manager_group::RestoreJobManagerGroup;
use restore::s3_download::S3SliceProcessor;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use store::PgRestoreJobStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => {
            info!("Restore sidecar stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            // tracing may not be initialised when the config cannot be read
            error!("{:?}", e);
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    // config.json next to the working directory unless a path is given
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let app_config = AppConfig::load_from_json(&config_path)
        .context(format!("Failed to load application configuration from {}", config_path.display()))?;

    init_tracing(&app_config.log_level)?;
    info!(instances = app_config.instances.len(), "Starting restore sidecar");

    let job_store = PgRestoreJobStore::connect(&app_config.job_store_database_url)
        .await
        .context("Failed to connect to the restore job store")?;
    job_store
        .ensure_schema()
        .await
        .context("Failed to prepare restore job tables")?;
    job_store
        .purge_expired(app_config.restore_job.restore_job_tables_ttl_seconds())
        .await
        .context("Failed to purge expired restore job records")?;

    let storage = app_config
        .s3_storage
        .as_ref()
        .context("s3_storage must be configured in config.json to stage restore slices")?;
    let processor = Arc::new(S3SliceProcessor::new(storage).await);

    let restore_config = Arc::new(app_config.restore_job.clone());
    let managers = Arc::new(RestoreJobManagerGroup::new(
        Arc::clone(&restore_config),
        &app_config.instances,
        processor,
    ));
    managers.start();

    let shutdown = CancellationToken::new();
    let discoverer = RestoreJobDiscoverer::new(restore_config, Arc::new(job_store), Arc::clone(&managers));
    let discovery = tokio::spawn(discoverer.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    shutdown.cancel();
    discovery.await.context("Restore job discovery task failed")?;
    managers.stop();
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context(format!("Invalid log_level '{}'", log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))
}
