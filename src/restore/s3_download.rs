// restore-sidecar/src/restore/s3_download.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::archive;
use super::processor::{ProcessOutcome, RestoreProcessor};
use super::slice::RestoreSlice;
use crate::config::S3StorageConfig;

#[derive(Debug, PartialEq, Eq)]
enum DownloadFailure {
    Fatal(String),
    Retriable(String),
    Cancelled,
}

impl From<DownloadFailure> for ProcessOutcome {
    fn from(failure: DownloadFailure) -> Self {
        match failure {
            DownloadFailure::Fatal(detail) => ProcessOutcome::FatalFailure(detail),
            DownloadFailure::Retriable(detail) => ProcessOutcome::RetriableFailure(detail),
            DownloadFailure::Cancelled => ProcessOutcome::RetriableFailure("Slice was cancelled".to_string()),
        }
    }
}

/// Stages slices by downloading their archive from S3-compatible storage and
/// unpacking it into the slice's staging directory.
#[derive(Debug, Clone)]
pub struct S3SliceProcessor {
    client: s3::Client,
}

impl S3SliceProcessor {
    pub async fn new(storage: &S3StorageConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&storage.endpoint_url)
            .region(Region::new(storage.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &storage.access_key_id,
                &storage.secret_access_key,
                None,
                None,
                "Static",
            ))
            .load()
            .await;
        Self {
            client: s3::Client::new(&sdk_config),
        }
    }

    async fn download(&self, slice: &RestoreSlice, destination: &Path, cancel: &CancellationToken) -> Result<u64, DownloadFailure> {
        let request = self
            .client
            .get_object()
            .bucket(slice.storage_bucket())
            .key(slice.storage_key())
            .send();
        let object = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadFailure::Cancelled),
            object = request => object,
        };
        let object = object.map_err(|e| {
            let detail = format!(
                "Failed to get object s3://{}/{}: {}",
                slice.storage_bucket(),
                slice.storage_key(),
                DisplayErrorContext(&e)
            );
            if e.as_service_error().is_some_and(|service| service.is_no_such_key()) {
                DownloadFailure::Fatal(detail)
            } else {
                DownloadFailure::Retriable(detail)
            }
        })?;

        stream_to_file(object.body, destination, cancel).await
    }
}

#[async_trait]
impl RestoreProcessor for S3SliceProcessor {
    async fn process(&self, slice: Arc<RestoreSlice>, cancel: CancellationToken) -> ProcessOutcome {
        let target_dir = slice.target_path_in_staging().to_path_buf();
        let archive_path = archive_path_of(&slice);
        if let Err(e) = tokio::fs::create_dir_all(&target_dir).await {
            return ProcessOutcome::RetriableFailure(format!(
                "Failed to create staging directory {}: {}",
                target_dir.display(),
                e
            ));
        }

        debug!(
            slice_key = %slice.key(),
            keyspace = slice.keyspace(),
            table = slice.table(),
            replicas = ?slice.replicas(),
            bucket = slice.storage_bucket(),
            key = slice.storage_key(),
            "Downloading slice"
        );
        let outcome = match self.download(&slice, &archive_path, &cancel).await {
            Ok(downloaded) => stage_archive(&archive_path, &target_dir, slice.compressed_size(), downloaded).await,
            Err(failure) => Err(failure),
        };
        remove_archive(&archive_path).await;

        match outcome {
            Ok(file_count) => {
                info!(slice_key = %slice.key(), file_count, "Slice staged");
                ProcessOutcome::Success
            }
            Err(failure) => failure.into(),
        }
    }
}

fn archive_path_of(slice: &RestoreSlice) -> PathBuf {
    let name = if slice.slice_id().is_empty() {
        format!("bucket-{}", slice.bucket_id())
    } else {
        slice.slice_id().replace('/', "_")
    };
    slice.target_path_in_staging().join(format!("{}.tar.gz", name))
}

/// Copies the body into `destination`, checking `cancel` between chunks.
/// The partial file is removed when the copy does not finish.
async fn stream_to_file(mut body: ByteStream, destination: &Path, cancel: &CancellationToken) -> Result<u64, DownloadFailure> {
    let mut file = File::create(destination).await.map_err(|e| {
        DownloadFailure::Retriable(format!("Failed to create {}: {}", destination.display(), e))
    })?;

    let mut written: u64 = 0;
    let copied = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(DownloadFailure::Cancelled),
            next = body.try_next() => next,
        };
        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break file.flush().await.map_err(|e| {
                DownloadFailure::Retriable(format!("Failed to flush {}: {}", destination.display(), e))
            }),
            Err(e) => break Err(DownloadFailure::Retriable(format!("Failed to read object body: {}", e))),
        };
        if let Err(e) = file.write_all(&chunk).await {
            break Err(DownloadFailure::Retriable(format!(
                "Failed to write to {}: {}",
                destination.display(),
                e
            )));
        }
        written += chunk.len() as u64;
    };
    drop(file);

    match copied {
        Ok(()) => Ok(written),
        Err(failure) => {
            remove_archive(destination).await;
            Err(failure)
        }
    }
}

/// Verifies the downloaded size and unpacks the archive on a blocking thread.
async fn stage_archive(archive_path: &Path, target_dir: &Path, expected_size: u64, downloaded: u64) -> Result<usize, DownloadFailure> {
    if downloaded != expected_size {
        return Err(DownloadFailure::Retriable(format!(
            "Downloaded {} bytes into {} but expected {}",
            downloaded,
            archive_path.display(),
            expected_size
        )));
    }

    let archive_path = archive_path.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    let extracted = tokio::task::spawn_blocking(move || archive::extract_tar_gz_archive(&archive_path, &target_dir)).await;
    match extracted {
        Ok(Ok(file_count)) => Ok(file_count),
        Ok(Err(e)) => Err(DownloadFailure::Retriable(format!("{:#}", e))),
        Err(e) => Err(DownloadFailure::Retriable(format!("Extraction task failed: {}", e))),
    }
}

async fn remove_archive(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove slice archive"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::archive::tests::write_tar_gz;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stream_to_file_writes_body() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let destination = dir.path().join("slice.tar.gz");
        let written = stream_to_file(ByteStream::from(b"0123456789".to_vec()), &destination, &CancellationToken::new())
            .await
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        assert_eq!(written, 10);
        assert_eq!(fs::read(&destination)?, b"0123456789");
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_no_partial_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let destination = dir.path().join("slice.tar.gz");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = stream_to_file(ByteStream::from(vec![0u8; 1024]), &destination, &cancel).await;
        assert_eq!(result, Err(DownloadFailure::Cancelled));
        assert!(!destination.exists());
        assert_eq!(
            ProcessOutcome::from(DownloadFailure::Cancelled),
            ProcessOutcome::RetriableFailure("Slice was cancelled".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_stage_archive_checks_size_then_extracts() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("ks").join("tbl");
        fs::create_dir_all(&target)?;
        let archive_path = target.join("slice.tar.gz");
        write_tar_gz(&archive_path, &[("nb-1-big-Data.db", b"sstable")])?;
        let size = fs::metadata(&archive_path)?.len();

        let mismatch = stage_archive(&archive_path, &target, size + 1, size).await;
        assert!(matches!(mismatch, Err(DownloadFailure::Retriable(_))));
        assert!(!target.join("nb-1-big-Data.db").exists());

        assert_eq!(stage_archive(&archive_path, &target, size, size).await, Ok(1));
        assert_eq!(fs::read(target.join("nb-1-big-Data.db"))?, b"sstable");
        Ok(())
    }

    #[test]
    fn test_archive_path_is_per_slice() {
        let slice = RestoreSlice::builder()
            .slice_id("a/b")
            .job_id(crate::restore::util::new_time_uuid())
            .keyspace("ks")
            .table("tbl")
            .target_path_in_staging("/staging", "upload")
            .build()
            .expect("slice builds");
        let path = archive_path_of(&slice);
        assert_eq!(path.parent(), Some(slice.target_path_in_staging()));
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("a_b.tar.gz"));
    }
}
