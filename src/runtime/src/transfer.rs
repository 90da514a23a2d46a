//! Image transfer: imports build artifacts into an image store.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use lxbake_core::error::{BakeError, Result};
use tokio_util::sync::CancellationToken;

use crate::fingerprint::file_fingerprint;
use crate::operation::cancelable_wait;
use crate::server::{
    ArtifactStream, ImageServer, ImageUpload, OperationRecord, ProgressHandler, TransferProgress,
};

/// Progress handler that logs every tenth percent at debug level.
pub fn log_progress() -> ProgressHandler {
    let last = Arc::new(std::sync::atomic::AtomicU64::new(u64::MAX));
    Arc::new(move |progress: TransferProgress| {
        let bucket = progress.percent() / 10;
        if last.swap(bucket, std::sync::atomic::Ordering::Relaxed) != bucket {
            tracing::debug!(
                sent = progress.sent,
                total = progress.total,
                "Transferring image: {}%",
                progress.percent()
            );
        }
    })
}

/// Upload a split image and return the fingerprint assigned by the store.
///
/// Both artifacts are streamed from disk and closed on every exit path.
/// Cancellation stops hashing or the upload in flight; once the import
/// operation exists it is forwarded to the server as well.
pub async fn transfer(
    server: &dyn ImageServer,
    meta_path: &Path,
    rootfs_path: &Path,
    filename_hint: &str,
    progress: Option<ProgressHandler>,
    cancel: &CancellationToken,
) -> Result<String> {
    let expected = until_cancelled(
        file_fingerprint(&[meta_path, rootfs_path]),
        cancel,
        "artifact hashing",
    )
    .await?;

    let upload = ImageUpload {
        filename: filename_hint.to_string(),
        meta: ArtifactStream::open(meta_path).await?,
        rootfs: ArtifactStream::open(rootfs_path).await?,
        public: false,
        progress,
    };

    tracing::info!(
        remote = server.name(),
        bytes = upload.total_size(),
        "Transferring image"
    );

    let op = until_cancelled(server.create_image(upload), cancel, "image upload")
        .await
        .map_err(into_transfer_failure)?;
    let record = cancelable_wait(op.as_ref(), cancel)
        .await
        .map_err(into_transfer_failure)?;

    let fingerprint = extract_fingerprint(&record)?;
    if fingerprint != expected {
        tracing::warn!(
            expected = %expected,
            fingerprint = %fingerprint,
            "Store fingerprint differs from local artifacts"
        );
    }

    tracing::info!(remote = server.name(), fingerprint = %fingerprint, "Image imported");
    Ok(fingerprint)
}

/// Run `fut` unless `cancel` fires first; the future is dropped on cancel.
async fn until_cancelled<T>(
    fut: impl Future<Output = Result<T>>,
    cancel: &CancellationToken,
    stage: &str,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::warn!(stage, "Transfer cancelled");
            Err(BakeError::Cancelled(stage.to_string()))
        }
        result = fut => result,
    }
}

/// Pull the fingerprint out of a finished import operation.
///
/// A successful import without a string fingerprint means the store broke
/// its contract; this is reported as `ContractViolation`, never retried.
pub fn extract_fingerprint(record: &OperationRecord) -> Result<String> {
    match record.metadata_field("fingerprint") {
        Some(serde_json::Value::String(fingerprint)) if !fingerprint.is_empty() => {
            Ok(fingerprint.clone())
        }
        other => {
            tracing::error!(
                operation = %record.id,
                fingerprint = ?other,
                "Import operation finished without a fingerprint"
            );
            Err(BakeError::ContractViolation(format!(
                "operation {} returned no string fingerprint (got {:?})",
                record.id, other
            )))
        }
    }
}

fn into_transfer_failure(err: BakeError) -> BakeError {
    match err {
        BakeError::Cancelled(_) | BakeError::TransferFailure(_) => err,
        other => BakeError::TransferFailure(other.to_string()),
    }
}
