//! Cancelable waiting on server-side operations.

use lxbake_core::error::{BakeError, Result};
use tokio_util::sync::CancellationToken;

use crate::server::{OperationRecord, RemoteOperation};

/// Wait for an operation, forwarding cancellation to the server.
///
/// When `cancel` fires before the operation finishes, a cancel request is
/// sent for the server-side operation and `Cancelled` is returned. Failure
/// to deliver the cancel request is logged, not returned.
pub async fn cancelable_wait(
    op: &dyn RemoteOperation,
    cancel: &CancellationToken,
) -> Result<OperationRecord> {
    tracing::debug!(operation = op.id(), "Waiting for operation");

    let record = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::warn!(operation = op.id(), "Wait interrupted, cancelling operation");
            if let Err(e) = op.cancel().await {
                tracing::warn!(operation = op.id(), error = %e, "Failed to cancel operation");
            }
            return Err(BakeError::Cancelled(format!("operation {}", op.id())));
        }
        result = op.wait() => result?,
    };

    record.into_result()
}
