//! Push handler - reconciles a device's batch of offline operations.

use crate::error::{AppError, Result};
use tally_engine::{RecordStore, Reconciler, SyncRequest, SyncResult};

/// Process a push request from a device.
///
/// Per-operation failures (conflicts, malformed entries) are part of the
/// result; only a store failure fails the request.
pub async fn handle_push(
    reconciler: &Reconciler<dyn RecordStore>,
    request: SyncRequest,
) -> Result<SyncResult> {
    if request.device_id.trim().is_empty() {
        return Err(AppError::BadRequest("deviceId is required".to_string()));
    }

    tracing::debug!(
        device_id = %request.device_id,
        operations = request.operations.len(),
        last_sync_timestamp = request.last_sync_timestamp,
        "sync batch received"
    );
    Ok(reconciler.sync(request).await?)
}
