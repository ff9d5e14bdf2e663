//! Pull handler - serves records changed since a checkpoint.

use crate::error::Result;
use serde::Deserialize;
use tally_engine::{ChangesResponse, RecordStore, Reconciler, Timestamp};

/// Query parameters for an incremental pull.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    /// Checkpoint from the previous sync; absent or `0` for a full snapshot
    #[serde(default)]
    pub since: Timestamp,
}

/// Process a pull request from a device.
pub async fn handle_pull(
    reconciler: &Reconciler<dyn RecordStore>,
    query: PullQuery,
) -> Result<ChangesResponse> {
    Ok(reconciler.changes_since(query.since).await?)
}
