//! User-visible sync notifications.

use std::time::Duration;
use tally_engine::{ConflictOutcome, RejectedOperation, Timestamp};

/// Something the user may want to know about.
///
/// Conflicts are non-fatal: local state already shows server truth when the
/// event arrives. Rejections are permanent and need a manual re-edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A flush completed.
    Synced {
        accepted: usize,
        conflicts: usize,
        rejected: usize,
        checkpoint: Timestamp,
    },
    /// Another device's change won; the local edit was discarded.
    Conflict(ConflictOutcome),
    /// An operation was malformed and dropped.
    Rejected(RejectedOperation),
    /// The server could not be reached; the batch stays queued.
    TransportFailed {
        error: String,
        retry_in: Duration,
        queued: usize,
    },
    /// An incremental pull refreshed local records.
    Pulled { records: usize, checkpoint: Timestamp },
}
