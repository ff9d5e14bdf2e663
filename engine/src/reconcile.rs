//! Reconciliation - the server side of the sync protocol.
//!
//! The Reconciler applies a device's batch against a [`RecordStore`] using
//! per-record optimistic versioning. Whichever operation reaches the store
//! first while holding the current `syncVersion` wins; everything computed
//! against an older version loses, regardless of wall-clock edit time.
//!
//! # Algorithm
//!
//! For each operation, in the order received:
//!
//! 1. Parse the raw entry; a malformed one is rejected on its own
//! 2. If a receipt exists for the operation id, report it accepted again
//! 3. CREATE: insert if absent; identical live content is an idempotent accept,
//!    anything else is an `already-exists` conflict
//! 4. UPDATE/DELETE: read the record, then compare-and-swap on
//!    `expectedSyncVersion`. Absent records are `not-found`, stale versions are
//!    `stale-version`, updates against a tombstone are `deleted`, and deleting
//!    a tombstone is an accepted no-op
//!
//! Operations are independent: a conflict never blocks or rolls back its
//! siblings. There is no batch-wide transaction.
//!
//! Checkpoints handed to devices come from the Reconciler's write watermark,
//! so a write that is stamped but not yet committed is still returned by the
//! next pull. Clones share the watermark; route every write for a store
//! through clones of one Reconciler.

use crate::{
    protocol::{
        AcceptedOperation, ChangeSet, ChangesResponse, ConflictKind, ConflictOutcome,
        RejectedOperation, SyncRequest, SyncResult,
    },
    store::{Change, CreateOutcome, MutationContext, Receipt, RecordStore, StoreError, StoreResult, SwapOutcome},
    watermark::WriteClock,
    Mutation, OfflineOperation, Record, Timestamp, Version, WireOperation,
};
use std::sync::Arc;

/// Server clock in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// RFC 3339 rendering of a millisecond timestamp.
pub fn format_timestamp(timestamp: Timestamp) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// Terminal outcome of a single operation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Accepted(AcceptedOperation),
    Conflict(ConflictOutcome),
    Rejected(RejectedOperation),
}

impl Outcome {
    fn accepted(op: &OfflineOperation, sync_version: Version) -> Self {
        Outcome::Accepted(AcceptedOperation {
            operation_id: op.operation_id.clone(),
            record_id: op.record_id.clone(),
            resource: op.resource(),
            sync_version,
        })
    }

    fn from_receipt(receipt: Receipt) -> Self {
        Outcome::Accepted(AcceptedOperation {
            operation_id: receipt.operation_id,
            record_id: receipt.record_id,
            resource: receipt.resource,
            sync_version: receipt.sync_version,
        })
    }

    fn conflict(op: &OfflineOperation, kind: ConflictKind, server_record: Option<Record>) -> Self {
        Outcome::Conflict(ConflictOutcome::new(op, kind, server_record))
    }

    fn rejected(operation_id: String, error: impl ToString) -> Self {
        Outcome::Rejected(RejectedOperation {
            operation_id,
            error: error.to_string(),
        })
    }
}

/// Applies sync batches against a Record Store.
pub struct Reconciler<S: RecordStore + ?Sized> {
    store: Arc<S>,
    writes: Arc<WriteClock>,
}

impl<S: RecordStore + ?Sized> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            writes: Arc::clone(&self.writes),
        }
    }
}

impl<S: RecordStore + ?Sized> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            writes: WriteClock::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Process one device batch.
    ///
    /// Fails only when the store itself fails; the caller answers with a
    /// server error and the device retries the whole batch, which receipts
    /// make safe.
    pub async fn sync(&self, request: SyncRequest) -> StoreResult<SyncResult> {
        // Captured first: anything committed while the batch runs is newer
        let current_timestamp = self.writes.watermark();
        let device_id = request.device_id;
        let mut result = SyncResult {
            success: true,
            current_timestamp,
            ..Default::default()
        };

        for wire in request.operations {
            match self.process(wire, &device_id).await? {
                Outcome::Accepted(accepted) => result.accepted.push(accepted),
                Outcome::Conflict(conflict) => {
                    tracing::debug!(
                        operation_id = %conflict.operation_id,
                        record_id = %conflict.record_id,
                        conflict_type = %conflict.conflict_type,
                        "operation lost"
                    );
                    result.conflicts.push(conflict);
                }
                Outcome::Rejected(rejected) => {
                    tracing::warn!(
                        operation_id = %rejected.operation_id,
                        error = %rejected.error,
                        "operation rejected"
                    );
                    result.rejected.push(rejected);
                }
            }
        }

        result.server_data = self.server_data(request.last_sync_timestamp).await?;

        tracing::info!(
            device_id = %device_id,
            accepted = result.accepted.len(),
            conflicts = result.conflicts.len(),
            rejected = result.rejected.len(),
            server_records = result.server_data.len(),
            "sync batch reconciled"
        );
        Ok(result)
    }

    /// Records changed since a checkpoint, for incremental pulls.
    pub async fn changes_since(&self, since: Timestamp) -> StoreResult<ChangesResponse> {
        let current_timestamp = self.writes.watermark();
        let changes = self.server_data(since).await?;
        tracing::debug!(since, records = changes.len(), "changes pulled");
        Ok(ChangesResponse {
            changes,
            current_timestamp,
            synced_at: format_timestamp(current_timestamp),
        })
    }

    /// Full snapshot for a first sync, otherwise a delta.
    async fn server_data(&self, since: Timestamp) -> StoreResult<ChangeSet> {
        let since = if since <= 0 { Timestamp::MIN } else { since };
        let records = self.store.changed_since(since).await?;
        Ok(ChangeSet::from_records(records))
    }

    async fn process(&self, wire: WireOperation, device_id: &str) -> StoreResult<Outcome> {
        let operation_id = wire.id.clone();
        let op = match OfflineOperation::try_from(wire) {
            Ok(op) => op,
            Err(e) => return Ok(Outcome::rejected(operation_id, e)),
        };

        if let Some(receipt) = self.store.receipt(&op.operation_id).await? {
            tracing::debug!(operation_id = %op.operation_id, "operation already applied");
            return Ok(Outcome::from_receipt(receipt));
        }

        // Open until the store call returns
        let write = self.writes.begin();
        let ctx = MutationContext {
            operation_id: op.operation_id.clone(),
            device_id: if device_id.is_empty() {
                op.device_id.clone()
            } else {
                device_id.to_string()
            },
            timestamp: write.timestamp(),
        };

        let outcome = self.apply(&op, &ctx).await;
        drop(write);
        match outcome {
            Err(StoreError::Engine(e)) if e.is_validation() => {
                Ok(Outcome::rejected(op.operation_id, e))
            }
            other => other,
        }
    }

    async fn apply(&self, op: &OfflineOperation, ctx: &MutationContext) -> StoreResult<Outcome> {
        match &op.mutation {
            Mutation::Create(body) => {
                let record = Record::new(
                    op.record_id.clone(),
                    body.clone(),
                    ctx.device_id.clone(),
                    ctx.timestamp,
                );
                Ok(match self.store.create_if_absent(record, ctx).await? {
                    CreateOutcome::Created(record) => Outcome::accepted(op, record.sync_version),
                    CreateOutcome::AlreadyApplied(receipt) => Outcome::from_receipt(receipt),
                    // A resubmitted create whose first attempt landed without a receipt match
                    CreateOutcome::Exists(existing)
                        if existing.is_active() && existing.body == *body =>
                    {
                        Outcome::accepted(op, existing.sync_version)
                    }
                    CreateOutcome::Exists(existing) => {
                        Outcome::conflict(op, ConflictKind::AlreadyExists, Some(existing))
                    }
                })
            }
            Mutation::Update {
                expected_sync_version,
                patch,
            } => {
                let Some(current) = self.store.get(op.resource(), &op.record_id).await? else {
                    return Ok(Outcome::conflict(op, ConflictKind::NotFound, None));
                };
                if current.sync_version != *expected_sync_version {
                    return Ok(Outcome::conflict(op, ConflictKind::StaleVersion, Some(current)));
                }
                if current.is_deleted {
                    return Ok(Outcome::conflict(op, ConflictKind::Deleted, Some(current)));
                }
                let change = Change::Patch(patch.clone());
                self.swap(op, *expected_sync_version, change, ctx).await
            }
            Mutation::Delete {
                resource,
                expected_sync_version,
            } => {
                let Some(current) = self.store.get(*resource, &op.record_id).await? else {
                    return Ok(Outcome::conflict(op, ConflictKind::NotFound, None));
                };
                if current.is_deleted {
                    return Ok(Outcome::accepted(op, current.sync_version));
                }
                if current.sync_version != *expected_sync_version {
                    return Ok(Outcome::conflict(op, ConflictKind::StaleVersion, Some(current)));
                }
                self.swap(op, *expected_sync_version, Change::SoftDelete, ctx)
                    .await
            }
        }
    }

    async fn swap(
        &self,
        op: &OfflineOperation,
        expected: Version,
        change: Change,
        ctx: &MutationContext,
    ) -> StoreResult<Outcome> {
        let deleting = change == Change::SoftDelete;
        let outcome = self
            .store
            .compare_and_swap(op.resource(), &op.record_id, expected, change, ctx)
            .await?;

        Ok(match outcome {
            SwapOutcome::Swapped(record) => Outcome::accepted(op, record.sync_version),
            SwapOutcome::AlreadyApplied(receipt) => Outcome::from_receipt(receipt),
            // Lost a race against another delete
            SwapOutcome::VersionConflict(record) if deleting && record.is_deleted => {
                Outcome::accepted(op, record.sync_version)
            }
            SwapOutcome::VersionConflict(record) => {
                Outcome::conflict(op, ConflictKind::StaleVersion, Some(record))
            }
            SwapOutcome::NotFound => Outcome::conflict(op, ConflictKind::NotFound, None),
        })
    }
}
