//! Sync protocol wire types.
//!
//! ```text
//! POST /sync
//!   SyncRequest { deviceId, lastSyncTimestamp, operations }
//!   -> SyncResult { success, accepted, conflicts, rejected, serverData, currentTimestamp }
//!
//! GET /sync/changes?since=<timestamp>
//!   -> ChangesResponse { accounts, categories, transactions, currentTimestamp, syncedAt }
//! ```

use crate::{
    DeviceId, OfflineOperation, OperationId, Record, RecordId, Resource, Timestamp, Version,
    WireOperation,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A batch of queued operations sent by one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub device_id: DeviceId,
    /// Checkpoint of the device's last successful sync; 0 requests a full snapshot
    #[serde(default)]
    pub last_sync_timestamp: Timestamp,
    /// Raw operations, parsed one by one so a malformed entry only rejects itself
    #[serde(default)]
    pub operations: Vec<WireOperation>,
}

impl SyncRequest {
    pub fn new(
        device_id: impl Into<DeviceId>,
        last_sync_timestamp: Timestamp,
        operations: impl IntoIterator<Item = OfflineOperation>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            last_sync_timestamp,
            operations: operations.into_iter().map(WireOperation::from).collect(),
        }
    }
}

/// An operation the Record Store applied (or had already applied).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedOperation {
    pub operation_id: OperationId,
    pub record_id: RecordId,
    pub resource: Resource,
    /// Version the record reached through this operation
    pub sync_version: Version,
}

/// Why an operation lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// `expectedSyncVersion` is behind the server
    StaleVersion,
    /// The record does not exist
    NotFound,
    /// The record was soft-deleted by an earlier operation
    Deleted,
    /// A CREATE reused an id held by different content
    AlreadyExists,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::StaleVersion => "stale-version",
            ConflictKind::NotFound => "not-found",
            ConflictKind::Deleted => "deleted",
            ConflictKind::AlreadyExists => "already-exists",
        }
    }

    /// Human readable reason.
    pub fn describe(&self) -> &'static str {
        match self {
            ConflictKind::StaleVersion => "record was modified by another device",
            ConflictKind::NotFound => "record does not exist",
            ConflictKind::Deleted => "record was deleted",
            ConflictKind::AlreadyExists => "a different record already uses this id",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lost operation together with the server truth that beat it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictOutcome {
    pub operation_id: OperationId,
    pub record_id: RecordId,
    pub resource: Resource,
    pub reason: String,
    pub conflict_type: ConflictKind,
    /// Record as it stands on the server; absent for `not-found`
    #[serde(default)]
    pub server_record: Option<Record>,
    #[serde(default)]
    pub server_sync_version: Option<Version>,
    #[serde(default)]
    pub expected_sync_version: Option<Version>,
    #[serde(default)]
    pub last_modified_by: Option<DeviceId>,
}

impl ConflictOutcome {
    pub fn new(
        op: &OfflineOperation,
        conflict_type: ConflictKind,
        server_record: Option<Record>,
    ) -> Self {
        Self {
            operation_id: op.operation_id.clone(),
            record_id: op.record_id.clone(),
            resource: op.resource(),
            reason: conflict_type.describe().to_string(),
            conflict_type,
            server_sync_version: server_record.as_ref().map(|r| r.sync_version),
            expected_sync_version: op.expected_sync_version(),
            last_modified_by: server_record.as_ref().map(|r| r.last_modified_by.clone()),
            server_record,
        }
    }
}

/// A structurally malformed operation, permanently refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedOperation {
    pub operation_id: OperationId,
    pub error: String,
}

/// Records grouped by resource, as returned to devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    #[serde(default)]
    pub accounts: Vec<Record>,
    #[serde(default)]
    pub categories: Vec<Record>,
    #[serde(default)]
    pub transactions: Vec<Record>,
}

impl ChangeSet {
    /// Bucket records by resource, keeping their order.
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut set = Self::default();
        for record in records {
            set.push(record);
        }
        set
    }

    pub fn push(&mut self, record: Record) {
        match record.resource() {
            Resource::Account => self.accounts.push(record),
            Resource::Category => self.categories.push(record),
            Resource::Transaction => self.transactions.push(record),
        }
    }

    pub fn into_records(self) -> impl Iterator<Item = Record> {
        self.accounts
            .into_iter()
            .chain(self.categories)
            .chain(self.transactions)
    }

    pub fn len(&self) -> usize {
        self.accounts.len() + self.categories.len() + self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Answer to a [`SyncRequest`].
///
/// Every operation in the request appears in exactly one of `accepted`,
/// `conflicts` or `rejected`; all three are terminal for the device's queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    #[serde(default)]
    pub accepted: Vec<AcceptedOperation>,
    #[serde(default)]
    pub conflicts: Vec<ConflictOutcome>,
    #[serde(default)]
    pub rejected: Vec<RejectedOperation>,
    /// Full snapshot or delta since the request's checkpoint
    #[serde(default)]
    pub server_data: ChangeSet,
    /// Checkpoint for the next sync
    pub current_timestamp: Timestamp,
}

impl SyncResult {
    /// IDs of every operation with a terminal outcome.
    pub fn settled_ids(&self) -> impl Iterator<Item = &str> {
        self.accepted
            .iter()
            .map(|a| a.operation_id.as_str())
            .chain(self.conflicts.iter().map(|c| c.operation_id.as_str()))
            .chain(self.rejected.iter().map(|r| r.operation_id.as_str()))
    }

    pub fn outcome_count(&self) -> usize {
        self.accepted.len() + self.conflicts.len() + self.rejected.len()
    }
}

/// Answer to an incremental pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
    #[serde(flatten)]
    pub changes: ChangeSet,
    pub current_timestamp: Timestamp,
    /// `current_timestamp` as RFC 3339
    pub synced_at: String,
}
