//! Record Store - the authoritative, versioned record storage.
//!
//! The Reconciler only talks to storage through [`RecordStore`]. Its
//! `compare_and_swap` is the single synchronization primitive of the
//! protocol: the version check, the write, the `+1` bump and the operation
//! receipt happen as one atomic step, so several Reconcilers may share one
//! store without lost updates.
//!
//! [`MemoryRecordStore`] keeps everything in a `DashMap`; the entry guard of a
//! record is its lock. Receipts live in a second map and are always locked
//! after the record.

use crate::{
    DeviceId, Error, OperationId, Record, RecordId, RecordKey, RecordPatch, Resource, Timestamp,
    Version,
};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};

/// Errors from a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error(transparent)]
    Engine(#[from] Error),
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        StoreError::Backend(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Who is writing, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationContext {
    pub operation_id: OperationId,
    pub device_id: DeviceId,
    /// Server time of the write
    pub timestamp: Timestamp,
}

/// Proof that an operation was applied, kept for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub operation_id: OperationId,
    pub resource: Resource,
    pub record_id: RecordId,
    /// Version produced by the operation
    pub sync_version: Version,
    pub applied_at: Timestamp,
}

impl Receipt {
    pub fn for_record(record: &Record, ctx: &MutationContext) -> Self {
        Self {
            operation_id: ctx.operation_id.clone(),
            resource: record.resource(),
            record_id: record.id.clone(),
            sync_version: record.sync_version,
            applied_at: ctx.timestamp,
        }
    }
}

/// What a conditional write does to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Patch(RecordPatch),
    SoftDelete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Record),
    /// The id is taken; the current record is returned untouched
    Exists(Record),
    AlreadyApplied(Receipt),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    Swapped(Record),
    /// `expected` did not match; the current record is returned untouched
    VersionConflict(Record),
    NotFound,
    AlreadyApplied(Receipt),
}

/// Authoritative per-record storage.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Current record, including soft-deleted ones.
    async fn get(&self, resource: Resource, id: &str) -> StoreResult<Option<Record>>;

    /// Insert `record` unless its id is taken.
    async fn create_if_absent(
        &self,
        record: Record,
        ctx: &MutationContext,
    ) -> StoreResult<CreateOutcome>;

    /// Apply `change` only if the record is at `expected`, bumping its version by one.
    async fn compare_and_swap(
        &self,
        resource: Resource,
        id: &str,
        expected: Version,
        change: Change,
        ctx: &MutationContext,
    ) -> StoreResult<SwapOutcome>;

    /// Receipt of an already-applied operation.
    async fn receipt(&self, operation_id: &str) -> StoreResult<Option<Receipt>>;

    /// Records with `updated_at >= since`, oldest first.
    async fn changed_since(&self, since: Timestamp) -> StoreResult<Vec<Record>>;
}

/// In-memory Record Store.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<RecordKey, Record>,
    receipts: DashMap<OperationId, Receipt>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing versioning.
    pub fn insert(&self, record: Record) {
        self.records.insert(record.key(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn applied(&self, operation_id: &str) -> Option<Receipt> {
        self.receipts.get(operation_id).map(|r| r.value().clone())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, resource: Resource, id: &str) -> StoreResult<Option<Record>> {
        Ok(self
            .records
            .get(&(resource, id.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn create_if_absent(
        &self,
        mut record: Record,
        ctx: &MutationContext,
    ) -> StoreResult<CreateOutcome> {
        match self.records.entry(record.key()) {
            Entry::Occupied(entry) => {
                if let Some(receipt) = self.applied(&ctx.operation_id) {
                    return Ok(CreateOutcome::AlreadyApplied(receipt));
                }
                Ok(CreateOutcome::Exists(entry.get().clone()))
            }
            Entry::Vacant(entry) => {
                record.sync_version = 1;
                record.is_deleted = false;
                record.last_modified_by = ctx.device_id.clone();
                record.created_at = ctx.timestamp;
                record.updated_at = ctx.timestamp;

                self.receipts.insert(
                    ctx.operation_id.clone(),
                    Receipt::for_record(&record, ctx),
                );
                entry.insert(record.clone());
                Ok(CreateOutcome::Created(record))
            }
        }
    }

    async fn compare_and_swap(
        &self,
        resource: Resource,
        id: &str,
        expected: Version,
        change: Change,
        ctx: &MutationContext,
    ) -> StoreResult<SwapOutcome> {
        let Some(mut entry) = self.records.get_mut(&(resource, id.to_string())) else {
            return Ok(SwapOutcome::NotFound);
        };
        if let Some(receipt) = self.applied(&ctx.operation_id) {
            return Ok(SwapOutcome::AlreadyApplied(receipt));
        }
        if entry.sync_version != expected {
            return Ok(SwapOutcome::VersionConflict(entry.clone()));
        }

        let mut next = entry.clone();
        match &change {
            Change::Patch(patch) => next.body.apply(patch)?,
            Change::SoftDelete => next.is_deleted = true,
        }
        next.advance(&ctx.device_id, ctx.timestamp);

        self.receipts
            .insert(ctx.operation_id.clone(), Receipt::for_record(&next, ctx));
        *entry = next.clone();
        Ok(SwapOutcome::Swapped(next))
    }

    async fn receipt(&self, operation_id: &str) -> StoreResult<Option<Receipt>> {
        Ok(self.applied(operation_id))
    }

    async fn changed_since(&self, since: Timestamp) -> StoreResult<Vec<Record>> {
        let mut records: Vec<Record> = self
            .records
            .iter()
            .filter(|r| r.updated_at >= since)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| {
            (a.updated_at, a.resource(), &a.id).cmp(&(b.updated_at, b.resource(), &b.id))
        });
        Ok(records)
    }
}
