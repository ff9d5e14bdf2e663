//! Local projection - the device's materialized view of every record.
//!
//! Offline mutations are applied here immediately and tagged
//! [`CacheState::Pending`]. After a sync each record moves to `Confirmed`
//! (server accepted, or server data received) or `Overwritten` (server
//! conflict truth replaced the local edit). The projection is a derived cache:
//! server records plus the still-queued operations rebuild it completely.

use crate::{
    error::Result, Error, Mutation, OfflineOperation, Record, RecordId, RecordKey, Resource,
    Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Confirmation state of a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    /// Locally applied, not yet confirmed by the server
    Pending,
    /// Matches server truth
    Confirmed,
    /// Server truth replaced a losing local edit
    Overwritten,
}

/// A record in the projection with its confirmation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedRecord {
    pub record: Record,
    pub state: CacheState,
    /// Last server copy, kept while local edits are pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_copy: Option<Record>,
}

impl CachedRecord {
    fn confirmed(record: Record) -> Self {
        Self {
            record,
            state: CacheState::Confirmed,
            server_copy: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == CacheState::Pending
    }
}

/// Materialized records per resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalProjection {
    records: BTreeMap<Resource, BTreeMap<RecordId, CachedRecord>>,
}

impl LocalProjection {
    /// Create an empty projection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached record, including deleted ones.
    pub fn get(&self, resource: Resource, id: &str) -> Option<&CachedRecord> {
        self.records.get(&resource)?.get(id)
    }

    /// Get an active (non-deleted) record.
    pub fn record(&self, resource: Resource, id: &str) -> Option<&Record> {
        self.get(resource, id)
            .map(|cached| &cached.record)
            .filter(|record| record.is_active())
    }

    /// All active records of a resource, ordered by ID.
    pub fn active(&self, resource: Resource) -> impl Iterator<Item = &Record> {
        self.records
            .get(&resource)
            .into_iter()
            .flat_map(|records| records.values())
            .map(|cached| &cached.record)
            .filter(|record| record.is_active())
    }

    /// All cached records of a resource, including deleted ones.
    pub fn all(&self, resource: Resource) -> impl Iterator<Item = &CachedRecord> {
        self.records
            .get(&resource)
            .into_iter()
            .flat_map(|records| records.values())
    }

    /// Total cached records across resources.
    pub fn len(&self) -> usize {
        self.records.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of records with unconfirmed local edits.
    pub fn pending_count(&self) -> usize {
        self.records
            .values()
            .flat_map(BTreeMap::values)
            .filter(|cached| cached.is_pending())
            .count()
    }

    fn insert(&mut self, cached: CachedRecord) {
        self.records
            .entry(cached.record.resource())
            .or_default()
            .insert(cached.record.id.clone(), cached);
    }

    fn remove(&mut self, resource: Resource, id: &str) -> Option<CachedRecord> {
        self.records.get_mut(&resource)?.remove(id)
    }

    fn get_mut(&mut self, resource: Resource, id: &str) -> Option<&mut CachedRecord> {
        self.records.get_mut(&resource)?.get_mut(id)
    }

    /// Apply an operation optimistically, before the server has seen it.
    ///
    /// The record's `sync_version` is left alone: only the server assigns
    /// versions. A locally created record carries version 0 until confirmed.
    pub fn apply_optimistic(&mut self, op: &OfflineOperation, now: Timestamp) -> Result<()> {
        let resource = op.resource();
        match &op.mutation {
            Mutation::Create(body) => {
                if self.record(resource, &op.record_id).is_some() {
                    return Err(Error::validation(format!(
                        "{resource}/{} already exists",
                        op.record_id
                    )));
                }
                let mut record =
                    Record::new(op.record_id.clone(), body.clone(), op.device_id.clone(), now);
                record.sync_version = 0;
                self.insert(CachedRecord {
                    record,
                    state: CacheState::Pending,
                    server_copy: None,
                });
            }
            Mutation::Update { patch, .. } => {
                let cached = self.editable(resource, &op.record_id)?;
                cached.record.body.apply(patch)?;
                cached.record.last_modified_by = op.device_id.clone();
                cached.record.updated_at = now;
            }
            Mutation::Delete { .. } => {
                let cached = self.editable(resource, &op.record_id)?;
                cached.record.is_deleted = true;
                cached.record.last_modified_by = op.device_id.clone();
                cached.record.updated_at = now;
            }
        }
        Ok(())
    }

    /// Borrow an active record for a local edit, remembering its server copy.
    fn editable(&mut self, resource: Resource, id: &str) -> Result<&mut CachedRecord> {
        let cached = self.get_mut(resource, id).ok_or_else(|| Error::RecordNotFound {
            resource,
            id: id.to_string(),
        })?;
        if cached.record.is_deleted {
            return Err(Error::RecordDeleted {
                resource,
                id: id.to_string(),
            });
        }
        if cached.state != CacheState::Pending {
            cached.server_copy = Some(cached.record.clone());
            cached.state = CacheState::Pending;
        }
        Ok(cached)
    }

    /// Mark a record as accepted by the server at `sync_version`.
    pub fn confirm(&mut self, resource: Resource, id: &str, sync_version: Version, device_id: &str) {
        if let Some(cached) = self.get_mut(resource, id) {
            cached.record.sync_version = sync_version;
            cached.record.last_modified_by = device_id.to_string();
            cached.state = CacheState::Confirmed;
            cached.server_copy = None;
        }
    }

    /// Replace a record with server conflict truth; `None` removes it.
    pub fn overwrite(&mut self, resource: Resource, id: &str, server_record: Option<Record>) {
        match server_record {
            Some(record) => self.insert(CachedRecord {
                record,
                state: CacheState::Overwritten,
                server_copy: None,
            }),
            None => {
                self.remove(resource, id);
            }
        }
    }

    /// Undo local edits after a permanent rejection.
    ///
    /// Restores the last server copy, or drops a record the server never had.
    pub fn revert(&mut self, resource: Resource, id: &str) {
        let Some(cached) = self.get_mut(resource, id) else {
            return;
        };
        if cached.state != CacheState::Pending {
            return;
        }
        match cached.server_copy.take() {
            Some(record) => *cached = CachedRecord::confirmed(record),
            None if cached.record.sync_version == 0 => {
                self.remove(resource, id);
            }
            None => cached.state = CacheState::Confirmed,
        }
    }

    /// Apply server truth; every record present overwrites the local copy.
    ///
    /// Returns the keys that were written.
    pub fn apply_server(&mut self, records: impl IntoIterator<Item = Record>) -> HashSet<RecordKey> {
        let mut touched = HashSet::new();
        for record in records {
            touched.insert(record.key());
            self.insert(CachedRecord::confirmed(record));
        }
        touched
    }

    /// Re-apply still-queued operations on top of freshly written records.
    ///
    /// Operations whose record was not in `touched` are already reflected.
    /// Operations that no longer apply (e.g. the server deleted the record)
    /// are skipped; their outcome will come from the Reconciler.
    pub fn reapply<'a>(
        &mut self,
        pending: impl IntoIterator<Item = &'a OfflineOperation>,
        touched: &HashSet<RecordKey>,
        now: Timestamp,
    ) {
        for op in pending {
            if !touched.contains(&op.key()) {
                continue;
            }
            if let Err(e) = self.apply_optimistic(op, now) {
                tracing::debug!(
                    operation_id = %op.operation_id,
                    error = %e,
                    "queued operation no longer applies to server state"
                );
            }
        }
    }
}
