//! The offline operation queue.
//!
//! An append-ordered log of mutations made while disconnected. Entries leave
//! the queue only when the Reconciler reports a terminal outcome for them
//! (accepted, conflict or rejected); a failed transmission leaves them in
//! place with `retry_count` bumped.
//!
//! Durability is the host's job: the queue serializes with its entries in
//! order and is persisted as part of a [`crate::DeviceSnapshot`]. The set of
//! operations handed to a transport is persisted too, so after a restart an
//! entry the server may already hold is never amended or discarded.

use crate::{
    error::Result, new_operation_id, Error, Mutation, OfflineOperation, OperationId, Resource,
    Version,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationQueue {
    entries: Vec<OfflineOperation>,
    /// IDs handed to a transport at least once
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    sent: BTreeSet<OperationId>,
}

impl OperationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from persisted entries, keeping their order.
    ///
    /// Sent marks for operations no longer queued are dropped.
    pub fn from_parts(entries: Vec<OfflineOperation>, sent: impl IntoIterator<Item = OperationId>) -> Self {
        let sent = sent
            .into_iter()
            .filter(|id| entries.iter().any(|op| &op.operation_id == id))
            .collect();
        Self { entries, sent }
    }

    /// Append an operation, assigning an operation ID if it has none.
    pub fn enqueue(&mut self, mut op: OfflineOperation) -> Result<OperationId> {
        if op.operation_id.trim().is_empty() {
            op.operation_id = new_operation_id();
        }
        op.validate()?;
        if self.contains(&op.operation_id) {
            return Err(Error::validation(format!(
                "operation {} is already queued",
                op.operation_id
            )));
        }

        let id = op.operation_id.clone();
        self.entries.push(op);
        Ok(id)
    }

    /// Current contents in queue order, without removing anything.
    pub fn peek_batch(&self) -> &[OfflineOperation] {
        &self.entries
    }

    /// The earliest queued operation of each record, in queue order.
    ///
    /// A later edit of a record is built on the version its predecessor
    /// produces, so it waits until that predecessor has an outcome.
    pub fn next_batch(&self) -> Vec<OfflineOperation> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|op| seen.insert(op.key()))
            .cloned()
            .collect()
    }

    /// Move queued edits of a record from base version `from` to `to`, once
    /// the operation they were built on is accepted at `to`.
    ///
    /// Returns how many entries moved.
    pub fn rebase(&mut self, resource: Resource, record_id: &str, from: Version, to: Version) -> usize {
        let mut moved = 0;
        for op in self
            .entries
            .iter_mut()
            .filter(|op| op.resource() == resource && op.record_id == record_id)
        {
            match &mut op.mutation {
                Mutation::Update {
                    expected_sync_version,
                    ..
                }
                | Mutation::Delete {
                    expected_sync_version,
                    ..
                } if *expected_sync_version == from => {
                    *expected_sync_version = to;
                    moved += 1;
                }
                _ => {}
            }
        }
        moved
    }

    /// Remove every entry whose ID is in `operation_ids`.
    ///
    /// Returns how many entries were removed.
    pub fn ack<'a>(&mut self, operation_ids: impl IntoIterator<Item = &'a str>) -> usize {
        let ids: HashSet<&str> = operation_ids.into_iter().collect();
        let before = self.entries.len();
        self.entries
            .retain(|op| !ids.contains(op.operation_id.as_str()));
        self.sent.retain(|id| !ids.contains(id.as_str()));
        before - self.entries.len()
    }

    /// Bump `retry_count` after a failed transmission.
    pub fn increment_retry(&mut self, operation_id: &str) -> Option<u32> {
        let op = self
            .entries
            .iter_mut()
            .find(|op| op.operation_id == operation_id)?;
        op.retry_count += 1;
        Some(op.retry_count)
    }

    /// Mark operations as handed to a transport. The mark stays until the
    /// operation is acked; persist it before the request leaves.
    ///
    /// Returns how many marks are new.
    pub fn mark_sent<'a>(&mut self, operation_ids: impl IntoIterator<Item = &'a str>) -> usize {
        let mut marked = 0;
        for id in operation_ids {
            if self.contains(id) && self.sent.insert(id.to_string()) {
                marked += 1;
            }
        }
        marked
    }

    pub fn is_sent(&self, operation_id: &str) -> bool {
        self.sent.contains(operation_id)
    }

    /// IDs marked as sent, in sorted order.
    pub fn sent(&self) -> impl Iterator<Item = &OperationId> {
        self.sent.iter()
    }

    /// Whether an operation may already have reached the server.
    pub fn is_transmitted(&self, op: &OfflineOperation) -> bool {
        op.retry_count > 0 || self.is_sent(&op.operation_id)
    }

    /// The latest queued operation for a record.
    pub fn last_for(&self, resource: Resource, record_id: &str) -> Option<&OfflineOperation> {
        self.entries
            .iter()
            .rev()
            .find(|op| op.resource() == resource && op.record_id == record_id)
    }

    /// Replace the payload of an entry that has never been transmitted.
    pub fn amend(&mut self, operation_id: &str, mutation: Mutation) -> Result<()> {
        let sent = self.is_sent(operation_id);
        let op = self
            .entries
            .iter_mut()
            .find(|op| op.operation_id == operation_id)
            .ok_or_else(|| Error::validation(format!("operation {operation_id} is not queued")))?;
        if sent || op.retry_count > 0 {
            return Err(Error::validation(format!(
                "operation {operation_id} was already transmitted"
            )));
        }

        let previous = std::mem::replace(&mut op.mutation, mutation);
        if let Err(e) = op.validate() {
            op.mutation = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Drop an entry that has never been transmitted.
    pub fn discard(&mut self, operation_id: &str) -> Option<OfflineOperation> {
        let index = self
            .entries
            .iter()
            .position(|op| op.operation_id == operation_id)?;
        if self.is_transmitted(&self.entries[index]) {
            return None;
        }
        Some(self.entries.remove(index))
    }

    pub fn contains(&self, operation_id: &str) -> bool {
        self.entries.iter().any(|op| op.operation_id == operation_id)
    }

    pub fn get(&self, operation_id: &str) -> Option<&OfflineOperation> {
        self.entries.iter().find(|op| op.operation_id == operation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn operations(&self) -> &[OfflineOperation] {
        &self.entries
    }
}
