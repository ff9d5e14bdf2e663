//! Snapshot types for persisting and restoring device state.
//!
//! A [`DeviceSnapshot`] is everything a device must carry across a restart:
//! its identity, the sync checkpoint, the offline queue in order and the local
//! projection. Maps are `BTreeMap`s so serialization is deterministic.

use crate::{
    error::Result, DeviceId, Error, LocalProjection, OfflineOperation, OperationId, OperationQueue,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Durable state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Generated once, stable for the device's lifetime
    pub device_id: DeviceId,
    /// Checkpoint for the next incremental pull
    #[serde(default)]
    pub last_sync_timestamp: Timestamp,
    /// Offline queue, oldest first
    #[serde(default)]
    pub operations: Vec<OfflineOperation>,
    /// Queued operations already handed to a transport
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sent: Vec<OperationId>,
    /// Materialized record caches per resource
    #[serde(default)]
    pub projection: LocalProjection,
}

impl DeviceSnapshot {
    /// Create an empty snapshot for a fresh device.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            device_id: device_id.into(),
            last_sync_timestamp: 0,
            operations: Vec::new(),
            sent: Vec::new(),
            projection: LocalProjection::new(),
        }
    }

    /// Capture the current device state.
    pub fn capture(
        device_id: impl Into<DeviceId>,
        last_sync_timestamp: Timestamp,
        queue: &OperationQueue,
        projection: &LocalProjection,
    ) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            device_id: device_id.into(),
            last_sync_timestamp,
            operations: queue.operations().to_vec(),
            sent: queue.sent().cloned().collect(),
            projection: projection.clone(),
        }
    }

    /// Split into a live queue and projection.
    pub fn into_parts(self) -> (OperationQueue, LocalProjection) {
        (
            OperationQueue::from_parts(self.operations, self.sent),
            self.projection,
        )
    }

    /// Check invariants a hand-edited or truncated file could break.
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::InvalidSnapshot("device id is empty".into()));
        }

        let mut seen = HashSet::new();
        for op in &self.operations {
            if !seen.insert(op.operation_id.as_str()) {
                return Err(Error::InvalidSnapshot(format!(
                    "duplicate operation id {}",
                    op.operation_id
                )));
            }
            op.validate()?;
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        snapshot.validate()?;

        Ok(snapshot)
    }
}
