//! Operation types for expressing changes.
//!
//! Every mutation made while offline becomes an [`OfflineOperation`]. The
//! payload is a [`Mutation`] keyed by operation type whose inner body or patch
//! is keyed by resource, so an operation can only carry fields that belong to
//! its `(resource, type)` pair.
//!
//! On the wire an operation is the flat shape
//! `{id, type, resource, data, localTimestamp, expectedSyncVersion, retryCount, deviceId}`
//! described by [`WireOperation`]. Parsing always goes through that raw form so
//! a malformed entry surfaces as a validation error for that entry alone.

use crate::{
    error::Result, DeviceId, Error, RecordBody, RecordId, RecordKey, RecordPatch, Resource,
    Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an operation, stable across retries.
pub type OperationId = String;

/// Generate a fresh, time-ordered operation ID.
pub fn new_operation_id() -> OperationId {
    uuid::Uuid::now_v7().to_string()
}

/// The type of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "CREATE",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        }
    }

    /// Parse a wire name, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "CREATE" => Some(OperationKind::Create),
            "UPDATE" => Some(OperationKind::Update),
            "DELETE" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The change an operation asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Create a record with a client-chosen ID at version 1.
    Create(RecordBody),
    /// Patch a record the device last saw at `expected_sync_version`.
    Update {
        expected_sync_version: Version,
        patch: RecordPatch,
    },
    /// Soft-delete a record the device last saw at `expected_sync_version`.
    Delete {
        resource: Resource,
        expected_sync_version: Version,
    },
}

impl Mutation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Mutation::Create(_) => OperationKind::Create,
            Mutation::Update { .. } => OperationKind::Update,
            Mutation::Delete { .. } => OperationKind::Delete,
        }
    }

    pub fn resource(&self) -> Resource {
        match self {
            Mutation::Create(body) => body.resource(),
            Mutation::Update { patch, .. } => patch.resource(),
            Mutation::Delete { resource, .. } => *resource,
        }
    }

    /// The version the device believed current; `None` for creates.
    pub fn expected_sync_version(&self) -> Option<Version> {
        match self {
            Mutation::Create(_) => None,
            Mutation::Update {
                expected_sync_version,
                ..
            }
            | Mutation::Delete {
                expected_sync_version,
                ..
            } => Some(*expected_sync_version),
        }
    }
}

/// A mutation queued on a device, waiting to reach the Reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireOperation", into = "WireOperation")]
pub struct OfflineOperation {
    /// De-duplication key, stable across retries and reconnections
    pub operation_id: OperationId,
    /// Target record
    pub record_id: RecordId,
    /// Typed payload
    pub mutation: Mutation,
    /// Queuing time; only used for local ordering
    pub local_timestamp: Timestamp,
    /// Failed transmission attempts
    pub retry_count: u32,
    /// Device that queued the operation
    pub device_id: DeviceId,
}

impl OfflineOperation {
    /// Create a new operation with a fresh operation ID.
    pub fn new(
        record_id: impl Into<RecordId>,
        mutation: Mutation,
        device_id: impl Into<DeviceId>,
        local_timestamp: Timestamp,
    ) -> Self {
        Self {
            operation_id: new_operation_id(),
            record_id: record_id.into(),
            mutation,
            local_timestamp,
            retry_count: 0,
            device_id: device_id.into(),
        }
    }

    /// Use a caller-provided operation ID.
    pub fn with_operation_id(mut self, operation_id: impl Into<OperationId>) -> Self {
        self.operation_id = operation_id.into();
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.mutation.kind()
    }

    pub fn resource(&self) -> Resource {
        self.mutation.resource()
    }

    pub fn key(&self) -> RecordKey {
        (self.resource(), self.record_id.clone())
    }

    pub fn expected_sync_version(&self) -> Option<Version> {
        self.mutation.expected_sync_version()
    }

    /// Check the structural invariants the typed payload cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.record_id.trim().is_empty() {
            return Err(Error::validation("record id is required"));
        }
        match &self.mutation {
            Mutation::Create(_) => Ok(()),
            Mutation::Update {
                expected_sync_version,
                patch,
            } => {
                check_expected(*expected_sync_version)?;
                if patch.is_empty() {
                    return Err(Error::EmptyPatch(patch.resource()));
                }
                Ok(())
            }
            Mutation::Delete {
                expected_sync_version,
                ..
            } => check_expected(*expected_sync_version),
        }
    }
}

fn check_expected(version: Version) -> Result<()> {
    if version == 0 {
        return Err(Error::validation("expectedSyncVersion must be at least 1"));
    }
    Ok(())
}

/// The language-neutral wire shape of an operation.
///
/// Every field defaults so that structurally broken entries still parse and
/// can be rejected individually.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOperation {
    #[serde(default, alias = "operationId")]
    pub id: OperationId,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub local_timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sync_version: Option<Version>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub device_id: DeviceId,
}

impl TryFrom<WireOperation> for OfflineOperation {
    type Error = Error;

    fn try_from(wire: WireOperation) -> Result<Self> {
        if wire.id.trim().is_empty() {
            return Err(Error::validation("operation id is required"));
        }
        let kind = OperationKind::parse(&wire.kind)
            .ok_or_else(|| Error::validation(format!("unknown operation type '{}'", wire.kind)))?;
        let resource = Resource::parse(&wire.resource)
            .ok_or_else(|| Error::validation(format!("unknown resource '{}'", wire.resource)))?;

        let serde_json::Value::Object(mut fields) = wire.data else {
            return Err(Error::validation("data must be an object"));
        };
        let record_id = match fields.remove("id") {
            Some(serde_json::Value::String(id)) if !id.trim().is_empty() => id,
            _ => return Err(Error::validation("data.id is required")),
        };
        let fields = serde_json::Value::Object(fields);

        let mutation = match kind {
            OperationKind::Create => Mutation::Create(RecordBody::from_fields(resource, fields)?),
            OperationKind::Update => Mutation::Update {
                expected_sync_version: required_expected(wire.expected_sync_version)?,
                patch: RecordPatch::from_fields(resource, fields)?,
            },
            OperationKind::Delete => Mutation::Delete {
                resource,
                expected_sync_version: required_expected(wire.expected_sync_version)?,
            },
        };

        let operation = OfflineOperation {
            operation_id: wire.id,
            record_id,
            mutation,
            local_timestamp: wire.local_timestamp,
            retry_count: wire.retry_count,
            device_id: wire.device_id,
        };
        operation.validate()?;
        Ok(operation)
    }
}

fn required_expected(version: Option<Version>) -> Result<Version> {
    version.ok_or_else(|| Error::validation("expectedSyncVersion is required"))
}

impl From<OfflineOperation> for WireOperation {
    fn from(op: OfflineOperation) -> Self {
        let kind = op.kind().as_str().to_string();
        let resource = op.resource().as_str().to_string();
        let expected_sync_version = op.expected_sync_version();

        let mut data = match &op.mutation {
            Mutation::Create(body) => body.to_fields(),
            Mutation::Update { patch, .. } => patch.to_fields(),
            Mutation::Delete { .. } => serde_json::Value::Object(Default::default()),
        };
        if let serde_json::Value::Object(map) = &mut data {
            map.insert("id".into(), serde_json::Value::String(op.record_id));
        }

        WireOperation {
            id: op.operation_id,
            kind,
            resource,
            data,
            local_timestamp: op.local_timestamp,
            expected_sync_version,
            retry_count: op.retry_count,
            device_id: op.device_id,
        }
    }
}
