//! # Tally Engine
//!
//! The protocol core of an offline-first ledger: accounts, categories and
//! transactions edited on many devices and reconciled against one
//! authoritative server.
//!
//! This crate has no knowledge of files or network. Devices and servers build
//! on it: the client crate drives the queue and projection, the server crate
//! hosts the [`Reconciler`] over a database-backed [`RecordStore`].
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! Every [`Record`] carries:
//! - A client-chosen ID
//! - Typed domain fields ([`RecordBody`])
//! - `syncVersion`, owned by the Record Store: 1 on creation, `+1` per accepted mutation
//! - A soft delete flag (tombstone)
//! - `lastModifiedBy`, the device whose mutation produced the current version
//!
//! ### Operations
//!
//! Offline edits are [`OfflineOperation`]s carrying a [`Mutation`]:
//! - `Create` - a full [`RecordBody`]
//! - `Update` - a [`RecordPatch`] against `expectedSyncVersion`
//! - `Delete` - a soft delete against `expectedSyncVersion`
//!
//! They wait in the [`OperationQueue`] and are applied optimistically to the
//! [`LocalProjection`] until the server answers.
//!
//! ### First-to-sync-wins
//!
//! The [`Reconciler`] admits an update or delete only if its
//! `expectedSyncVersion` equals the record's current version, using the store's
//! atomic compare-and-swap. Later operations against the old version come back
//! as conflicts carrying server truth, which the device applies verbatim.
//! There is no timestamp tie-break and no merge.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tally_engine::{
//!     record::{Account, AccountKind},
//!     MemoryRecordStore, Mutation, OfflineOperation, RecordBody, Reconciler, SyncRequest,
//! };
//!
//! # tokio_test();
//! # fn tokio_test() {
//! # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # rt.block_on(async {
//! let reconciler = Reconciler::new(Arc::new(MemoryRecordStore::new()));
//!
//! let create = OfflineOperation::new(
//!     "acc-1",
//!     Mutation::Create(RecordBody::Account(Account {
//!         name: "Checking".into(),
//!         kind: AccountKind::Checking,
//!         currency: "USD".into(),
//!         balance: 0,
//!         archived: false,
//!     })),
//!     "device-1",
//!     1706745600000,
//! );
//!
//! let result = reconciler
//!     .sync(SyncRequest::new("device-1", 0, [create]))
//!     .await
//!     .unwrap();
//! assert_eq!(result.accepted[0].sync_version, 1);
//! # });
//! # }
//! ```
//!
//! ## Persistence
//!
//! Use [`DeviceSnapshot`] to persist a device's queue, projection and
//! checkpoint. Snapshots are serializable to JSON with deterministic ordering.

pub mod connectivity;
pub mod error;
pub mod operation;
pub mod projection;
pub mod protocol;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod snapshot;
pub mod store;
mod watermark;

// Re-export main types at crate root
pub use connectivity::{ConnectivityEvent, ConnectivityState, Transition};
pub use error::Error;
pub use operation::{
    new_operation_id, Mutation, OfflineOperation, OperationId, OperationKind, WireOperation,
};
pub use projection::{CacheState, CachedRecord, LocalProjection};
pub use protocol::{
    AcceptedOperation, ChangeSet, ChangesResponse, ConflictKind, ConflictOutcome,
    RejectedOperation, SyncRequest, SyncResult,
};
pub use queue::OperationQueue;
pub use reconcile::{format_timestamp, now_millis, Reconciler};
pub use record::{Record, RecordBody, RecordKey, RecordPatch, Resource};
pub use snapshot::{DeviceSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{
    Change, CreateOutcome, MemoryRecordStore, MutationContext, Receipt, RecordStore, StoreError,
    StoreResult, SwapOutcome,
};

/// Type aliases for clarity
pub type RecordId = String;
pub type DeviceId = String;
pub type Version = u64;
/// Milliseconds since the Unix epoch
pub type Timestamp = i64;
