//! # Tally Client
//!
//! Device runtime for Tally. Wraps the engine's queue and projection with
//! durable storage, a transport to the sync server and connectivity handling.
//!
//! - While offline, every mutation is applied optimistically and queued
//!   ([`Device::mutate`]); `queue_count` grows.
//! - On reconnection the device goes `SYNCING`, flushes the whole queue in one
//!   request and goes `ONLINE`. A failed flush keeps the queue and retries
//!   with exponential backoff.
//! - While online, mutations go straight to the server and never enter the
//!   queue.
//!
//! Conflicts and rejections are reported through [`SyncEvent`]s; by the time
//! a conflict arrives the projection already shows the server's record.

pub mod backoff;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod events;
pub mod storage;
pub mod sync_client;
pub mod transport;

pub use backoff::Backoff;
pub use config::{ClientConfig, ConfigError};
pub use context::SyncContext;
pub use device::{Device, DeviceOptions, MutationOutcome};
pub use error::{ClientError, Result, StorageError, TransportError};
pub use events::SyncEvent;
pub use storage::{DeviceStorage, FileStorage, MemoryStorage};
pub use sync_client::{FlushOutcome, FlushReport, SyncClient};
pub use transport::{HttpTransport, InProcessTransport, SyncTransport, TransportBuildError};
