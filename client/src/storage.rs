//! Durable device storage.
//!
//! The whole device state is one [`DeviceSnapshot`]. [`FileStorage`] writes it
//! to a temporary file, syncs it and renames it over the previous state, so a
//! crash mid-write leaves the last good snapshot in place.

use crate::error::StorageError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tally_engine::DeviceSnapshot;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const STATE_FILE: &str = "device.json";

#[async_trait]
pub trait DeviceStorage: Send + Sync {
    /// Load the saved state; `None` on first launch.
    async fn load(&self) -> Result<Option<DeviceSnapshot>, StorageError>;

    /// Replace the saved state.
    async fn save(&self, snapshot: &DeviceSnapshot) -> Result<(), StorageError>;
}

/// JSON file in a data directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeviceStorage for FileStorage {
    async fn load(&self) -> Result<Option<DeviceSnapshot>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => Ok(Some(DeviceSnapshot::from_json(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &DeviceSnapshot) -> Result<(), StorageError> {
        let json = snapshot.to_json_pretty()?;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::trace!(path = %self.path.display(), bytes = json.len(), "device state saved");
        Ok(())
    }
}

/// In-memory storage with a switch to simulate write failures.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    snapshot: Mutex<Option<DeviceSnapshot>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The last saved snapshot.
    pub async fn saved(&self) -> Option<DeviceSnapshot> {
        self.snapshot.lock().await.clone()
    }
}

#[async_trait]
impl DeviceStorage for MemoryStorage {
    async fn load(&self) -> Result<Option<DeviceSnapshot>, StorageError> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save(&self, snapshot: &DeviceSnapshot) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".into()));
        }
        *self.snapshot.lock().await = Some(snapshot.clone());
        Ok(())
    }
}
