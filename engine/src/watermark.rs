//! Write watermark for incremental pulls.
//!
//! A write is stamped with its `updated_at` before it reaches the store but
//! only becomes visible when the store call returns. A pull that runs in
//! between must not hand out a checkpoint past that stamp, or the write is
//! skipped by every later `updated_at >= checkpoint` query.
//!
//! [`WriteClock`] issues non-decreasing stamps and remembers the ones still
//! open. [`WriteClock::watermark`] is the checkpoint to give a reader: no write
//! that is still open, or that starts later, carries an earlier stamp.

use crate::{now_millis, Timestamp};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Stamps {
    last_issued: Timestamp,
    /// Open stamps with how many writes hold each
    open: BTreeMap<Timestamp, usize>,
}

impl Stamps {
    fn tick(&mut self) -> Timestamp {
        self.last_issued = self.last_issued.max(now_millis());
        self.last_issued
    }
}

#[derive(Debug, Default)]
pub(crate) struct WriteClock {
    stamps: Mutex<Stamps>,
}

impl WriteClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn stamps(&self) -> MutexGuard<'_, Stamps> {
        // The map is consistent after every statement; a panic elsewhere cannot corrupt it
        self.stamps.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stamp a write. The stamp stays open until the returned guard drops.
    pub fn begin(self: &Arc<Self>) -> OpenWrite {
        let mut stamps = self.stamps();
        let timestamp = stamps.tick();
        *stamps.open.entry(timestamp).or_default() += 1;
        OpenWrite {
            clock: Arc::clone(self),
            timestamp,
        }
    }

    /// Checkpoint safe to hand out before reading changes.
    pub fn watermark(&self) -> Timestamp {
        let mut stamps = self.stamps();
        let now = stamps.tick();
        stamps
            .open
            .keys()
            .next()
            .map_or(now, |&oldest| oldest.min(now))
    }

    fn finish(&self, timestamp: Timestamp) {
        let mut stamps = self.stamps();
        if let Some(count) = stamps.open.get_mut(&timestamp) {
            *count -= 1;
            if *count == 0 {
                stamps.open.remove(&timestamp);
            }
        }
    }
}

/// A write between its stamp and its commit.
#[derive(Debug)]
pub(crate) struct OpenWrite {
    clock: Arc<WriteClock>,
    timestamp: Timestamp,
}

impl OpenWrite {
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Drop for OpenWrite {
    fn drop(&mut self) {
        self.clock.finish(self.timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_never_decrease() {
        let clock = WriteClock::new();
        let a = clock.begin();
        let b = clock.begin();
        assert!(b.timestamp() >= a.timestamp());
        assert!(clock.watermark() <= a.timestamp());
    }

    #[test]
    fn watermark_holds_at_oldest_open_write() {
        let clock = WriteClock::new();
        let slow = clock.begin();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let fast = clock.begin();
        drop(fast);

        assert_eq!(clock.watermark(), slow.timestamp());

        drop(slow);
        assert!(clock.watermark() >= now_millis() - 1000);
    }

    #[test]
    fn later_writes_are_stamped_at_or_after_the_watermark() {
        let clock = WriteClock::new();
        let checkpoint = clock.watermark();
        let write = clock.begin();
        assert!(write.timestamp() >= checkpoint);
    }

    #[test]
    fn shared_stamps_close_independently() {
        let clock = WriteClock::new();
        let a = clock.begin();
        let b = clock.begin();

        drop(b);
        assert!(clock.watermark() <= a.timestamp());
        drop(a);
        assert!(clock.stamps().open.is_empty());
    }
}
