//! Explicit sync context shared by a device's components.
//!
//! Holds the device identity, the current connectivity state and the queue
//! counter. Components receive it by `Arc`; there is no process-wide state.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tally_engine::{ConnectivityEvent, ConnectivityState, DeviceId, Transition};
use tokio::sync::watch;

#[derive(Debug)]
pub struct SyncContext {
    device_id: DeviceId,
    state: watch::Sender<ConnectivityState>,
    queue_count: AtomicUsize,
    flushing: AtomicBool,
}

impl SyncContext {
    /// Create a context for a device, starting offline.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Offline);
        Self {
            device_id: device_id.into(),
            state,
            queue_count: AtomicUsize::new(0),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Watch connectivity changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Feed an event through the state machine.
    pub fn apply(&self, event: ConnectivityEvent) -> Transition {
        let mut transition = self.state().on(event);
        self.state.send_if_modified(|state| {
            transition = state.on(event);
            *state = transition.to;
            transition.changed()
        });
        if transition.changed() {
            tracing::info!(
                device_id = %self.device_id,
                from = %transition.from,
                to = %transition.to,
                "connectivity changed"
            );
        }
        transition
    }

    /// Number of operations waiting in the offline queue.
    pub fn queue_count(&self) -> usize {
        self.queue_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_queue_count(&self, count: usize) {
        self.queue_count.store(count, Ordering::Release);
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Claim the single flush slot; `None` if a flush is already running.
    pub(crate) fn try_begin_flush(&self) -> Option<FlushGuard<'_>> {
        self.flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushGuard { ctx: self })
    }
}

/// Releases the flush slot on drop, including on cancellation.
pub(crate) struct FlushGuard<'a> {
    ctx: &'a SyncContext,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.ctx.flushing.store(false, Ordering::Release);
    }
}
