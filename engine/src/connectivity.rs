//! Connectivity state machine.
//!
//! Pure transition logic; the client owns the current state and acts on the
//! returned [`Transition`].
//!
//! ```text
//!   ONLINE --lost--> OFFLINE --restored--> SYNCING --flush done--> ONLINE
//!      ^                ^                     |
//!      |                +-------lost----------+
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connectivity state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectivityState {
    Online,
    /// Initial state until the host reports connectivity
    #[default]
    Offline,
    Syncing,
}

impl ConnectivityState {
    /// Online mutations bypass the queue; this includes `Syncing`.
    pub fn is_online(&self) -> bool {
        !matches!(self, ConnectivityState::Offline)
    }

    /// Apply an event and report the new state.
    pub fn on(self, event: ConnectivityEvent) -> Transition {
        use ConnectivityEvent::*;
        use ConnectivityState::*;

        let (to, flush) = match (self, event) {
            (_, ConnectionLost) => (Offline, false),
            (Offline, ConnectionRestored) => (Syncing, true),
            (Syncing, FlushCompleted) => (Online, false),
            (state, _) => (state, false),
        };
        Transition {
            from: self,
            to,
            flush,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectivityState::Online => "ONLINE",
            ConnectivityState::Offline => "OFFLINE",
            ConnectivityState::Syncing => "SYNCING",
        })
    }
}

/// Signals that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectivityEvent {
    ConnectionLost,
    ConnectionRestored,
    /// The reconnection flush finished, successfully or not
    FlushCompleted,
}

/// Outcome of applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectivityState,
    pub to: ConnectivityState,
    /// Whether the caller must start exactly one flush
    pub flush: bool,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}
