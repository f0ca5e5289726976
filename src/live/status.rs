//! # Session Status Notifications
//!
//! The live session's only externally observable state is its
//! [`SessionStatus`]. Interested parties subscribe to a [`StatusHub`] and get
//! called synchronously on every emission. Each observer keeps receiving
//! updates until it unsubscribes.
//!
//! ## Emission Semantics:
//! Every `emit` reaches every observer, even when the status didn't change.
//! `disconnect()` relies on this: each call re-emits `disconnected` as a
//! confirmation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Lifecycle state of a live session.
///
/// ## Transitions:
/// `disconnected → connecting → connected ⇄ speaking`, and any state → `disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Speaking,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Speaking => "speaking",
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Disconnected
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer callback.
pub type StatusCallback = Arc<dyn Fn(SessionStatus) + Send + Sync>;

/// Token returned by [`StatusHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct HubInner {
    current: SessionStatus,
    next_id: u64,
    observers: Vec<(SubscriptionId, StatusCallback)>,
}

/// Fan-out of status changes to any number of observers.
pub struct StatusHub {
    inner: Mutex<HubInner>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner {
                current: SessionStatus::Disconnected,
                next_id: 1,
                observers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(SessionStatus) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.observers.push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(existing, _)| *existing != id);
        inner.observers.len() != before
    }

    pub fn current(&self) -> SessionStatus {
        self.lock().current
    }

    /// Record `status` and notify every observer.
    ///
    /// Observers run after the internal lock is released, so they may call
    /// back into the hub (or the session) freely.
    pub fn emit(&self, status: SessionStatus) {
        let observers: Vec<StatusCallback> = {
            let mut inner = self.lock();
            inner.current = status;
            inner.observers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        debug!(status = %status, observers = observers.len(), "Session status");
        for observer in observers {
            observer(status);
        }
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}
