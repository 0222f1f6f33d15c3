//! Connection-lifecycle state machine and observer list (spec §3, §4.4).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct StatusChangeEvent {
    pub from_status: ConnectionStatus,
    pub to_status: ConnectionStatus,
    pub error: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

type Observer = Arc<dyn Fn(&StatusChangeEvent) + Send + Sync>;

/// A single status value plus an ordered list of observer callbacks.
///
/// Observers are invoked synchronously, in registration order, *before*
/// `set` returns, from a snapshot taken before dispatch so an observer that
/// mutates the list (e.g. by calling `unsubscribe`) cannot corrupt an
/// in-flight iteration. A panicking observer is caught so it cannot abort
/// the transition for the remaining observers.
pub struct StatusManager {
    inner: Mutex<Inner>,
}

struct Inner {
    status: ConnectionStatus,
    observers: Vec<(u64, Observer)>,
    next_id: u64,
}

/// A handle returned by `subscribe`; drop it or call `unsubscribe` to stop
/// receiving events.
pub struct Subscription {
    id: u64,
}

impl StatusManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: ConnectionStatus::Disconnected,
                observers: Vec::new(),
                next_id: 0,
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status
    }

    pub fn subscribe(
        &self,
        observer: impl Fn(&StatusChangeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.observers.push((id, Arc::new(observer)));
        Subscription { id }
    }

    pub fn unsubscribe(&self, sub: Subscription) {
        let mut inner = self.inner.lock();
        inner.observers.retain(|(id, _)| *id != sub.id);
    }

    /// Attempt a transition. Rejects any transition out of `Destroyed`.
    pub fn set(
        &self,
        to: ConnectionStatus,
        error: Option<String>,
    ) -> Result<(), BackendError> {
        let (from, snapshot) = {
            let mut inner = self.inner.lock();
            if inner.status == ConnectionStatus::Destroyed {
                return Err(BackendError::ConnectionClosed);
            }
            let from = inner.status;
            inner.status = to;
            (from, inner.observers.clone())
        };

        let event = StatusChangeEvent {
            from_status: from,
            to_status: to,
            error,
            timestamp: now_epoch_secs(),
        };
        for (_, observer) in snapshot {
            let observer = observer.clone();
            let event = event.clone();
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer(&event)));
        }
        Ok(())
    }

    /// Destroy, unconditionally and idempotently, clearing all observers.
    pub fn destroy(&self) {
        let (from, snapshot) = {
            let mut inner = self.inner.lock();
            if inner.status == ConnectionStatus::Destroyed {
                return;
            }
            let from = inner.status;
            inner.status = ConnectionStatus::Destroyed;
            let snapshot = inner.observers.clone();
            (from, snapshot)
        };
        let event = StatusChangeEvent {
            from_status: from,
            to_status: ConnectionStatus::Destroyed,
            error: None,
            timestamp: now_epoch_secs(),
        };
        for (_, observer) in &snapshot {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer(&event)));
        }
        self.clear_listeners();
    }

    fn clear_listeners(&self) {
        self.inner.lock().observers.clear();
    }
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn destroyed_is_terminal() {
        let mgr = StatusManager::new();
        mgr.destroy();
        assert_eq!(mgr.status(), ConnectionStatus::Destroyed);
        assert!(matches!(
            mgr.set(ConnectionStatus::Connecting, None),
            Err(BackendError::ConnectionClosed)
        ));
        assert_eq!(mgr.status(), ConnectionStatus::Destroyed);
    }

    #[test]
    fn observers_receive_exactly_one_destroyed_event() {
        let mgr = StatusManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = mgr.subscribe(move |ev| {
            if ev.to_status == ConnectionStatus::Destroyed {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        mgr.set(ConnectionStatus::Connecting, None).unwrap();
        mgr.destroy();
        mgr.destroy(); // idempotent, must not fire a second event
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observers_see_transitions_in_program_order() {
        let mgr = StatusManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = mgr.subscribe(move |ev| s.lock().push(ev.to_status));
        mgr.set(ConnectionStatus::Connecting, None).unwrap();
        mgr.set(ConnectionStatus::Connected, None).unwrap();
        mgr.set(ConnectionStatus::Disconnected, Some("boom".into())).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected
            ]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mgr = StatusManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = mgr.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        mgr.set(ConnectionStatus::Connecting, None).unwrap();
        mgr.unsubscribe(sub);
        mgr.set(ConnectionStatus::Connected, None).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_observer_does_not_abort_transition() {
        let mgr = StatusManager::new();
        let _sub1 = mgr.subscribe(|_| panic!("boom"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub2 = mgr.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        mgr.set(ConnectionStatus::Connecting, None).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
