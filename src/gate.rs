use crate::{error, KeeperState, WatchedEvent, WatchedEventType};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GateState {
    Closed,
    Released,
    Expired,
}

/// A single-fire barrier that holds start-up back until the session is connected.
///
/// The gate opens the first time it observes the initial connection signal (`SyncConnected`, no
/// event type, no path) and never closes again. A session that later drops and comes back is not
/// reflected here; that is visible only through subsequent events.
#[derive(Clone, Debug)]
pub struct SessionGate {
    state: Arc<watch::Sender<GateState>>,
}

impl Default for SessionGate {
    fn default() -> Self {
        let (tx, _) = watch::channel(GateState::Closed);
        SessionGate {
            state: Arc::new(tx),
        }
    }
}

impl SessionGate {
    /// A closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a session event to the gate. Returns `true` if this event released it.
    ///
    /// Only the first connection signal has any effect. An `Expired` state seen while the gate
    /// is still closed fails every current and future waiter.
    pub fn observe(&self, event: &WatchedEvent) -> bool {
        let next = match (event.keeper_state, event.event_type, &event.path) {
            (KeeperState::SyncConnected, WatchedEventType::None, None) => GateState::Released,
            (KeeperState::Expired, _, _) => GateState::Expired,
            _ => return false,
        };
        let mut released = false;
        self.state.send_if_modified(|state| {
            if *state != GateState::Closed {
                return false;
            }
            *state = next;
            released = next == GateState::Released;
            true
        });
        released
    }

    /// True once the gate has been released.
    pub fn is_released(&self) -> bool {
        *self.state.borrow() == GateState::Released
    }

    /// Wait until the session has connected.
    ///
    /// Returns immediately if the gate was released earlier.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), error::Connect> {
        let mut rx = self.state.subscribe();
        let wait = async move {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    GateState::Released => return Ok(()),
                    GateState::Expired => return Err(error::Connect::Expired),
                    GateState::Closed => {}
                }
                if rx.changed().await.is_err() {
                    // the sender lives in `self`, so this only happens during teardown
                    return Err(error::Connect::Expired);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(error::Connect::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn releases_on_first_connect_signal_only() {
        let gate = SessionGate::new();
        let connected = WatchedEvent::session(KeeperState::SyncConnected);

        assert!(!gate.is_released());
        assert!(gate.observe(&connected));
        assert!(!gate.observe(&connected));
        assert!(gate.is_released());
        assert_eq!(gate.wait_connected(SHORT).await, Ok(()));
        assert_eq!(gate.wait_connected(SHORT).await, Ok(()));
    }

    #[tokio::test]
    async fn ignores_non_session_events() {
        let gate = SessionGate::new();
        assert!(!gate.observe(&WatchedEvent::node(
            WatchedEventType::NodeChildrenChanged,
            "/a"
        )));
        assert!(!gate.observe(&WatchedEvent {
            event_type: WatchedEventType::None,
            keeper_state: KeeperState::SyncConnected,
            path: Some("/a".to_string()),
        }));
        assert!(!gate.observe(&WatchedEvent::session(KeeperState::Disconnected)));
        assert_eq!(
            gate.wait_connected(SHORT).await,
            Err(error::Connect::Timeout)
        );
    }

    #[tokio::test]
    async fn later_expiry_does_not_reset() {
        let gate = SessionGate::new();
        gate.observe(&WatchedEvent::session(KeeperState::SyncConnected));
        gate.observe(&WatchedEvent::session(KeeperState::Expired));
        gate.observe(&WatchedEvent::session(KeeperState::Disconnected));
        assert_eq!(gate.wait_connected(SHORT).await, Ok(()));
    }

    #[tokio::test]
    async fn expiry_before_connect_fails_waiters() {
        let gate = SessionGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_connected(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        gate.observe(&WatchedEvent::session(KeeperState::Expired));
        assert_eq!(waiter.await.unwrap(), Err(error::Connect::Expired));
        assert!(!gate.observe(&WatchedEvent::session(KeeperState::SyncConnected)));
    }

    #[tokio::test]
    async fn waiter_is_released_by_later_event() {
        let gate = SessionGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_connected(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        gate.observe(&WatchedEvent::session(KeeperState::SyncConnected));
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }
}
