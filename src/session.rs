use crate::client::{Coordinator, CreateReply, DeleteReply};
use crate::gate::SessionGate;
use crate::{Acl, CreateMode, KeeperState};
use failure::format_err;
use parking_lot::{Mutex, RwLock};
use slog::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Connection state of a session, as last reported by the ensemble.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No connection signal has been seen yet.
    Connecting,
    /// Connected to a server of the ensemble.
    Connected,
    /// Connected to a server that only serves reads.
    ConnectedReadOnly,
    /// The connection was lost; the session may still come back.
    Disconnected,
    /// Authentication failed; the session will not recover.
    AuthFailed,
    /// The ensemble expired the session. Terminal.
    Expired,
    /// The session was closed by us. Terminal.
    Closed,
}

impl From<KeeperState> for SessionState {
    fn from(state: KeeperState) -> Self {
        match state {
            KeeperState::SyncConnected | KeeperState::SaslAuthenticated => SessionState::Connected,
            KeeperState::ConnectedReadOnly => SessionState::ConnectedReadOnly,
            KeeperState::Disconnected => SessionState::Disconnected,
            KeeperState::AuthFailed => SessionState::AuthFailed,
            KeeperState::Expired => SessionState::Expired,
        }
    }
}

/// The state shared between the caller and the callback task for one logical session.
///
/// Holds the client handle (swapped for a fresh one if the session is re-initialized after
/// expiry), the tracked connection state and the start-up gate. Once [`Session::is_closing`]
/// is set no new requests are issued through it.
pub struct Session<C> {
    client: RwLock<Arc<C>>,
    state: Mutex<SessionState>,
    gate: SessionGate,
    closing: AtomicBool,
    logger: slog::Logger,
}

impl<C: Coordinator> Session<C> {
    pub(crate) fn new(client: C, gate: SessionGate, logger: slog::Logger) -> Self {
        Session {
            client: RwLock::new(Arc::new(client)),
            state: Mutex::new(SessionState::Connecting),
            gate,
            closing: AtomicBool::new(false),
            logger,
        }
    }

    /// The identifier of the current underlying session.
    pub fn id(&self) -> i64 {
        self.client.read().session_id()
    }

    /// The last state reported by the ensemble.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// The start-up gate of this session.
    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    /// True once shutdown has begun.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Create a node with the open ACL.
    pub async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CreateReply {
        let reply = self
            .client()?
            .create(path, data.to_vec(), Acl::open_unsafe(), mode);
        reply.await
    }

    /// Delete a node. A `version` of `None` matches any version.
    pub async fn delete(&self, path: &str, version: Option<i32>) -> DeleteReply {
        let reply = self.client()?.delete(path, version);
        reply.await
    }

    /// The client to issue a request on, unless shutdown has begun.
    pub(crate) fn client(&self) -> Result<Arc<C>, failure::Error> {
        if self.is_closing() {
            return Err(format_err!("session is closing; not issuing new requests"));
        }
        Ok(Arc::clone(&self.client.read()))
    }

    pub(crate) fn record_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current == SessionState::Closed || *current == state {
            return;
        }
        info!(self.logger, "session state changed";
              "from" => ?*current, "to" => ?state, "session_id" => self.id());
        *current = state;
    }

    /// Swap in a brand-new session after the previous one expired.
    pub(crate) fn replace(&self, client: C) {
        let mut current = self.client.write();
        debug!(self.logger, "replacing session";
               "old" => current.session_id(), "new" => client.session_id());
        *current = Arc::new(client);
        drop(current);
        *self.state.lock() = SessionState::Connected;
    }

    /// Stop issuing requests and hand back the client to close. Only the first call gets it.
    pub(crate) fn begin_close(&self) -> Option<Arc<C>> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Arc::clone(&self.client.read()))
    }

    pub(crate) fn mark_closed(&self) {
        *self.state.lock() = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Ensemble;
    use slog::o;

    fn session() -> (Ensemble, Session<crate::memory::MemorySession>) {
        let zk = Ensemble::new(slog::Logger::root(slog::Discard, o!()));
        let (client, _events) = zk.connect();
        let log = slog::Logger::root(slog::Discard, o!());
        (zk, Session::new(client, SessionGate::new(), log))
    }

    #[test]
    fn keeper_states_map_onto_session_states() {
        assert_eq!(
            SessionState::from(KeeperState::SyncConnected),
            SessionState::Connected
        );
        assert_eq!(
            SessionState::from(KeeperState::Expired),
            SessionState::Expired
        );
    }

    #[tokio::test]
    async fn refuses_requests_once_closing() {
        let (zk, session) = session();
        session
            .create("/a", b"", CreateMode::Persistent)
            .await
            .unwrap()
            .unwrap();
        assert!(zk.exists("/a"));

        assert!(session.begin_close().is_some());
        assert!(session.begin_close().is_none());
        assert!(session
            .create("/b", b"", CreateMode::Persistent)
            .await
            .is_err());
        assert!(!zk.exists("/b"));
    }

    #[test]
    fn closed_is_sticky() {
        let (_zk, session) = session();
        assert_eq!(session.state(), SessionState::Connecting);
        session.record_state(SessionState::Connected);
        session.mark_closed();
        session.record_state(SessionState::Connected);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn replace_swaps_the_session_id() {
        let (zk, session) = session();
        let old = session.id();
        let (fresh, _events) = zk.connect();
        session.replace(fresh);
        assert_ne!(session.id(), old);
        assert_eq!(session.state(), SessionState::Connected);
    }
}
