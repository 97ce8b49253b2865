//! An embedded coordination service with ZooKeeper's watch semantics.
//!
//! [`Ensemble`] keeps a znode tree in memory and hands out [`MemorySession`]s that implement
//! [`Coordinator`]. Child watches are one-shot and are registered under the same lock as the
//! read that arms them, ephemeral nodes disappear with their session, and each session receives
//! its events in the order they were generated. The test hooks [`Ensemble::disconnect`],
//! [`Ensemble::reconnect`] and [`Ensemble::expire`] drive a session through the states a real
//! ensemble would put it in.

use crate::client::{ChildrenReply, Connector, Coordinator, CreateReply, DeleteReply};
use crate::{error, Acl, CreateMode, KeeperState, Stat, WatchedEvent, WatchedEventType, ZkError};
use async_trait::async_trait;
use failure::format_err;
use futures::channel::mpsc;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use slog::{debug, info, o, trace};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// An in-process ensemble. Cloning yields another handle to the same tree.
#[derive(Clone)]
pub struct Ensemble {
    tree: Arc<Mutex<Tree>>,
    logger: slog::Logger,
}

/// One client session on an [`Ensemble`].
pub struct MemorySession {
    id: i64,
    ensemble: Ensemble,
}

struct Znode {
    data: Vec<u8>,
    acl: Vec<Acl>,
    stat: Stat,
}

#[derive(Debug, PartialEq)]
enum SlotState {
    Connected,
    /// Events generated while disconnected are held back until reconnect.
    Disconnected(Vec<WatchedEvent>),
}

struct Slot {
    events: mpsc::UnboundedSender<WatchedEvent>,
    state: SlotState,
}

struct Tree {
    nodes: BTreeMap<String, Znode>,
    /// Live sessions only; an ended session is gone and refused as expired.
    sessions: HashMap<i64, Slot>,
    /// path -> sessions holding a child watch on it
    child_watches: HashMap<String, HashSet<i64>>,
    next_session: i64,
    zxid: i64,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn valid_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/') && !path.ends_with('/') && !path[1..].split('/').any(str::is_empty)
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        _ if path == "/" => None,
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Znode {
                data: Vec::new(),
                acl: Acl::open_unsafe().to_vec(),
                stat: Stat::default(),
            },
        );
        Tree {
            nodes,
            sessions: HashMap::new(),
            child_watches: HashMap::new(),
            next_session: 0x1000,
            zxid: 0,
        }
    }

    /// The status a request from `session` fails with, if it cannot be served right now.
    fn refuse(&self, session: i64) -> Option<ZkError> {
        match self.sessions.get(&session).map(|s| &s.state) {
            Some(SlotState::Connected) => None,
            Some(SlotState::Disconnected(_)) => Some(ZkError::ConnectionLoss),
            None => Some(ZkError::SessionExpired),
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| &p[prefix.len()..])
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn deliver(&mut self, session: i64, event: WatchedEvent) {
        if let Some(slot) = self.sessions.get_mut(&session) {
            match slot.state {
                SlotState::Connected => {
                    let _ = slot.events.unbounded_send(event);
                }
                SlotState::Disconnected(ref mut held) => held.push(event),
            }
        }
    }

    /// Fire (and thereby consume) every child watch on `path`.
    fn trigger_child_watches(&mut self, path: &str, event_type: WatchedEventType) {
        if let Some(watchers) = self.child_watches.remove(path) {
            for session in watchers {
                self.deliver(session, WatchedEvent::node(event_type, path));
            }
        }
    }

    fn create(
        &mut self,
        session: i64,
        path: &str,
        data: Vec<u8>,
        acl: &[Acl],
        mode: CreateMode,
    ) -> Result<Result<String, error::Create>, ZkError> {
        if let Some(e) = self.refuse(session) {
            return Err(e);
        }
        if !valid_path(path) || path == "/" {
            return Err(ZkError::BadArguments);
        }
        if acl.is_empty() {
            return Ok(Err(error::Create::InvalidAcl));
        }
        let parent_path = match parent_of(path) {
            Some(p) => p.to_string(),
            None => return Err(ZkError::BadArguments),
        };
        let parent = match self.nodes.get(&parent_path) {
            Some(parent) => parent,
            None => return Ok(Err(error::Create::NoNode)),
        };
        if parent.stat.ephemeral_owner != 0 {
            return Ok(Err(error::Create::NoChildrenForEphemerals));
        }
        let path = if mode.is_sequential() {
            format!("{}{:010}", path, parent.stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&path) {
            return Ok(Err(error::Create::NodeExists));
        }

        self.zxid += 1;
        let zxid = self.zxid;
        let now = now_millis();
        self.nodes.insert(
            path.clone(),
            Znode {
                stat: Stat {
                    czxid: zxid,
                    mzxid: zxid,
                    ctime: now,
                    mtime: now,
                    ephemeral_owner: if mode.is_ephemeral() { session } else { 0 },
                    data_length: data.len() as i32,
                    pzxid: zxid,
                    ..Stat::default()
                },
                data,
                acl: acl.to_vec(),
            },
        );
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.stat.cversion += 1;
            parent.stat.num_children += 1;
            parent.stat.pzxid = zxid;
        }
        self.trigger_child_watches(&parent_path, WatchedEventType::NodeChildrenChanged);
        Ok(Ok(path))
    }

    fn delete(
        &mut self,
        session: i64,
        path: &str,
        version: Option<i32>,
    ) -> Result<Result<(), error::Delete>, ZkError> {
        if let Some(e) = self.refuse(session) {
            return Err(e);
        }
        self.remove(path, version)
    }

    fn remove(&mut self, path: &str, version: Option<i32>) -> Result<Result<(), error::Delete>, ZkError> {
        if path == "/" || !valid_path(path) {
            return Err(ZkError::BadArguments);
        }
        let node = match self.nodes.get(path) {
            Some(node) => node,
            None => return Ok(Err(error::Delete::NoNode)),
        };
        if let Some(expected) = version {
            if node.stat.version != expected {
                return Ok(Err(error::Delete::BadVersion { expected }));
            }
        }
        if node.stat.num_children > 0 {
            return Ok(Err(error::Delete::NotEmpty));
        }

        self.nodes.remove(path);
        self.zxid += 1;
        let zxid = self.zxid;
        let parent_path = parent_of(path).unwrap_or("/").to_string();
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.stat.cversion += 1;
            parent.stat.num_children -= 1;
            parent.stat.pzxid = zxid;
        }
        self.trigger_child_watches(path, WatchedEventType::NodeDeleted);
        self.trigger_child_watches(&parent_path, WatchedEventType::NodeChildrenChanged);
        Ok(Ok(()))
    }

    fn get_children(
        &mut self,
        session: i64,
        path: &str,
        watch: bool,
    ) -> Result<(Vec<String>, Stat), ZkError> {
        if let Some(e) = self.refuse(session) {
            return Err(e);
        }
        if !valid_path(path) {
            return Err(ZkError::NoNode);
        }
        let stat = match self.nodes.get(path) {
            Some(node) => node.stat,
            None => return Err(ZkError::NoNode),
        };
        // registered under the same lock as the read: nothing can slip in between
        if watch {
            self.child_watches
                .entry(path.to_string())
                .or_default()
                .insert(session);
        }
        Ok((self.children_of(path), stat))
    }

    /// Take a live session out of the tree, dropping its watches and ephemeral nodes. Returns
    /// its slot so the caller can say goodbye on the event stream.
    fn end_session(&mut self, session: i64) -> Option<Slot> {
        let slot = self.sessions.remove(&session)?;

        for watchers in self.child_watches.values_mut() {
            watchers.remove(&session);
        }
        self.child_watches.retain(|_, w| !w.is_empty());

        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.stat.ephemeral_owner == session)
            .map(|(p, _)| p.clone())
            .collect();
        for path in ephemerals {
            // ephemeral nodes cannot have children, so this always succeeds
            let _ = self.remove(&path, None);
        }
        Some(slot)
    }
}

impl Ensemble {
    /// An empty ensemble holding only the root node.
    pub fn new(logger: slog::Logger) -> Self {
        Ensemble {
            tree: Arc::new(Mutex::new(Tree::new())),
            logger: logger.new(o!("ensemble" => "memory")),
        }
    }

    /// Open a new session. Its event stream starts with `SyncConnected`.
    pub fn connect(&self) -> (MemorySession, mpsc::UnboundedReceiver<WatchedEvent>) {
        let (tx, rx) = mpsc::unbounded();
        let mut tree = self.tree.lock();
        tree.next_session += 1;
        let id = tree.next_session;
        let _ = tx.unbounded_send(WatchedEvent::session(KeeperState::SyncConnected));
        tree.sessions.insert(
            id,
            Slot {
                events: tx,
                state: SlotState::Connected,
            },
        );
        debug!(self.logger, "session opened"; "session_id" => id);
        (
            MemorySession {
                id,
                ensemble: self.clone(),
            },
            rx,
        )
    }

    /// Simulate a lost connection: the session sees `Disconnected` and its requests fail with
    /// `ConnectionLoss` until [`Ensemble::reconnect`]. Its watches and ephemeral nodes survive.
    pub fn disconnect(&self, session_id: i64) {
        let mut tree = self.tree.lock();
        if let Some(slot) = tree.sessions.get_mut(&session_id) {
            if slot.state == SlotState::Connected {
                let _ = slot
                    .events
                    .unbounded_send(WatchedEvent::session(KeeperState::Disconnected));
                slot.state = SlotState::Disconnected(Vec::new());
                info!(self.logger, "session disconnected"; "session_id" => session_id);
            }
        }
    }

    /// Bring a disconnected session back. It sees `SyncConnected`, then every event it missed.
    pub fn reconnect(&self, session_id: i64) {
        let mut tree = self.tree.lock();
        if let Some(slot) = tree.sessions.get_mut(&session_id) {
            if let SlotState::Disconnected(ref mut held) = slot.state {
                let held = std::mem::take(held);
                let _ = slot
                    .events
                    .unbounded_send(WatchedEvent::session(KeeperState::SyncConnected));
                for event in held {
                    let _ = slot.events.unbounded_send(event);
                }
                slot.state = SlotState::Connected;
                info!(self.logger, "session reconnected"; "session_id" => session_id);
            }
        }
    }

    /// Expire a session as the ensemble would after its timeout: ephemeral nodes go away, watches
    /// are dropped, the session sees `Expired` and its event stream ends.
    pub fn expire(&self, session_id: i64) {
        let mut tree = self.tree.lock();
        if let Some(slot) = tree.end_session(session_id) {
            let _ = slot
                .events
                .unbounded_send(WatchedEvent::session(KeeperState::Expired));
            slot.events.close_channel();
            info!(self.logger, "session expired"; "session_id" => session_id);
        }
    }

    /// True if a node exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.tree.lock().nodes.contains_key(path)
    }

    /// The data stored at `path`, if the node exists.
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.lock().nodes.get(path).map(|n| n.data.clone())
    }

    /// The ACL of the node at `path`, if it exists.
    pub fn acl(&self, path: &str) -> Option<Vec<Acl>> {
        self.tree.lock().nodes.get(path).map(|n| n.acl.clone())
    }

    /// Number of sessions that have been opened and not yet closed or expired.
    pub fn session_count(&self) -> usize {
        self.tree.lock().sessions.len()
    }

    /// Number of child watches currently armed on `path`, across all sessions.
    pub fn child_watch_count(&self, path: &str) -> usize {
        self.tree
            .lock()
            .child_watches
            .get(path)
            .map_or(0, HashSet::len)
    }
}

impl Coordinator for MemorySession {
    fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: &'static [Acl],
        mode: CreateMode,
    ) -> BoxFuture<'static, CreateReply> {
        trace!(self.ensemble.logger, "create"; "session_id" => self.id, "path" => path, "mode" => ?mode);
        let res = self.ensemble.tree.lock().create(self.id, path, data, acl, mode);
        future::ready(res.map_err(|e| format_err!("create call failed: {}", e))).boxed()
    }

    fn delete(&self, path: &str, version: Option<i32>) -> BoxFuture<'static, DeleteReply> {
        trace!(self.ensemble.logger, "delete"; "session_id" => self.id, "path" => path);
        let res = self.ensemble.tree.lock().delete(self.id, path, version);
        future::ready(res.map_err(|e| format_err!("delete call failed: {}", e))).boxed()
    }

    fn get_children(&self, path: &str, watch: bool) -> BoxFuture<'static, ChildrenReply> {
        trace!(self.ensemble.logger, "get_children"; "session_id" => self.id, "path" => path, "watch" => watch);
        let res = self.ensemble.tree.lock().get_children(self.id, path, watch);
        let res = match res {
            Ok(children) => Ok(children),
            Err(ZkError::NoNode) => Err(error::GetChildren::NoNode),
            Err(ZkError::NoAuth) => Err(error::GetChildren::NoAuth),
            Err(ZkError::ConnectionLoss) => Err(error::GetChildren::ConnectionLoss),
            Err(ZkError::SessionExpired) => Err(error::GetChildren::SessionExpired),
            Err(e) => Err(error::GetChildren::Internal(e)),
        };
        future::ready(Ok(res)).boxed()
    }

    fn close(&self) -> BoxFuture<'static, Result<(), failure::Error>> {
        let mut tree = self.ensemble.tree.lock();
        if let Some(slot) = tree.end_session(self.id) {
            slot.events.close_channel();
            debug!(self.ensemble.logger, "session closed"; "session_id" => self.id);
        }
        future::ready(Ok(())).boxed()
    }

    fn session_id(&self) -> i64 {
        self.id
    }
}

#[async_trait]
impl Connector<MemorySession> for Ensemble {
    async fn connect(
        &self,
    ) -> Result<(MemorySession, mpsc::UnboundedReceiver<WatchedEvent>), failure::Error> {
        Ok(Ensemble::connect(self))
    }
}
