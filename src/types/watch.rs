use failure::format_err;
use std::convert::TryFrom;

/// Represents a change on the ZooKeeper that a watcher is able to respond to.
///
/// The `WatchedEvent` includes exactly what happened, the current state of the ZooKeeper, and the
/// path of the znode that was involved in the event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    /// The trigger that caused the watch to hit.
    pub event_type: WatchedEventType,
    /// The current state of ZooKeeper (and the client's connection to it).
    pub keeper_state: KeeperState,
    /// The path of the znode that was involved.
    ///
    /// This is `None` for session-related triggers.
    pub path: Option<String>,
}

impl WatchedEvent {
    /// A session-level notification carrying no path.
    pub fn session(keeper_state: KeeperState) -> Self {
        WatchedEvent {
            event_type: WatchedEventType::None,
            keeper_state,
            path: None,
        }
    }

    /// A node-level notification for `path`, delivered while connected.
    pub fn node<P: Into<String>>(event_type: WatchedEventType, path: P) -> Self {
        WatchedEvent {
            event_type,
            keeper_state: KeeperState::SyncConnected,
            path: Some(path.into()),
        }
    }
}

/// Enumeration of states the client may be at a Watcher Event. It represents the state of the
/// server at the time the event was generated.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeeperState {
    /// The client is in the disconnected state - it is not connected to any server in the ensemble.
    Disconnected = 0,
    /// The client is in the connected state - it is connected to a server in the ensemble (one of
    /// the servers specified in the host connection parameter during ZooKeeper client creation).
    SyncConnected = 3,
    /// Authentication has failed -- connection requires a new `ZooKeeper` instance.
    AuthFailed = 4,
    /// The client is connected to a read-only server, that is the server which is not currently
    /// connected to the majority.
    ConnectedReadOnly = 5,
    /// Used to notify clients that they are SASL-authenticated.
    SaslAuthenticated = 6,
    /// The serving cluster has expired this session. The ZooKeeper client connection (the session)
    /// is no longer valid. You must create a new client connection if you wish to access the
    /// ensemble.
    Expired = -112,
}

impl TryFrom<i32> for KeeperState {
    type Error = failure::Error;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => KeeperState::Disconnected,
            3 => KeeperState::SyncConnected,
            4 => KeeperState::AuthFailed,
            5 => KeeperState::ConnectedReadOnly,
            6 => KeeperState::SaslAuthenticated,
            -112 => KeeperState::Expired,
            _ => return Err(format_err!("unknown keeper state {:x}", code)),
        })
    }
}

/// Enumeration of types of events that may occur on the znode.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchedEventType {
    /// Nothing known has occurred on the znode. This value is issued as part of a `WatchedEvent`
    /// when the `KeeperState` changes.
    None = -1,
    /// Issued when a znode at a given path is created.
    NodeCreated = 1,
    /// Issued when a znode at a given path is deleted.
    NodeDeleted = 2,
    /// Issued when the data of a watched znode are altered.
    NodeDataChanged = 3,
    /// Issued when the children of a watched znode are created or deleted. This event is not issued
    /// when the data within children is altered.
    NodeChildrenChanged = 4,
    /// Issued when the client removes a data watcher.
    DataWatchRemoved = 5,
    /// Issued when the client removes a child watcher.
    ChildWatchRemoved = 6,
}

impl TryFrom<i32> for WatchedEventType {
    type Error = failure::Error;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            -1 => WatchedEventType::None,
            1 => WatchedEventType::NodeCreated,
            2 => WatchedEventType::NodeDeleted,
            3 => WatchedEventType::NodeDataChanged,
            4 => WatchedEventType::NodeChildrenChanged,
            5 => WatchedEventType::DataWatchRemoved,
            6 => WatchedEventType::ChildWatchRemoved,
            _ => return Err(format_err!("unknown event type {:x}", code)),
        })
    }
}
