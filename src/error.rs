use crate::ZkError;

/// Errors that may cause a create request to fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum Create {
    /// A node with the given `path` already exists.
    #[fail(display = "target node already exists")]
    NodeExists,

    /// The parent node of the given `path` does not exist.
    #[fail(display = "parent node of target does not exist")]
    NoNode,

    /// The parent node of the given `path` is ephemeral, and cannot have children.
    #[fail(display = "parent node is ephemeral, and cannot have children")]
    NoChildrenForEphemerals,

    /// The given ACL is invalid.
    #[fail(display = "the given ACL is invalid")]
    InvalidAcl,
}

/// Errors that may cause a delete request to fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum Delete {
    /// No node exists with the given `path`.
    #[fail(display = "target node does not exist")]
    NoNode,

    /// The target node has a different version than was specified by the call to delete.
    #[fail(
        display = "target node has different version than expected ({})",
        expected
    )]
    BadVersion {
        /// The expected node version.
        expected: i32,
    },

    /// The target node has child nodes, and therefore cannot be deleted.
    #[fail(display = "target node has children, and cannot be deleted")]
    NotEmpty,
}

/// Errors that may cause a `get_children` request (and thus a refresh) to fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum GetChildren {
    /// No node exists with the given `path`. Retrying will not help.
    #[fail(display = "target node does not exist")]
    NoNode,

    /// The node's ACL does not allow listing its children.
    #[fail(display = "insufficient authentication to list children")]
    NoAuth,

    /// The connection to the ensemble was lost while the request was outstanding. The request
    /// may be retried once the session has reconnected.
    #[fail(display = "connection lost before the request completed")]
    ConnectionLoss,

    /// The session the request was issued on has expired. A new session is required.
    #[fail(display = "session expired")]
    SessionExpired,

    /// The server failed the request for another reason.
    #[fail(display = "server error: {}", _0)]
    Internal(ZkError),
}

impl GetChildren {
    /// The numeric ZooKeeper status code for this failure. Success is `0`.
    pub fn code(&self) -> i32 {
        match *self {
            GetChildren::NoNode => ZkError::NoNode as i32,
            GetChildren::NoAuth => ZkError::NoAuth as i32,
            GetChildren::ConnectionLoss => ZkError::ConnectionLoss as i32,
            GetChildren::SessionExpired => ZkError::SessionExpired as i32,
            GetChildren::Internal(e) => e as i32,
        }
    }

    /// Whether the same request may succeed once the session has recovered.
    pub fn is_transient(&self) -> bool {
        match *self {
            GetChildren::ConnectionLoss => true,
            GetChildren::Internal(e) => e == ZkError::OperationTimeout,
            GetChildren::NoNode | GetChildren::NoAuth | GetChildren::SessionExpired => false,
        }
    }
}

/// Errors that may occur while waiting for a session to become usable.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Fail)]
pub enum Connect {
    /// The session did not reach the connected state in time.
    #[fail(display = "timed out waiting for the session to connect")]
    Timeout,

    /// The ensemble declared the session invalid before it ever connected.
    #[fail(display = "session expired before it connected")]
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_children_codes_match_server_codes() {
        assert_eq!(GetChildren::NoNode.code(), -101);
        assert_eq!(GetChildren::ConnectionLoss.code(), -4);
        assert_eq!(GetChildren::SessionExpired.code(), -112);
        assert_eq!(GetChildren::Internal(ZkError::MarshallingError).code(), -5);
    }

    #[test]
    fn only_session_hiccups_are_transient() {
        assert!(GetChildren::ConnectionLoss.is_transient());
        assert!(GetChildren::Internal(ZkError::OperationTimeout).is_transient());
        assert!(!GetChildren::NoNode.is_transient());
        assert!(!GetChildren::SessionExpired.is_transient());
    }
}
