use std::fmt;

/// The status code in a ZooKeeper reply header.
///
/// Codes between `SystemError` and `APIError` mean the server or the connection failed; codes
/// below `APIError` are the server's verdict on a well-formed request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum ZkError {
    /// Success.
    Ok = 0,

    /// Lower bound of the system range. Never sent by servers.
    SystemError = -1,
    /// The server found its own state inconsistent.
    RuntimeInconsistency = -2,
    /// The server found replicated data inconsistent.
    DataInconsistency = -3,
    /// The connection to the server broke; the session may still be alive.
    ConnectionLoss = -4,
    /// A request or reply could not be (de)serialized.
    MarshallingError = -5,
    /// The server does not implement the operation.
    Unimplemented = -6,
    /// The operation did not complete in time.
    OperationTimeout = -7,
    /// The request carried invalid arguments.
    BadArguments = -8,

    /// Lower bound of the API range. Never sent by servers.
    APIError = -100,
    /// The node does not exist.
    NoNode = -101,
    /// The session lacks permission for the operation.
    NoAuth = -102,
    /// The node's version did not match the expected one.
    BadVersion = -103,
    /// Ephemeral nodes cannot have children.
    NoChildrenForEphemerals = -108,
    /// The node already exists.
    NodeExists = -110,
    /// The node still has children.
    NotEmpty = -111,
    /// The server expired the session.
    SessionExpired = -112,
    /// The callback passed with the request was invalid.
    InvalidCallback = -113,
    /// The ACL passed with the request was invalid.
    InvalidACL = -114,
    /// Authentication failed.
    AuthFailed = -115,
    /// The session moved to another server.
    SessionMoved = -118,
    /// A write was sent to a read-only server.
    NotReadOnly = -119,
    /// Ephemeral nodes cannot be created by local sessions.
    EphemeralOnLocalSession = -120,
    /// There was no such watch to remove.
    NoWatcher = -121,
}

impl ZkError {
    const KNOWN: [ZkError; 24] = [
        ZkError::Ok,
        ZkError::SystemError,
        ZkError::RuntimeInconsistency,
        ZkError::DataInconsistency,
        ZkError::ConnectionLoss,
        ZkError::MarshallingError,
        ZkError::Unimplemented,
        ZkError::OperationTimeout,
        ZkError::BadArguments,
        ZkError::APIError,
        ZkError::NoNode,
        ZkError::NoAuth,
        ZkError::BadVersion,
        ZkError::NoChildrenForEphemerals,
        ZkError::NodeExists,
        ZkError::NotEmpty,
        ZkError::SessionExpired,
        ZkError::InvalidCallback,
        ZkError::InvalidACL,
        ZkError::AuthFailed,
        ZkError::SessionMoved,
        ZkError::NotReadOnly,
        ZkError::EphemeralOnLocalSession,
        ZkError::NoWatcher,
    ];

    /// True for codes in the system range: the server or the link failed, not the request.
    pub fn is_system_error(self) -> bool {
        let code = self as i32;
        code < 0 && code > ZkError::APIError as i32
    }
}

impl From<i32> for ZkError {
    fn from(code: i32) -> Self {
        ZkError::KNOWN
            .iter()
            .copied()
            .find(|e| *e as i32 == code)
            // codes added by newer servers are still failures we cannot act on
            .unwrap_or(ZkError::SystemError)
    }
}

impl fmt::Display for ZkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}
