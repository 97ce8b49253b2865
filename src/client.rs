use crate::{error, Acl, CreateMode, Stat, WatchedEvent};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::future::BoxFuture;

/// Reply to a `create` request: the path the node was actually created at.
pub type CreateReply = Result<Result<String, error::Create>, failure::Error>;

/// Reply to a `delete` request.
pub type DeleteReply = Result<Result<(), error::Delete>, failure::Error>;

/// Reply to a `get_children` request: the child names (in server order) and the parent's `Stat`.
pub type ChildrenReply = Result<Result<(Vec<String>, Stat), error::GetChildren>, failure::Error>;

/// The operations this crate needs from a coordination-service session.
///
/// Every method *submits* its request before returning; the returned future only waits for the
/// reply. Requests issued one after another from the same task therefore reach the service in
/// that order, which is what lets a watch registered by `get_children` observe a `create` issued
/// right after it.
///
/// The outer `Result` reports a broken session handle, the inner one the service's verdict.
pub trait Coordinator: Send + Sync + 'static {
    /// Create a node at `path`.
    fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: &'static [Acl],
        mode: CreateMode,
    ) -> BoxFuture<'static, CreateReply>;

    /// Delete the node at `path`. A `version` of `None` deletes whatever version is current.
    fn delete(&self, path: &str, version: Option<i32>) -> BoxFuture<'static, DeleteReply>;

    /// Read the children of `path`, and if `watch` is set, arm a one-shot child watch as part of
    /// the same request.
    fn get_children(&self, path: &str, watch: bool) -> BoxFuture<'static, ChildrenReply>;

    /// End the session. Ephemeral nodes it owns are removed and its watches are released.
    fn close(&self) -> BoxFuture<'static, Result<(), failure::Error>>;

    /// The identifier the service assigned to this session.
    fn session_id(&self) -> i64;
}

/// Produces brand-new sessions, each with its own stream of watch events.
///
/// Used once at start-up, and again whenever a session expires and the watcher is configured to
/// re-initialize.
#[async_trait]
pub trait Connector<C: Coordinator>: Send + Sync + 'static {
    /// Establish a session and return it with the receiving end of its event stream.
    async fn connect(&self) -> Result<(C, mpsc::UnboundedReceiver<WatchedEvent>), failure::Error>;
}
