//! This crate keeps a continuously refreshed view of the children of nodes stored in
//! [ZooKeeper](https://zookeeper.apache.org/), using one-shot child watches instead of polling.
//!
//! A ZooKeeper watch fires at most once. To keep observing a node, every notification has to be
//! answered with a new read that also registers a new watch. This crate does exactly that, on a
//! single callback task that also delivers the results of asynchronous reads, so event handling
//! and result handling never run concurrently.
//!
//! Note that any changes that happen between a watch firing and the watch being re-armed do
//! **not** produce notifications of their own. They are picked up by the re-arming read, so each
//! [`ChildUpdate`] is "the children as of now", never a delta. Two children added in quick
//! succession may well show up as a single update.
//!
//! # Sessions
//!
//! The watcher is generic over a [`Coordinator`], the handful of operations it needs from a
//! session. Two are provided:
//!
//!  - [`ZooKeeper`], a client for a real ensemble speaking the ZooKeeper binary protocol over TCP.
//!    It sends heartbeats, reconnects after a lost connection and re-installs armed child
//!    watches when it does.
//!  - [`memory::Ensemble`], an in-process ensemble with the same watch semantics, used for
//!    testing and for local runs. It can simulate disconnects and session expiry.
//!
//! When the ensemble expires a session the watcher by default opens a new one and re-arms the
//! watch of every path it knows about; see [`ExpiryPolicy`].
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), failure::Error> {
//! use futures::StreamExt;
//! use tokio_zookeeper_children::*;
//!
//! let log = slog::Logger::root(slog::Discard, slog::o!());
//! let zk = memory::Ensemble::new(log.clone());
//! let (watcher, mut updates): (ChildWatcher<memory::MemorySession>, _) =
//!     WatcherBuilder::default().start(zk).await?;
//!
//! watcher.create("/root", b"", CreateMode::Persistent).await??;
//! watcher.refresh_async("/root", "first read", LoggingSink::new(log))?;
//! watcher.create("/root/c1", b"", CreateMode::Ephemeral).await??;
//!
//! let update = updates.next().await.expect("watcher stopped");
//! assert_eq!(update.path, "/root");
//! assert_eq!(update.children.to_vec(), vec!["c1"]);
//!
//! watcher.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Against a real ensemble, pass a [`ZooKeeperConnector`] to [`WatcherBuilder::start`] instead.
#[macro_use]
extern crate failure;

mod client;
mod dispatcher;
pub mod error;
mod gate;
pub mod memory;
mod proto;
mod refresher;
mod session;
mod sink;
mod transform;
mod types;
mod view;
mod watcher;
mod zookeeper;

pub use crate::client::{ChildrenReply, Connector, Coordinator, CreateReply, DeleteReply};
pub use crate::dispatcher::{ChildUpdate, ExpiryPolicy};
pub use crate::gate::SessionGate;
pub use crate::proto::{ZkError, ZooKeeperTransport};
pub use crate::refresher::ChildrenRefresher;
pub use crate::session::{Session, SessionState};
pub use crate::sink::{ChildrenResult, LoggingSink, ResultSink};
pub use crate::types::*;
pub use crate::view::ChildView;
pub use crate::watcher::{ChildWatcher, WatcherBuilder};
pub use crate::zookeeper::{ZooKeeper, ZooKeeperBuilder, ZooKeeperConnector};

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use slog::Drain;

    fn logger() -> slog::Logger {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog::o!())
    }

    #[tokio::test]
    #[ignore = "needs a ZooKeeper server on 127.0.0.1:2181"]
    async fn it_works() {
        let log = logger();
        let mut zk = ZooKeeperBuilder::default();
        zk.set_logger(log.clone());
        let connector = ZooKeeperConnector::new("127.0.0.1:2181".parse().unwrap(), zk);

        let mut builder = WatcherBuilder::default();
        builder.set_logger(log.clone());
        let (watcher, mut updates): (ChildWatcher<ZooKeeper>, _) =
            builder.start(connector).await.unwrap();

        let _ = watcher.delete("/zk-book/c1", None).await.unwrap();
        let _ = watcher.delete("/zk-book", None).await.unwrap();
        let path = watcher
            .create("/zk-book", b"", CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(path.as_ref().map(String::as_str), Ok("/zk-book"));

        let (children, stat) = watcher.refresh("/zk-book").await.unwrap().unwrap();
        assert!(children.is_empty());
        assert_eq!(stat.num_children, 0);

        watcher
            .create("/zk-book/c1", b"", CreateMode::Ephemeral)
            .await
            .unwrap()
            .unwrap();
        let update = updates.next().await.unwrap();
        assert_eq!(update.path, "/zk-book");
        assert_eq!(update.children.to_vec(), vec!["c1"]);

        watcher.close().await.unwrap();

        // the ephemeral child went away with the session
        let (zk, _events) = ZooKeeper::connect(&"127.0.0.1:2181".parse().unwrap())
            .await
            .unwrap();
        let (children, _) = zk.get_children("/zk-book", false).await.unwrap().unwrap();
        assert!(children.is_empty());
        zk.delete("/zk-book", None).await.unwrap().unwrap();
        zk.close().await.unwrap();
        drop(log);
    }
}
