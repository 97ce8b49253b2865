use crate::client::{ChildrenReply, Connector, Coordinator, CreateReply, DeleteReply};
use crate::proto::{self, Enqueuer, Handshake, Packetizer, Request, SessionKeys, ZooKeeperTransport};
use crate::{transform, Acl, CreateMode, WatchedEvent};
use async_trait::async_trait;
use failure::bail;
use futures::channel::mpsc;
use futures::future::{BoxFuture, FutureExt};
use slog::{debug, o, trace};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::time;

/// A connection to a ZooKeeper ensemble speaking the binary client protocol.
///
/// The connection is driven by a background task. It sends heartbeats, reconnects after a
/// connection loss (re-installing armed child watches), and reports session transitions on the
/// event stream returned by [`ZooKeeper::connect`].
#[derive(Debug, Clone)]
pub struct ZooKeeper {
    connection: Enqueuer,
    session_id: i64,
    logger: slog::Logger,
}

/// Builder that allows customizing options for ZooKeeper connections.
#[derive(Debug, Clone)]
pub struct ZooKeeperBuilder {
    session_timeout: time::Duration,
    logger: slog::Logger,
}

impl Default for ZooKeeperBuilder {
    fn default() -> Self {
        let drain = slog::Discard;
        let root = slog::Logger::root(drain, o!());

        ZooKeeperBuilder {
            session_timeout: time::Duration::new(0, 0),
            logger: root,
        }
    }
}

impl ZooKeeperBuilder {
    /// Connect to a ZooKeeper server instance at the given address.
    ///
    /// The session is established once this resolves. Watch notifications and session state
    /// changes are delivered on the returned stream, starting with `SyncConnected`.
    pub async fn connect(
        self,
        addr: &SocketAddr,
    ) -> Result<(ZooKeeper, mpsc::UnboundedReceiver<WatchedEvent>), failure::Error> {
        let (tx, rx) = mpsc::unbounded();
        let stream = tokio::net::TcpStream::connect(addr).await?;
        Ok((self.handshake(*addr, stream, tx).await?, rx))
    }

    /// Set the ZooKeeper [session expiry
    /// timeout](https://zookeeper.apache.org/doc/r3.4.12/zookeeperProgrammers.html#ch_zkSessions).
    ///
    /// The default timeout is dictated by the server.
    pub fn set_timeout(&mut self, t: time::Duration) {
        self.session_timeout = t;
    }

    /// Set the logger that should be used internally in the ZooKeeper client.
    ///
    /// By default, all logging is disabled. See also [the `slog`
    /// documentation](https://docs.rs/slog).
    pub fn set_logger(&mut self, l: slog::Logger) {
        self.logger = l;
    }

    async fn handshake<S>(
        self,
        addr: S::Addr,
        mut stream: S,
        default_watcher: mpsc::UnboundedSender<WatchedEvent>,
    ) -> Result<ZooKeeper, failure::Error>
    where
        S: ZooKeeperTransport,
    {
        let keys = SessionKeys::fresh(self.session_timeout);
        let keys = match proto::handshake(&mut stream, &keys, &self.logger).await? {
            Handshake::Established(keys) => keys,
            Handshake::Expired => bail!("server refused to create a session"),
        };
        let session_id = keys.session_id;
        let logger = self.logger.new(o!("session_id" => session_id));
        debug!(logger, "session established");

        let connection = Packetizer::new(addr, stream, keys, logger.clone(), default_watcher);
        Ok(ZooKeeper {
            connection,
            session_id,
            logger,
        })
    }
}

impl ZooKeeper {
    /// Connect to a ZooKeeper server instance at the given address with default parameters.
    ///
    /// See [`ZooKeeperBuilder::connect`].
    pub async fn connect(
        addr: &SocketAddr,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchedEvent>), failure::Error> {
        ZooKeeperBuilder::default().connect(addr).await
    }
}

impl Coordinator for ZooKeeper {
    fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        acl: &'static [Acl],
        mode: CreateMode,
    ) -> BoxFuture<'static, CreateReply> {
        trace!(self.logger, "create"; "path" => path, "mode" => ?mode, "dlen" => data.len());
        self.connection
            .enqueue(Request::Create {
                path: path.to_string(),
                data: Cow::Owned(data),
                acl: Cow::Borrowed(acl),
                mode,
            })
            .map(|r| r.and_then(transform::create))
            .boxed()
    }

    fn delete(&self, path: &str, version: Option<i32>) -> BoxFuture<'static, DeleteReply> {
        let version = version.unwrap_or(-1);
        trace!(self.logger, "delete"; "path" => path, "version" => version);
        self.connection
            .enqueue(Request::Delete {
                path: path.to_string(),
                version,
            })
            .map(move |r| r.and_then(|res| transform::delete(version, res)))
            .boxed()
    }

    fn get_children(&self, path: &str, watch: bool) -> BoxFuture<'static, ChildrenReply> {
        trace!(self.logger, "get_children"; "path" => path, "watch" => watch);
        self.connection
            .enqueue(Request::GetChildren {
                path: path.to_string(),
                watch,
            })
            .map(|r| r.and_then(transform::get_children))
            .boxed()
    }

    fn close(&self) -> BoxFuture<'static, Result<(), failure::Error>> {
        trace!(self.logger, "close");
        self.connection
            .enqueue(Request::CloseSession)
            .map(|r| r.and_then(transform::close))
            .boxed()
    }

    fn session_id(&self) -> i64 {
        self.session_id
    }
}

/// Opens a new [`ZooKeeper`] session on every call, for use with the children watcher.
#[derive(Debug, Clone)]
pub struct ZooKeeperConnector {
    addr: SocketAddr,
    builder: ZooKeeperBuilder,
}

impl ZooKeeperConnector {
    /// Sessions will be opened against `addr` using the options in `builder`.
    pub fn new(addr: SocketAddr, builder: ZooKeeperBuilder) -> Self {
        ZooKeeperConnector { addr, builder }
    }
}

#[async_trait]
impl Connector<ZooKeeper> for ZooKeeperConnector {
    async fn connect(
        &self,
    ) -> Result<(ZooKeeper, mpsc::UnboundedReceiver<WatchedEvent>), failure::Error> {
        self.builder.clone().connect(&self.addr).await
    }
}
