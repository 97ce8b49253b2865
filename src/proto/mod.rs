use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

mod error;
mod packetizer;
mod request;
mod response;

pub use self::error::ZkError;
pub(crate) use self::packetizer::{handshake, Enqueuer, Handshake, Packetizer, SessionKeys};
pub(crate) use self::request::Request;
pub(crate) use self::response::Response;

/// A byte stream that a ZooKeeper session can run over.
#[async_trait]
pub trait ZooKeeperTransport: AsyncRead + AsyncWrite + Sized + Send + Unpin + 'static {
    /// Where to connect to.
    type Addr: Send + Sync + Clone;
    /// What went wrong while connecting.
    type ConnectError: Into<failure::Error> + Send + 'static;
    /// Open a new stream to `addr`.
    async fn connect(addr: Self::Addr) -> Result<Self, Self::ConnectError>;
}

#[async_trait]
impl ZooKeeperTransport for tokio::net::TcpStream {
    type Addr = SocketAddr;
    type ConnectError = tokio::io::Error;
    async fn connect(addr: SocketAddr) -> Result<Self, Self::ConnectError> {
        tokio::net::TcpStream::connect(addr).await
    }
}
