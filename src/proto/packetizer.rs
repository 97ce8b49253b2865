use super::{
    request::{self, xid, OpCode},
    response::ReadFrom,
    Request, Response, ZkError, ZooKeeperTransport,
};
use crate::{KeeperState, WatchedEvent, WatchedEventType};
use byteorder::{BigEndian, ReadBytesExt};
use failure::{bail, format_err};
use futures::{
    channel::{mpsc, oneshot},
    future::{self, Either},
    Future, StreamExt, TryFutureExt,
};
use slog::{debug, info, trace, warn};
use std::collections::{HashMap, HashSet};
use std::{io, time};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are treated as a corrupt stream.
const MAX_FRAME_LEN: i32 = 64 * 1024 * 1024;

/// Shortest and longest pause between two reconnection attempts.
const RECONNECT_DELAY_MIN: time::Duration = time::Duration::from_millis(50);
const RECONNECT_DELAY_MAX: time::Duration = time::Duration::from_secs(2);

type Reply = oneshot::Sender<Result<Response, ZkError>>;

/// Everything needed to resume a session on a fresh connection.
#[derive(Clone, Debug)]
pub(crate) struct SessionKeys {
    pub(crate) session_id: i64,
    pub(crate) password: Vec<u8>,
    pub(crate) last_zxid_seen: i64,
    pub(crate) timeout: time::Duration,
}

impl SessionKeys {
    pub(crate) fn fresh(timeout: time::Duration) -> Self {
        SessionKeys {
            session_id: 0,
            password: vec![0; 16],
            last_zxid_seen: 0,
            timeout,
        }
    }

    fn ping_interval(&self) -> time::Duration {
        self.timeout / 3
    }
}

/// Outcome of a connect request.
#[derive(Debug)]
pub(crate) enum Handshake {
    Established(SessionKeys),
    /// The server no longer knows the session we tried to resume.
    Expired,
}

/// Send the connect request on `stream` and wait for the server's answer.
pub(crate) async fn handshake<S>(
    stream: &mut S,
    keys: &SessionKeys,
    logger: &slog::Logger,
) -> Result<Handshake, failure::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = Request::Connect {
        protocol_version: 0,
        last_zxid_seen: keys.last_zxid_seen,
        timeout: keys.timeout.as_millis() as i32,
        session_id: keys.session_id,
        passwd: keys.password.clone(),
        read_only: false,
    };
    trace!(logger, "about to handshake"; "session_id" => keys.session_id);
    stream.write_all(&request.frame(0)?).await?;
    stream.flush().await?;

    let frame = read_frame(stream).await?;
    match Response::parse(OpCode::CreateSession, &frame)? {
        Response::Connect {
            timeout,
            session_id,
            password,
            ..
        } => {
            if timeout <= 0 {
                return Ok(Handshake::Expired);
            }
            trace!(logger, "negotiated session timeout: {}ms", timeout; "session_id" => session_id);
            Ok(Handshake::Established(SessionKeys {
                session_id,
                password,
                last_zxid_seen: keys.last_zxid_seen,
                timeout: time::Duration::from_millis(timeout as u64),
            }))
        }
        r => bail!("got non-connect response to handshake: {:?}", r),
    }
}

async fn read_frame<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_i32().await?;
    if !(0..=MAX_FRAME_LEN).contains(&length) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length {}", length),
        ));
    }
    let mut frame = vec![0; length as usize];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

enum Reconnect<S> {
    Connected(S),
    Expired,
    Abandoned,
}

pub(crate) struct Packetizer<S>
where
    S: ZooKeeperTransport,
{
    /// ZooKeeper address
    addr: S::Addr,

    keys: SessionKeys,

    /// Watcher to send watch events to.
    default_watcher: mpsc::UnboundedSender<WatchedEvent>,

    /// Incoming requests
    rx: mpsc::UnboundedReceiver<(Request, Reply)>,

    /// What operation are we waiting for a response for?
    reply: HashMap<i32, (OpCode, Reply)>,

    /// Child watches requested by an in-flight request (xid -> path).
    pending_watches: HashMap<i32, String>,

    /// Paths with an armed child watch; replayed with setWatches after a reconnect.
    child_watches: HashSet<String>,

    /// Next xid to issue
    xid: i32,

    logger: slog::Logger,

    exiting: bool,
}

impl<S> Packetizer<S>
where
    S: ZooKeeperTransport,
{
    /// Spawn the connection task for an already established session.
    ///
    /// The returned `Enqueuer` is the only way to submit requests; once every clone of it is
    /// dropped the session is closed.
    #[allow(clippy::new_ret_no_self)]
    pub(crate) fn new(
        addr: S::Addr,
        stream: S,
        keys: SessionKeys,
        logger: slog::Logger,
        default_watcher: mpsc::UnboundedSender<WatchedEvent>,
    ) -> Enqueuer {
        let (tx, rx) = mpsc::unbounded();

        // the handshake already happened, so this is the first thing the watcher sees
        let _ = default_watcher.unbounded_send(WatchedEvent::session(KeeperState::SyncConnected));

        tokio::spawn(
            Packetizer {
                addr,
                keys,
                default_watcher,
                rx,
                reply: HashMap::new(),
                pending_watches: HashMap::new(),
                child_watches: HashSet::new(),
                xid: 0,
                logger,
                exiting: false,
            }
            .run(stream),
        );

        Enqueuer(tx)
    }

    async fn run(mut self, mut stream: S) {
        loop {
            let e = match self.serve(stream).await {
                Ok(()) => {
                    debug!(self.logger, "packetizer done");
                    return;
                }
                Err(e) => e,
            };

            if self.exiting {
                debug!(self.logger, "connection lost during exit; not reconnecting");
                return;
            }

            info!(self.logger, "connection lost; reconnecting";
                  "session_id" => self.keys.session_id,
                  "last_zxid" => self.keys.last_zxid_seen,
                  "error" => %e
            );
            self.fail_outstanding(ZkError::ConnectionLoss);
            let _ = self
                .default_watcher
                .unbounded_send(WatchedEvent::session(KeeperState::Disconnected));

            stream = match self.reconnect().await {
                Reconnect::Connected(s) => s,
                Reconnect::Abandoned => return,
                Reconnect::Expired => {
                    self.expire().await;
                    return;
                }
            };
        }
    }

    async fn reconnect(&mut self) -> Reconnect<S> {
        let mut delay = RECONNECT_DELAY_MIN;
        loop {
            // requests cannot be queued across the gap; they fail like in-flight ones did
            self.reject_queued(ZkError::ConnectionLoss);
            if self.exiting {
                return Reconnect::Abandoned;
            }

            match S::connect(self.addr.clone()).await {
                Ok(mut stream) => match handshake(&mut stream, &self.keys, &self.logger).await {
                    Ok(Handshake::Established(keys)) => {
                        info!(self.logger, "reconnected"; "session_id" => keys.session_id);
                        self.keys = keys;
                        let _ = self
                            .default_watcher
                            .unbounded_send(WatchedEvent::session(KeeperState::SyncConnected));
                        return Reconnect::Connected(stream);
                    }
                    Ok(Handshake::Expired) => return Reconnect::Expired,
                    Err(e) => debug!(self.logger, "re-handshake failed: {}", e),
                },
                Err(e) => {
                    let e: failure::Error = e.into();
                    debug!(self.logger, "reconnect failed: {}", e);
                }
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RECONNECT_DELAY_MAX);
        }
    }

    /// The session is gone for good: tell the watcher, then refuse everything until the user
    /// drops the handle.
    async fn expire(&mut self) {
        info!(self.logger, "session expired"; "session_id" => self.keys.session_id);
        self.fail_outstanding(ZkError::SessionExpired);
        self.child_watches.clear();
        let _ = self
            .default_watcher
            .unbounded_send(WatchedEvent::session(KeeperState::Expired));
        self.default_watcher.close_channel();

        while let Some((_, tx)) = self.rx.next().await {
            let _ = tx.send(Err(ZkError::SessionExpired));
        }
    }

    fn fail_outstanding(&mut self, err: ZkError) {
        self.pending_watches.clear();
        for (_, (_, tx)) in self.reply.drain() {
            let _ = tx.send(Err(err));
        }
    }

    fn reject_queued(&mut self, err: ZkError) {
        loop {
            match self.rx.try_next() {
                Ok(Some((_, tx))) => {
                    let _ = tx.send(Err(err));
                }
                Ok(None) => {
                    // no more requests will be enqueued
                    self.exiting = true;
                    return;
                }
                Err(_) => return,
            }
        }
    }

    fn next_xid(&mut self) -> i32 {
        // non-positive xids are reserved for server-initiated traffic
        self.xid = if self.xid == i32::MAX { 1 } else { self.xid + 1 };
        self.xid
    }

    fn enqueue(&mut self, request: Request, tx: Reply) -> io::Result<Vec<u8>> {
        let xid = self.next_xid();
        debug!(self.logger, "enqueueing request {:?}", request; "xid" => xid);

        if let Request::GetChildren {
            ref path,
            watch: true,
        } = request
        {
            trace!(self.logger, "adding pending watcher"; "xid" => xid, "path" => path);
            self.pending_watches.insert(xid, path.clone());
        }

        let frame = request.frame(xid)?;
        let old = self.reply.insert(xid, (request.opcode(), tx));
        debug_assert!(old.is_none());
        Ok(frame)
    }

    async fn serve(&mut self, stream: S) -> Result<(), failure::Error> {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let (frames_tx, mut frames) = mpsc::unbounded();
        let read_task = tokio::spawn(async move {
            loop {
                let frame = read_frame(&mut reader).await;
                let failed = frame.is_err();
                if frames_tx.unbounded_send(frame).is_err() || failed {
                    break;
                }
            }
        });

        let result = self.pump(&mut writer, &mut frames).await;
        read_task.abort();
        result
    }

    async fn pump<W>(
        &mut self,
        writer: &mut W,
        frames: &mut mpsc::UnboundedReceiver<io::Result<Vec<u8>>>,
    ) -> Result<(), failure::Error>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.child_watches.is_empty() {
            let request = Request::SetWatches {
                relative_zxid: self.keys.last_zxid_seen,
                data: Vec::new(),
                exist: Vec::new(),
                child: self.child_watches.iter().cloned().collect(),
            };
            debug!(self.logger, "re-installing child watches"; "n" => self.child_watches.len());
            writer.write_all(&request.frame(xid::SET_WATCHES)?).await?;
            writer.flush().await?;
        }

        let interval = self.keys.ping_interval();
        let heartbeat = tokio::time::sleep(interval);
        tokio::pin!(heartbeat);

        loop {
            tokio::select! {
                request = self.rx.next(), if !self.exiting => {
                    let frame = match request {
                        Some((request, tx)) => self.enqueue(request, tx)?,
                        None => {
                            // no more requests will be enqueued
                            self.exiting = true;
                            let (tx, _) = oneshot::channel();
                            self.enqueue(Request::CloseSession, tx)?
                        }
                    };
                    writer.write_all(&frame).await?;
                    writer.flush().await?;
                    // heartbeat is since last write traffic!
                    heartbeat.as_mut().reset(tokio::time::Instant::now() + interval);
                }
                frame = frames.next() => {
                    let frame = match frame {
                        Some(frame) => frame?,
                        None => bail!("connection reader exited"),
                    };
                    if self.handle_frame(&frame)? {
                        return Ok(());
                    }
                }
                _ = &mut heartbeat => {
                    trace!(self.logger, "sending heartbeat");
                    writer.write_all(&request::ping_frame()).await?;
                    writer.flush().await?;
                    heartbeat.as_mut().reset(tokio::time::Instant::now() + interval);
                }
            }
        }
    }

    /// Handle one reply frame. Returns `true` once the session has been closed.
    fn handle_frame(&mut self, frame: &[u8]) -> Result<bool, failure::Error> {
        let mut buf = frame;
        let xid = ReadBytesExt::read_i32::<BigEndian>(&mut buf)?;
        let zxid = ReadBytesExt::read_i64::<BigEndian>(&mut buf)?;
        if zxid > 0 {
            trace!(
                self.logger,
                "updated zxid from {} to {}",
                self.keys.last_zxid_seen,
                zxid
            );
            self.keys.last_zxid_seen = self.keys.last_zxid_seen.max(zxid);
        }
        let err = ZkError::from(ReadBytesExt::read_i32::<BigEndian>(&mut buf)?);

        match xid {
            xid::NOTIFICATION => {
                let e = WatchedEvent::read_from(&mut buf)?;
                trace!(self.logger, "got watcher event {:?}", e);
                if let Some(ref path) = e.path {
                    match e.event_type {
                        // the server dropped the child watch when it fired
                        WatchedEventType::NodeChildrenChanged | WatchedEventType::NodeDeleted => {
                            self.child_watches.remove(path);
                        }
                        _ => {}
                    }
                }
                // NOTE: ignoring error, because the user may not care about events
                let _ = self.default_watcher.unbounded_send(e);
            }
            xid::PING => {
                trace!(self.logger, "got response to heartbeat");
                if err != ZkError::Ok {
                    bail!("bad response to ping: {:?}", err);
                }
            }
            xid::SET_WATCHES => {
                if err != ZkError::Ok {
                    warn!(self.logger, "server refused to re-install watches: {:?}", err);
                }
            }
            xid => {
                let (opcode, tx) = self
                    .reply
                    .remove(&xid)
                    .ok_or_else(|| format_err!("response for unknown xid {}", xid))?;

                if let Some(path) = self.pending_watches.remove(&xid) {
                    // watches are only set by successful reads
                    if err == ZkError::Ok {
                        trace!(self.logger, "pending watcher turned into real watcher"; "xid" => xid);
                        self.child_watches.insert(path);
                    }
                }

                if err != ZkError::Ok {
                    if err.is_system_error() {
                        warn!(self.logger, "server failed request: {}", err;
                              "xid" => xid, "opcode" => ?opcode);
                    } else {
                        debug!(self.logger, "server refused request: {}", err;
                               "xid" => xid, "opcode" => ?opcode);
                    }
                    let _ = tx.send(Err(err));
                } else {
                    let r = Response::parse(opcode, buf)?;
                    debug!(self.logger,
                           "handling server response: {:?}", r;
                           "xid" => xid, "opcode" => ?opcode);
                    // if receiver doesn't care, we don't either
                    let _ = tx.send(Ok(r));
                }

                if opcode == OpCode::CloseSession {
                    trace!(self.logger, "got response to CloseSession");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Enqueuer(mpsc::UnboundedSender<(Request, Reply)>);

impl Enqueuer {
    /// Submit `request` right away; the returned future resolves with the server's reply.
    pub(crate) fn enqueue(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Result<Response, ZkError>, failure::Error>> + Send + 'static
    {
        let (tx, rx) = oneshot::channel();
        match self.0.unbounded_send((request, tx)) {
            Ok(()) => {
                Either::Left(rx.map_err(|e| format_err!("failed to enqueue new request: {:?}", e)))
            }
            Err(e) => Either::Right(future::ready(Err(format_err!(
                "failed to enqueue new request: {:?}",
                e
            )))),
        }
    }
}
