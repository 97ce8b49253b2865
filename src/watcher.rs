use crate::client::{Connector, Coordinator, CreateReply, DeleteReply};
use crate::dispatcher::{self, ChildUpdate, Delivery, ExpiryPolicy, WatchDispatcher};
use crate::gate::SessionGate;
use crate::refresher::ChildrenRefresher;
use crate::session::Session;
use crate::sink::ResultSink;
use crate::view::ChildView;
use crate::{error, ChildSet, CreateMode, Stat};
use futures::channel::mpsc;
use slog::{debug, error, info, o, warn};
use std::sync::Arc;
use std::time;
use tokio::task::JoinHandle;

/// Builder that allows customizing options for a [`ChildWatcher`].
#[derive(Debug, Clone)]
pub struct WatcherBuilder {
    connect_timeout: time::Duration,
    refresh_timeout: time::Duration,
    expiry_policy: ExpiryPolicy,
    logger: slog::Logger,
}

impl Default for WatcherBuilder {
    fn default() -> Self {
        let drain = slog::Discard;
        let root = slog::Logger::root(drain, o!());

        WatcherBuilder {
            connect_timeout: time::Duration::from_secs(15),
            refresh_timeout: time::Duration::from_secs(5),
            expiry_policy: ExpiryPolicy::default(),
            logger: root,
        }
    }
}

impl WatcherBuilder {
    /// How long [`WatcherBuilder::start`] waits for the session to connect, and how long the
    /// callback task waits for a replacement session after an expiry.
    pub fn set_connect_timeout(&mut self, t: time::Duration) {
        self.connect_timeout = t;
    }

    /// Upper bound on each refresh the callback task performs after a watch fires, and on the
    /// wait for the reply to a [`ChildWatcher::refresh_async`].
    ///
    /// Nothing else is delivered while either is outstanding.
    pub fn set_refresh_timeout(&mut self, t: time::Duration) {
        self.refresh_timeout = t;
    }

    /// What to do when the session expires. Defaults to [`ExpiryPolicy::Reinitialize`].
    pub fn set_expiry_policy(&mut self, policy: ExpiryPolicy) {
        self.expiry_policy = policy;
    }

    /// Set the logger used by the watcher and its callback task.
    ///
    /// By default, all logging is disabled.
    pub fn set_logger(&mut self, l: slog::Logger) {
        self.logger = l;
    }

    /// Open a session through `connector` and wait until it is connected.
    ///
    /// Returns the watcher and the stream of updates produced each time a child watch fires and
    /// is re-armed. Fails if the connector fails, or with [`error::Connect`] if the session does
    /// not connect within the connect timeout.
    pub async fn start<C, K>(
        self,
        connector: K,
    ) -> Result<(ChildWatcher<C>, mpsc::UnboundedReceiver<ChildUpdate>), failure::Error>
    where
        C: Coordinator,
        K: Connector<C>,
    {
        let connector: Arc<dyn Connector<C>> = Arc::new(connector);
        let (client, events) = connector.connect().await?;
        debug!(self.logger, "session opened"; "session_id" => client.session_id());

        let session = Arc::new(Session::new(client, SessionGate::new(), self.logger.clone()));
        let (deliveries, inbox) = mpsc::unbounded();
        let (updates, updates_rx) = mpsc::unbounded();
        let refresher = ChildrenRefresher::new(
            Arc::clone(&session),
            ChildView::default(),
            deliveries.clone(),
            self.refresh_timeout,
            self.logger.clone(),
        );
        dispatcher::pump(events, 0, deliveries);

        let dispatcher = WatchDispatcher::new(
            refresher.clone(),
            Arc::clone(&session),
            connector,
            self.expiry_policy,
            self.connect_timeout,
            self.refresh_timeout,
            updates,
            self.logger.clone(),
        );
        let callbacks = tokio::spawn(dispatcher.run(inbox));

        let watcher = ChildWatcher {
            session,
            refresher,
            callbacks: Some(callbacks),
            logger: self.logger,
        };
        if let Err(e) = watcher.session.gate().wait_connected(self.connect_timeout).await {
            let logger = watcher.logger.clone();
            warn!(logger, "session did not connect: {}", e);
            if let Err(close) = watcher.close().await {
                debug!(logger, "close after failed start: {}", close);
            }
            return Err(e.into());
        }
        info!(watcher.logger, "watcher started"; "session_id" => watcher.session.id());
        Ok((watcher, updates_rx))
    }
}

/// Keeps a best-effort view of the children of watched nodes.
///
/// Every path passed to [`ChildWatcher::refresh`] or [`ChildWatcher::refresh_async`] gets a
/// child watch. When it fires, the callback task reads the children again, re-arming the watch
/// in the same request, records them in [`ChildWatcher::view`] and publishes a [`ChildUpdate`].
/// Changes that land between a watch firing and it being re-armed produce no notification of
/// their own; they are picked up by the re-arming read.
pub struct ChildWatcher<C: Coordinator> {
    session: Arc<Session<C>>,
    refresher: ChildrenRefresher<C>,
    callbacks: Option<JoinHandle<()>>,
    logger: slog::Logger,
}

impl<C: Coordinator> ChildWatcher<C> {
    /// The underlying session.
    pub fn session(&self) -> &Session<C> {
        &self.session
    }

    /// The last known children of every watched path.
    pub fn view(&self) -> &ChildView {
        self.refresher.view()
    }

    /// Create a node with the open ACL.
    pub async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CreateReply {
        self.session.create(path, data, mode).await
    }

    /// Delete a node. A `version` of `None` matches any version.
    pub async fn delete(&self, path: &str, version: Option<i32>) -> DeleteReply {
        self.session.delete(path, version).await
    }

    /// Read the children of `path` and arm its child watch, waiting for the answer.
    ///
    /// See [`ChildrenRefresher::refresh`].
    pub async fn refresh(
        &self,
        path: &str,
    ) -> Result<Result<(ChildSet, Stat), error::GetChildren>, failure::Error> {
        self.refresher.refresh(path).await
    }

    /// Read the children of `path` and arm its child watch without waiting.
    ///
    /// See [`ChildrenRefresher::refresh_async`].
    pub fn refresh_async<T, K>(&self, path: &str, context: T, sink: K) -> Result<(), failure::Error>
    where
        T: Send + 'static,
        K: ResultSink<T>,
    {
        self.refresher.refresh_async(path, context, sink)
    }

    /// Shut down: refuse new requests, let the callback task finish what is already queued, then
    /// close the session. Ephemeral nodes created through it go away.
    pub async fn close(mut self) -> Result<(), failure::Error> {
        let client = self.session.begin_close();
        let _ = self.refresher.deliveries().unbounded_send(Delivery::Shutdown);
        if let Some(callbacks) = self.callbacks.take() {
            if let Err(e) = callbacks.await {
                error!(self.logger, "callback task failed: {}", e);
            }
        }

        let res = match client {
            Some(client) => client.close().await,
            None => Ok(()),
        };
        self.session.mark_closed();
        debug!(self.logger, "watcher closed");
        res
    }
}

impl<C: Coordinator> Drop for ChildWatcher<C> {
    fn drop(&mut self) {
        if self.callbacks.is_some() {
            // not closed; stop the callback task, the session goes away with the last handle
            self.session.begin_close();
            let _ = self.refresher.deliveries().unbounded_send(Delivery::Shutdown);
        }
    }
}
