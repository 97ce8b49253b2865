use crate::client::{Connector, Coordinator};
use crate::refresher::ChildrenRefresher;
use crate::session::Session;
use crate::{error, ChildSet, KeeperState, Stat, WatchedEvent, WatchedEventType};
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use slog::{debug, error, info, trace, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// A finished asynchronous refresh, ready to be folded in and handed to its sink.
pub(crate) type Report = Box<dyn FnOnce() + Send>;

/// Work for the callback task.
pub(crate) enum Delivery {
    /// A watch event from the session of the given generation.
    Event { generation: u64, event: WatchedEvent },
    /// An asynchronous refresh, queued when it was submitted. Resolves once its reply is in.
    Reply(BoxFuture<'static, Report>),
    /// Stop after everything queued before this.
    Shutdown,
}

/// What to do when the ensemble expires the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Open a new session and re-arm the child watch of every known path.
    Reinitialize,
    /// Stop handling events. Requests made afterwards fail with `SessionExpired`.
    Terminate,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        ExpiryPolicy::Reinitialize
    }
}

/// The children of a path after a child watch fired and was re-armed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildUpdate {
    /// The watched path.
    pub path: String,
    /// Its children as of the re-arming read.
    pub children: ChildSet,
    /// Its metadata as of the same read.
    pub stat: Stat,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Forward a session's events to the callback task, tagged with its generation.
pub(crate) fn pump(
    mut events: mpsc::UnboundedReceiver<WatchedEvent>,
    generation: u64,
    deliveries: mpsc::UnboundedSender<Delivery>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if deliveries
                .unbounded_send(Delivery::Event { generation, event })
                .is_err()
            {
                break;
            }
        }
    });
}

/// Routes watch events on the callback task.
pub(crate) struct WatchDispatcher<C: Coordinator> {
    refresher: ChildrenRefresher<C>,
    session: Arc<Session<C>>,
    connector: Arc<dyn Connector<C>>,
    expiry: ExpiryPolicy,
    connect_timeout: Duration,
    refresh_timeout: Duration,
    updates: mpsc::UnboundedSender<ChildUpdate>,
    generation: u64,
    logger: slog::Logger,
}

impl<C: Coordinator> WatchDispatcher<C> {
    pub(crate) fn new(
        refresher: ChildrenRefresher<C>,
        session: Arc<Session<C>>,
        connector: Arc<dyn Connector<C>>,
        expiry: ExpiryPolicy,
        connect_timeout: Duration,
        refresh_timeout: Duration,
        updates: mpsc::UnboundedSender<ChildUpdate>,
        logger: slog::Logger,
    ) -> Self {
        WatchDispatcher {
            refresher,
            session,
            connector,
            expiry,
            connect_timeout,
            refresh_timeout,
            updates,
            generation: 0,
            logger,
        }
    }

    /// Handle one watch event.
    ///
    /// A children-changed notification re-arms the watch on its path before returning, so the
    /// next notification for that path cannot be handled before the watch that produces it exists.
    pub(crate) async fn on_event(&mut self, event: WatchedEvent) -> Flow {
        trace!(self.logger, "watch event"; "state" => ?event.keeper_state,
               "type" => ?event.event_type, "path" => ?event.path);
        self.session.record_state(event.keeper_state.into());

        match (event.keeper_state, event.event_type, event.path.as_deref()) {
            (KeeperState::SyncConnected, WatchedEventType::None, None) => {
                if self.session.gate().observe(&event) {
                    info!(self.logger, "session connected"; "session_id" => self.session.id());
                }
                Flow::Continue
            }
            (KeeperState::Expired, _, _) => {
                self.session.gate().observe(&event);
                self.on_expired().await
            }
            (_, WatchedEventType::NodeChildrenChanged, Some(path)) => {
                self.rearm(path).await;
                Flow::Continue
            }
            (_, WatchedEventType::NodeChildrenChanged, None) => {
                warn!(self.logger, "children-changed notification without a path");
                Flow::Continue
            }
            (_, WatchedEventType::NodeDeleted, Some(path)) => {
                // the watch went with the node
                if self.refresher.view().forget(path).is_some() {
                    info!(self.logger, "watched node deleted"; "path" => path);
                }
                Flow::Continue
            }
            (_, WatchedEventType::None, _)
            | (_, WatchedEventType::NodeCreated, _)
            | (_, WatchedEventType::NodeDeleted, _)
            | (_, WatchedEventType::NodeDataChanged, _)
            | (_, WatchedEventType::DataWatchRemoved, _)
            | (_, WatchedEventType::ChildWatchRemoved, _) => Flow::Continue,
        }
    }

    async fn rearm(&self, path: &str) {
        let refresh = tokio::time::timeout(self.refresh_timeout, self.refresher.refresh(path));
        match refresh.await {
            Ok(Ok(Ok((children, stat)))) => {
                info!(self.logger, "children changed"; "path" => path, "children" => %children);
                let update = ChildUpdate {
                    path: path.to_string(),
                    children,
                    stat,
                };
                if self.updates.unbounded_send(update).is_err() {
                    trace!(self.logger, "no one is listening for child updates");
                }
            }
            Ok(Ok(Err(e))) => {
                warn!(self.logger, "could not re-arm child watch: {}", e;
                      "path" => path, "transient" => e.is_transient());
            }
            Ok(Err(e)) => {
                warn!(self.logger, "could not re-arm child watch: {}", e; "path" => path);
            }
            Err(_) => {
                warn!(self.logger, "re-arming child watch timed out";
                      "path" => path, "timeout" => ?self.refresh_timeout);
            }
        }
    }

    async fn on_expired(&mut self) -> Flow {
        warn!(self.logger, "session expired"; "session_id" => self.session.id());
        if self.session.is_closing() {
            return Flow::Stop;
        }
        match self.expiry {
            ExpiryPolicy::Terminate => Flow::Stop,
            ExpiryPolicy::Reinitialize => match self.reinitialize().await {
                Ok(()) => Flow::Continue,
                Err(e) => {
                    error!(self.logger, "could not re-initialize expired session: {}", e);
                    Flow::Stop
                }
            },
        }
    }

    async fn reinitialize(&mut self) -> Result<(), failure::Error> {
        let connect = tokio::time::timeout(self.connect_timeout, self.connector.connect());
        let (client, events) = match connect.await {
            Ok(res) => res?,
            Err(_) => return Err(error::Connect::Timeout.into()),
        };
        self.generation += 1;
        info!(self.logger, "re-initialized session";
              "session_id" => client.session_id(), "generation" => self.generation);
        self.session.replace(client);
        pump(
            events,
            self.generation,
            self.refresher.deliveries().clone(),
        );

        for path in self.refresher.view().paths() {
            self.rearm(&path).await;
        }
        Ok(())
    }

    /// Drain deliveries until shut down, or until the session is gone for good.
    pub(crate) async fn run(mut self, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Delivery::Event { generation, event } => {
                    if generation != self.generation {
                        trace!(self.logger, "dropping event from replaced session";
                               "generation" => generation);
                        continue;
                    }
                    match AssertUnwindSafe(self.on_event(event)).catch_unwind().await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => break,
                        Err(_) => error!(self.logger, "watch handler panicked"),
                    }
                }
                Delivery::Reply(reply) => {
                    let report = reply.await;
                    if panic::catch_unwind(AssertUnwindSafe(report)).is_err() {
                        error!(self.logger, "result sink panicked");
                    }
                }
                Delivery::Shutdown => break,
            }
        }
        debug!(self.logger, "callback task exiting");
    }
}
