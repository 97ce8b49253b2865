use crate::client::Coordinator;
use crate::dispatcher::{Delivery, Report};
use crate::session::Session;
use crate::sink::{ChildrenResult, ResultSink};
use crate::view::ChildView;
use crate::{error, ChildSet, Stat, ZkError};
use futures::channel::mpsc;
use futures::FutureExt;
use slog::{debug, info, trace, warn};
use std::sync::Arc;
use std::time::Duration;

/// Reads the children of a path and re-arms its child watch, in one request.
///
/// The watch is always registered by the same request that reads the children, so it covers
/// every change after that read. It cannot cover changes between an earlier watch firing and
/// this request reaching the ensemble; treat each result as "the state now", never as a
/// sequence of deltas.
pub struct ChildrenRefresher<C> {
    session: Arc<Session<C>>,
    view: ChildView,
    deliveries: mpsc::UnboundedSender<Delivery>,
    reply_timeout: Duration,
    logger: slog::Logger,
}

impl<C> Clone for ChildrenRefresher<C> {
    fn clone(&self) -> Self {
        ChildrenRefresher {
            session: Arc::clone(&self.session),
            view: self.view.clone(),
            deliveries: self.deliveries.clone(),
            reply_timeout: self.reply_timeout,
            logger: self.logger.clone(),
        }
    }
}

/// Fold a finished read into the view and log it.
fn settle(
    view: &ChildView,
    logger: &slog::Logger,
    path: &str,
    res: Result<(Vec<String>, Stat), error::GetChildren>,
) -> Result<(ChildSet, Stat), error::GetChildren> {
    match res {
        Ok((children, stat)) => {
            let children = ChildSet::from(children);
            trace!(logger, "child watch armed"; "path" => path, "n" => children.len());
            if !view.record(path, children.clone(), &stat) {
                debug!(logger, "kept newer children over an older read";
                       "path" => path, "pzxid" => stat.pzxid);
            }
            Ok((children, stat))
        }
        Err(error::GetChildren::NoNode) => {
            info!(logger, "watched node does not exist"; "path" => path);
            view.forget(path);
            Err(error::GetChildren::NoNode)
        }
        Err(e) => {
            debug!(logger, "children read failed: {}", e; "path" => path, "transient" => e.is_transient());
            Err(e)
        }
    }
}

impl<C: Coordinator> ChildrenRefresher<C> {
    pub(crate) fn new(
        session: Arc<Session<C>>,
        view: ChildView,
        deliveries: mpsc::UnboundedSender<Delivery>,
        reply_timeout: Duration,
        logger: slog::Logger,
    ) -> Self {
        ChildrenRefresher {
            session,
            view,
            deliveries,
            reply_timeout,
            logger,
        }
    }

    /// The last known children of every path refreshed through this refresher.
    pub fn view(&self) -> &ChildView {
        &self.view
    }

    pub(crate) fn deliveries(&self) -> &mpsc::UnboundedSender<Delivery> {
        &self.deliveries
    }

    /// Read the children of `path` and re-arm its watch, waiting for the answer.
    ///
    /// The outer error means the request could not be issued or the connection broke; the inner
    /// error is the ensemble's answer. A failed read leaves the view untouched, except that a
    /// missing node is dropped from it.
    pub async fn refresh(
        &self,
        path: &str,
    ) -> Result<Result<(ChildSet, Stat), error::GetChildren>, failure::Error> {
        let reply = self.session.client()?.get_children(path, true);
        let res = reply.await?;
        Ok(settle(&self.view, &self.logger, path, res))
    }

    /// Read the children of `path` and re-arm its watch without waiting.
    ///
    /// The request is submitted before this returns. Its result, carrying `context` unchanged,
    /// is handed to `sink` on the callback task, ahead of any watch event caused by a later
    /// request. If the connection breaks before the answer arrives the sink sees
    /// `ConnectionLoss`; if no answer arrives within the reply timeout it sees
    /// `OperationTimeout`.
    ///
    /// Fails if the session is closing or the callback task is gone.
    pub fn refresh_async<T, K>(&self, path: &str, context: T, sink: K) -> Result<(), failure::Error>
    where
        T: Send + 'static,
        K: ResultSink<T>,
    {
        let reply = self.session.client()?.get_children(path, true);

        let view = self.view.clone();
        let logger = self.logger.clone();
        let timeout = self.reply_timeout;
        let path = path.to_string();
        let reply = async move {
            let res = match tokio::time::timeout(timeout, reply).await {
                Ok(Ok(res)) => res,
                Ok(Err(e)) => {
                    warn!(logger, "children request failed: {}", e; "path" => &path);
                    Err(error::GetChildren::ConnectionLoss)
                }
                Err(_) => {
                    warn!(logger, "children request timed out";
                          "path" => &path, "timeout" => ?timeout);
                    Err(error::GetChildren::Internal(ZkError::OperationTimeout))
                }
            };

            Box::new(move || {
                let outcome = settle(&view, &logger, &path, res);
                sink.on_result(ChildrenResult {
                    path,
                    context,
                    outcome,
                });
            }) as Report
        };

        // queued now, so it is handled before events that follow the reply
        self.deliveries
            .unbounded_send(Delivery::Reply(reply.boxed()))
            .map_err(|_| format_err!("callback task is gone"))
    }
}
