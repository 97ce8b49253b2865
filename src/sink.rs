use crate::{error, ChildSet, Stat};
use slog::{info, warn};
use std::fmt;

/// The eventual result of an asynchronous children refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildrenResult<T> {
    /// The path that was read.
    pub path: String,
    /// The context token passed to `refresh_async`, returned untouched.
    pub context: T,
    /// The children and the parent's `Stat`, or why they could not be read.
    pub outcome: Result<(ChildSet, Stat), error::GetChildren>,
}

impl<T> ChildrenResult<T> {
    /// The ZooKeeper status code: `0` on success, negative otherwise.
    pub fn code(&self) -> i32 {
        match self.outcome {
            Ok(_) => 0,
            Err(ref e) => e.code(),
        }
    }

    /// The children, if the read succeeded.
    pub fn children(&self) -> Option<&ChildSet> {
        self.outcome.as_ref().ok().map(|(children, _)| children)
    }

    /// The parent's metadata, if the read succeeded.
    pub fn stat(&self) -> Option<&Stat> {
        self.outcome.as_ref().ok().map(|(_, stat)| stat)
    }
}

/// Receives the results of asynchronous refreshes.
///
/// Sinks run on the callback task, one result at a time and never concurrently with event
/// handling. They should return quickly and must not block: nothing else is delivered while a
/// sink runs. A panicking sink is caught and logged, but the result it was handling is lost.
pub trait ResultSink<T>: Send + Sync + 'static {
    /// Handle one result.
    fn on_result(&self, result: ChildrenResult<T>);
}

impl<T, F> ResultSink<T> for F
where
    F: Fn(ChildrenResult<T>) + Send + Sync + 'static,
{
    fn on_result(&self, result: ChildrenResult<T>) {
        self(result)
    }
}

/// A sink that only reports each result through the logger.
#[derive(Clone, Debug)]
pub struct LoggingSink {
    logger: slog::Logger,
}

impl LoggingSink {
    /// Report results on `logger`.
    pub fn new(logger: slog::Logger) -> Self {
        LoggingSink { logger }
    }
}

impl<T: fmt::Debug> ResultSink<T> for LoggingSink {
    fn on_result(&self, result: ChildrenResult<T>) {
        let code = result.code();
        match result.outcome {
            Ok((ref children, ref stat)) => info!(self.logger, "get children result";
                "code" => code,
                "path" => &result.path,
                "ctx" => ?result.context,
                "children" => %children,
                "stat" => ?stat
            ),
            Err(ref e) => warn!(self.logger, "get children failed: {}", e;
                "code" => code,
                "path" => &result.path,
                "ctx" => ?result.context,
                "transient" => e.is_transient()
            ),
        }
    }
}
