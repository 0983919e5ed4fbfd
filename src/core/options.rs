//! Group-level options: naming, concurrency cap, deadline, interceptors,
//! error collection, and boundary logging.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::core::context::Context;
use crate::core::error::GroupError;
use crate::core::types::TaskError;

/// Group pre-execution interceptor; an error aborts the run before any
/// node is dispatched.
pub(crate) type GroupPreFn =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

/// Group post-execution interceptor; its return value replaces the run's
/// result.
pub(crate) type GroupAfterFn = Arc<
    dyn Fn(Context, Option<GroupError>) -> BoxFuture<'static, Option<GroupError>> + Send + Sync,
>;

/// A failing task report offered to the error collector channel.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// Label of the failing node or function.
    pub node: String,
    /// Rendered error message.
    pub message: String,
}

/// Behavior shared by every node of a group (and by the flat executor).
#[derive(Clone, Default)]
pub struct Options {
    pub(crate) prefix: Option<String>,
    pub(crate) limit: usize,
    pub(crate) timeout: Option<Duration>,
    pub(crate) pre: Option<GroupPreFn>,
    pub(crate) after: Option<GroupAfterFn>,
    pub(crate) error_sink: Option<mpsc::Sender<ErrorReport>>,
    pub(crate) with_log: bool,
}

impl Options {
    /// Options with defaults: prefix `anonymous`, no cap, no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name embedded in log events and timeout errors.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Concurrency cap; without one, the task count is the cap.
    ///
    /// # Panics
    ///
    /// Panics when `limit` is zero.
    pub fn limit(mut self, limit: usize) -> Self {
        if limit == 0 {
            panic!("limit must be positive");
        }
        self.limit = limit;
        self
    }

    /// Group deadline; elapsing yields a `group <prefix> timeout` error.
    ///
    /// # Panics
    ///
    /// Panics when the duration is zero.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            panic!("timeout must be positive");
        }
        self.timeout = Some(timeout);
        self
    }

    /// Hook run before any node is dispatched; an error aborts the run.
    pub fn pre<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.pre = Some(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    /// Hook run as the last step of every run; its return value replaces
    /// the result.
    pub fn after<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Option<GroupError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<GroupError>> + Send + 'static,
    {
        self.after = Some(Arc::new(move |ctx, err| f(ctx, err).boxed()));
        self
    }

    /// Channel offered a report for every failing task; reports are
    /// dropped rather than blocking when the channel is full.
    pub fn error_sink(mut self, sink: mpsc::Sender<ErrorReport>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Emit informational and error events at group and node boundaries.
    pub fn with_log(mut self) -> Self {
        self.with_log = true;
        self
    }

    pub(crate) fn prefix_str(&self) -> &str {
        self.prefix.as_deref().unwrap_or("anonymous")
    }

    pub(crate) fn effective_limit(&self, task_count: usize) -> usize {
        if self.limit > 0 {
            self.limit
        } else {
            task_count
        }
    }
}
