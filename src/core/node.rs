//! Node records, the chainable builder handle, and the `Task` capability
//! trait adapted by [`Group::add_node`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::core::context::Context;
use crate::core::error::{Failure, GroupError};
use crate::core::group::Group;
use crate::core::types::{Key, Shared, StoreValue, TaskError};

/// Normalized task body: every adder shape collapses to this signature at
/// construction time.
pub(crate) type TaskFn =
    Arc<dyn Fn(Context, Shared) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

/// Node-level pre-execution interceptor.
pub(crate) type NodePreFn =
    Arc<dyn Fn(Context, Shared) -> BoxFuture<'static, Result<(), TaskError>> + Send + Sync>;

/// Node-level post-execution interceptor; its return value replaces the
/// task's error.
pub(crate) type NodeAfterFn = Arc<
    dyn Fn(Context, Shared, Option<TaskError>) -> BoxFuture<'static, Option<TaskError>>
        + Send
        + Sync,
>;

/// Compensation hook invoked while unwinding a failed run.
pub(crate) type RollbackFn = Arc<
    dyn Fn(Context, Shared, Option<Failure>) -> BoxFuture<'static, Result<(), TaskError>>
        + Send
        + Sync,
>;

/// Per-node behavior configured through the builder.
#[derive(Default)]
pub(crate) struct NodeSpec {
    pub(crate) fast_fail: bool,
    pub(crate) retry: u32,
    pub(crate) pre: Option<NodePreFn>,
    pub(crate) after: Option<NodeAfterFn>,
    pub(crate) rollback: Option<RollbackFn>,
    pub(crate) timeout: Option<Duration>,
}

pub(crate) struct Node {
    pub(crate) idx: usize,
    pub(crate) key: Option<Key>,
    pub(crate) f: TaskFn,
    /// Dependency indices, strong and weak.
    pub(crate) deps: Vec<usize>,
    /// All successor indices.
    pub(crate) to: Vec<usize>,
    /// Successors that depend on this node weakly.
    pub(crate) weak_to: Vec<usize>,
    pub(crate) spec: NodeSpec,
}

impl Node {
    pub(crate) fn label(&self) -> String {
        match &self.key {
            Some(key) => key.to_string(),
            None => format!("#{}", self.idx),
        }
    }
}

/// A self-describing task that can be added to a group in one call.
///
/// Implement this to package a node's key, dependencies, and body in one
/// value; [`Group::add_node`] adapts it into the builder.
#[async_trait]
pub trait Task: Send + Sync {
    /// The node's key.
    fn key(&self) -> Key;

    /// Keys this task strongly depends on.
    fn dependencies(&self) -> Vec<Key> {
        Vec::new()
    }

    /// Keys this task weakly depends on.
    fn weak_dependencies(&self) -> Vec<Key> {
        Vec::new()
    }

    /// Execute the task.
    async fn exec(&self, ctx: Context, shared: Shared) -> Result<(), TaskError>;
}

/// Chainable handle for the node most recently added to a group.
///
/// Re-exposes the group's adders so builder chains continue without
/// naming the group again.
pub struct NodeRef<'g> {
    pub(crate) group: &'g mut Group,
    pub(crate) idx: usize,
}

impl<'g> NodeRef<'g> {
    /// Index of this node within the group.
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Assign the node's key.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate key within the group.
    pub fn key(self, key: impl Into<Key>) -> Self {
        self.group.set_key(self.idx, key.into());
        self
    }

    /// Declare strong dependencies: this node runs only after every named
    /// node succeeded.
    ///
    /// # Panics
    ///
    /// Panics on an unknown or duplicate dependency key.
    pub fn dep<I, K>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        self.group.add_edges(self.idx, keys, false);
        self
    }

    /// Declare weak dependencies: this node runs after every named node
    /// completed, regardless of their success.
    ///
    /// # Panics
    ///
    /// Panics on an unknown or duplicate dependency key.
    pub fn weak_dep<I, K>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        self.group.add_edges(self.idx, keys, true);
        self
    }

    /// Mark the node fast-fail: its error cancels the whole run.
    pub fn fast_fail(mut self) -> Self {
        self.node_mut().spec.fast_fail = true;
        self
    }

    /// Retry the body up to `times` more attempts on error, no backoff.
    pub fn with_retry(mut self, times: u32) -> Self {
        self.node_mut().spec.retry = times;
        self
    }

    /// Per-node deadline; elapsing yields a `node <key> timeout` error.
    ///
    /// # Panics
    ///
    /// Panics when the duration is zero.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            panic!("timeout must be positive");
        }
        self.node_mut().spec.timeout = Some(timeout);
        self
    }

    /// Hook run once before the body (outside the retry loop); an error
    /// skips the body and becomes the node's error.
    pub fn with_pre<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Shared) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.node_mut().spec.pre = Some(Arc::new(move |ctx, shared| f(ctx, shared).boxed()));
        self
    }

    /// Hook run once after the body (after all retries); receives the raw
    /// task error and its return value replaces it.
    pub fn with_after<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Shared, Option<TaskError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<TaskError>> + Send + 'static,
    {
        self.node_mut().spec.after =
            Some(Arc::new(move |ctx, shared, err| f(ctx, shared, err).boxed()));
        self
    }

    /// Compensation invoked in reverse completion order when the run
    /// ultimately fails; receives the node's recorded failure, if any.
    pub fn with_rollback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Shared, Option<Failure>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.node_mut().spec.rollback =
            Some(Arc::new(move |ctx, shared, failure| f(ctx, shared, failure).boxed()));
        self
    }

    /// Continue the chain: add a task that takes neither context nor shared.
    pub fn add_runner<F, Fut>(self, f: F) -> NodeRef<'g>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.group.add_runner(f)
    }

    /// Continue the chain: add a task that takes the context.
    pub fn add_task<F, Fut>(self, f: F) -> NodeRef<'g>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.group.add_task(f)
    }

    /// Continue the chain: add a task that takes the context and the
    /// shared payload.
    pub fn add_shared_task<F, Fut>(self, f: F) -> NodeRef<'g>
    where
        F: Fn(Context, Shared) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.group.add_shared_task(f)
    }

    /// Continue the chain: adapt a [`Task`] implementation.
    pub fn add_node(self, task: Arc<dyn Task>) -> NodeRef<'g> {
        self.group.add_node(task)
    }

    /// Check the group for dependency cycles; see [`Group::verify`].
    pub fn verify(self, panicking: bool) -> Self {
        self.group.verify(panicking);
        self
    }

    /// Execute the group; see [`Group::go`].
    pub async fn go(self, ctx: Context) -> Result<(), GroupError> {
        self.group.go(ctx).await
    }

    /// Execute the group with a shared payload; see [`Group::go_shared`].
    pub async fn go_shared(
        self,
        ctx: Context,
        shared: Vec<StoreValue>,
    ) -> Result<(), GroupError> {
        self.group.go_shared(ctx, shared).await
    }

    fn node_mut(&mut self) -> &mut Node {
        self.group.node_mut(self.idx)
    }
}
