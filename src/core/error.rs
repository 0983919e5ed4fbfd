//! Error model: per-node failures folding their failed upstreams, and the
//! aggregated result of a whole run.
//!
//! A failing node records a [`Failure`] that references the recorded
//! failures of its failed dependencies, transitively. The run's final
//! error keeps only the leaves of that structure; every ancestor remains
//! reachable through [`Failure::chain`].

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::core::types::Key;
pub use crate::core::types::TaskError;

/// A node's recorded error together with the failures of its failed
/// upstream dependencies.
#[derive(Debug, Clone)]
pub struct Failure {
    key: Option<Key>,
    error: Arc<dyn StdError + Send + Sync + 'static>,
    upstreams: Vec<Failure>,
}

impl Failure {
    pub(crate) fn new(key: Option<Key>, error: TaskError, upstreams: Vec<Failure>) -> Self {
        Self {
            key,
            error: Arc::from(error),
            upstreams,
        }
    }

    /// Key of the node that recorded this failure, if it had one.
    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// The node's own error, before upstream folding.
    pub fn error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.error.as_ref()
    }

    /// Failures of the node's failed dependencies.
    pub fn upstreams(&self) -> &[Failure] {
        &self.upstreams
    }

    /// Walk this failure's own error and every upstream error, transitively.
    pub fn chain(&self) -> impl Iterator<Item = &(dyn StdError + Send + Sync + 'static)> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let next = stack.pop()?;
            stack.extend(next.upstreams.iter());
            Some(next.error.as_ref())
        })
    }

    /// Find the first error in the chain that downcasts to `E`.
    pub fn find<E: StdError + 'static>(&self) -> Option<&E> {
        self.chain().find_map(|e| e.downcast_ref::<E>())
    }

    /// Whether any error in the chain downcasts to `E`.
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.find::<E>().is_some()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upstreams.as_slice() {
            [] => write!(f, "{}", self.error),
            [up] => write!(f, "{} <- {}", self.error, up),
            many => {
                write!(f, "{} <- [", self.error)?;
                for (i, up) in many.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{up}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.error.as_ref() as &(dyn StdError + 'static))
    }
}

/// Error recorded when a per-node deadline elapses.
#[derive(Debug, Error)]
#[error("node {node} timeout")]
pub struct NodeTimeout {
    /// Label of the node that timed out.
    pub node: String,
}

/// A rollback hook that itself failed during unwinding.
#[derive(Debug, Clone)]
pub struct RollbackFailure {
    node: String,
    error: Arc<dyn StdError + Send + Sync + 'static>,
}

impl RollbackFailure {
    pub(crate) fn new(node: String, error: TaskError) -> Self {
        Self {
            node,
            error: Arc::from(error),
        }
    }

    /// Label of the node whose rollback failed.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// The error returned by the rollback hook.
    pub fn error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.error.as_ref()
    }
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rollback {} failed: {}", self.node, self.error)
    }
}

impl StdError for RollbackFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.error.as_ref() as &(dyn StdError + 'static))
    }
}

/// Aggregated result of a run.
#[derive(Debug)]
pub enum GroupError {
    /// One or more nodes failed. The entries are the leaf failures: nodes
    /// with a recorded error none of whose successors recorded one.
    Failed(Vec<Failure>),

    /// The group deadline elapsed while nodes were still running.
    Timeout {
        /// Group prefix, embedded in the error text.
        prefix: String,
    },

    /// The caller's context was cancelled before the run could finish.
    Cancelled,

    /// A configured limit is smaller than the number of submitted tasks.
    LimitExceeded,

    /// An error surfaced unchanged from a task or a group interceptor.
    Other(Arc<dyn StdError + Send + Sync + 'static>),

    /// The run failed and one or more rollback hooks failed while
    /// unwinding; both remain individually inspectable.
    Rollback {
        /// The error that triggered the unwinding.
        source: Box<GroupError>,
        /// The rollback hooks that failed, in unwinding order.
        rollback: Vec<RollbackFailure>,
    },
}

impl GroupError {
    /// Wrap an arbitrary error, e.g. to inject one from an `after` hook.
    pub fn other(err: TaskError) -> Self {
        GroupError::Other(Arc::from(err))
    }

    /// Leaf failures of a [`GroupError::Failed`] result (also reachable
    /// through a [`GroupError::Rollback`] wrapper). Empty otherwise.
    pub fn failures(&self) -> &[Failure] {
        match self {
            GroupError::Failed(failures) => failures,
            GroupError::Rollback { source, .. } => source.failures(),
            _ => &[],
        }
    }

    /// Rollback hooks that failed during unwinding, if any.
    pub fn rollback_failures(&self) -> &[RollbackFailure] {
        match self {
            GroupError::Rollback { rollback, .. } => rollback,
            _ => &[],
        }
    }

    /// Find the first error anywhere in this result that downcasts to `E`.
    ///
    /// Searches the leaf failures and their upstream chains, rollback
    /// errors, and interceptor-surfaced errors.
    pub fn find<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            GroupError::Failed(failures) => failures.iter().find_map(|f| f.find::<E>()),
            GroupError::Other(e) => e.downcast_ref::<E>(),
            GroupError::Rollback { source, rollback } => source.find::<E>().or_else(|| {
                rollback
                    .iter()
                    .find_map(|r| r.error.as_ref().downcast_ref::<E>())
            }),
            _ => None,
        }
    }

    /// Whether any error in this result downcasts to `E`.
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.find::<E>().is_some()
    }

    /// Whether this is a group-deadline timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, GroupError::Timeout { .. })
    }
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupError::Failed(failures) => {
                for (i, failure) in failures.iter().enumerate() {
                    if i > 0 {
                        f.write_str("\n")?;
                    }
                    write!(f, "{failure}")?;
                }
                Ok(())
            }
            GroupError::Timeout { prefix } => write!(f, "group {prefix} timeout"),
            GroupError::Cancelled => f.write_str("context cancelled"),
            GroupError::LimitExceeded => {
                f.write_str("limit cannot be less than the number of funcs")
            }
            GroupError::Other(e) => write!(f, "{e}"),
            GroupError::Rollback { source, rollback } => {
                write!(f, "{source}")?;
                for failure in rollback {
                    write!(f, "\n{failure}")?;
                }
                Ok(())
            }
        }
    }
}

impl StdError for GroupError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            GroupError::Failed(failures) => failures
                .first()
                .map(|fail| fail as &(dyn StdError + 'static)),
            GroupError::Other(e) => Some(e.as_ref() as &(dyn StdError + 'static)),
            GroupError::Rollback { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
