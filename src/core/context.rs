//! Execution context: the cancellation scope and the store bridge that the
//! engine threads through every task invocation.
//!
//! Tasks publish outputs under their own node key with [`Context::store`]
//! and read upstream outputs with [`Context::fetch`]; the backing
//! [`Storer`] is attached by the caller before the run starts.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::types::{Key, StoreValue};
use crate::store::Storer;

type PublishFn = Arc<dyn Fn(StoreValue) + Send + Sync>;

/// Cancellation scope plus the optional key/value store, cloned into every
/// task, interceptor, and rollback invocation of a run.
#[derive(Clone)]
pub struct Context {
    cancel: CancellationToken,
    store: Option<Arc<dyn Storer>>,
    publish: Option<PublishFn>,
}

impl Context {
    /// Create a fresh, uncancelled context with no store attached.
    pub fn new() -> Self {
        Self::from_token(CancellationToken::new())
    }

    /// Create a context driven by an existing cancellation token.
    pub fn from_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            store: None,
            publish: None,
        }
    }

    /// Attach a store so tasks can publish and fetch values.
    pub fn with_store(mut self, store: Arc<dyn Storer>) -> Self {
        self.store = Some(store);
        self
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether this scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until this scope is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Cancel this scope and everything derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Publish a value under the current node's key.
    ///
    /// # Panics
    ///
    /// Panics when called outside a keyed node running under a
    /// store-carrying context; that is a wiring error in the caller.
    pub fn store<V: Send + Sync + 'static>(&self, value: V) {
        match &self.publish {
            Some(publish) => publish(Arc::new(value)),
            None => panic!("missing store func in context"),
        }
    }

    /// Write a value under an explicit key, bypassing the per-node hook.
    ///
    /// # Panics
    ///
    /// Panics when no store is attached to the context.
    pub fn put<K: Into<Key>, V: Send + Sync + 'static>(&self, key: K, value: V) {
        match &self.store {
            Some(store) => store.store(key.into(), Arc::new(value)),
            None => panic!("missing store in context"),
        }
    }

    /// Look up a value by key, downcasting it to `T`.
    ///
    /// Returns `None` when no store is attached, the key is absent, or the
    /// stored value has a different type.
    pub fn fetch<T: Clone + Send + Sync + 'static, K: Into<Key>>(&self, key: K) -> Option<T> {
        let value = self.store.as_ref()?.load(&key.into())?;
        value.downcast_ref::<T>().cloned()
    }

    pub(crate) fn storer(&self) -> Option<&Arc<dyn Storer>> {
        self.store.as_ref()
    }

    /// Derive a child scope: cancelled with this one, cancellable on its own.
    pub(crate) fn child(&self) -> Context {
        Context {
            cancel: self.cancel.child_token(),
            store: self.store.clone(),
            publish: self.publish.clone(),
        }
    }

    /// Derive a scope with cancellation stripped; the store stays attached.
    pub(crate) fn detached(&self) -> Context {
        Context {
            cancel: CancellationToken::new(),
            store: self.store.clone(),
            publish: None,
        }
    }

    pub(crate) fn with_publish(&self, publish: PublishFn) -> Context {
        Context {
            cancel: self.cancel.clone(),
            store: self.store.clone(),
            publish: Some(publish),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
