//! Fluent graph builder: add tasks, assign keys, declare strong and weak
//! dependencies, detect cycles.
//!
//! Construction errors are programmer errors and panic eagerly; only
//! acyclicity is deferred to [`Group::verify`] because it needs the whole
//! graph.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;

use crate::core::context::Context;
use crate::core::node::{Node, NodeRef, NodeSpec, Task, TaskFn};
use crate::core::options::Options;
use crate::core::types::{Key, Shared, TaskError};

/// A set of tasks and their dependency edges, built fluently and executed
/// with [`Group::go`].
///
/// The graph is immutable while a run is in flight; several runs may
/// execute the same group concurrently as long as no task mutates shared
/// data without synchronization.
#[derive(Default)]
pub struct Group {
    pub(crate) nodes: Vec<Arc<Node>>,
    pub(crate) index: HashMap<Key, usize>,
    pub(crate) options: Options,
}

impl Group {
    /// An empty group with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty group with the given options.
    pub fn with_options(options: Options) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Number of nodes added so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the group has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a task that takes neither context nor shared payload.
    pub fn add_runner<F, Fut>(&mut self, f: F) -> NodeRef<'_>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.push(Arc::new(move |_ctx, _shared| f().boxed()))
    }

    /// Add a task that takes the execution context.
    pub fn add_task<F, Fut>(&mut self, f: F) -> NodeRef<'_>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.push(Arc::new(move |ctx, _shared| f(ctx).boxed()))
    }

    /// Add a task that takes the context and the shared payload.
    pub fn add_shared_task<F, Fut>(&mut self, f: F) -> NodeRef<'_>
    where
        F: Fn(Context, Shared) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.push(Arc::new(move |ctx, shared| f(ctx, shared).boxed()))
    }

    /// Adapt a [`Task`] implementation: its key and declared dependencies
    /// are applied as if chained through the builder.
    pub fn add_node(&mut self, task: Arc<dyn Task>) -> NodeRef<'_> {
        let key = task.key();
        let deps = task.dependencies();
        let weak = task.weak_dependencies();

        let body = Arc::clone(&task);
        let node = self
            .push(Arc::new(move |ctx, shared| {
                let body = Arc::clone(&body);
                async move { body.exec(ctx, shared).await }.boxed()
            }))
            .key(key);
        node.dep(deps).weak_dep(weak)
    }

    /// Look up a previously added node by key for further chaining.
    pub fn node(&mut self, key: impl Into<Key>) -> Option<NodeRef<'_>> {
        let idx = *self.index.get(&key.into())?;
        Some(NodeRef { group: self, idx })
    }

    /// Walk the keyed sub-graph looking for a dependency cycle.
    ///
    /// Returns a human-readable path such as
    /// `dependency cycle detected: "a" -> "c" -> "b" -> "a"`, or `None`
    /// when the graph is acyclic. With `panicking`, panics with that
    /// message instead. Not invoked automatically by [`Group::go`].
    pub fn verify(&self, panicking: bool) -> Option<String> {
        // 0 = unvisited, 1 = on the current path, 2 = done
        let mut state = vec![0_u8; self.nodes.len()];
        for node in &self.nodes {
            if node.key.is_none() || state[node.idx] != 0 {
                continue;
            }
            if let Some(path) = self.cycle_path(node.idx, &mut state) {
                let msg = format!("dependency cycle detected: {path}");
                if panicking {
                    panic!("{msg}");
                }
                return Some(msg);
            }
        }
        None
    }

    fn cycle_path(&self, idx: usize, state: &mut [u8]) -> Option<String> {
        let key = self.nodes[idx].key.as_ref()?;
        match state[idx] {
            1 => return Some(format!("{:?}", key.as_str())),
            2 => return None,
            _ => {}
        }
        state[idx] = 1;
        for &dep in &self.nodes[idx].deps {
            if let Some(path) = self.cycle_path(dep, state) {
                return Some(format!("{:?} -> {}", key.as_str(), path));
            }
        }
        state[idx] = 2;
        None
    }

    fn push(&mut self, f: TaskFn) -> NodeRef<'_> {
        let idx = self.nodes.len();
        self.nodes.push(Arc::new(Node {
            idx,
            key: None,
            f,
            deps: Vec::new(),
            to: Vec::new(),
            weak_to: Vec::new(),
            spec: NodeSpec::default(),
        }));
        NodeRef { group: self, idx }
    }

    pub(crate) fn set_key(&mut self, idx: usize, key: Key) {
        if self.index.contains_key(&key) {
            panic!("duplicate node key {:?}", key.as_str());
        }
        self.index.insert(key.clone(), idx);
        self.node_mut(idx).key = Some(key);
    }

    pub(crate) fn add_edges<I, K>(&mut self, idx: usize, keys: I, weak: bool)
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        for key in keys {
            let key = key.into();
            let Some(&dep_idx) = self.index.get(&key) else {
                panic!(
                    "missing dependency {:?} -> {:?}",
                    self.nodes[idx].label(),
                    key.as_str()
                );
            };
            if self.nodes[idx].deps.contains(&dep_idx) {
                panic!(
                    "duplicate dependency {:?} -> {:?}",
                    self.nodes[idx].label(),
                    key.as_str()
                );
            }
            self.node_mut(idx).deps.push(dep_idx);
            let parent = self.node_mut(dep_idx);
            parent.to.push(idx);
            if weak {
                parent.weak_to.push(idx);
            }
        }
    }

    pub(crate) fn node_mut(&mut self, idx: usize) -> &mut Node {
        Arc::get_mut(&mut self.nodes[idx])
            .expect("cannot mutate a node while the group is executing")
    }
}
