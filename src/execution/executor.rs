//! The dependency-aware scheduler behind [`Group::go`].
//!
//! Dispatch is driven by indegree counters: root nodes are seeded onto a
//! bounded worker pool, and a finishing node decrements the counters of
//! its successors, enqueueing those that reach zero. A successful node
//! releases all of its successors; a failed node releases only the weak
//! ones, so strong dependents of a failure are never dispatched.
//!
//! Workers are detached tasks reporting over a completion channel rather
//! than joined handles: when the group deadline fires, `go` returns while
//! in-flight nodes keep running against the cancelled scope, so their
//! `after` hooks still observe the cancellation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, info_span, Instrument};

use crate::core::context::Context;
use crate::core::error::{Failure, GroupError, NodeTimeout};
use crate::core::group::Group;
use crate::core::node::Node;
use crate::core::options::ErrorReport;
use crate::core::types::{Shared, StoreValue, TaskError};
use crate::execution::rollback::RollbackTracker;
use crate::execution::safe::safe_run;

pub(crate) enum WorkerOutcome {
    Completed,
    /// A fast-fail node recorded this failure and cancelled the run scope.
    FastFail(Failure),
    /// The worker observed a cancelled scope before running its body.
    Cancelled,
}

/// Everything a worker needs, shared across the whole run.
struct RunState {
    nodes: Vec<Arc<Node>>,
    indegree: Vec<AtomicU32>,
    errs: Vec<OnceLock<Failure>>,
    tracker: Option<RollbackTracker>,
    semaphore: Arc<Semaphore>,
    ctx: Context,
    shared: Shared,
    prefix: String,
    with_log: bool,
    error_sink: Option<mpsc::Sender<ErrorReport>>,
    ready_tx: mpsc::UnboundedSender<usize>,
    done_tx: mpsc::UnboundedSender<WorkerOutcome>,
}

impl Group {
    /// Execute the graph and return the aggregated result.
    ///
    /// Equivalent to [`Group::go_shared`] with an empty payload.
    pub async fn go(&self, ctx: Context) -> Result<(), GroupError> {
        self.go_shared(ctx, Vec::new()).await
    }

    /// Execute the graph, threading a shared payload into every task.
    ///
    /// An empty `shared` means tasks see `None`; a single element is
    /// passed as-is; more than one element is passed as the whole list.
    /// Multiple shared values are not recommended.
    pub async fn go_shared(
        &self,
        ctx: Context,
        shared: Vec<StoreValue>,
    ) -> Result<(), GroupError> {
        if self.nodes.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let prefix = self.options.prefix_str().to_string();
        let group_ctx = ctx.child();

        if let Some(pre) = &self.options.pre {
            if let Err(err) = pre(group_ctx.clone()).await {
                if self.options.with_log {
                    error!(group = %prefix, error = %err, "group pre interceptor failed");
                }
                return Err(GroupError::other(err));
            }
        }

        let shared = pack_shared(shared);
        let rollback_count = self
            .nodes
            .iter()
            .filter(|n| n.spec.rollback.is_some())
            .count();

        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RunState {
            nodes: self.nodes.clone(),
            indegree: self
                .nodes
                .iter()
                .map(|n| AtomicU32::new(n.deps.len() as u32))
                .collect(),
            errs: self.nodes.iter().map(|_| OnceLock::new()).collect(),
            tracker: (rollback_count > 0).then(|| RollbackTracker::new(rollback_count)),
            semaphore: Arc::new(Semaphore::new(
                self.options.effective_limit(self.nodes.len()),
            )),
            ctx: group_ctx.clone(),
            shared: shared.clone(),
            prefix: prefix.clone(),
            with_log: self.options.with_log,
            error_sink: self.options.error_sink.clone(),
            ready_tx,
            done_tx,
        });

        let mut spawned = 0_usize;
        for node in &self.nodes {
            if node.deps.is_empty() {
                spawn_node(Arc::clone(&state), node.idx);
                spawned += 1;
            }
        }

        let mut first_err: Option<GroupError> = None;
        let mut timed_out = false;
        {
            let mut completed = 0_usize;
            let drive = async {
                while completed < spawned {
                    let Some(outcome) = done_rx.recv().await else {
                        break;
                    };
                    completed += 1;
                    match outcome {
                        WorkerOutcome::Completed => {}
                        WorkerOutcome::FastFail(failure) => {
                            // a fast-fail failure outranks cancellation noise
                            // from workers it woke up
                            if !matches!(first_err, Some(GroupError::Failed(_))) {
                                first_err = Some(GroupError::Failed(vec![failure]));
                            }
                        }
                        WorkerOutcome::Cancelled => {
                            if first_err.is_none() {
                                first_err = Some(GroupError::Cancelled);
                            }
                        }
                    }
                    while let Ok(idx) = ready_rx.try_recv() {
                        spawn_node(Arc::clone(&state), idx);
                        spawned += 1;
                    }
                }
            };
            tokio::pin!(drive);
            match self.options.timeout {
                Some(timeout) => {
                    let deadline = tokio::time::Instant::now() + timeout;
                    tokio::select! {
                        _ = &mut drive => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            group_ctx.cancel();
                            timed_out = true;
                        }
                    }
                }
                None => drive.await,
            }
        }

        let mut err: Option<GroupError> = if timed_out {
            if self.options.with_log {
                info!(group = %prefix, "group timeout");
            }
            Some(GroupError::Timeout {
                prefix: prefix.clone(),
            })
        } else {
            first_err.or_else(|| {
                let leaves = leaf_failures(&state.nodes, &state.errs);
                (!leaves.is_empty()).then_some(GroupError::Failed(leaves))
            })
        };

        // rollback is skipped when the group deadline itself fired
        if !timed_out && err.is_some() {
            if let Some(tracker) = &state.tracker {
                let rollback = tracker
                    .unwind(ctx.detached(), shared.clone(), &state.nodes, &state.errs)
                    .await;
                if !rollback.is_empty() {
                    if let Some(source) = err.take() {
                        err = Some(GroupError::Rollback {
                            source: Box::new(source),
                            rollback,
                        });
                    }
                }
            }
        }

        if let Some(after) = &self.options.after {
            err = after(group_ctx.clone(), err).await;
        }

        if self.options.with_log {
            info!(
                group = %prefix,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "group done"
            );
            if let Some(e) = &err {
                error!(group = %prefix, error = %e, "group failed");
            }
        }

        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn pack_shared(mut values: Vec<StoreValue>) -> Shared {
    match values.len() {
        0 => None,
        1 => values.pop(),
        _ => Some(Arc::new(values) as StoreValue),
    }
}

fn spawn_node(state: Arc<RunState>, idx: usize) {
    let span = info_span!(
        "node",
        group = %state.prefix,
        node = %state.nodes[idx].label(),
    );
    let done_tx = state.done_tx.clone();
    tokio::spawn(
        async move {
            let outcome = std::panic::AssertUnwindSafe(run_node(state, idx))
                .catch_unwind()
                .await
                .unwrap_or(WorkerOutcome::Completed);
            let _ = done_tx.send(outcome);
        }
        .instrument(span),
    );
}

async fn run_node(state: Arc<RunState>, idx: usize) -> WorkerOutcome {
    let Ok(_permit) = state.semaphore.clone().acquire_owned().await else {
        return WorkerOutcome::Cancelled;
    };
    if state.ctx.is_cancelled() {
        return WorkerOutcome::Cancelled;
    }

    let node = Arc::clone(&state.nodes[idx]);
    let label = node.label();
    let started = Instant::now();

    // bind the per-node publish hook for keyed nodes under a store
    let task_ctx = match (&node.key, state.ctx.storer()) {
        (Some(key), Some(store)) => {
            let key = key.clone();
            let store = Arc::clone(store);
            state
                .ctx
                .with_publish(Arc::new(move |value| store.store(key.clone(), value)))
        }
        _ => state.ctx.clone(),
    };
    let node_ctx = match node.spec.timeout {
        Some(_) => task_ctx.child(),
        None => task_ctx.clone(),
    };

    let body = {
        let node = Arc::clone(&node);
        let ctx = node_ctx.clone();
        let shared = state.shared.clone();
        let prefix = state.prefix.clone();
        let with_log = state.with_log;
        let label = label.clone();
        async move {
            if let Some(pre) = &node.spec.pre {
                pre(ctx.clone(), shared.clone()).await?;
            }
            let mut attempt = 0_u32;
            loop {
                match (node.f)(ctx.clone(), shared.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        attempt += 1;
                        if attempt > node.spec.retry {
                            return Err(err);
                        }
                        if with_log {
                            info!(group = %prefix, node = %label, attempt, "node retry");
                        }
                    }
                }
            }
        }
    };

    let guarded = safe_run(body);
    let mut err: Option<TaskError> = match node.spec.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, guarded).await {
            Ok(result) => result.err(),
            Err(_) => {
                node_ctx.cancel();
                Some(Box::new(NodeTimeout {
                    node: label.clone(),
                }))
            }
        },
        None => guarded.await.err(),
    };

    // boundary monitoring sees the raw error, before the after hook
    if state.with_log {
        info!(
            group = %state.prefix,
            node = %label,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "node done"
        );
        if let Some(e) = &err {
            error!(group = %state.prefix, node = %label, error = %e, "node failed");
        }
    }
    if let (Some(sink), Some(e)) = (&state.error_sink, &err) {
        let _ = sink.try_send(ErrorReport {
            node: label.clone(),
            message: e.to_string(),
        });
    }

    // only nodes whose bodies observably ran are tracked for rollback
    if node.spec.rollback.is_some() {
        if let Some(tracker) = &state.tracker {
            tracker.track(idx);
        }
    }

    if let Some(after) = &node.spec.after {
        err = after(task_ctx.clone(), state.shared.clone(), err).await;
    }

    let ok = err.is_none();
    if let Some(e) = err {
        let failure = wrap_failure(&node, e, &state.errs);
        let _ = state.errs[idx].set(failure.clone());
        if node.spec.fast_fail {
            // the pool's first-error-cancels discipline; successors are
            // not notified, the cancelled scope stops them instead
            state.ctx.cancel();
            return WorkerOutcome::FastFail(failure);
        }
    }

    // anonymous nodes cannot be depended on, nothing to notify
    if node.key.is_some() {
        let successors = if ok { &node.to } else { &node.weak_to };
        for &next in successors {
            if state.indegree[next].fetch_sub(1, Ordering::AcqRel) == 1 {
                let _ = state.ready_tx.send(next);
            }
        }
    }

    WorkerOutcome::Completed
}

/// Fold the recorded failures of a node's failed dependencies into its own.
fn wrap_failure(node: &Node, err: TaskError, errs: &[OnceLock<Failure>]) -> Failure {
    let upstreams = node
        .deps
        .iter()
        .filter_map(|&dep| errs[dep].get().cloned())
        .collect();
    Failure::new(node.key.clone(), err, upstreams)
}

/// Failures of nodes none of whose successors recorded a failure. Inner
/// failures are already folded into their failed descendants, so leaves
/// alone cover the whole failure set without double reporting.
fn leaf_failures(nodes: &[Arc<Node>], errs: &[OnceLock<Failure>]) -> Vec<Failure> {
    let mut leaves = Vec::new();
    for node in nodes {
        let Some(failure) = errs[node.idx].get() else {
            continue;
        };
        if node.to.iter().all(|&next| errs[next].get().is_none()) {
            leaves.push(failure.clone());
        }
    }
    leaves
}
