//! Append-only record of completed nodes that declared a rollback,
//! unwound in reverse completion order when a run ultimately fails.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use crate::core::context::Context;
use crate::core::error::{Failure, RollbackFailure};
use crate::core::node::Node;
use crate::core::types::Shared;

pub(crate) struct RollbackTracker {
    slots: Vec<OnceLock<usize>>,
    count: AtomicU32,
}

impl RollbackTracker {
    /// `capacity` is the number of nodes in the group that declared a
    /// rollback; only those are ever tracked.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| OnceLock::new()).collect(),
            count: AtomicU32::new(0),
        }
    }

    /// Record a node whose body ran to completion, success or failure.
    pub(crate) fn track(&self, idx: usize) {
        let slot = self.count.fetch_add(1, Ordering::AcqRel) as usize;
        if let Some(cell) = self.slots.get(slot) {
            let _ = cell.set(idx);
        }
    }

    /// Invoke tracked rollbacks in reverse completion order.
    ///
    /// `ctx` must already be stripped of cancellation so compensation is
    /// not aborted by the failure that triggered it.
    pub(crate) async fn unwind(
        &self,
        ctx: Context,
        shared: Shared,
        nodes: &[Arc<Node>],
        errs: &[OnceLock<Failure>],
    ) -> Vec<RollbackFailure> {
        let total = (self.count.load(Ordering::Acquire) as usize).min(self.slots.len());
        let mut failures = Vec::new();
        for slot in (0..total).rev() {
            let Some(&idx) = self.slots[slot].get() else {
                continue;
            };
            let node = &nodes[idx];
            let Some(rollback) = &node.spec.rollback else {
                continue;
            };
            let failure = errs[idx].get().cloned();
            if let Err(err) = rollback(ctx.clone(), shared.clone(), failure).await {
                failures.push(RollbackFailure::new(node.label(), err));
            }
        }
        failures
    }
}
