//! Flat executor: run an unstructured list of independent tasks under the
//! same options, interceptor, timeout, and crash-trap machinery as the
//! graph scheduler. No dependencies, no retries, no rollback.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, info_span, Instrument};

use crate::core::context::Context;
use crate::core::error::GroupError;
use crate::core::options::{ErrorReport, Options};
use crate::core::types::TaskError;
use crate::execution::safe::safe_run;

/// A task accepted by the flat executor.
pub type Runner = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), TaskError>> + Send>;

/// Box an async closure into a [`Runner`].
pub fn runner<F, Fut>(f: F) -> Runner
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

/// Run every task, blocking submission while the pool is saturated, and
/// return when all complete or the group deadline fires.
///
/// The first task error cancels the derived scope; not-yet-admitted tasks
/// observe the cancellation on entry and do not run their bodies.
pub async fn go(ctx: Context, opts: &Options, tasks: Vec<Runner>) -> Result<(), GroupError> {
    run_flat(ctx, opts, tasks, false).await.1
}

/// Like [`go`], but admission is non-blocking: tasks that cannot acquire
/// a pool slot immediately are not run at all. Returns whether every task
/// was accepted, and still waits on the ones that were.
pub async fn try_go(
    ctx: Context,
    opts: &Options,
    tasks: Vec<Runner>,
) -> (bool, Result<(), GroupError>) {
    run_flat(ctx, opts, tasks, true).await
}

struct FlatState {
    ctx: Context,
    semaphore: Arc<Semaphore>,
    prefix: String,
    with_log: bool,
    error_sink: Option<mpsc::Sender<ErrorReport>>,
    done_tx: mpsc::UnboundedSender<Option<GroupError>>,
}

async fn run_flat(
    ctx: Context,
    opts: &Options,
    tasks: Vec<Runner>,
    non_blocking: bool,
) -> (bool, Result<(), GroupError>) {
    if tasks.is_empty() {
        return (true, Ok(()));
    }
    let count = tasks.len();
    if opts.limit > 0 && opts.limit < count {
        return (false, Err(GroupError::LimitExceeded));
    }

    let started = Instant::now();
    let prefix = opts.prefix_str().to_string();
    let group_ctx = ctx.child();

    if let Some(pre) = &opts.pre {
        if let Err(err) = pre(group_ctx.clone()).await {
            if opts.with_log {
                error!(group = %prefix, error = %err, "group pre interceptor failed");
            }
            return (false, Err(GroupError::other(err)));
        }
    }

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let state = Arc::new(FlatState {
        ctx: group_ctx.clone(),
        semaphore: Arc::new(Semaphore::new(opts.effective_limit(count))),
        prefix: prefix.clone(),
        with_log: opts.with_log,
        error_sink: opts.error_sink.clone(),
        done_tx,
    });

    let mut all_accepted = true;
    let mut spawned = 0_usize;
    for (index, task) in tasks.into_iter().enumerate() {
        if non_blocking {
            match state.semaphore.clone().try_acquire_owned() {
                Ok(permit) => {
                    spawn_func(Arc::clone(&state), index, task, Some(permit));
                    spawned += 1;
                }
                Err(_) => all_accepted = false,
            }
        } else {
            spawn_func(Arc::clone(&state), index, task, None);
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
                if let Some(err) = outcome {
                    let replace = match &first_err {
                        None => true,
                        // a real task error outranks cancellation noise
                        Some(GroupError::Cancelled) => !matches!(err, GroupError::Cancelled),
                        _ => false,
                    };
                    if replace {
                        first_err = Some(err);
                    }
                }
            }
        };
        tokio::pin!(drive);
        match opts.timeout {
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

    let mut err = if timed_out {
        if opts.with_log {
            info!(group = %prefix, "group timeout");
        }
        Some(GroupError::Timeout {
            prefix: prefix.clone(),
        })
    } else {
        first_err
    };

    if let Some(after) = &opts.after {
        err = after(group_ctx.clone(), err).await;
    }

    if opts.with_log {
        info!(
            group = %prefix,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "group done"
        );
        if let Some(e) = &err {
            error!(group = %prefix, error = %e, "group failed");
        }
    }

    let result = match err {
        Some(e) => Err(e),
        None => Ok(()),
    };
    (all_accepted, result)
}

fn spawn_func(state: Arc<FlatState>, index: usize, task: Runner, permit: Option<OwnedSemaphorePermit>) {
    let span = info_span!("func", group = %state.prefix, func = index);
    let done_tx = state.done_tx.clone();
    tokio::spawn(
        async move {
            let outcome = std::panic::AssertUnwindSafe(run_func(state, index, task, permit))
                .catch_unwind()
                .await
                .unwrap_or(None);
            let _ = done_tx.send(outcome);
        }
        .instrument(span),
    );
}

async fn run_func(
    state: Arc<FlatState>,
    index: usize,
    task: Runner,
    permit: Option<OwnedSemaphorePermit>,
) -> Option<GroupError> {
    let _permit = match permit {
        Some(permit) => permit,
        None => match state.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Some(GroupError::Cancelled),
        },
    };
    if state.ctx.is_cancelled() {
        return Some(GroupError::Cancelled);
    }

    let started = Instant::now();
    let result = safe_run(task()).await;

    if state.with_log {
        info!(
            group = %state.prefix,
            func = index,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "func done"
        );
        if let Err(e) = &result {
            error!(group = %state.prefix, func = index, error = %e, "func failed");
        }
    }

    match result {
        Ok(()) => None,
        Err(err) => {
            if let Some(sink) = &state.error_sink {
                let _ = sink.try_send(ErrorReport {
                    node: format!("func #{index}"),
                    message: err.to_string(),
                });
            }
            // first error cancels the siblings' scope
            state.ctx.cancel();
            Some(GroupError::other(err))
        }
    }
}
