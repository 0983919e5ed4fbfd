//! End-to-end scheduler tests: dependency ordering, strong/weak edges,
//! fast-fail, retries, timeouts, interceptors, and rollback.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;

use common::{assert_elapsed, STEP};
use dagrun::{Context, Group, GroupError, NodeTimeout, Options, PanicError, TaskError};

#[derive(Debug, Error)]
#[error("F_ERR")]
struct FErr;

#[derive(Debug, Error)]
#[error("X_ERR")]
struct XErr;

/// Value cells mirroring a small data-preparation pipeline:
/// a -> {b, c} -> d, where d folds the results of b and c.
#[derive(Default)]
struct Cells {
    a: AtomicU32,
    b: AtomicU32,
    c: AtomicU32,
    d: AtomicU32,
    x: AtomicU32,
}

fn diamond(cells: &Arc<Cells>) -> Group {
    let mut g = Group::new();
    let c = Arc::clone(cells);
    g.add_runner(move || {
        let c = Arc::clone(&c);
        async move {
            sleep(STEP).await;
            c.a.store(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .key("a");
    let c = Arc::clone(cells);
    g.add_runner(move || {
        let c = Arc::clone(&c);
        async move {
            sleep(STEP).await;
            c.b.store(c.a.load(Ordering::SeqCst) + 1, Ordering::SeqCst);
            Ok(())
        }
    })
    .key("b")
    .dep(["a"]);
    let c = Arc::clone(cells);
    g.add_runner(move || {
        let c = Arc::clone(&c);
        async move {
            sleep(2 * STEP).await;
            c.c.store(c.a.load(Ordering::SeqCst) + 1, Ordering::SeqCst);
            Ok(())
        }
    })
    .key("c")
    .dep(["a"]);
    let c = Arc::clone(cells);
    g.add_runner(move || {
        let c = Arc::clone(&c);
        async move {
            sleep(STEP).await;
            c.d.store(
                c.b.load(Ordering::SeqCst) + c.c.load(Ordering::SeqCst),
                Ordering::SeqCst,
            );
            Ok(())
        }
    })
    .key("d")
    .dep(["b", "c"]);
    g
}

#[tokio::test]
async fn test_diamond_runs_in_dependency_order() {
    let cells = Arc::new(Cells::default());
    let mut g = diamond(&cells);
    // anonymous node, runs once a, b, and c are done
    let c = Arc::clone(&cells);
    g.add_runner(move || {
        let c = Arc::clone(&c);
        async move {
            c.x.store(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .dep(["a", "b", "c"]);

    let started = Instant::now();
    g.go(Context::new()).await.expect("diamond should succeed");

    // a (1) + max(b, c) (2) + d (1)
    assert_elapsed(started.elapsed(), 4 * STEP);
    assert_eq!(cells.d.load(Ordering::SeqCst), 4);
    assert_eq!(cells.x.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_group_succeeds_immediately() {
    let g = Group::new();
    assert!(g.go(Context::new()).await.is_ok());
}

#[tokio::test]
async fn test_group_reruns_with_fresh_state() {
    let count = Arc::new(AtomicU32::new(0));
    let mut g = Group::new();
    let n = Arc::clone(&count);
    g.add_runner(move || {
        let n = Arc::clone(&n);
        async move {
            n.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .key("a");

    g.go(Context::new()).await.expect("first run");
    g.go(Context::new()).await.expect("second run");
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_runs_on_one_group() {
    let mut g = Group::new();
    g.add_runner(|| async { Ok(()) })
        .key("a")
        .add_runner(|| async { Ok(()) })
        .key("b")
        .dep(["a"])
        .add_runner(|| async { Ok(()) })
        .key("c")
        .dep(["a"])
        .add_runner(|| async { Ok(()) })
        .key("d")
        .dep(["b", "c"]);

    let (left, right) = tokio::join!(g.go(Context::new()), g.go(Context::new()));
    assert!(left.is_ok());
    assert!(right.is_ok());
}

#[tokio::test]
async fn test_limit_serializes_independent_nodes() {
    let mut g = Group::with_options(Options::new().limit(1));
    g.add_runner(|| async {
        sleep(STEP).await;
        Ok(())
    })
    .add_runner(|| async {
        sleep(STEP).await;
        Ok(())
    });

    let started = Instant::now();
    g.go(Context::new()).await.expect("should succeed");
    assert!(
        started.elapsed() >= 2 * STEP,
        "limit 1 must serialize execution"
    );
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut g = Group::with_options(Options::new().limit(2));
    for _ in 0..6 {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        g.add_runner(move || {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(30)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }

    g.go(Context::new()).await.expect("should succeed");
    assert!(peak.load(Ordering::SeqCst) <= 2, "limit 2 exceeded");
}

#[tokio::test]
async fn test_upstream_failure_blocks_strong_dependent() {
    let ran = Arc::new(AtomicBool::new(false));
    let mut g = Group::new();
    g.add_runner(|| async {
        sleep(STEP).await;
        Err(FErr.into())
    })
    .key("f");
    let ran2 = Arc::clone(&ran);
    g.add_runner(move || {
        let ran = Arc::clone(&ran2);
        async move {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .dep(["f"]);

    let started = Instant::now();
    let err = g.go(Context::new()).await.expect_err("must fail");

    assert_eq!(err.to_string(), "F_ERR");
    assert!(err.is::<FErr>());
    assert!(!ran.load(Ordering::SeqCst), "strong dependent must not run");
    assert_elapsed(started.elapsed(), STEP);
}

#[tokio::test]
async fn test_weak_dependent_runs_and_wraps_upstream_error() {
    let ran = Arc::new(AtomicBool::new(false));
    let mut g = Group::new();
    g.add_runner(|| async { Err(FErr.into()) }).key("f");
    let ran2 = Arc::clone(&ran);
    g.add_runner(move || {
        let ran = Arc::clone(&ran2);
        async move {
            ran.store(true, Ordering::SeqCst);
            Err(XErr.into())
        }
    })
    .key("x")
    .weak_dep(["f"]);

    let err = g.go(Context::new()).await.expect_err("must fail");

    assert!(ran.load(Ordering::SeqCst), "weak dependent must run");
    assert_eq!(err.to_string(), "X_ERR <- F_ERR");
    assert!(err.is::<FErr>());
    assert!(err.is::<XErr>());
}

#[tokio::test]
async fn test_diamond_of_weak_failures_joins_both_leaves() {
    let mut g = Group::new();
    g.add_runner(|| async { Err(FErr.into()) })
        .key("f")
        .add_runner(|| async { Err(XErr.into()) })
        .key("x")
        .weak_dep(["f"])
        .add_runner(|| async { Err("Y_ERR".into()) })
        .key("y")
        .weak_dep(["f"])
        .add_runner(|| async { Ok(()) })
        .dep(["x", "y"]);

    let err = g.go(Context::new()).await.expect_err("must fail");

    assert_eq!(err.to_string(), "X_ERR <- F_ERR\nY_ERR <- F_ERR");
    assert_eq!(err.failures().len(), 2);
    assert!(err.is::<FErr>());
    assert!(err.is::<XErr>());
}

#[tokio::test]
async fn test_non_fast_fail_error_does_not_cancel_siblings() {
    let ran = Arc::new(AtomicBool::new(false));
    let mut g = Group::new();
    g.add_runner(|| async {
        sleep(STEP).await;
        Err(FErr.into())
    })
    .key("f");
    g.add_runner(|| async {
        sleep(2 * STEP).await;
        Ok(())
    })
    .key("c");
    let ran2 = Arc::clone(&ran);
    g.add_runner(move || {
        let ran = Arc::clone(&ran2);
        async move {
            sleep(STEP).await;
            ran.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .dep(["c"]);

    let started = Instant::now();
    let err = g.go(Context::new()).await.expect_err("must fail");

    assert_eq!(err.to_string(), "F_ERR");
    assert!(ran.load(Ordering::SeqCst), "sibling chain must complete");
    assert_elapsed(started.elapsed(), 3 * STEP);
}

#[tokio::test]
async fn test_fast_fail_cancels_siblings_and_blocks_downstream() {
    let ran = Arc::new(AtomicBool::new(false));
    let mut g = Group::new();
    g.add_runner(|| async {
        sleep(STEP).await;
        Err(FErr.into())
    })
    .key("f")
    .fast_fail();
    g.add_task(|ctx: Context| async move {
        tokio::select! {
            _ = sleep(2 * STEP) => Ok(()),
            _ = ctx.cancelled() => Err("c cancelled".into()),
        }
    })
    .key("c");
    let ran2 = Arc::clone(&ran);
    g.add_runner(move || {
        let ran = Arc::clone(&ran2);
        async move {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .dep(["c"]);

    let started = Instant::now();
    let err = g.go(Context::new()).await.expect_err("must fail");

    assert_eq!(err.to_string(), "F_ERR");
    assert!(err.is::<FErr>());
    assert!(!ran.load(Ordering::SeqCst), "downstream of cancelled node must not run");
    assert_elapsed(started.elapsed(), STEP);
}

#[tokio::test]
async fn test_retry_stops_at_first_success() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut g = Group::new();
    let n = Arc::clone(&attempts);
    g.add_runner(move || {
        let n = Arc::clone(&n);
        async move {
            let attempt = n.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                Err(format!("attempt {attempt} failed").into())
            } else {
                Ok(())
            }
        }
    })
    .key("retry")
    .with_retry(2);

    g.go(Context::new()).await.expect("third attempt succeeds");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_exhausted_reports_last_error() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut g = Group::new();
    let n = Arc::clone(&attempts);
    g.add_runner(move || {
        let n = Arc::clone(&n);
        async move {
            let attempt = n.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("attempt {attempt} failed").into())
        }
    })
    .key("retry")
    .with_retry(2);

    let err = g.go(Context::new()).await.expect_err("must fail");
    assert_eq!(err.to_string(), "attempt 3 failed");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_runs_pre_and_after_once() {
    let attempts = Arc::new(AtomicU32::new(0));
    let pre_count = Arc::new(AtomicU32::new(0));
    let after_count = Arc::new(AtomicU32::new(0));

    let mut g = Group::new();
    let n = Arc::clone(&attempts);
    let pre = Arc::clone(&pre_count);
    let after = Arc::clone(&after_count);
    g.add_runner(move || {
        let n = Arc::clone(&n);
        async move {
            let attempt = n.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                Err(format!("attempt {attempt} failed").into())
            } else {
                Ok(())
            }
        }
    })
    .key("retry")
    .with_retry(2)
    .with_pre(move |_ctx, _shared| {
        let pre = Arc::clone(&pre);
        async move {
            pre.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .with_after(move |_ctx, _shared, err| {
        let after = Arc::clone(&after);
        async move {
            after.fetch_add(1, Ordering::SeqCst);
            err
        }
    });

    g.go(Context::new()).await.expect("should succeed");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(pre_count.load(Ordering::SeqCst), 1);
    assert_eq!(after_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_node_pre_error_skips_body_and_blocks_downstream() {
    let body_ran = Arc::new(AtomicBool::new(false));
    let down_ran = Arc::new(AtomicBool::new(false));

    let mut g = Group::new();
    let body = Arc::clone(&body_ran);
    g.add_runner(move || {
        let body = Arc::clone(&body);
        async move {
            body.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .key("a")
    .with_pre(|_ctx, _shared| async { Err("pre failed".into()) });
    let down = Arc::clone(&down_ran);
    g.add_runner(move || {
        let down = Arc::clone(&down);
        async move {
            down.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .key("b")
    .dep(["a"]);

    let err = g.go(Context::new()).await.expect_err("must fail");

    assert_eq!(err.to_string(), "pre failed");
    assert!(!body_ran.load(Ordering::SeqCst), "pre error must skip the body");
    assert!(!down_ran.load(Ordering::SeqCst), "downstream must stay blocked");
}

#[tokio::test]
async fn test_node_after_suppresses_error() {
    let mut g = Group::new();
    g.add_runner(|| async { Err("original".into()) })
        .key("a")
        .with_after(|_ctx, _shared, _err| async { None });

    assert!(g.go(Context::new()).await.is_ok());
}

#[tokio::test]
async fn test_node_after_replaces_error() {
    let mut g = Group::new();
    g.add_runner(|| async { Err("original".into()) })
        .key("a")
        .with_after(|_ctx, _shared, err: Option<TaskError>| async move {
            err.map(|e| -> TaskError { format!("wrapped: {e}").into() })
        });

    let err = g.go(Context::new()).await.expect_err("must fail");
    assert_eq!(err.to_string(), "wrapped: original");
}

#[tokio::test]
async fn test_node_after_sees_raw_error_before_upstream_folding() {
    let seen = Arc::new(Mutex::new(String::new()));
    let mut g = Group::new();
    g.add_runner(|| async { Err(FErr.into()) }).key("f");
    let seen2 = Arc::clone(&seen);
    g.add_runner(|| async { Err(XErr.into()) })
        .key("x")
        .weak_dep(["f"])
        .with_after(move |_ctx, _shared, err: Option<TaskError>| {
            let seen = Arc::clone(&seen2);
            async move {
                if let Some(e) = &err {
                    *seen.lock().expect("lock") = e.to_string();
                }
                err
            }
        });

    let err = g.go(Context::new()).await.expect_err("must fail");

    // the hook observes the task's own error, not the folded chain
    assert_eq!(*seen.lock().expect("lock"), "X_ERR");
    assert_eq!(err.to_string(), "X_ERR <- F_ERR");
}

#[tokio::test]
async fn test_node_timeout_blocks_downstream() {
    let down_ran = Arc::new(AtomicBool::new(false));
    let mut g = Group::new();
    g.add_runner(|| async {
        sleep(STEP).await;
        Ok(())
    })
    .key("a");
    g.add_runner(|| async {
        sleep(3 * STEP).await;
        Ok(())
    })
    .key("c")
    .dep(["a"])
    .with_timeout(STEP);
    let down = Arc::clone(&down_ran);
    g.add_runner(move || {
        let down = Arc::clone(&down);
        async move {
            down.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .key("d")
    .dep(["c"]);

    let started = Instant::now();
    let err = g.go(Context::new()).await.expect_err("must fail");

    assert_eq!(err.to_string(), "node c timeout");
    assert!(err.is::<NodeTimeout>());
    assert!(!down_ran.load(Ordering::SeqCst));
    assert_elapsed(started.elapsed(), 2 * STEP);
}

#[tokio::test]
async fn test_node_timeout_releases_weak_dependent() {
    let weak_ran = Arc::new(AtomicBool::new(false));
    let mut g = Group::new();
    g.add_runner(|| async {
        sleep(3 * STEP).await;
        Ok(())
    })
    .key("c")
    .with_timeout(STEP);
    let weak = Arc::clone(&weak_ran);
    g.add_runner(move || {
        let weak = Arc::clone(&weak);
        async move {
            weak.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .key("x")
    .weak_dep(["c"]);

    let err = g.go(Context::new()).await.expect_err("must fail");

    assert_eq!(err.to_string(), "node c timeout");
    assert!(weak_ran.load(Ordering::SeqCst), "weak dependent must run");
}

#[tokio::test]
async fn test_group_timeout_masks_node_state_and_skips_rollback() {
    let rolled_back = Arc::new(AtomicBool::new(false));
    let after_ran = Arc::new(AtomicBool::new(false));

    let mut g = Group::with_options(Options::new().timeout(STEP));
    let rb = Arc::clone(&rolled_back);
    let after = Arc::clone(&after_ran);
    g.add_runner(|| async {
        sleep(2 * STEP).await;
        Ok(())
    })
    .key("c")
    .with_rollback(move |_ctx, _shared, _failure| {
        let rb = Arc::clone(&rb);
        async move {
            rb.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .with_after(move |_ctx, _shared, err| {
        let after = Arc::clone(&after);
        async move {
            after.store(true, Ordering::SeqCst);
            err
        }
    });

    let started = Instant::now();
    let err = g.go(Context::new()).await.expect_err("must time out");

    assert_eq!(err.to_string(), "group anonymous timeout");
    assert!(err.is_timeout());
    assert_elapsed(started.elapsed(), STEP);
    assert!(!rolled_back.load(Ordering::SeqCst), "group timeout skips rollback");

    // the node keeps running against the cancelled scope; its after hook
    // still fires once the body finishes
    sleep(2 * STEP).await;
    assert!(after_ran.load(Ordering::SeqCst));
    assert!(!rolled_back.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_group_timeout_uses_configured_prefix() {
    let mut g = Group::with_options(Options::new().prefix("etl").timeout(STEP));
    g.add_runner(|| async {
        sleep(2 * STEP).await;
        Ok(())
    });

    let err = g.go(Context::new()).await.expect_err("must time out");
    assert_eq!(err.to_string(), "group etl timeout");
}

#[tokio::test]
async fn test_group_pre_error_aborts_without_running_nodes() {
    let ran = Arc::new(AtomicBool::new(false));
    let mut g = Group::with_options(
        Options::new().pre(|_ctx| async { Err("pre boom".into()) }),
    );
    let ran2 = Arc::clone(&ran);
    g.add_runner(move || {
        let ran = Arc::clone(&ran2);
        async move {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        }
    });

    let started = Instant::now();
    let err = g.go(Context::new()).await.expect_err("must fail");

    assert_eq!(err.to_string(), "pre boom");
    assert!(!ran.load(Ordering::SeqCst));
    assert!(started.elapsed() < STEP);
}

#[tokio::test]
async fn test_group_after_suppresses_and_injects() {
    // suppress: a failing node, after swallows the error
    let mut g = Group::with_options(Options::new().after(|_ctx, _err| async { None }));
    g.add_runner(|| async { Err(FErr.into()) });
    assert!(g.go(Context::new()).await.is_ok());

    // inject: a clean run, after replaces the result with an error
    let mut g = Group::with_options(Options::new().after(|_ctx, _err| async {
        Some(GroupError::other("injected".into()))
    }));
    g.add_runner(|| async { Ok(()) });
    let err = g.go(Context::new()).await.expect_err("must fail");
    assert_eq!(err.to_string(), "injected");
}

#[tokio::test]
async fn test_cancelled_before_execution() {
    let ran = Arc::new(AtomicBool::new(false));
    let ctx = Context::new();
    ctx.cancel();

    let mut g = Group::new();
    let ran2 = Arc::clone(&ran);
    g.add_runner(move || {
        let ran = Arc::clone(&ran2);
        async move {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .key("a");

    let started = Instant::now();
    let err = g.go(ctx).await.expect_err("must fail");

    assert!(matches!(err, GroupError::Cancelled));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(started.elapsed() < STEP);
}

#[tokio::test]
async fn test_cancelled_during_execution_blocks_pending_nodes() {
    let d_ran = Arc::new(AtomicBool::new(false));
    let ctx = Context::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        sleep(STEP + STEP / 2).await;
        canceller.cancel();
    });

    let mut g = Group::new();
    g.add_runner(|| async {
        sleep(STEP).await;
        Ok(())
    })
    .key("a")
    .add_runner(|| async {
        sleep(STEP).await;
        Ok(())
    })
    .key("b")
    .dep(["a"]);
    let d = Arc::clone(&d_ran);
    g.add_runner(move || {
        let d = Arc::clone(&d);
        async move {
            d.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .key("d")
    .dep(["b"]);

    let err = g.go(ctx).await.expect_err("must fail");

    assert!(matches!(err, GroupError::Cancelled));
    assert!(!d_ran.load(Ordering::SeqCst), "pending node must not run");
}

#[tokio::test]
async fn test_rollback_runs_in_reverse_completion_order() {
    let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let rollback_ctx_cancelled = Arc::new(AtomicBool::new(false));
    let b_failure_seen = Arc::new(AtomicBool::new(false));

    let mut g = Group::new();
    let log = Arc::clone(&order);
    let flag = Arc::clone(&rollback_ctx_cancelled);
    g.add_runner(|| async {
        sleep(STEP).await;
        Ok(())
    })
    .key("a")
    .with_rollback(move |ctx, _shared, failure| {
        let log = Arc::clone(&log);
        let flag = Arc::clone(&flag);
        async move {
            assert!(failure.is_none(), "a succeeded, no failure to pass");
            if ctx.is_cancelled() {
                flag.store(true, Ordering::SeqCst);
            }
            log.lock().expect("lock").push("a");
            Ok(())
        }
    });
    let log = Arc::clone(&order);
    let seen = Arc::clone(&b_failure_seen);
    g.add_runner(|| async { Err("B_ERR".into()) })
        .key("b")
        .dep(["a"])
        .fast_fail()
        .with_rollback(move |_ctx, _shared, failure| {
            let log = Arc::clone(&log);
            let seen = Arc::clone(&seen);
            async move {
                if failure.map(|f| f.to_string()) == Some("B_ERR".into()) {
                    seen.store(true, Ordering::SeqCst);
                }
                log.lock().expect("lock").push("b");
                Ok(())
            }
        });

    let err = g.go(Context::new()).await.expect_err("must fail");

    assert_eq!(err.to_string(), "B_ERR");
    assert_eq!(*order.lock().expect("lock"), vec!["b", "a"]);
    assert!(b_failure_seen.load(Ordering::SeqCst));
    assert!(
        !rollback_ctx_cancelled.load(Ordering::SeqCst),
        "rollback scope must not be cancelled even after fast-fail"
    );
}

#[tokio::test]
async fn test_rollback_errors_join_the_main_error() {
    let mut g = Group::new();
    g.add_runner(|| async { Ok(()) })
        .key("a")
        .with_rollback(|_ctx, _shared, _failure| async { Err("undo a boom".into()) });
    g.add_runner(|| async { Err("B_ERR".into()) })
        .key("b")
        .dep(["a"]);

    let err = g.go(Context::new()).await.expect_err("must fail");

    assert_eq!(err.to_string(), "B_ERR\nrollback a failed: undo a boom");
    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.rollback_failures().len(), 1);
    assert_eq!(err.rollback_failures()[0].node(), "a");
}

#[tokio::test]
async fn test_rollback_skipped_for_never_dispatched_node() {
    let rolled_back = Arc::new(AtomicBool::new(false));
    let mut g = Group::new();
    g.add_runner(|| async { Err(FErr.into()) }).key("f");
    let rb = Arc::clone(&rolled_back);
    g.add_runner(|| async { Ok(()) })
        .key("x")
        .dep(["f"])
        .with_rollback(move |_ctx, _shared, _failure| {
            let rb = Arc::clone(&rb);
            async move {
                rb.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

    let err = g.go(Context::new()).await.expect_err("must fail");

    assert_eq!(err.to_string(), "F_ERR");
    assert!(
        !rolled_back.load(Ordering::SeqCst),
        "blocked node's rollback must not run"
    );
}

#[tokio::test]
async fn test_task_panic_is_trapped_and_siblings_continue() {
    let sibling_ran = Arc::new(AtomicBool::new(false));
    let mut g = Group::new();
    g.add_runner(|| async { panic!("boom") }).key("p");
    let sibling = Arc::clone(&sibling_ran);
    g.add_runner(move || {
        let sibling = Arc::clone(&sibling);
        async move {
            sleep(STEP).await;
            sibling.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .key("ok");

    let err = g.go(Context::new()).await.expect_err("must fail");

    assert!(err.is::<PanicError>());
    assert_eq!(err.to_string(), "panic recovered: boom");
    assert!(sibling_ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_error_sink_receives_failing_node_reports() {
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    let mut g = Group::with_options(Options::new().error_sink(tx));
    g.add_runner(|| async { Err(FErr.into()) }).key("f");
    g.add_runner(|| async { Err(XErr.into()) }).key("x");

    g.go(Context::new()).await.expect_err("must fail");

    let mut reports = Vec::new();
    while let Ok(report) = rx.try_recv() {
        reports.push((report.node, report.message));
    }
    reports.sort();
    assert_eq!(
        reports,
        vec![
            ("f".to_string(), "F_ERR".to_string()),
            ("x".to_string(), "X_ERR".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_logging_enabled_run_behaves_identically() {
    let mut g = Group::with_options(Options::new().prefix("logged").with_log());
    g.add_runner(|| async { Ok(()) })
        .key("a")
        .add_runner(|| async { Err("late".into()) })
        .key("b")
        .dep(["a"])
        .with_retry(1);

    let err = g.go(Context::new()).await.expect_err("must fail");
    assert_eq!(err.to_string(), "late");
}
