//! Panic trap around task invocations: a task that panics yields a typed
//! error instead of unwinding into the engine.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use thiserror::Error;
use tracing::error;

use crate::core::types::TaskError;

/// Upper bound on the captured backtrace snapshot.
const MAX_BACKTRACE: usize = 64 << 10;

/// A task panic converted into an error.
///
/// Carries the panic payload's message and a backtrace captured at the
/// trap site, truncated to 64 KiB.
#[derive(Debug, Error)]
#[error("panic recovered: {message}")]
pub struct PanicError {
    /// The panic payload, rendered as text.
    pub message: String,
    /// Backtrace snapshot from the trap site.
    pub backtrace: String,
}

/// Run a task future, converting a panic into a [`PanicError`].
///
/// A normal error passes through unchanged; a panic is logged and
/// returned as an error, never rethrown.
pub async fn safe_run<F>(f: F) -> Result<(), TaskError>
where
    F: Future<Output = Result<(), TaskError>>,
{
    match AssertUnwindSafe(f).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload);
            let backtrace = bounded_backtrace();
            error!(panic = %message, "panic recovered");
            Err(Box::new(PanicError { message, backtrace }))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn bounded_backtrace() -> String {
    let mut trace = Backtrace::force_capture().to_string();
    if trace.len() > MAX_BACKTRACE {
        let mut cut = MAX_BACKTRACE;
        while !trace.is_char_boundary(cut) {
            cut -= 1;
        }
        trace.truncate(cut);
    }
    trace
}
