mod executor;
pub mod flat;
mod rollback;
pub mod safe;

pub use flat::{go, runner, try_go, Runner};
pub use safe::{safe_run, PanicError};
