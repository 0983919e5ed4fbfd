//! Dependency-aware concurrent task executor.
//!
//! `dagrun` schedules a set of tasks arranged as a directed acyclic graph
//! of dependencies, runs independent tasks in parallel up to a concurrency
//! cap, and returns a single aggregated error reflecting every terminal
//! failure. Strong dependencies block a successor until all of its parents
//! succeed; weak dependencies only wait for the parents to complete.
//!
//! # Example
//!
//! ```
//! use dagrun::{Context, Group};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut group = Group::new();
//! group
//!     .add_runner(|| async { Ok(()) })
//!     .key("extract")
//!     .add_runner(|| async { Ok(()) })
//!     .key("transform")
//!     .dep(["extract"])
//!     .add_runner(|| async { Ok(()) })
//!     .key("load")
//!     .dep(["transform"]);
//!
//! assert!(group.go(Context::new()).await.is_ok());
//! # }
//! ```

pub mod core;
pub mod execution;
pub mod store;

pub use crate::core::context::Context;
pub use crate::core::error::{Failure, GroupError, NodeTimeout, RollbackFailure, TaskError};
pub use crate::core::group::Group;
pub use crate::core::node::{NodeRef, Task};
pub use crate::core::options::{ErrorReport, Options};
pub use crate::core::types::{Key, Shared, StoreValue};
pub use crate::execution::flat::{go, runner, try_go, Runner};
pub use crate::execution::safe::{safe_run, PanicError};
pub use crate::store::{MapStore, Storer};
