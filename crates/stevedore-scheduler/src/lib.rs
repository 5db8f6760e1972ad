//! stevedore-scheduler — the scheduling core.
//!
//! All externally visible mutating operations flow through one actor,
//! the [`SchedulerCore`], which owns the run-spec lock table and the
//! leadership lifecycle:
//!
//! - **`locks`** — reference-counted run-spec locks
//! - **`actions`** — per-run-spec scaling and fleet-wide reconciliation
//! - **`core`** — the command-serializing actor
//!
//! # Command flow
//!
//! ```text
//! caller ── SchedulerHandle ──► SchedulerCore (actor)
//!                                 ├── LockTable (exclusive)
//!                                 ├── DeploymentManagerHandle (deploy/cancel)
//!                                 └── SchedulerActions (scale/reconcile/kill)
//! ```

pub mod actions;
pub mod core;
pub mod error;
pub mod locks;

pub use actions::SchedulerActions;
pub use core::{SchedulerCore, SchedulerDeps, SchedulerHandle};
pub use error::{SchedulerError, SchedulerResult};
pub use locks::LockTable;
