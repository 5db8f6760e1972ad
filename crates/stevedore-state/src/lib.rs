//! stevedore-state — persistence and in-memory collaborators.
//!
//! The redb-backed [`StateStore`] implements the deployment and group
//! repositories the scheduling core recovers from after a leadership
//! change. All values are JSON-serialized into `&str → &[u8]` tables.
//!
//! The [`memory`] module provides in-memory implementations of the
//! remaining collaborators (instance tracker, launch queue, health check
//! manager, task driver) used by the standalone daemon and by the
//! integration suites.

pub mod error;
pub mod memory;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use memory::{MemoryHealthChecks, MemoryInstanceTracker, MemoryLaunchQueue, RecordingDriver};
pub use store::StateStore;
