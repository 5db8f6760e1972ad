//! stevedore-deploy — the deployment engine.
//!
//! Turns a pair of group trees into an ordered plan and drives the
//! cluster toward the target:
//!
//! - **`scaling`** — pure scaling proposition (who to kill, how many to start)
//! - **`planner`** — group-tree diff into ordered steps
//! - **`watcher`** — completion signals over the instance update stream
//! - **`worker`** — supervised launch/replace workers
//! - **`executor`** — executes one plan, step by step
//! - **`manager`** — tracks in-flight plans, resolves conflicts, recovers
//!
//! # Architecture
//!
//! ```text
//! DeploymentManager (actor)
//!   ├── active plan table + conflict resolution
//!   ├── DeploymentRepository (persist / recover plans)
//!   └── per plan: StepExecutor (task)
//!         ├── steps serially, actions of a step concurrently
//!         └── TaskStart / TaskReplace workers (supervised tasks)
//! ```

use std::sync::Arc;

use stevedore_core::{EventBus, HealthCheckManager, InstanceTracker, LaunchQueue};

pub mod error;
pub mod executor;
pub mod manager;
pub mod planner;
pub mod scaling;
pub mod watcher;
pub mod worker;

pub use error::{DeployError, DeployResult};
pub use manager::{DeploymentInfo, DeploymentManager, DeploymentManagerHandle, DeploymentOutcome};
pub use planner::build_plan;
pub use scaling::{ScalingProposition, propose};
pub use watcher::InstanceWatch;

/// Collaborators every deployment component works against.
#[derive(Clone)]
pub struct DeployContext {
    pub tracker: Arc<dyn InstanceTracker>,
    pub launch_queue: Arc<dyn LaunchQueue>,
    pub health_checks: Arc<dyn HealthCheckManager>,
    pub events: EventBus,
}
