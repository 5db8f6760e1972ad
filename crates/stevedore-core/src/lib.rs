//! stevedore-core — domain types and collaborator interfaces.
//!
//! The scheduling core manipulates three kinds of values:
//!
//! - **Run specs** — declarative workload descriptions identified by a
//!   hierarchical path id, carrying a desired instance count and a
//!   kill-selection policy
//! - **Instances** — live (or formerly live) replicas of a run spec,
//!   each with an observed condition and a desired goal
//! - **Group trees** — the hierarchical arrangement of run specs that a
//!   deployment transitions between
//! - **Deployment plans** — immutable, ordered step lists describing one
//!   transition between two group trees
//!
//! External subsystems (instance tracker, launch queue, health check
//! manager, repositories, task driver) are consumed exclusively through
//! the traits in [`interfaces`]; the core never owns their state.

pub mod error;
pub mod events;
pub mod group;
pub mod id;
pub mod instance;
pub mod interfaces;
pub mod plan;
pub mod runspec;

pub use error::{CoreError, CoreResult};
pub use events::{Event, EventBus};
pub use group::Group;
pub use id::{InstanceId, RunSpecId};
pub use instance::{Condition, Goal, GoalReason, Instance, Task, TaskStatus};
pub use interfaces::{
    DeploymentRepository, GroupRepository, HealthCheckManager, InstanceChange, InstanceTracker,
    InstanceUpdates, LaunchQueue, TaskDriver,
};
pub use plan::{DeploymentAction, DeploymentPlan, DeploymentStep};
pub use runspec::{HealthCheckSpec, KillSelection, RunSpec, RunSpecKind};
