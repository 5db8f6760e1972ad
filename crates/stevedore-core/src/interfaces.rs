//! Interfaces to the external collaborators of the scheduling core.
//!
//! The core consumes these as `Arc<dyn …>` and never owns their state.
//! Every method returns `anyhow::Result`; callers convert failures into
//! their own error taxonomy at the component boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::group::Group;
use crate::id::{InstanceId, RunSpecId};
use crate::instance::{Goal, GoalReason, Instance, TaskStatus};
use crate::plan::DeploymentPlan;
use crate::runspec::RunSpec;

/// One change on the instance update stream.
#[derive(Debug, Clone)]
pub enum InstanceChange {
    Updated(Instance),
    Removed(InstanceId),
}

impl InstanceChange {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            InstanceChange::Updated(i) => &i.id,
            InstanceChange::Removed(id) => id,
        }
    }
}

/// A durable subscription to the instance update stream: a snapshot of
/// all known instances followed by an append-only live stream.
///
/// The snapshot is taken atomically with the subscription, so no change
/// is ever missed between the two. Per-instance changes arrive in
/// causal order.
pub struct InstanceUpdates {
    pub snapshot: Vec<Instance>,
    pub rx: broadcast::Receiver<InstanceChange>,
}

/// Authoritative store of all known instances and their states.
#[async_trait]
pub trait InstanceTracker: Send + Sync {
    /// All instances of one run spec.
    async fn spec_instances(&self, id: &RunSpecId) -> anyhow::Result<Vec<Instance>>;

    /// One instance by id.
    async fn get(&self, id: &InstanceId) -> anyhow::Result<Option<Instance>>;

    /// Every known instance, grouped by run spec.
    async fn instances_by_spec(&self) -> anyhow::Result<BTreeMap<RunSpecId, Vec<Instance>>>;

    /// Set the sticky goal of an instance. Idempotent: re-setting the
    /// current goal is safe.
    async fn set_goal(
        &self,
        id: &InstanceId,
        goal: Goal,
        reason: GoalReason,
    ) -> anyhow::Result<()>;

    /// Subscribe to the update stream (snapshot-first, no gap).
    async fn updates(&self) -> anyhow::Result<InstanceUpdates>;
}

/// Requests new instance launches and applies back-off delays.
#[async_trait]
pub trait LaunchQueue: Send + Sync {
    /// Request `count` additional launches of the given spec revision.
    async fn add(&self, run: &RunSpec, count: u32) -> anyhow::Result<()>;

    /// Drop all pending launches for a run spec.
    async fn purge(&self, id: &RunSpecId) -> anyhow::Result<()>;

    /// Clear the launch back-off for a run spec.
    async fn reset_delay(&self, run: &RunSpec) -> anyhow::Result<()>;
}

/// Registers and deregisters health checks. Applications only; callers
/// skip pods.
#[async_trait]
pub trait HealthCheckManager: Send + Sync {
    async fn add_all_for(&self, run: &RunSpec) -> anyhow::Result<()>;

    async fn remove_all_for(&self, id: &RunSpecId) -> anyhow::Result<()>;

    async fn remove_all(&self) -> anyhow::Result<()>;

    /// Align registrations with the given set of applications.
    async fn reconcile(&self, apps: &[RunSpec]) -> anyhow::Result<()>;
}

/// Persistent store of the group tree.
#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn root(&self) -> anyhow::Result<Group>;

    async fn store_root(&self, root: &Group) -> anyhow::Result<()>;
}

/// Persistent store of in-flight deployment plans.
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn all(&self) -> anyhow::Result<Vec<DeploymentPlan>>;

    async fn store(&self, plan: &DeploymentPlan) -> anyhow::Result<()>;

    async fn delete(&self, plan_id: &str) -> anyhow::Result<()>;
}

/// Low-level driver speaking the cluster's offer protocol.
#[async_trait]
pub trait TaskDriver: Send + Sync {
    /// Submit task statuses for explicit reconciliation. An empty list
    /// solicits implicit statuses for tasks unknown to the caller.
    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> anyhow::Result<()>;
}
