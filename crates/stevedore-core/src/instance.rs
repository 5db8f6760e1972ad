//! Instances — observed condition and desired goal of one replica.
//!
//! Condition and goal are orthogonal: the condition is what the cluster
//! reports, the goal is what the orchestrator wants. A terminal
//! condition under a `Running` goal is a failure the tracker and launch
//! queue will try to repair; the core only mutates goals and never
//! deletes instances.

use serde::{Deserialize, Serialize};

use crate::id::{InstanceId, RunSpecId};

/// Observed execution state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Provisioned,
    Staging,
    Starting,
    Running,
    Killing,
    Killed,
    Finished,
    Failed,
    Error,
    Gone,
    Dropped,
    Unknown,
    Unreachable,
}

impl Condition {
    /// Whether this condition is a final state of the instance lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Condition::Killed
                | Condition::Finished
                | Condition::Failed
                | Condition::Error
                | Condition::Gone
                | Condition::Dropped
                | Condition::Unknown
        )
    }

    /// Whether an instance in this condition occupies cluster resources.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Condition::Staging
                | Condition::Starting
                | Condition::Running
                | Condition::Killing
                | Condition::Unreachable
        )
    }
}

/// Desired lifecycle target of an instance. Sticky once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    /// Keep the instance alive.
    Running,
    /// Halt but keep the reservation (stateful workloads).
    Stopped,
    /// Halt and forget.
    Decommissioned,
}

/// Why a goal change was issued. Appears in events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalReason {
    DeploymentScaling,
    Upgrading,
    DeletingApp,
    OverCapacity,
    Orphaned,
    /// Reserved for callers outside the scheduling core.
    UserRequest,
    /// Reserved for callers outside the scheduling core.
    HealthFailure,
}

/// Cluster-reported status of one task of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub condition: Condition,
    pub agent_id: Option<String>,
}

/// One task of an instance. The status is absent until the cluster has
/// reported on the task at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: Option<TaskStatus>,
}

/// One live (or formerly live) replica of a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub run_spec_id: RunSpecId,
    /// Version of the run spec that launched this instance.
    pub run_spec_version: u64,
    pub condition: Condition,
    pub goal: Goal,
    pub has_reservation: bool,
    /// Unix timestamp (milliseconds) when this instance started.
    pub started_at: u64,
    pub tasks: Vec<Task>,
}

impl Instance {
    pub fn is_active(&self) -> bool {
        self.condition.is_active()
    }

    /// Whether the instance is scheduled for launch but not yet placed.
    pub fn is_scheduled(&self) -> bool {
        self.condition == Condition::Provisioned
    }

    /// Cluster-reported, non-terminal task statuses of this instance.
    ///
    /// This is exactly the set reconciliation submits to the driver.
    pub fn reportable_statuses(&self) -> impl Iterator<Item = &TaskStatus> {
        self.tasks
            .iter()
            .filter_map(|t| t.status.as_ref())
            .filter(|s| !s.condition.is_terminal())
    }
}
