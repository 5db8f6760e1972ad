//! Deployment plans — immutable descriptions of a group transition.
//!
//! A plan is an ordered list of steps; each step is a set of mutually
//! independent actions executed concurrently. Steps are strictly
//! sequential: running them in order brings the live state from the
//! `original` tree toward the `target` tree.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::group::Group;
use crate::id::{InstanceId, RunSpecId};
use crate::runspec::RunSpec;

/// One scheduling action within a deployment step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentAction {
    /// Register the application. Starting instances is handled by a
    /// later scale of the already-registered spec.
    Start { run: RunSpec },
    /// Scale to `scale_to` instances, optionally pinning victims.
    Scale {
        run: RunSpec,
        scale_to: u32,
        to_kill: Vec<InstanceId>,
    },
    /// Replace all instances with the new spec revision.
    Restart { run: RunSpec },
    /// Halt every instance and deregister the application.
    Stop { run: RunSpec },
}

impl DeploymentAction {
    /// The run spec this action targets.
    pub fn run_spec(&self) -> &RunSpec {
        match self {
            DeploymentAction::Start { run }
            | DeploymentAction::Scale { run, .. }
            | DeploymentAction::Restart { run }
            | DeploymentAction::Stop { run } => run,
        }
    }
}

/// A set of independent actions executed concurrently.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub actions: Vec<DeploymentAction>,
}

impl DeploymentStep {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Immutable plan for transitioning `original` into `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: String,
    pub original: Group,
    pub target: Group,
    pub steps: Vec<DeploymentStep>,
    /// Timestamp of plan creation.
    pub version: u64,
    /// Instances pinned for killing during scaling, per run spec.
    pub to_kill: BTreeMap<RunSpecId, Vec<InstanceId>>,
}

impl DeploymentPlan {
    /// Assemble a plan from precomputed steps, deriving the id from the
    /// tree versions and the plan version.
    pub fn new(
        original: Group,
        target: Group,
        steps: Vec<DeploymentStep>,
        version: u64,
        to_kill: BTreeMap<RunSpecId, Vec<InstanceId>>,
    ) -> Self {
        let id = derive_plan_id(&original, &target, version);
        Self {
            id,
            original,
            target,
            steps,
            version,
            to_kill,
        }
    }

    /// Union of run spec ids referenced by any action of any step.
    pub fn affected_run_spec_ids(&self) -> BTreeSet<RunSpecId> {
        self.steps
            .iter()
            .flat_map(|s| s.actions.iter())
            .map(|a| a.run_spec().id.clone())
            .collect()
    }

    /// Whether this plan conflicts with another (overlapping run specs).
    pub fn conflicts_with(&self, other: &DeploymentPlan) -> bool {
        let mine = self.affected_run_spec_ids();
        other
            .affected_run_spec_ids()
            .iter()
            .any(|id| mine.contains(id))
    }
}

/// Content-derived plan id: truncated sha256 over the tree versions and
/// the transitive run spec ids of both sides.
fn derive_plan_id(original: &Group, target: &Group, version: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(original.version.to_be_bytes());
    hasher.update(target.version.to_be_bytes());
    hasher.update(version.to_be_bytes());
    for id in original.transitive_ids() {
        hasher.update(id.as_str().as_bytes());
        hasher.update([0u8]);
    }
    hasher.update([0xff]);
    for id in target.transitive_ids() {
        hasher.update(id.as_str().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..8])
}
