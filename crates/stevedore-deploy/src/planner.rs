//! Plan construction — group-tree diff into ordered steps.
//!
//! Step order: register new applications first, then scale and restart,
//! then stop what the target no longer names. Actions within one step
//! never share a run spec id, so they may execute concurrently.

use std::collections::BTreeMap;

use tracing::debug;

use stevedore_core::plan::{DeploymentAction, DeploymentPlan, DeploymentStep};
use stevedore_core::{Group, InstanceId, RunSpecId};

/// Compute a deployment plan transitioning `original` into `target`.
///
/// `to_kill` pins specific instances to kill while scaling down.
pub fn build_plan(
    original: Group,
    target: Group,
    version: u64,
    to_kill: BTreeMap<RunSpecId, Vec<InstanceId>>,
) -> DeploymentPlan {
    let old_specs: BTreeMap<_, _> = original
        .transitive_run_specs()
        .into_iter()
        .map(|s| (s.id.clone(), s.clone()))
        .collect();
    let new_specs: BTreeMap<_, _> = target
        .transitive_run_specs()
        .into_iter()
        .map(|s| (s.id.clone(), s.clone()))
        .collect();

    let mut starts = Vec::new();
    let mut updates = Vec::new();
    let mut stops = Vec::new();

    for (id, new) in &new_specs {
        match old_specs.get(id) {
            None => {
                starts.push(DeploymentAction::Start {
                    run: new.with_instances(0),
                });
                updates.push(DeploymentAction::Scale {
                    run: new.clone(),
                    scale_to: new.instances,
                    to_kill: Vec::new(),
                });
            }
            Some(old) if new.is_upgrade(old) => {
                updates.push(DeploymentAction::Restart { run: new.clone() });
            }
            Some(old) => {
                let pinned = to_kill.get(id).cloned().unwrap_or_default();
                if new.instances != old.instances || !pinned.is_empty() {
                    updates.push(DeploymentAction::Scale {
                        run: new.clone(),
                        scale_to: new.instances,
                        to_kill: pinned,
                    });
                }
            }
        }
    }

    for (id, old) in &old_specs {
        if !new_specs.contains_key(id) {
            stops.push(DeploymentAction::Stop {
                run: old.with_instances(0),
            });
        }
    }

    let steps: Vec<DeploymentStep> = [starts, updates, stops]
        .into_iter()
        .filter(|actions| !actions.is_empty())
        .map(|actions| DeploymentStep { actions })
        .collect();

    debug!(
        steps = steps.len(),
        actions = steps.iter().map(|s| s.actions.len()).sum::<usize>(),
        "plan built"
    );
    DeploymentPlan::new(original, target, steps, version, to_kill)
}
