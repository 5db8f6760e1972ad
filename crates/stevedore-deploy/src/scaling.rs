//! Scaling proposition — who to kill and how many to start.
//!
//! The single source of truth for scaling decisions during both
//! deployment scaling steps and background scale reconciliation. Pure
//! and deterministic: equal inputs produce equal outputs, and the
//! result always satisfies `running - killed + started = scale_to`.

use std::collections::BTreeSet;

use stevedore_core::{Instance, InstanceId, KillSelection};

/// Outcome of a scaling decision. Empty sides are `None` so callers can
/// short-circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingProposition {
    pub to_kill: Option<Vec<Instance>>,
    pub to_start: Option<u32>,
}

/// Decide which of `running` to kill and how many fresh instances to
/// start to reach `scale_to`.
///
/// Instances named by `to_kill_hint` are sentenced first (hints naming
/// already-gone instances are dropped). When the hint does not cover
/// the overcapacity, additional victims are selected by the run spec's
/// kill-selection policy: youngest first or oldest first by start
/// timestamp, ties broken by instance id.
pub fn propose(
    running: &[Instance],
    to_kill_hint: &[InstanceId],
    scale_to: u32,
    kill_selection: KillSelection,
) -> ScalingProposition {
    let over_capacity = running.len().saturating_sub(scale_to as usize);

    let hint: BTreeSet<&InstanceId> = to_kill_hint.iter().collect();
    let sentenced: Vec<Instance> = running
        .iter()
        .filter(|i| hint.contains(&i.id))
        .cloned()
        .collect();

    let mut to_kill = sentenced;
    if to_kill.len() < over_capacity {
        let missing = over_capacity - to_kill.len();
        let killed_ids: BTreeSet<&InstanceId> = to_kill.iter().map(|i| &i.id).collect();
        let mut candidates: Vec<&Instance> = running
            .iter()
            .filter(|i| !killed_ids.contains(&i.id))
            .collect();
        sort_for_killing(&mut candidates, kill_selection);
        to_kill.extend(candidates.into_iter().take(missing).cloned());
    }

    let surviving = running.len() - to_kill.len();
    let to_start = (scale_to as usize).saturating_sub(surviving) as u32;

    ScalingProposition {
        to_kill: if to_kill.is_empty() { None } else { Some(to_kill) },
        to_start: if to_start == 0 { None } else { Some(to_start) },
    }
}

/// Total order over kill candidates: preferred victims first.
fn sort_for_killing(candidates: &mut [&Instance], kill_selection: KillSelection) {
    candidates.sort_by(|a, b| {
        let by_age = match kill_selection {
            KillSelection::YoungestFirst => b.started_at.cmp(&a.started_at),
            KillSelection::OldestFirst => a.started_at.cmp(&b.started_at),
        };
        by_age.then_with(|| a.id.cmp(&b.id))
    });
}
