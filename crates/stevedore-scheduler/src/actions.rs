//! Scheduler actions — per-run-spec scaling and fleet reconciliation.
//!
//! Invoked from the scheduler core under its lock protocol; the
//! functions here do the actual tracker, launch-queue, and driver work.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use stevedore_core::{
    Goal, GoalReason, GroupRepository, Instance, InstanceId, InstanceTracker, LaunchQueue,
    RunSpec, RunSpecId, TaskDriver, TaskStatus,
};
use stevedore_deploy::{InstanceWatch, propose};

/// Collaborators for the scale and reconcile actions.
#[derive(Clone)]
pub struct SchedulerActions {
    pub tracker: Arc<dyn InstanceTracker>,
    pub launch_queue: Arc<dyn LaunchQueue>,
    pub group_repo: Arc<dyn GroupRepository>,
    pub driver: Arc<dyn TaskDriver>,
}

impl SchedulerActions {
    /// Drive one run spec toward its target instance count.
    ///
    /// Unknown ids are logged and ignored (the spec may have been
    /// deleted since the command was queued).
    pub async fn scale(&self, id: &RunSpecId) -> anyhow::Result<()> {
        let root = self.group_repo.root().await?;
        let Some(run) = root.find_run_spec(id).cloned() else {
            info!(run_spec = %id, "scale requested for unknown run spec, ignoring");
            return Ok(());
        };
        self.scale_spec(&run).await
    }

    /// Scale a resolved run spec: kill overcapacity, then fill the
    /// launch queue up to the target. Both phases are awaited, so the
    /// caller's lock covers the entire adjustment.
    pub async fn scale_spec(&self, run: &RunSpec) -> anyhow::Result<()> {
        let instances = match self.tracker.spec_instances(&run.id).await {
            Ok(instances) => instances,
            Err(err) => {
                warn!(run_spec = %run.id, error = %err, "tracker unavailable, assuming no instances");
                Vec::new()
            }
        };
        let (active, rest): (Vec<Instance>, Vec<Instance>) =
            instances.into_iter().partition(Instance::is_active);
        let scheduled = rest.iter().filter(|i| i.is_scheduled()).count() as u32;

        let proposition = propose(&active, &[], run.instances, run.kill_selection);

        if let Some(victims) = &proposition.to_kill {
            if let Err(err) = self.launch_queue.purge(&run.id).await {
                warn!(run_spec = %run.id, error = %err, "launch queue purge failed");
            }
            let updates = self.tracker.updates().await?;
            let watch = InstanceWatch::killed(
                updates,
                self.tracker.clone(),
                victims.iter().map(|i| i.id.clone()),
            );
            for victim in victims {
                let goal = if victim.has_reservation {
                    Goal::Stopped
                } else {
                    Goal::Decommissioned
                };
                self.tracker
                    .set_goal(&victim.id, goal, GoalReason::OverCapacity)
                    .await?;
            }
            info!(run_spec = %run.id, victims = victims.len(), "killing overcapacity instances");
            watch.wait().await?;
        }

        if let Some(to_start) = proposition.to_start {
            let to_add = to_start.saturating_sub(scheduled);
            if to_add > 0 {
                info!(run_spec = %run.id, to_add, "queueing additional launches");
                self.launch_queue.add(run, to_add).await?;
            } else {
                debug!(
                    run_spec = %run.id,
                    scheduled,
                    "enough launches already scheduled"
                );
            }
        }

        if proposition.to_kill.is_none() && proposition.to_start.is_none() {
            debug!(run_spec = %run.id, instances = run.instances, "already at target");
        }
        Ok(())
    }

    /// Decommission specific instances of one run spec and wait for
    /// their termination.
    pub async fn kill_instances(
        &self,
        id: &RunSpecId,
        instances: &[InstanceId],
    ) -> anyhow::Result<()> {
        let updates = self.tracker.updates().await?;
        let watch = InstanceWatch::killed(
            updates,
            self.tracker.clone(),
            instances.iter().cloned(),
        );
        for instance_id in instances {
            self.tracker
                .set_goal(instance_id, Goal::Decommissioned, GoalReason::UserRequest)
                .await?;
        }
        info!(run_spec = %id, count = instances.len(), "killing instances");
        watch.wait().await
    }

    /// Rebuild the cluster's view of our tasks.
    ///
    /// Submits every cluster-reported, non-terminal task status of the
    /// known run specs, decommissions instances whose run spec left the
    /// group tree, and finally solicits implicit statuses with an empty
    /// reconcile call.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let root = self.group_repo.root().await?;
        let known: BTreeSet<RunSpecId> = root.transitive_ids().into_iter().collect();
        let by_spec = self.tracker.instances_by_spec().await?;

        let mut statuses: Vec<TaskStatus> = Vec::new();
        let mut orphans: Vec<Instance> = Vec::new();
        for (spec_id, instances) in by_spec {
            if known.contains(&spec_id) {
                for instance in &instances {
                    statuses.extend(instance.reportable_statuses().cloned());
                }
            } else {
                orphans.extend(instances);
            }
        }

        for orphan in &orphans {
            warn!(
                instance = %orphan.id,
                run_spec = %orphan.run_spec_id,
                "orphaned instance, decommissioning"
            );
            if let Err(err) = self
                .tracker
                .set_goal(&orphan.id, Goal::Decommissioned, GoalReason::Orphaned)
                .await
            {
                warn!(instance = %orphan.id, error = %err, "orphan decommission failed");
            }
        }

        info!(
            statuses = statuses.len(),
            orphans = orphans.len(),
            "reconciling tasks with the driver"
        );
        if !statuses.is_empty() {
            self.driver.reconcile_tasks(statuses).await?;
        }
        // Empty call solicits implicit statuses for unknown tasks.
        self.driver.reconcile_tasks(Vec::new()).await
    }
}
