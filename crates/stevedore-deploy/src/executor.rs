//! Step executor — drives one deployment plan to completion.
//!
//! Steps run strictly in order; the actions of one step run
//! concurrently and the step completes when all of them have. A
//! `Cancel` finalizes immediately: in-flight action futures are
//! aborted, which also stops any child workers they spawned.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use stevedore_core::plan::{DeploymentAction, DeploymentPlan};
use stevedore_core::{Event, Goal, GoalReason, Instance, InstanceId, RunSpec};

use crate::error::{DeployError, DeployResult};
use crate::manager::ManagerMsg;
use crate::scaling::propose;
use crate::watcher::InstanceWatch;
use crate::worker::{supervise, TaskReplaceWorker, TaskStartWorker};
use crate::DeployContext;

/// Progress messages an executor sends to its manager.
#[derive(Debug)]
pub enum ExecutorMsg {
    /// About to execute the step at `index` (1-based).
    StepInfo { plan_id: String, index: usize },
    /// All steps done, or the plan failed/was cancelled.
    Finished {
        plan_id: String,
        result: Result<(), String>,
    },
}

/// Run a plan to completion, reporting progress and the final outcome
/// to the manager. Spawned by the manager, one task per plan.
pub(crate) async fn run(
    plan: DeploymentPlan,
    ctx: DeployContext,
    manager: mpsc::Sender<ManagerMsg>,
    mut cancel: oneshot::Receiver<String>,
) {
    let plan_id = plan.id.clone();
    let result = execute_plan(&plan, &ctx, &manager, &mut cancel).await;
    match &result {
        Ok(()) => info!(%plan_id, "deployment finished"),
        Err(err) => warn!(%plan_id, error = %err, "deployment failed"),
    }
    let _ = manager
        .send(ManagerMsg::Executor(ExecutorMsg::Finished {
            plan_id,
            result: result.map_err(|e| e.to_string()),
        }))
        .await;
}

async fn execute_plan(
    plan: &DeploymentPlan,
    ctx: &DeployContext,
    manager: &mpsc::Sender<ManagerMsg>,
    cancel: &mut oneshot::Receiver<String>,
) -> DeployResult<()> {
    for (idx, step) in plan.steps.iter().enumerate() {
        let _ = manager
            .send(ManagerMsg::Executor(ExecutorMsg::StepInfo {
                plan_id: plan.id.clone(),
                index: idx + 1,
            }))
            .await;

        if step.is_empty() {
            continue;
        }

        ctx.events.publish(Event::DeploymentStatus {
            plan: plan.clone(),
            step: step.clone(),
        });
        debug!(plan_id = %plan.id, step = idx + 1, actions = step.actions.len(), "executing step");

        let mut actions = JoinSet::new();
        for action in &step.actions {
            actions.spawn(perform_action(ctx.clone(), action.clone()));
        }

        let step_result = loop {
            tokio::select! {
                reason = &mut *cancel => {
                    actions.abort_all();
                    let cause = reason.unwrap_or_else(|_| "deployment manager gone".to_string());
                    ctx.events.publish(Event::DeploymentStepFailure {
                        plan: plan.clone(),
                        step: step.clone(),
                    });
                    return Err(DeployError::Cancelled(cause));
                }
                joined = actions.join_next() => match joined {
                    None => break Ok(()),
                    Some(Ok(Ok(()))) => continue,
                    Some(Ok(Err(err))) => {
                        actions.abort_all();
                        break Err(err);
                    }
                    Some(Err(join_err)) => {
                        actions.abort_all();
                        break Err(DeployError::ActionFailed(join_err.to_string()));
                    }
                }
            }
        };

        match step_result {
            Ok(()) => ctx.events.publish(Event::DeploymentStepSuccess {
                plan: plan.clone(),
                step: step.clone(),
            }),
            Err(err) => {
                ctx.events.publish(Event::DeploymentStepFailure {
                    plan: plan.clone(),
                    step: step.clone(),
                });
                return Err(err);
            }
        }
    }
    Ok(())
}

async fn perform_action(ctx: DeployContext, action: DeploymentAction) -> DeployResult<()> {
    let run = action.run_spec().clone();
    // Health checks are registered for applications up front; pods and
    // check-less specs skip this. Registration failures do not fail the
    // deployment.
    if run.wants_health_checks() {
        if let Err(err) = ctx.health_checks.add_all_for(&run).await {
            warn!(run_spec = %run.id, error = %err, "health check registration failed");
        }
    }

    match action {
        // Starting is handled via scaling of the registered spec.
        DeploymentAction::Start { .. } => Ok(()),
        DeploymentAction::Scale {
            run,
            scale_to,
            to_kill,
        } => scale_action(&ctx, run, scale_to, to_kill).await,
        DeploymentAction::Restart { run } => restart_action(&ctx, run).await,
        DeploymentAction::Stop { run } => stop_action(&ctx, run).await,
    }
}

/// Kill the overcapacity (pinned victims first), then launch what is
/// missing. Kills are awaited before the launch phase begins.
async fn scale_action(
    ctx: &DeployContext,
    run: RunSpec,
    scale_to: u32,
    to_kill: Vec<InstanceId>,
) -> DeployResult<()> {
    let instances = match ctx.tracker.spec_instances(&run.id).await {
        Ok(instances) => instances,
        Err(err) => {
            // An unavailable tracker reads as "no active instances".
            warn!(run_spec = %run.id, error = %err, "tracker unavailable, assuming no instances");
            Vec::new()
        }
    };
    let active: Vec<Instance> = instances.into_iter().filter(Instance::is_active).collect();
    let proposition = propose(&active, &to_kill, scale_to, run.kill_selection);

    if let Some(victims) = proposition.to_kill {
        let updates = ctx
            .tracker
            .updates()
            .await
            .map_err(|e| DeployError::ActionFailed(e.to_string()))?;
        let watch = InstanceWatch::killed(
            updates,
            ctx.tracker.clone(),
            victims.iter().map(|i| i.id.clone()),
        );
        for victim in &victims {
            let goal = if victim.has_reservation {
                Goal::Stopped
            } else {
                Goal::Decommissioned
            };
            ctx.tracker
                .set_goal(&victim.id, goal, GoalReason::DeploymentScaling)
                .await
                .map_err(|e| DeployError::ActionFailed(e.to_string()))?;
        }
        debug!(run_spec = %run.id, victims = victims.len(), "waiting for scaled-down instances");
        watch
            .wait()
            .await
            .map_err(|e| DeployError::ActionFailed(e.to_string()))?;
    }

    if proposition.to_start.is_some() {
        let worker = TaskStartWorker::new(ctx.clone(), run.clone(), scale_to);
        supervise(&format!("task-start {}", run.id), move || {
            let worker = worker.clone();
            async move { worker.attempt().await }
        })
        .await
        .map_err(|e| DeployError::ActionFailed(e.to_string()))?;
    }
    Ok(())
}

async fn restart_action(ctx: &DeployContext, run: RunSpec) -> DeployResult<()> {
    if run.instances == 0 {
        debug!(run_spec = %run.id, "restart of suspended spec, nothing to do");
        return Ok(());
    }
    ctx.events.publish(Event::UpgradeEvent {
        run_spec_id: run.id.clone(),
    });
    let worker = TaskReplaceWorker::new(ctx.clone(), run.clone());
    supervise(&format!("task-replace {}", run.id), move || {
        let worker = worker.clone();
        async move { worker.attempt().await }
    })
    .await
    .map_err(|e| DeployError::ActionFailed(e.to_string()))
}

/// Decommission every instance and deregister the spec. Cleanup
/// failures are logged and swallowed so the deployment still makes
/// progress.
async fn stop_action(ctx: &DeployContext, run: RunSpec) -> DeployResult<()> {
    if let Err(err) = ctx.health_checks.remove_all_for(&run.id).await {
        warn!(run_spec = %run.id, error = %err, "health check removal failed");
    }
    if let Err(err) = ctx.launch_queue.purge(&run.id).await {
        warn!(run_spec = %run.id, error = %err, "launch queue purge failed");
    }

    let instances = match ctx.tracker.spec_instances(&run.id).await {
        Ok(instances) => instances,
        Err(err) => {
            warn!(run_spec = %run.id, error = %err, "tracker unavailable during stop");
            Vec::new()
        }
    };

    if !instances.is_empty() {
        let updates = match ctx.tracker.updates().await {
            Ok(updates) => Some(updates),
            Err(err) => {
                warn!(run_spec = %run.id, error = %err, "cannot watch decommissioning");
                None
            }
        };

        let mut expected = Vec::new();
        for instance in &instances {
            match ctx
                .tracker
                .set_goal(&instance.id, Goal::Decommissioned, GoalReason::DeletingApp)
                .await
            {
                Ok(()) => expected.push(instance.id.clone()),
                Err(err) => {
                    warn!(instance = %instance.id, error = %err, "decommission goal failed")
                }
            }
        }

        if let Some(updates) = updates
            && !expected.is_empty()
        {
            let watch = InstanceWatch::decommissioned(updates, ctx.tracker.clone(), expected);
            if let Err(err) = watch.wait().await {
                warn!(run_spec = %run.id, error = %err, "decommission watch aborted");
            }
        }
    }

    if let Err(err) = ctx.launch_queue.reset_delay(&run).await {
        warn!(run_spec = %run.id, error = %err, "launch delay reset failed");
    }
    ctx.events.publish(Event::AppTerminated {
        run_spec_id: run.id.clone(),
    });
    Ok(())
}
