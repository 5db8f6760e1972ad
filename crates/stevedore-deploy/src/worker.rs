//! Subordinate workers — instance launch and replacement.
//!
//! Workers query the tracker and launch queue, both of which can fail
//! transiently, so they are designed to be idempotent and run under
//! [`supervise`]: restart on transient failure with exponential
//! back-off, escalate on fatal failure.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use stevedore_core::{Condition, Goal, GoalReason, Instance, InstanceChange, InstanceId, RunSpec};

use crate::DeployContext;

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const BACKOFF_JITTER: f64 = 0.2;

/// Failure of one worker attempt.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Retried by the supervisor after a back-off delay.
    #[error("transient worker failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Escalates and fails the enclosing deployment step.
    #[error("fatal worker failure: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl WorkerError {
    fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }
}

/// Run `attempt` to completion, restarting on transient failures with
/// exponential back-off (5s..1min, ±20% jitter).
pub async fn supervise<F, Fut>(name: &str, mut attempt: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), WorkerError>>,
{
    let mut restarts = 0u32;
    loop {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(WorkerError::Fatal(err)) => {
                error!(worker = name, error = %err, "worker failed fatally");
                return Err(err);
            }
            Err(WorkerError::Transient(err)) => {
                let delay = jittered(base_delay(restarts));
                warn!(
                    worker = name,
                    restarts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "worker failed, restarting after back-off"
                );
                restarts += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Exponential back-off before the given restart, capped at the maximum.
fn base_delay(restarts: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << restarts.min(5));
    exp.min(BACKOFF_MAX)
}

fn jittered(delay: Duration) -> Duration {
    let factor = 1.0 - BACKOFF_JITTER + rand::rng().random::<f64>() * 2.0 * BACKOFF_JITTER;
    delay.mul_f64(factor)
}

// ── Task start ─────────────────────────────────────────────────────

/// Brings a run spec up to `scale_to` running instances: queues the
/// missing launches, then watches the update stream until enough
/// instances report `Running`.
///
/// Idempotent: every attempt recounts live instances first and only
/// queues the remainder, so a supervisor restart never over-launches.
#[derive(Clone)]
pub struct TaskStartWorker {
    ctx: DeployContext,
    run: RunSpec,
    scale_to: u32,
}

impl TaskStartWorker {
    pub fn new(ctx: DeployContext, run: RunSpec, scale_to: u32) -> Self {
        Self { ctx, run, scale_to }
    }

    pub async fn attempt(&self) -> Result<(), WorkerError> {
        let mut updates = self
            .ctx
            .tracker
            .updates()
            .await
            .map_err(WorkerError::transient)?;

        let mut running: BTreeSet<InstanceId> = updates
            .snapshot
            .iter()
            .filter(|i| self.matches(i) && i.condition == Condition::Running)
            .map(|i| i.id.clone())
            .collect();

        // Anything not yet terminal still counts toward the target, so
        // a restarted attempt only queues what is genuinely missing.
        let launchable = updates
            .snapshot
            .iter()
            .filter(|i| self.matches(i) && !i.condition.is_terminal())
            .count() as u32;

        let missing = self.scale_to.saturating_sub(launchable);
        if missing > 0 {
            debug!(run_spec = %self.run.id, missing, "queueing instance launches");
            self.ctx
                .launch_queue
                .add(&self.run, missing)
                .await
                .map_err(WorkerError::transient)?;
        }

        while (running.len() as u32) < self.scale_to {
            match updates.rx.recv().await {
                Ok(InstanceChange::Updated(i)) if self.matches(&i) => {
                    if i.condition == Condition::Running {
                        running.insert(i.id);
                    } else if i.condition.is_terminal() {
                        running.remove(&i.id);
                    }
                }
                Ok(InstanceChange::Updated(_)) => {}
                Ok(InstanceChange::Removed(id)) => {
                    running.remove(&id);
                }
                Err(RecvError::Lagged(skipped)) => {
                    return Err(WorkerError::transient(anyhow::anyhow!(
                        "update stream lagged by {skipped} events"
                    )));
                }
                Err(RecvError::Closed) => {
                    return Err(WorkerError::Fatal(anyhow::anyhow!(
                        "instance update stream closed"
                    )));
                }
            }
        }
        Ok(())
    }

    fn matches(&self, instance: &Instance) -> bool {
        instance.run_spec_id == self.run.id
    }
}

// ── Task replace ───────────────────────────────────────────────────

/// Replaces every old-revision instance of a run spec with the new
/// revision: decommissions the old instances (reason `Upgrading`),
/// waits for them to terminate, then brings the new revision up to the
/// spec's instance count.
#[derive(Clone)]
pub struct TaskReplaceWorker {
    ctx: DeployContext,
    run: RunSpec,
}

impl TaskReplaceWorker {
    pub fn new(ctx: DeployContext, run: RunSpec) -> Self {
        Self { ctx, run }
    }

    pub async fn attempt(&self) -> Result<(), WorkerError> {
        let updates = self
            .ctx
            .tracker
            .updates()
            .await
            .map_err(WorkerError::transient)?;

        let old: Vec<Instance> = updates
            .snapshot
            .iter()
            .filter(|i| {
                i.run_spec_id == self.run.id
                    && i.run_spec_version != self.run.version
                    && i.is_active()
            })
            .cloned()
            .collect();

        if !old.is_empty() {
            let watch = crate::watcher::InstanceWatch::killed(
                updates,
                self.ctx.tracker.clone(),
                old.iter().map(|i| i.id.clone()),
            );
            for instance in &old {
                let goal = if instance.has_reservation {
                    Goal::Stopped
                } else {
                    Goal::Decommissioned
                };
                self.ctx
                    .tracker
                    .set_goal(&instance.id, goal, GoalReason::Upgrading)
                    .await
                    .map_err(WorkerError::transient)?;
            }
            debug!(
                run_spec = %self.run.id,
                old = old.len(),
                "waiting for old-revision instances to terminate"
            );
            watch.wait().await.map_err(WorkerError::transient)?;
        }

        TaskStartWorker::new(self.ctx.clone(), self.run.clone(), self.run.instances)
            .attempt()
            .await
    }
}
