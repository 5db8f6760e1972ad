//! Deployment manager — tracks every in-flight plan.
//!
//! An actor owning the active-plan table. Plans are persisted before
//! their executor spawns and deleted when it finishes, so a new leader
//! can recover exactly the set of interrupted deployments. Forced
//! deployments cancel every conflicting plan and wait for each one's
//! finish before starting.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use stevedore_core::plan::DeploymentPlan;
use stevedore_core::{DeploymentRepository, Event, RunSpecId};

use crate::error::{DeployError, DeployResult};
use crate::executor::{self, ExecutorMsg};
use crate::DeployContext;

const MAILBOX_CAPACITY: usize = 64;

/// Final outcome of one deployment, delivered on the `done` channel
/// returned by [`DeploymentManagerHandle::start`].
#[derive(Debug)]
pub struct DeploymentOutcome {
    pub plan: DeploymentPlan,
    pub result: Result<(), String>,
}

/// Snapshot of one active deployment, for listings.
#[derive(Debug, Clone)]
pub struct DeploymentInfo {
    pub plan: DeploymentPlan,
    /// 1-based index of the step currently executing; 0 before step 1.
    pub current_step: usize,
}

/// Mailbox messages of the manager actor.
pub enum ManagerMsg {
    Start {
        plan: DeploymentPlan,
        force: bool,
        /// Recovered plans are already persisted; skip the store write.
        recovered: bool,
        ack: oneshot::Sender<DeployResult<()>>,
        done: oneshot::Sender<DeploymentOutcome>,
    },
    Cancel {
        plan_id: String,
        reply: oneshot::Sender<DeployResult<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<DeploymentInfo>>,
    },
    Executor(ExecutorMsg),
}

struct ActiveDeployment {
    plan: DeploymentPlan,
    affected: BTreeSet<RunSpecId>,
    cancel: Option<oneshot::Sender<String>>,
    done: Option<oneshot::Sender<DeploymentOutcome>>,
    current_step: usize,
}

/// A forced start parked until its conflicting plans have finished.
struct PendingStart {
    plan: DeploymentPlan,
    recovered: bool,
    waiting_on: BTreeSet<String>,
    ack: oneshot::Sender<DeployResult<()>>,
    done: oneshot::Sender<DeploymentOutcome>,
}

/// Clone-able front-end to the manager actor.
#[derive(Clone)]
pub struct DeploymentManagerHandle {
    tx: mpsc::Sender<ManagerMsg>,
}

impl DeploymentManagerHandle {
    /// Begin a new plan. Resolves once the plan is registered and its
    /// executor spawned (or rejected); the returned channel resolves
    /// with the final outcome.
    pub async fn start(
        &self,
        plan: DeploymentPlan,
        force: bool,
        recovered: bool,
    ) -> DeployResult<oneshot::Receiver<DeploymentOutcome>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(ManagerMsg::Start {
                plan,
                force,
                recovered,
                ack: ack_tx,
                done: done_tx,
            })
            .await
            .map_err(|_| DeployError::ManagerGone)?;
        ack_rx.await.map_err(|_| DeployError::ManagerGone)??;
        Ok(done_rx)
    }

    /// Cancel a specific in-flight plan.
    pub async fn cancel(&self, plan_id: &str) -> DeployResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ManagerMsg::Cancel {
                plan_id: plan_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| DeployError::ManagerGone)?;
        reply_rx.await.map_err(|_| DeployError::ManagerGone)?
    }

    /// Snapshot of all active plans.
    pub async fn list(&self) -> DeployResult<Vec<DeploymentInfo>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ManagerMsg::List { reply: reply_tx })
            .await
            .map_err(|_| DeployError::ManagerGone)?;
        reply_rx.await.map_err(|_| DeployError::ManagerGone)
    }
}

/// The manager actor. Owns the active table exclusively; all access
/// goes through the mailbox.
pub struct DeploymentManager {
    ctx: DeployContext,
    repository: Arc<dyn DeploymentRepository>,
    tx: mpsc::Sender<ManagerMsg>,
    rx: mpsc::Receiver<ManagerMsg>,
    active: BTreeMap<String, ActiveDeployment>,
    pending: Vec<PendingStart>,
}

impl DeploymentManager {
    /// Spawn the manager actor and return its handle.
    pub fn spawn(
        ctx: DeployContext,
        repository: Arc<dyn DeploymentRepository>,
    ) -> DeploymentManagerHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let manager = Self {
            ctx,
            repository,
            tx: tx.clone(),
            rx,
            active: BTreeMap::new(),
            pending: Vec::new(),
        };
        tokio::spawn(manager.run());
        DeploymentManagerHandle { tx }
    }

    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                ManagerMsg::Start {
                    plan,
                    force,
                    recovered,
                    ack,
                    done,
                } => self.handle_start(plan, force, recovered, ack, done).await,
                ManagerMsg::Cancel { plan_id, reply } => {
                    let _ = reply.send(self.handle_cancel(&plan_id));
                }
                ManagerMsg::List { reply } => {
                    let infos = self
                        .active
                        .values()
                        .map(|entry| DeploymentInfo {
                            plan: entry.plan.clone(),
                            current_step: entry.current_step,
                        })
                        .collect();
                    let _ = reply.send(infos);
                }
                ManagerMsg::Executor(ExecutorMsg::StepInfo { plan_id, index }) => {
                    self.handle_step_info(&plan_id, index);
                }
                ManagerMsg::Executor(ExecutorMsg::Finished { plan_id, result }) => {
                    self.handle_finished(&plan_id, result).await;
                }
            }
        }
    }

    async fn handle_start(
        &mut self,
        plan: DeploymentPlan,
        force: bool,
        recovered: bool,
        ack: oneshot::Sender<DeployResult<()>>,
        done: oneshot::Sender<DeploymentOutcome>,
    ) {
        let affected = plan.affected_run_spec_ids();
        let conflicts: Vec<String> = self
            .active
            .values()
            .filter(|entry| entry.affected.iter().any(|id| affected.contains(id)))
            .map(|entry| entry.plan.id.clone())
            .collect();

        if conflicts.is_empty() {
            self.launch(plan, recovered, ack, done).await;
            return;
        }

        if !force {
            debug!(plan_id = %plan.id, ?conflicts, "deployment rejected, conflicting plans active");
            let _ = ack.send(Err(DeployError::Conflict {
                plan_id: plan.id,
                conflicts,
            }));
            return;
        }

        info!(plan_id = %plan.id, ?conflicts, "forced deployment, cancelling conflicting plans");
        for conflict_id in &conflicts {
            if let Some(entry) = self.active.get_mut(conflict_id)
                && let Some(cancel) = entry.cancel.take()
            {
                let _ = cancel.send(format!("superseded by deployment {}", plan.id));
            }
        }
        self.pending.push(PendingStart {
            plan,
            recovered,
            waiting_on: conflicts.into_iter().collect(),
            ack,
            done,
        });
    }

    async fn launch(
        &mut self,
        plan: DeploymentPlan,
        recovered: bool,
        ack: oneshot::Sender<DeployResult<()>>,
        done: oneshot::Sender<DeploymentOutcome>,
    ) {
        if !recovered
            && let Err(err) = self.repository.store(&plan).await
        {
            warn!(plan_id = %plan.id, error = %err, "failed to persist plan");
            let _ = ack.send(Err(DeployError::Repository(err.to_string())));
            return;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(executor::run(
            plan.clone(),
            self.ctx.clone(),
            self.tx.clone(),
            cancel_rx,
        ));
        self.active.insert(
            plan.id.clone(),
            ActiveDeployment {
                affected: plan.affected_run_spec_ids(),
                plan: plan.clone(),
                cancel: Some(cancel_tx),
                done: Some(done),
                current_step: 0,
            },
        );
        info!(plan_id = %plan.id, recovered, "deployment started");
        self.ctx.events.publish(Event::DeploymentStarted { plan });
        let _ = ack.send(Ok(()));
    }

    fn handle_cancel(&mut self, plan_id: &str) -> DeployResult<()> {
        match self.active.get_mut(plan_id) {
            Some(entry) => {
                if let Some(cancel) = entry.cancel.take() {
                    info!(%plan_id, "cancelling deployment");
                    let _ = cancel.send("cancelled".to_string());
                }
                Ok(())
            }
            None => Err(DeployError::UnknownDeployment(plan_id.to_string())),
        }
    }

    fn handle_step_info(&mut self, plan_id: &str, index: usize) {
        let Some(entry) = self.active.get_mut(plan_id) else {
            return;
        };
        entry.current_step = index;
        let plan = entry.plan.clone();
        if let Some(step) = plan.steps.get(index - 1).cloned() {
            self.ctx.events.publish(Event::DeploymentStepInfo { plan, step, index });
        }
    }

    async fn handle_finished(&mut self, plan_id: &str, result: Result<(), String>) {
        let Some(mut entry) = self.active.remove(plan_id) else {
            debug!(%plan_id, "finish for unknown plan, ignoring");
            return;
        };
        if let Err(err) = self.repository.delete(plan_id).await {
            warn!(%plan_id, error = %err, "failed to delete finished plan");
        }
        if let Some(done) = entry.done.take() {
            let _ = done.send(DeploymentOutcome {
                plan: entry.plan,
                result: result.clone(),
            });
        }

        // Re-submit forced starts that were waiting on this plan. They
        // go through conflict resolution again: a later forced start
        // may have been launched meanwhile and must be superseded too.
        for pending in &mut self.pending {
            pending.waiting_on.remove(plan_id);
        }
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].waiting_on.is_empty() {
                let ready = self.pending.remove(i);
                self.handle_start(ready.plan, true, ready.recovered, ready.ack, ready.done)
                    .await;
            } else {
                i += 1;
            }
        }
    }
}
