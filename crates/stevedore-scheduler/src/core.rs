//! Scheduler core — the single serialization point.
//!
//! One actor processes every externally visible mutating command in
//! arrival order. Handlers may suspend on collaborator calls, during
//! which further commands stay queued; this cooperative discipline is
//! what makes the lock table safe without synchronization.
//!
//! Lifecycle: the core starts **suspended** and buffers commands until
//! `ElectedAsLeaderAndReady` arrives, then recovers persisted plans and
//! starts. `Standby` drops the lock table and suspends again; in-flight
//! executors keep running and their late completions are discarded.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use stevedore_core::plan::DeploymentPlan;
use stevedore_core::{
    DeploymentRepository, Event, EventBus, HealthCheckManager, InstanceId, RunSpecId,
    RunSpecKind,
};
use stevedore_deploy::{DeployError, DeploymentInfo, DeploymentManagerHandle};

use crate::actions::SchedulerActions;
use crate::error::{SchedulerError, SchedulerResult};
use crate::locks::LockTable;

const MAILBOX_CAPACITY: usize = 256;
const STASH_CAPACITY: usize = 1024;

/// Collaborators of the scheduler core.
pub struct SchedulerDeps {
    pub manager: DeploymentManagerHandle,
    pub repository: Arc<dyn DeploymentRepository>,
    pub health_checks: Arc<dyn HealthCheckManager>,
    pub actions: SchedulerActions,
    pub events: EventBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Suspended,
    Started,
}

/// Mailbox commands. External commands carry reply channels; the
/// `*Finished`/`*Scaled`/`*Killed` variants are self-messages closing
/// out background work.
enum Command {
    Deploy {
        plan: DeploymentPlan,
        force: bool,
        reply: Option<oneshot::Sender<SchedulerResult<()>>>,
    },
    CancelDeployment {
        plan_id: String,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    ListDeployments {
        reply: oneshot::Sender<SchedulerResult<Vec<DeploymentInfo>>>,
    },
    ScaleRunSpec {
        id: RunSpecId,
    },
    KillInstances {
        id: RunSpecId,
        instances: Vec<InstanceId>,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    ReconcileTasks {
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    LeaderElected {
        reply: oneshot::Sender<()>,
    },
    Standby {
        reply: oneshot::Sender<()>,
    },
    DeploymentFinished {
        plan: DeploymentPlan,
    },
    DeploymentFailed {
        plan: DeploymentPlan,
        reason: Option<String>,
    },
    RunSpecScaled {
        id: RunSpecId,
    },
    TasksKilled {
        id: RunSpecId,
    },
    ReconcileFinished {
        result: Result<(), String>,
    },
}

/// Clone-able front-end to the scheduler core.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Submit a deployment plan. Resolves once the plan is accepted
    /// (its executor running) or rejected.
    pub async fn deploy(&self, plan: DeploymentPlan, force: bool) -> SchedulerResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Deploy {
            plan,
            force,
            reply: Some(reply_tx),
        })
        .await?;
        reply_rx.await.map_err(|_| SchedulerError::SchedulerGone)?
    }

    pub async fn cancel_deployment(&self, plan_id: &str) -> SchedulerResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::CancelDeployment {
            plan_id: plan_id.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| SchedulerError::SchedulerGone)?
    }

    pub async fn list_deployments(&self) -> SchedulerResult<Vec<DeploymentInfo>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::ListDeployments { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| SchedulerError::SchedulerGone)?
    }

    /// Request a background scale of one run spec. Dropped silently
    /// when the run spec is locked by other work.
    pub async fn scale_run_spec(&self, id: RunSpecId) -> SchedulerResult<()> {
        self.send(Command::ScaleRunSpec { id }).await
    }

    /// Decommission specific instances of one run spec; resolves when
    /// they have terminated.
    pub async fn kill_instances(
        &self,
        id: RunSpecId,
        instances: Vec<InstanceId>,
    ) -> SchedulerResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::KillInstances {
            id,
            instances,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| SchedulerError::SchedulerGone)?
    }

    /// Reconcile task statuses with the cluster. Concurrent requests
    /// share one underlying reconciliation.
    pub async fn reconcile_tasks(&self) -> SchedulerResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::ReconcileTasks { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| SchedulerError::SchedulerGone)?
    }

    /// Leadership acquired; resolves once recovery has finished and the
    /// core accepts commands.
    pub async fn leader_elected(&self) -> SchedulerResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::LeaderElected { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| SchedulerError::SchedulerGone)
    }

    /// Leadership lost; the core clears its locks and suspends.
    pub async fn standby(&self) -> SchedulerResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Standby { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| SchedulerError::SchedulerGone)
    }

    async fn send(&self, cmd: Command) -> SchedulerResult<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| SchedulerError::SchedulerGone)
    }
}

/// The scheduler core actor.
pub struct SchedulerCore {
    deps: SchedulerDeps,
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
    lifecycle: Lifecycle,
    locks: LockTable,
    stash: VecDeque<Command>,
    /// Reply channels of requests satisfied by the in-flight
    /// reconciliation; `None` when no reconciliation is running.
    reconcile_waiters: Option<Vec<oneshot::Sender<SchedulerResult<()>>>>,
}

impl SchedulerCore {
    /// Spawn the core actor (suspended) and return its handle.
    pub fn spawn(deps: SchedulerDeps) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let core = Self {
            deps,
            tx: tx.clone(),
            rx,
            lifecycle: Lifecycle::Suspended,
            locks: LockTable::new(),
            stash: VecDeque::new(),
            reconcile_waiters: None,
        };
        tokio::spawn(core.run());
        SchedulerHandle { tx }
    }

    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match self.lifecycle {
                Lifecycle::Suspended => self.handle_suspended(cmd).await,
                Lifecycle::Started => self.handle_started(cmd).await,
            }
        }
    }

    // ── Suspended ──────────────────────────────────────────────────

    async fn handle_suspended(&mut self, cmd: Command) {
        match cmd {
            Command::LeaderElected { reply } => {
                self.recover().await;
                self.lifecycle = Lifecycle::Started;
                let stashed: Vec<Command> = self.stash.drain(..).collect();
                info!(stashed = stashed.len(), "leadership acquired, scheduler started");
                for cmd in stashed {
                    self.handle_started(cmd).await;
                }
                self.reconcile_health_checks().await;
                let _ = reply.send(());
            }
            Command::Standby { reply } => {
                let _ = reply.send(());
            }
            // Late completions of work from a previous leadership term.
            Command::DeploymentFinished { plan } | Command::DeploymentFailed { plan, .. } => {
                debug!(plan_id = %plan.id, "dropping deployment completion while suspended");
            }
            Command::RunSpecScaled { id } | Command::TasksKilled { id } => {
                debug!(run_spec = %id, "dropping command completion while suspended");
            }
            Command::ReconcileFinished { .. } => {
                self.reconcile_waiters = None;
            }
            other => self.stash(other),
        }
    }

    fn stash(&mut self, cmd: Command) {
        if self.stash.len() >= STASH_CAPACITY {
            warn!("command stash full while suspended, rejecting command");
            reject_not_ready(cmd);
            return;
        }
        self.stash.push_back(cmd);
    }

    /// Re-deploy every persisted plan. Repository failures degrade to
    /// an empty plan set.
    async fn recover(&mut self) {
        let plans = match self.deps.repository.all().await {
            Ok(plans) => plans,
            Err(err) => {
                warn!(error = %err, "failed to load persisted plans, starting with none");
                Vec::new()
            }
        };
        info!(plans = plans.len(), "recovering persisted deployments");
        for plan in plans {
            self.deploy(plan, false, true, None).await;
        }
    }

    async fn reconcile_health_checks(&self) {
        let apps = match self.deps.actions.group_repo.root().await {
            Ok(root) => root
                .transitive_run_specs()
                .into_iter()
                .filter(|s| s.kind == RunSpecKind::Application)
                .cloned()
                .collect::<Vec<_>>(),
            Err(err) => {
                warn!(error = %err, "cannot read group root for health check reconciliation");
                return;
            }
        };
        if let Err(err) = self.deps.health_checks.reconcile(&apps).await {
            warn!(error = %err, "health check reconciliation failed");
        }
    }

    // ── Started ────────────────────────────────────────────────────

    async fn handle_started(&mut self, cmd: Command) {
        match cmd {
            Command::LeaderElected { reply } => {
                let _ = reply.send(());
            }
            Command::Standby { reply } => {
                info!("standby, suspending scheduler");
                if let Err(err) = self.deps.health_checks.remove_all().await {
                    warn!(error = %err, "health check removal failed on standby");
                }
                self.locks.clear();
                self.lifecycle = Lifecycle::Suspended;
                let _ = reply.send(());
            }
            Command::Deploy { plan, force, reply } => {
                self.deploy(plan, force, false, reply).await;
            }
            Command::CancelDeployment { plan_id, reply } => {
                let result = match self.deps.manager.cancel(&plan_id).await {
                    Ok(()) => Ok(()),
                    Err(DeployError::UnknownDeployment(id)) => {
                        Err(SchedulerError::UnknownDeployment(id))
                    }
                    Err(err) => Err(SchedulerError::CommandFailed(err.to_string())),
                };
                let _ = reply.send(result);
            }
            Command::ListDeployments { reply } => {
                let result = self
                    .deps
                    .manager
                    .list()
                    .await
                    .map_err(|err| SchedulerError::CommandFailed(err.to_string()));
                let _ = reply.send(result);
            }
            Command::ScaleRunSpec { id } => self.scale_run_spec(id),
            Command::KillInstances {
                id,
                instances,
                reply,
            } => self.kill_instances(id, instances, reply),
            Command::ReconcileTasks { reply } => self.reconcile_tasks(reply),
            Command::ReconcileFinished { result } => {
                // Clear the marker before replying, so a requester that
                // reacts to the reply starts a fresh reconciliation.
                let waiters = self.reconcile_waiters.take().unwrap_or_default();
                if result.is_ok() {
                    self.deps.events.publish(Event::TasksReconciled);
                }
                for reply in waiters {
                    let _ = reply.send(
                        result
                            .clone()
                            .map_err(SchedulerError::CommandFailed),
                    );
                }
            }
            Command::DeploymentFinished { plan } => {
                let affected = plan.affected_run_spec_ids();
                self.locks.remove_locks(affected.iter());
                info!(plan_id = %plan.id, "deployment succeeded");
                self.deps.events.publish(Event::DeploymentSuccess {
                    id: plan.id.clone(),
                    plan,
                });
            }
            Command::DeploymentFailed { plan, reason } => {
                let affected = plan.affected_run_spec_ids();
                self.locks.remove_locks(affected.iter());
                for id in &affected {
                    if let Err(err) = self.deps.actions.launch_queue.purge(id).await {
                        warn!(run_spec = %id, error = %err, "launch queue purge failed");
                    }
                }
                warn!(plan_id = %plan.id, ?reason, "deployment failed");
                self.deps.events.publish(Event::DeploymentFailed {
                    id: plan.id.clone(),
                    plan,
                    reason,
                });
            }
            Command::RunSpecScaled { id } | Command::TasksKilled { id } => {
                self.locks.remove_lock(&id);
            }
        }
    }

    /// Acquire locks up front, then let the manager resolve conflicts.
    /// A rejection releases the provisionally acquired locks on the
    /// same path as the `AppLocked` reply; no failure event is
    /// published for it.
    async fn deploy(
        &mut self,
        plan: DeploymentPlan,
        force: bool,
        recovered: bool,
        reply: Option<oneshot::Sender<SchedulerResult<()>>>,
    ) {
        let affected = plan.affected_run_spec_ids();
        self.locks.add_locks(affected.iter().cloned());

        match self.deps.manager.start(plan.clone(), force, recovered).await {
            Ok(done) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let cmd = match done.await {
                        Ok(outcome) => match outcome.result {
                            Ok(()) => Command::DeploymentFinished { plan: outcome.plan },
                            Err(reason) => Command::DeploymentFailed {
                                plan: outcome.plan,
                                reason: Some(reason),
                            },
                        },
                        Err(_) => Command::DeploymentFailed {
                            plan,
                            reason: Some("deployment manager gone".to_string()),
                        },
                    };
                    let _ = tx.send(cmd).await;
                });
            }
            Err(DeployError::Conflict { plan_id, conflicts }) => {
                debug!(%plan_id, ?conflicts, "deployment rejected, releasing provisional locks");
                self.locks.remove_locks(affected.iter());
                if let Some(reply) = reply {
                    let _ = reply.send(Err(SchedulerError::AppLocked { plan_id, conflicts }));
                }
            }
            Err(err) => {
                self.locks.remove_locks(affected.iter());
                if let Some(reply) = reply {
                    let _ = reply.send(Err(SchedulerError::CommandFailed(err.to_string())));
                }
            }
        }
    }

    fn scale_run_spec(&mut self, id: RunSpecId) {
        let ids = BTreeSet::from([id.clone()]);
        if self.locks.with_lock_for(&ids, || ()).is_none() {
            debug!(run_spec = %id, "scale dropped, run spec locked");
            return;
        }
        let actions = self.deps.actions.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(err) = actions.scale(&id).await {
                warn!(run_spec = %id, error = %err, "background scale failed");
            }
            let _ = tx.send(Command::RunSpecScaled { id }).await;
        });
    }

    fn kill_instances(
        &mut self,
        id: RunSpecId,
        instances: Vec<InstanceId>,
        reply: oneshot::Sender<SchedulerResult<()>>,
    ) {
        let ids = BTreeSet::from([id.clone()]);
        if self.locks.with_lock_for(&ids, || ()).is_none() {
            let _ = reply.send(Err(SchedulerError::CommandFailed(format!(
                "run spec {id} is locked by another operation"
            ))));
            return;
        }
        let actions = self.deps.actions.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = actions
                .kill_instances(&id, &instances)
                .await
                .map_err(|err| SchedulerError::CommandFailed(err.to_string()));
            let _ = reply.send(result);
            let _ = tx.send(Command::TasksKilled { id }).await;
        });
    }

    fn reconcile_tasks(&mut self, reply: oneshot::Sender<SchedulerResult<()>>) {
        if let Some(waiters) = &mut self.reconcile_waiters {
            debug!("reconciliation already in flight, sharing its result");
            waiters.push(reply);
            return;
        }
        self.reconcile_waiters = Some(vec![reply]);
        let actions = self.deps.actions.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = actions.reconcile().await.map_err(|err| err.to_string());
            let _ = tx.send(Command::ReconcileFinished { result }).await;
        });
    }
}

/// Fail a rejected command's reply channel, if it has one.
fn reject_not_ready(cmd: Command) {
    match cmd {
        Command::Deploy {
            reply: Some(reply), ..
        } => {
            let _ = reply.send(Err(SchedulerError::NotReady));
        }
        Command::CancelDeployment { reply, .. } => {
            let _ = reply.send(Err(SchedulerError::NotReady));
        }
        Command::ListDeployments { reply } => {
            let _ = reply.send(Err(SchedulerError::NotReady));
        }
        Command::KillInstances { reply, .. } => {
            let _ = reply.send(Err(SchedulerError::NotReady));
        }
        Command::ReconcileTasks { reply } => {
            let _ = reply.send(Err(SchedulerError::NotReady));
        }
        _ => {}
    }
}
