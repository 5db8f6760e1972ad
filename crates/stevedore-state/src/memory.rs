//! In-memory collaborators — instance tracker, launch queue, health
//! check registry, and task driver.
//!
//! The standalone daemon has no external cluster, so these double as
//! its working implementations: the tracker can acknowledge kill goals
//! itself and the launch queue can fulfil launches immediately. The
//! integration suites drive them the same way.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use stevedore_core::{
    Condition, Goal, GoalReason, HealthCheckManager, Instance, InstanceChange, InstanceId,
    InstanceTracker, InstanceUpdates, LaunchQueue, RunSpec, RunSpecId, TaskDriver, TaskStatus,
};

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Instance tracker ───────────────────────────────────────────────

/// In-memory authoritative instance store with a broadcast update feed.
///
/// `updates()` takes the snapshot and subscribes under one lock, so a
/// subscriber never misses a change published after its snapshot.
pub struct MemoryInstanceTracker {
    instances: Mutex<BTreeMap<InstanceId, Instance>>,
    tx: broadcast::Sender<InstanceChange>,
    /// When set, a Stopped/Decommissioned goal immediately drives the
    /// condition to `Killed` (standalone mode has no cluster to do it).
    react_to_goals: bool,
    suffix: AtomicU64,
    goal_changes: Mutex<Vec<(InstanceId, Goal, GoalReason)>>,
}

impl MemoryInstanceTracker {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// Tracker that acknowledges kill goals itself.
    pub fn reactive() -> Arc<Self> {
        Self::build(true)
    }

    fn build(react_to_goals: bool) -> Arc<Self> {
        let (tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            instances: Mutex::new(BTreeMap::new()),
            tx,
            react_to_goals,
            suffix: AtomicU64::new(1),
            goal_changes: Mutex::new(Vec::new()),
        })
    }

    /// Insert or replace an instance and publish the change.
    pub fn put_instance(&self, instance: Instance) {
        let mut instances = self.instances.lock().unwrap();
        instances.insert(instance.id.clone(), instance.clone());
        let _ = self.tx.send(InstanceChange::Updated(instance));
    }

    /// Create a fresh running instance of the given spec revision.
    pub fn launch_instance(&self, run: &RunSpec) -> Instance {
        let suffix = self.suffix.fetch_add(1, Ordering::Relaxed);
        let instance = Instance {
            id: InstanceId::for_run_spec(&run.id, &format!("{suffix:08x}")),
            run_spec_id: run.id.clone(),
            run_spec_version: run.version,
            condition: Condition::Running,
            goal: Goal::Running,
            has_reservation: false,
            started_at: epoch_millis(),
            tasks: Vec::new(),
        };
        self.put_instance(instance.clone());
        instance
    }

    /// Transition an instance's condition and publish the change.
    pub fn set_condition(&self, id: &InstanceId, condition: Condition) {
        let mut instances = self.instances.lock().unwrap();
        if let Some(instance) = instances.get_mut(id) {
            instance.condition = condition;
            let _ = self.tx.send(InstanceChange::Updated(instance.clone()));
        }
    }

    /// Forget an instance entirely and publish the removal.
    pub fn remove(&self, id: &InstanceId) {
        let mut instances = self.instances.lock().unwrap();
        if instances.remove(id).is_some() {
            let _ = self.tx.send(InstanceChange::Removed(id.clone()));
        }
    }

    /// Current goal and condition of an instance, for assertions.
    pub fn goal_of(&self, id: &InstanceId) -> Option<(Goal, Condition)> {
        let instances = self.instances.lock().unwrap();
        instances.get(id).map(|i| (i.goal, i.condition))
    }

    /// Every goal change issued so far, in order, for assertions.
    pub fn goal_changes(&self) -> Vec<(InstanceId, Goal, GoalReason)> {
        self.goal_changes.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstanceTracker for MemoryInstanceTracker {
    async fn spec_instances(&self, id: &RunSpecId) -> anyhow::Result<Vec<Instance>> {
        let instances = self.instances.lock().unwrap();
        Ok(instances
            .values()
            .filter(|i| &i.run_spec_id == id)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &InstanceId) -> anyhow::Result<Option<Instance>> {
        let instances = self.instances.lock().unwrap();
        Ok(instances.get(id).cloned())
    }

    async fn instances_by_spec(&self) -> anyhow::Result<BTreeMap<RunSpecId, Vec<Instance>>> {
        let instances = self.instances.lock().unwrap();
        let mut by_spec: BTreeMap<RunSpecId, Vec<Instance>> = BTreeMap::new();
        for instance in instances.values() {
            by_spec
                .entry(instance.run_spec_id.clone())
                .or_default()
                .push(instance.clone());
        }
        Ok(by_spec)
    }

    async fn set_goal(
        &self,
        id: &InstanceId,
        goal: Goal,
        reason: GoalReason,
    ) -> anyhow::Result<()> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown instance {id}"))?;
        instance.goal = goal;
        debug!(instance = %id, ?goal, ?reason, "goal set");
        self.goal_changes
            .lock()
            .unwrap()
            .push((id.clone(), goal, reason));
        let _ = self.tx.send(InstanceChange::Updated(instance.clone()));

        if self.react_to_goals
            && matches!(goal, Goal::Stopped | Goal::Decommissioned)
            && !instance.condition.is_terminal()
        {
            instance.condition = Condition::Killed;
            let _ = self.tx.send(InstanceChange::Updated(instance.clone()));
        }
        Ok(())
    }

    async fn updates(&self) -> anyhow::Result<InstanceUpdates> {
        let instances = self.instances.lock().unwrap();
        let snapshot = instances.values().cloned().collect();
        let rx = self.tx.subscribe();
        Ok(InstanceUpdates { snapshot, rx })
    }
}

// ── Launch queue ───────────────────────────────────────────────────

/// Recording launch queue; optionally fulfils launches on the spot by
/// creating running instances in the tracker.
pub struct MemoryLaunchQueue {
    tracker: Option<Arc<MemoryInstanceTracker>>,
    adds: Mutex<Vec<(RunSpecId, u32)>>,
    purges: Mutex<Vec<RunSpecId>>,
    resets: Mutex<Vec<(RunSpecId, u32)>>,
}

impl MemoryLaunchQueue {
    pub fn new() -> Self {
        Self {
            tracker: None,
            adds: Mutex::new(Vec::new()),
            purges: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
        }
    }

    /// Queue that creates running instances in `tracker` on every add.
    pub fn fulfilling(tracker: Arc<MemoryInstanceTracker>) -> Self {
        Self {
            tracker: Some(tracker),
            ..Self::new()
        }
    }

    pub fn adds(&self) -> Vec<(RunSpecId, u32)> {
        self.adds.lock().unwrap().clone()
    }

    pub fn purges(&self) -> Vec<RunSpecId> {
        self.purges.lock().unwrap().clone()
    }

    /// Recorded `reset_delay` calls as (id, instances-at-reset).
    pub fn resets(&self) -> Vec<(RunSpecId, u32)> {
        self.resets.lock().unwrap().clone()
    }
}

impl Default for MemoryLaunchQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LaunchQueue for MemoryLaunchQueue {
    async fn add(&self, run: &RunSpec, count: u32) -> anyhow::Result<()> {
        self.adds.lock().unwrap().push((run.id.clone(), count));
        debug!(run_spec = %run.id, count, "launches queued");
        if let Some(tracker) = &self.tracker {
            for _ in 0..count {
                tracker.launch_instance(run);
            }
        }
        Ok(())
    }

    async fn purge(&self, id: &RunSpecId) -> anyhow::Result<()> {
        self.purges.lock().unwrap().push(id.clone());
        Ok(())
    }

    async fn reset_delay(&self, run: &RunSpec) -> anyhow::Result<()> {
        self.resets
            .lock()
            .unwrap()
            .push((run.id.clone(), run.instances));
        Ok(())
    }
}

// ── Health checks ──────────────────────────────────────────────────

/// Recording health check registry.
pub struct MemoryHealthChecks {
    registered: Mutex<BTreeSet<RunSpecId>>,
    reconcile_calls: AtomicU64,
}

impl MemoryHealthChecks {
    pub fn new() -> Self {
        Self {
            registered: Mutex::new(BTreeSet::new()),
            reconcile_calls: AtomicU64::new(0),
        }
    }

    pub fn registered(&self) -> Vec<RunSpecId> {
        self.registered.lock().unwrap().iter().cloned().collect()
    }

    pub fn reconcile_calls(&self) -> u64 {
        self.reconcile_calls.load(Ordering::Relaxed)
    }
}

impl Default for MemoryHealthChecks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthCheckManager for MemoryHealthChecks {
    async fn add_all_for(&self, run: &RunSpec) -> anyhow::Result<()> {
        self.registered.lock().unwrap().insert(run.id.clone());
        Ok(())
    }

    async fn remove_all_for(&self, id: &RunSpecId) -> anyhow::Result<()> {
        self.registered.lock().unwrap().remove(id);
        Ok(())
    }

    async fn remove_all(&self) -> anyhow::Result<()> {
        self.registered.lock().unwrap().clear();
        Ok(())
    }

    async fn reconcile(&self, apps: &[RunSpec]) -> anyhow::Result<()> {
        self.reconcile_calls.fetch_add(1, Ordering::Relaxed);
        let mut registered = self.registered.lock().unwrap();
        registered.clear();
        registered.extend(
            apps.iter()
                .filter(|a| a.wants_health_checks())
                .map(|a| a.id.clone()),
        );
        Ok(())
    }
}

// ── Task driver ────────────────────────────────────────────────────

/// Records every `reconcile_tasks` payload for assertions.
pub struct RecordingDriver {
    calls: Mutex<Vec<Vec<TaskStatus>>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<TaskStatus>> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskDriver for RecordingDriver {
    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(statuses);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(path: &str) -> RunSpecId {
        RunSpecId::parse(path).unwrap()
    }

    fn test_instance(tracker: &MemoryInstanceTracker, path: &str) -> Instance {
        let run = RunSpec::app(id(path), 1);
        tracker.launch_instance(&run)
    }

    #[tokio::test]
    async fn snapshot_then_stream_has_no_gap() {
        let tracker = MemoryInstanceTracker::new();
        let existing = test_instance(&tracker, "/foo/app");

        let mut updates = tracker.updates().await.unwrap();
        assert_eq!(updates.snapshot.len(), 1);
        assert_eq!(updates.snapshot[0].id, existing.id);

        // A change after subscription arrives on the stream.
        tracker.set_condition(&existing.id, Condition::Killed);
        match updates.rx.recv().await.unwrap() {
            InstanceChange::Updated(i) => assert_eq!(i.condition, Condition::Killed),
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[tokio::test]
    async fn set_goal_is_idempotent() {
        let tracker = MemoryInstanceTracker::new();
        let instance = test_instance(&tracker, "/foo/app");

        for _ in 0..3 {
            tracker
                .set_goal(&instance.id, Goal::Decommissioned, GoalReason::Orphaned)
                .await
                .unwrap();
        }
        let (goal, _) = tracker.goal_of(&instance.id).unwrap();
        assert_eq!(goal, Goal::Decommissioned);
    }

    #[tokio::test]
    async fn set_goal_on_unknown_instance_fails() {
        let tracker = MemoryInstanceTracker::new();
        let missing = InstanceId::for_run_spec(&id("/foo/app"), "nope");
        assert!(tracker
            .set_goal(&missing, Goal::Decommissioned, GoalReason::Orphaned)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reactive_tracker_kills_on_decommission() {
        let tracker = MemoryInstanceTracker::reactive();
        let instance = test_instance(&tracker, "/foo/app");

        tracker
            .set_goal(
                &instance.id,
                Goal::Decommissioned,
                GoalReason::DeploymentScaling,
            )
            .await
            .unwrap();

        let (goal, condition) = tracker.goal_of(&instance.id).unwrap();
        assert_eq!(goal, Goal::Decommissioned);
        assert_eq!(condition, Condition::Killed);
    }

    #[tokio::test]
    async fn fulfilling_queue_creates_running_instances() {
        let tracker = MemoryInstanceTracker::new();
        let queue = MemoryLaunchQueue::fulfilling(Arc::clone(&tracker));
        let run = RunSpec::app(id("/foo/app"), 3);

        queue.add(&run, 3).await.unwrap();

        let instances = tracker.spec_instances(&run.id).await.unwrap();
        assert_eq!(instances.len(), 3);
        assert!(instances.iter().all(|i| i.condition == Condition::Running));
        assert_eq!(queue.adds(), vec![(run.id.clone(), 3)]);
    }

    #[tokio::test]
    async fn health_checks_register_and_reconcile() {
        let checks = MemoryHealthChecks::new();
        let mut app = RunSpec::app(id("/foo/app"), 1);
        app.health_checks = vec![stevedore_core::HealthCheckSpec {
            path: "/healthz".to_string(),
            interval_secs: 5,
            timeout_secs: 2,
            unhealthy_threshold: 3,
        }];

        checks.add_all_for(&app).await.unwrap();
        assert_eq!(checks.registered(), vec![app.id.clone()]);

        checks.remove_all().await.unwrap();
        assert!(checks.registered().is_empty());

        checks.reconcile(std::slice::from_ref(&app)).await.unwrap();
        assert_eq!(checks.registered(), vec![app.id.clone()]);
        assert_eq!(checks.reconcile_calls(), 1);
    }
}
