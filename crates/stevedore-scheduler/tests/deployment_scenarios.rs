//! End-to-end deployment scenarios over the real scheduler core,
//! deployment manager, and step executors, wired against the in-memory
//! collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::timeout;

use stevedore_core::{
    Condition, Event, EventBus, Goal, GoalReason, Group, Instance, InstanceId, RunSpec,
    RunSpecId, TaskDriver, TaskStatus,
};
use stevedore_deploy::{build_plan, DeployContext, DeploymentManager};
use stevedore_scheduler::{SchedulerActions, SchedulerCore, SchedulerDeps, SchedulerError, SchedulerHandle};
use stevedore_state::{
    MemoryHealthChecks, MemoryInstanceTracker, MemoryLaunchQueue, RecordingDriver, StateStore,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn id(path: &str) -> RunSpecId {
    RunSpecId::parse(path).unwrap()
}

fn app(path: &str, instances: u32, cmd: Option<&str>, version: u64) -> RunSpec {
    RunSpec {
        cmd: cmd.map(str::to_string),
        version,
        ..RunSpec::app(id(path), instances)
    }
}

fn instance(run: &RunSpec, suffix: &str, started_at: u64) -> Instance {
    Instance {
        id: InstanceId::for_run_spec(&run.id, suffix),
        run_spec_id: run.id.clone(),
        run_spec_version: run.version,
        condition: Condition::Running,
        goal: Goal::Running,
        has_reservation: false,
        started_at,
        tasks: Vec::new(),
    }
}

struct Cluster {
    scheduler: SchedulerHandle,
    tracker: Arc<MemoryInstanceTracker>,
    queue: Arc<MemoryLaunchQueue>,
    health: Arc<MemoryHealthChecks>,
    driver: Arc<RecordingDriver>,
    store: StateStore,
    events: EventBus,
}

/// Wire the real core/manager/executor stack. `reactive` clusters
/// acknowledge kills and fulfil launches on their own; non-reactive
/// ones leave deployments wedged until the test intervenes.
fn cluster(reactive: bool) -> Cluster {
    cluster_over(StateStore::open_in_memory().unwrap(), reactive)
}

fn cluster_over(store: StateStore, reactive: bool) -> Cluster {
    let tracker = if reactive {
        MemoryInstanceTracker::reactive()
    } else {
        MemoryInstanceTracker::new()
    };
    let queue = if reactive {
        Arc::new(MemoryLaunchQueue::fulfilling(Arc::clone(&tracker)))
    } else {
        Arc::new(MemoryLaunchQueue::new())
    };
    let health = Arc::new(MemoryHealthChecks::new());
    let driver = Arc::new(RecordingDriver::new());
    let events = EventBus::default();

    let ctx = DeployContext {
        tracker: tracker.clone(),
        launch_queue: queue.clone(),
        health_checks: health.clone(),
        events: events.clone(),
    };
    let manager = DeploymentManager::spawn(ctx, Arc::new(store.clone()));
    let actions = SchedulerActions {
        tracker: tracker.clone(),
        launch_queue: queue.clone(),
        group_repo: Arc::new(store.clone()),
        driver: driver.clone(),
    };
    let scheduler = SchedulerCore::spawn(SchedulerDeps {
        manager,
        repository: Arc::new(store.clone()),
        health_checks: health.clone(),
        actions,
        events: events.clone(),
    });

    Cluster {
        scheduler,
        tracker,
        queue,
        health,
        driver,
        store,
        events,
    }
}

async fn elected(cluster: &Cluster) {
    cluster.scheduler.leader_elected().await.unwrap();
}

/// Wait for the success or failure event of one plan.
async fn deployment_result(
    events: &mut broadcast::Receiver<Event>,
    plan_id: &str,
) -> Result<(), Option<String>> {
    loop {
        let event = timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for deployment result")
            .expect("event bus closed");
        match event {
            Event::DeploymentSuccess { id, .. } if id == plan_id => return Ok(()),
            Event::DeploymentFailed { id, reason, .. } if id == plan_id => {
                return Err(reason)
            }
            _ => {}
        }
    }
}

// ── S1: three-app restructure ──────────────────────────────────────

#[tokio::test]
async fn restructures_a_three_app_group() {
    let c = cluster(true);
    elected(&c).await;
    let mut events = c.events.subscribe();

    let app1 = app("/foo/app1", 2, None, 0);
    let app2 = app("/foo/app2", 1, Some("cmd"), 0);
    let app4 = app("/foo/app4", 1, None, 0);
    let original = Group::with_apps([app1.clone(), app2.clone(), app4.clone()], 0);

    let i1_1 = instance(&app1, "1_1", 0);
    let i1_2 = instance(&app1, "1_2", 1000);
    let i2_1 = instance(&app2, "2_1", 0);
    let i4_1 = instance(&app4, "4_1", 0);
    for i in [&i1_1, &i1_2, &i2_1, &i4_1] {
        c.tracker.put_instance(i.clone());
    }

    let target = Group::with_apps(
        [
            app("/foo/app1", 1, None, 1000),
            app("/foo/app2", 2, Some("otherCmd"), 1000),
            app("/foo/app3", 1, None, 1000),
        ],
        1000,
    );

    let plan = build_plan(original, target, 1000, BTreeMap::new());
    c.scheduler.deploy(plan.clone(), false).await.unwrap();
    deployment_result(&mut events, &plan.id).await.unwrap();

    // Exact set of goal changes: the removed app4 instance, the younger
    // app1 instance, and the upgraded app2 instance.
    let changes: BTreeSet<(InstanceId, Goal, GoalReason)> =
        c.tracker.goal_changes().into_iter().collect();
    let expected: BTreeSet<(InstanceId, Goal, GoalReason)> = [
        (i4_1.id.clone(), Goal::Decommissioned, GoalReason::DeletingApp),
        (
            i1_2.id.clone(),
            Goal::Decommissioned,
            GoalReason::DeploymentScaling,
        ),
        (i2_1.id.clone(), Goal::Decommissioned, GoalReason::Upgrading),
    ]
    .into_iter()
    .collect();
    assert_eq!(changes, expected);

    // Launch queue: back-off reset for the stopped app4 (at zero
    // instances), two app2 launches, one app3 launch.
    assert_eq!(c.queue.resets(), vec![(id("/foo/app4"), 0)]);
    let adds: BTreeSet<(RunSpecId, u32)> = c.queue.adds().into_iter().collect();
    let expected_adds: BTreeSet<(RunSpecId, u32)> =
        [(id("/foo/app2"), 2), (id("/foo/app3"), 1)].into_iter().collect();
    assert_eq!(adds, expected_adds);

    // The surviving app1 instance was never touched.
    assert_eq!(c.tracker.goal_of(&i1_1.id).unwrap().0, Goal::Running);
}

// ── S2: restart of a two-instance app ──────────────────────────────

#[tokio::test]
async fn restarts_every_instance_on_upgrade() {
    let c = cluster(true);
    elected(&c).await;
    let mut events = c.events.subscribe();

    let old = app("/foo/app", 2, Some("cmd"), 0);
    let i1 = instance(&old, "1_1", 0);
    let i2 = instance(&old, "1_2", 100);
    c.tracker.put_instance(i1.clone());
    c.tracker.put_instance(i2.clone());

    let original = Group::with_apps([old], 0);
    let target = Group::with_apps([app("/foo/app", 2, Some("cmd new"), 1000)], 1000);

    let plan = build_plan(original, target, 1000, BTreeMap::new());
    c.scheduler.deploy(plan.clone(), false).await.unwrap();
    deployment_result(&mut events, &plan.id).await.unwrap();

    let changes: BTreeSet<(InstanceId, Goal, GoalReason)> =
        c.tracker.goal_changes().into_iter().collect();
    let expected: BTreeSet<(InstanceId, Goal, GoalReason)> = [
        (i1.id.clone(), Goal::Decommissioned, GoalReason::Upgrading),
        (i2.id.clone(), Goal::Decommissioned, GoalReason::Upgrading),
    ]
    .into_iter()
    .collect();
    assert_eq!(changes, expected);
    assert_eq!(c.queue.adds(), vec![(id("/foo/app"), 2)]);
}

// ── S3: restart of a suspended app ─────────────────────────────────

#[tokio::test]
async fn restart_of_suspended_app_completes_immediately() {
    let c = cluster(true);
    elected(&c).await;
    let mut events = c.events.subscribe();

    let original = Group::with_apps([app("/foo/app", 0, Some("cmd"), 0)], 0);
    let target = Group::with_apps([app("/foo/app", 0, Some("cmd new"), 1000)], 1000);

    let plan = build_plan(original, target, 1000, BTreeMap::new());
    c.scheduler.deploy(plan.clone(), false).await.unwrap();
    deployment_result(&mut events, &plan.id).await.unwrap();

    assert!(c.tracker.goal_changes().is_empty());
    assert!(c.queue.adds().is_empty());
}

// ── S4: scale-down with explicit kill hint ─────────────────────────

#[tokio::test]
async fn scale_down_honors_the_kill_hint() {
    let c = cluster(true);
    elected(&c).await;
    let mut events = c.events.subscribe();

    let old = app("/foo/app", 3, None, 0);
    let i1 = instance(&old, "1_1", 0);
    let i2 = instance(&old, "1_2", 100);
    let i3 = instance(&old, "1_3", 200);
    for i in [&i1, &i2, &i3] {
        c.tracker.put_instance(i.clone());
    }

    let original = Group::with_apps([old], 0);
    let target = Group::with_apps([app("/foo/app", 2, None, 1000)], 1000);
    let mut to_kill = BTreeMap::new();
    to_kill.insert(id("/foo/app"), vec![i2.id.clone()]);

    let plan = build_plan(original, target, 1000, to_kill);
    c.scheduler.deploy(plan.clone(), false).await.unwrap();
    deployment_result(&mut events, &plan.id).await.unwrap();

    // Exactly one goal change: the hinted victim.
    assert_eq!(
        c.tracker.goal_changes(),
        vec![(
            i2.id.clone(),
            Goal::Decommissioned,
            GoalReason::DeploymentScaling
        )]
    );
    assert!(c.queue.adds().is_empty());
}

// ── S5: orphan reconciliation ──────────────────────────────────────

#[tokio::test]
async fn reconciliation_decommissions_orphans() {
    let c = cluster(true);
    elected(&c).await;
    c.store.put_root(&Group::default()).unwrap();

    let deleted = app("/deleted-app", 1, None, 0);
    let orphan = instance(&deleted, "1", 0);
    c.tracker.put_instance(orphan.clone());

    c.scheduler.reconcile_tasks().await.unwrap();

    assert_eq!(
        c.tracker.goal_changes(),
        vec![(orphan.id.clone(), Goal::Decommissioned, GoalReason::Orphaned)]
    );
    // No reportable statuses, so only the soliciting empty call.
    assert_eq!(c.driver.calls(), vec![Vec::new()]);
}

// ── S6: force-deploy preempts a locked plan ────────────────────────

#[tokio::test]
async fn force_deploy_supersedes_the_active_plan() {
    let c = cluster(false);
    elected(&c).await;
    let mut events = c.events.subscribe();

    // P wedges: nothing fulfils its launch request.
    let p = build_plan(
        Group::default(),
        Group::with_apps([app("/foo/app1", 1, None, 0)], 0),
        1,
        BTreeMap::new(),
    );
    c.scheduler.deploy(p.clone(), false).await.unwrap();

    // Non-forced conflicting deploy is rejected and P stays active.
    let q = build_plan(
        Group::with_apps([app("/foo/app1", 1, None, 0)], 0),
        Group::with_apps([app("/foo/app1", 0, None, 1000)], 1000),
        1000,
        BTreeMap::new(),
    );
    match c.scheduler.deploy(q.clone(), false).await {
        Err(SchedulerError::AppLocked { conflicts, .. }) => {
            assert_eq!(conflicts, vec![p.id.clone()]);
        }
        other => panic!("expected AppLocked, got {other:?}"),
    }
    let active = c.scheduler.list_deployments().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].plan.id, p.id);

    // Forced deploy cancels P and runs to completion. Collect both
    // outcomes without assuming their event order.
    c.scheduler.deploy(q.clone(), true).await.unwrap();

    let mut outcomes: BTreeMap<String, Result<(), Option<String>>> = BTreeMap::new();
    while outcomes.len() < 2 {
        let event = timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for forced-deploy outcomes")
            .expect("event bus closed");
        match event {
            Event::DeploymentSuccess { id, .. } => {
                outcomes.insert(id, Ok(()));
            }
            Event::DeploymentFailed { id, reason, .. } => {
                outcomes.insert(id, Err(reason));
            }
            _ => {}
        }
    }
    let p_failure = outcomes.remove(&p.id).unwrap().unwrap_err();
    assert!(p_failure.unwrap().contains("superseded"));
    assert_eq!(outcomes.remove(&q.id), Some(Ok(())));

    // All locks released: a fresh deploy for the same app is accepted.
    let r = build_plan(
        Group::with_apps([app("/foo/app1", 0, None, 1000)], 1000),
        Group::default(),
        2000,
        BTreeMap::new(),
    );
    c.scheduler.deploy(r.clone(), false).await.unwrap();
    deployment_result(&mut events, &r.id).await.unwrap();
}

// ── Reconciliation de-duplication ──────────────────────────────────

/// Driver that blocks each call until allowed, to hold a
/// reconciliation in flight.
struct SlowDriver {
    inner: RecordingDriver,
    gate: tokio::sync::Semaphore,
}

#[async_trait]
impl TaskDriver for SlowDriver {
    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> anyhow::Result<()> {
        let permit = self.gate.acquire().await?;
        permit.forget();
        self.inner.reconcile_tasks(statuses).await
    }
}

#[tokio::test]
async fn concurrent_reconcile_requests_share_one_run() {
    let store = StateStore::open_in_memory().unwrap();
    let tracker = MemoryInstanceTracker::reactive();
    let queue = Arc::new(MemoryLaunchQueue::new());
    let health = Arc::new(MemoryHealthChecks::new());
    let events = EventBus::default();
    let driver = Arc::new(SlowDriver {
        inner: RecordingDriver::new(),
        gate: tokio::sync::Semaphore::new(0),
    });

    // One known instance with a live task status, so each
    // reconciliation produces the full call pair.
    let known = app("/foo/app", 1, None, 0);
    store.put_root(&Group::with_apps([known.clone()], 1)).unwrap();
    let mut tracked = instance(&known, "1", 0);
    tracked.tasks = vec![stevedore_core::Task {
        id: "t1".to_string(),
        status: Some(TaskStatus {
            task_id: "t1".to_string(),
            condition: Condition::Running,
            agent_id: None,
        }),
    }];
    tracker.put_instance(tracked);

    let ctx = DeployContext {
        tracker: tracker.clone(),
        launch_queue: queue.clone(),
        health_checks: health.clone(),
        events: events.clone(),
    };
    let manager = DeploymentManager::spawn(ctx, Arc::new(store.clone()));
    let actions = SchedulerActions {
        tracker: tracker.clone(),
        launch_queue: queue,
        group_repo: Arc::new(store.clone()),
        driver: driver.clone(),
    };
    let scheduler = SchedulerCore::spawn(SchedulerDeps {
        manager,
        repository: Arc::new(store.clone()),
        health_checks: health,
        actions,
        events,
    });
    scheduler.leader_elected().await.unwrap();

    // Three requests while the driver is gated: all must resolve from
    // the single in-flight reconciliation.
    let (a, b, c3) = tokio::join!(
        scheduler.reconcile_tasks(),
        scheduler.reconcile_tasks(),
        {
            let gate = &driver.gate;
            async move {
                // Let the requests pile up, then open the gate for one
                // full call pair.
                tokio::time::sleep(Duration::from_millis(50)).await;
                gate.add_permits(2);
                Ok::<(), SchedulerError>(())
            }
        }
    );
    a.unwrap();
    b.unwrap();
    c3.unwrap();
    assert_eq!(driver.inner.calls().len(), 2);

    // A sequential request afterwards starts a fresh reconciliation.
    driver.gate.add_permits(2);
    scheduler.reconcile_tasks().await.unwrap();
    assert_eq!(driver.inner.calls().len(), 4);
}

// ── Recovery after leadership change ───────────────────────────────

#[tokio::test]
async fn new_leader_resumes_persisted_plans() {
    let store = StateStore::open_in_memory().unwrap();

    // First leader starts a plan that wedges, leaving it persisted.
    let first = cluster_over(store.clone(), false);
    elected(&first).await;
    let plan = build_plan(
        Group::default(),
        Group::with_apps([app("/foo/app", 1, None, 0)], 0),
        1,
        BTreeMap::new(),
    );
    first.scheduler.deploy(plan.clone(), false).await.unwrap();
    assert_eq!(store.list_plans().unwrap().len(), 1);
    first.scheduler.standby().await.unwrap();

    // A fresh process over the same repository resumes exactly it.
    let second = cluster_over(store.clone(), false);
    elected(&second).await;

    let active = second.scheduler.list_deployments().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].plan.id, plan.id);
    // Still persisted until it finishes.
    assert_eq!(store.list_plans().unwrap().len(), 1);

    // The resumed plan holds its lock: conflicting deploys are refused.
    let conflicting = build_plan(
        Group::default(),
        Group::with_apps([app("/foo/app", 2, None, 1000)], 1000),
        1000,
        BTreeMap::new(),
    );
    assert!(matches!(
        second.scheduler.deploy(conflicting, false).await,
        Err(SchedulerError::AppLocked { .. })
    ));
}

// ── Suspended command buffering ────────────────────────────────────

#[tokio::test]
async fn commands_before_election_wait_for_leadership() {
    let c = cluster(true);
    c.store.put_root(&Group::default()).unwrap();

    let scheduler = c.scheduler.clone();
    let buffered = tokio::spawn(async move { scheduler.reconcile_tasks().await });

    // Give the command time to land in the stash, then elect.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!buffered.is_finished());
    elected(&c).await;

    buffered.await.unwrap().unwrap();
}

// ── Background scaling through the core ────────────────────────────

#[tokio::test]
async fn scale_command_drives_spec_toward_target() {
    let c = cluster(true);
    elected(&c).await;

    let run = app("/foo/app", 3, None, 0);
    c.store.put_root(&Group::with_apps([run.clone()], 1)).unwrap();

    c.scheduler.scale_run_spec(run.id.clone()).await.unwrap();

    // The command completes in the background; poll for its effect.
    timeout(EVENT_TIMEOUT, async {
        loop {
            if c.queue.adds() == vec![(run.id.clone(), 3)] {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("scale never reached the launch queue");
}

// ── Standby removes health checks and clears locks ─────────────────

#[tokio::test]
async fn standby_resets_health_checks_and_locks() {
    let c = cluster(false);
    elected(&c).await;

    let mut checked = app("/foo/app", 1, None, 0);
    checked.health_checks = vec![stevedore_core::HealthCheckSpec {
        path: "/healthz".to_string(),
        interval_secs: 5,
        timeout_secs: 2,
        unhealthy_threshold: 3,
    }];
    let plan = build_plan(
        Group::default(),
        Group::with_apps([checked.clone()], 0),
        1,
        BTreeMap::new(),
    );
    c.scheduler.deploy(plan.clone(), false).await.unwrap();

    // The wedged deployment registered its health checks.
    timeout(EVENT_TIMEOUT, async {
        loop {
            if c.health.registered() == vec![checked.id.clone()] {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("health checks never registered");

    c.scheduler.standby().await.unwrap();
    assert!(c.health.registered().is_empty());

    // Suspended again: deploys are buffered rather than served.
    let scheduler = c.scheduler.clone();
    let plan2 = build_plan(
        Group::default(),
        Group::with_apps([app("/bar/app", 0, None, 0)], 0),
        2,
        BTreeMap::new(),
    );
    let buffered = tokio::spawn(async move { scheduler.deploy(plan2, false).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!buffered.is_finished());
    buffered.abort();
}
