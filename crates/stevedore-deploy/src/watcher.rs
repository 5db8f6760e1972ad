//! Kill-stream watchers — completion signals over the update stream.
//!
//! A watch is constructed on an already-subscribed [`InstanceUpdates`],
//! so it can (and should) be created *before* the goal changes that
//! trigger termination: the snapshot-first delivery of the stream
//! guarantees no missed events. Dropping a watch detaches the
//! subscription without side effects.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace};

use stevedore_core::{
    Goal, Instance, InstanceChange, InstanceId, InstanceTracker, InstanceUpdates,
};

/// What "done" means for one expected instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    /// Terminal condition, or absent from the tracker.
    Killed,
    /// Absent, or decommissioned goal with a terminal condition.
    Decommissioned,
}

impl WatchKind {
    fn satisfied_by(self, instance: &Instance) -> bool {
        match self {
            WatchKind::Killed => instance.condition.is_terminal(),
            WatchKind::Decommissioned => {
                instance.goal == Goal::Decommissioned && instance.condition.is_terminal()
            }
        }
    }
}

/// Completion signal over a set of expected instances.
pub struct InstanceWatch {
    kind: WatchKind,
    pending: BTreeSet<InstanceId>,
    rx: tokio::sync::broadcast::Receiver<InstanceChange>,
    tracker: Arc<dyn InstanceTracker>,
}

impl InstanceWatch {
    /// Watch until every expected instance is killed (terminal) or gone.
    pub fn killed(
        updates: InstanceUpdates,
        tracker: Arc<dyn InstanceTracker>,
        expected: impl IntoIterator<Item = InstanceId>,
    ) -> Self {
        Self::build(WatchKind::Killed, updates, tracker, expected)
    }

    /// Watch until every expected instance is absent or decommissioned
    /// with a terminal condition.
    pub fn decommissioned(
        updates: InstanceUpdates,
        tracker: Arc<dyn InstanceTracker>,
        expected: impl IntoIterator<Item = InstanceId>,
    ) -> Self {
        Self::build(WatchKind::Decommissioned, updates, tracker, expected)
    }

    fn build(
        kind: WatchKind,
        updates: InstanceUpdates,
        tracker: Arc<dyn InstanceTracker>,
        expected: impl IntoIterator<Item = InstanceId>,
    ) -> Self {
        let expected: BTreeSet<InstanceId> = expected.into_iter().collect();
        let pending = still_pending(kind, &expected, &updates.snapshot);
        debug!(
            expected = expected.len(),
            pending = pending.len(),
            ?kind,
            "instance watch created"
        );
        Self {
            kind,
            pending,
            rx: updates.rx,
            tracker,
        }
    }

    /// Resolve once all expected instances satisfy the watch condition.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        while !self.pending.is_empty() {
            match self.rx.recv().await {
                Ok(InstanceChange::Updated(instance)) => {
                    if self.pending.contains(&instance.id)
                        && self.kind.satisfied_by(&instance)
                    {
                        trace!(instance = %instance.id, "watched instance done");
                        self.pending.remove(&instance.id);
                    }
                }
                Ok(InstanceChange::Removed(id)) => {
                    self.pending.remove(&id);
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "update stream lagged, resyncing from snapshot");
                    self.resync().await?;
                }
                Err(RecvError::Closed) => {
                    anyhow::bail!("instance update stream closed while watching");
                }
            }
        }
        Ok(())
    }

    /// Re-subscribe and rebuild the pending set from a fresh snapshot.
    async fn resync(&mut self) -> anyhow::Result<()> {
        let updates = self.tracker.updates().await?;
        self.pending = still_pending(self.kind, &self.pending, &updates.snapshot);
        self.rx = updates.rx;
        Ok(())
    }
}

/// Expected ids that are present in the snapshot and not yet satisfied.
fn still_pending(
    kind: WatchKind,
    expected: &BTreeSet<InstanceId>,
    snapshot: &[Instance],
) -> BTreeSet<InstanceId> {
    snapshot
        .iter()
        .filter(|i| expected.contains(&i.id) && !kind.satisfied_by(i))
        .map(|i| i.id.clone())
        .collect()
}
