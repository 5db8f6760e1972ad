//! Process-wide event bus.
//!
//! Consumers outside the scheduling core (API, metrics, history)
//! subscribe to deployment progress here. Publishing never blocks and
//! never fails: a bus with no subscribers simply drops events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::id::RunSpecId;
use crate::plan::{DeploymentPlan, DeploymentStep};

/// Events published by the scheduling core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    DeploymentStarted {
        plan: DeploymentPlan,
    },
    /// Announces the step about to be executed (1-based index).
    DeploymentStepInfo {
        plan: DeploymentPlan,
        step: DeploymentStep,
        index: usize,
    },
    DeploymentStepSuccess {
        plan: DeploymentPlan,
        step: DeploymentStep,
    },
    DeploymentStepFailure {
        plan: DeploymentPlan,
        step: DeploymentStep,
    },
    /// Progress marker published at the start of each step's execution.
    DeploymentStatus {
        plan: DeploymentPlan,
        step: DeploymentStep,
    },
    DeploymentSuccess {
        id: String,
        plan: DeploymentPlan,
    },
    DeploymentFailed {
        id: String,
        plan: DeploymentPlan,
        reason: Option<String>,
    },
    AppTerminated {
        run_spec_id: RunSpecId,
    },
    UpgradeEvent {
        run_spec_id: RunSpecId,
    },
    TasksReconciled,
}

/// Clone-able handle to the broadcast bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. A bus without subscribers drops it silently.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(Event::TasksReconciled);
        assert!(matches!(rx.recv().await.unwrap(), Event::TasksReconciled));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(Event::TasksReconciled);
    }
}
