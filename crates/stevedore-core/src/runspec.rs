//! Run specs — declarative workload descriptions.
//!
//! A run spec names a workload (application or pod), its desired
//! instance count, and the policy used to pick victims when scaling
//! down. The scheduling core treats the two kinds uniformly except that
//! health-check registration applies only to applications.

use serde::{Deserialize, Serialize};

use crate::id::RunSpecId;

/// Kind of workload a run spec describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSpecKind {
    Application,
    Pod,
}

/// Ordering policy for choosing which instances to kill when scaling down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSelection {
    /// Kill the most recently started instances first. Default.
    #[default]
    YoungestFirst,
    /// Kill the longest-running instances first.
    OldestFirst,
}

/// Health check parameters registered for an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// HTTP path to probe (e.g., "/healthz").
    pub path: String,
    /// Check interval in seconds.
    pub interval_secs: u64,
    /// Timeout per check in seconds.
    pub timeout_secs: u64,
    /// Consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,
}

/// Declarative description of a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub id: RunSpecId,
    pub kind: RunSpecKind,
    /// Desired number of running instances.
    pub instances: u32,
    /// Command the instance runs. Changing it is an upgrade.
    pub cmd: Option<String>,
    pub kill_selection: KillSelection,
    /// Version timestamp of this spec revision.
    pub version: u64,
    /// Health checks (applications only; empty for pods).
    pub health_checks: Vec<HealthCheckSpec>,
}

impl RunSpec {
    /// Minimal application spec used pervasively by tests and planners.
    pub fn app(id: RunSpecId, instances: u32) -> Self {
        Self {
            id,
            kind: RunSpecKind::Application,
            instances,
            cmd: None,
            kill_selection: KillSelection::default(),
            version: 0,
            health_checks: Vec::new(),
        }
    }

    /// Copy of this spec with a different desired instance count.
    pub fn with_instances(&self, instances: u32) -> Self {
        Self {
            instances,
            ..self.clone()
        }
    }

    /// Whether replacing `old` with `self` requires restarting instances.
    ///
    /// Instance count and version are excluded: a pure count change is a
    /// scale, and a version bump with identical configuration does not
    /// force a restart.
    pub fn is_upgrade(&self, old: &RunSpec) -> bool {
        let a = self.with_instances(0).with_version(0);
        let b = old.with_instances(0).with_version(0);
        a != b
    }

    fn with_version(&self, version: u64) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    /// Whether health checks should be registered for this spec.
    pub fn wants_health_checks(&self) -> bool {
        self.kind == RunSpecKind::Application && !self.health_checks.is_empty()
    }
}
