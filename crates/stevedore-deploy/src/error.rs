//! Deployment engine error types.

use thiserror::Error;

/// Result type alias for deployment operations.
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors that can occur while managing or executing deployments.
#[derive(Debug, Error)]
pub enum DeployError {
    /// A non-forced plan overlaps one or more active plans.
    #[error("plan {plan_id} conflicts with active deployments: {conflicts:?}")]
    Conflict {
        plan_id: String,
        conflicts: Vec<String>,
    },

    #[error("no active deployment with id {0}")]
    UnknownDeployment(String),

    #[error("deployment cancelled: {0}")]
    Cancelled(String),

    #[error("deployment action failed: {0}")]
    ActionFailed(String),

    #[error("deployment repository error: {0}")]
    Repository(String),

    #[error("deployment manager is shut down")]
    ManagerGone,
}
