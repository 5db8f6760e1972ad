//! Scheduler error types.

use thiserror::Error;

/// Result type alias for scheduler commands.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors returned on a command's reply channel.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A non-forced deployment overlaps active plans.
    #[error("plan {plan_id} is locked by conflicting deployments: {conflicts:?}")]
    AppLocked {
        plan_id: String,
        conflicts: Vec<String>,
    },

    /// The scheduler is suspended and its command stash is full.
    #[error("scheduler is not ready to accept commands")]
    NotReady,

    #[error("no active deployment with id {0}")]
    UnknownDeployment(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("scheduler is shut down")]
    SchedulerGone,
}
