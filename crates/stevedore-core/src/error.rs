//! Core error types.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the core domain types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid run spec id {0:?}: must be an absolute /a/b/c path")]
    InvalidRunSpecId(String),

    #[error("invalid instance id {0:?}: missing run spec prefix")]
    InvalidInstanceId(String),
}
