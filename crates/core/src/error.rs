use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by promises, queues and the scheduler.
///
/// Cloneable so a single rejection cause can be handed to every fail
/// callback registered on a promise.
#[derive(Error, Debug, Clone)]
pub enum AwexError {
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("absent value")]
    AbsentValue,

    #[error("all {} promises failed", .0.len())]
    AllFailed(Vec<AwexError>),

    #[error("worker interrupted")]
    Interrupted,

    #[error("task cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to spawn thread: {0}")]
    Spawn(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl AwexError {
    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Whether this cause means the work was stopped rather than failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Interrupted | Self::Cancelled)
    }

    /// Every underlying cause of an aggregate failure, or `self` alone.
    pub fn causes(&self) -> &[AwexError] {
        match self {
            Self::AllFailed(causes) => causes,
            other => std::slice::from_ref(other),
        }
    }
}

impl From<anyhow::Error> for AwexError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }
}

pub type Result<T, E = AwexError> = std::result::Result<T, E>;
