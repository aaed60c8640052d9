use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::error::AwexError;

/// A unit of deferred work handed to a dispatcher or executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where a callback wants to run.
///
/// `Context` callbacks are delivered on the [`ThreadContext`] configured on
/// the scheduler (posted to it when settled from any other thread). `Any`
/// callbacks run on the settling thread, unless that thread is the context
/// thread itself, in which case they are moved to the background callback
/// executor.
///
/// [`ThreadContext`]: super::dispatch::ThreadContext
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Affinity {
    #[default]
    Any,
    Context,
}

pub(crate) enum Callback<R, P> {
    Done(Box<dyn FnOnce(R) + Send>),
    Fail(Box<dyn FnOnce(AwexError) + Send>),
    Progress(Arc<dyn Fn(P) + Send + Sync>),
    Cancel(Box<dyn FnOnce() + Send>),
    Always(Box<dyn FnOnce() + Send>),
}

impl<R, P> Callback<R, P> {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Done(_) => "done",
            Self::Fail(_) => "fail",
            Self::Progress(_) => "progress",
            Self::Cancel(_) => "cancel",
            Self::Always(_) => "always",
        }
    }
}

pub(crate) struct Registered<R, P> {
    pub(crate) affinity: Affinity,
    pub(crate) callback: Callback<R, P>,
}

/// Render a panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a user callback, logging instead of propagating a panic.
pub(crate) fn run_guarded(kind: &'static str, job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        error!(
            callback = kind,
            panic = %panic_message(payload.as_ref()),
            "error executing promise callback"
        );
    }
}
