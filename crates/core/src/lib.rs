//! Promises with progress and cancellation, backed by a priority worker
//! pool whose shape is decided by a pluggable [`PoolPolicy`].

pub mod config;
pub mod error;
pub mod fan_out;
pub mod metrics;
pub mod policy;
pub mod promise;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::AwexConfig;
pub use error::*;
pub use fan_out::{concat, round_robin};
pub use metrics::{ExecutionOutcome, OutcomeStats, PoolMetrics};
pub use policy::{DefaultPoolPolicy, PoolManager, PoolPolicy, DEFAULT_QUEUE};
pub use promise::{
    after_all, all_of, any_of, Affinity, Dispatcher, MultipleResult, Outcome, Promise,
    PromiseState, ThreadContext, WeakPromise,
};
pub use queue::{QueueId, TaskQueue};
pub use scheduler::{Awex, AwexBuilder};
pub use state::{PoolState, QueueState, WorkerState, WorkerStatus};
pub use task::{Task, TaskBuilder, TaskContext, TaskId, TaskRef, TaskState};
pub use worker::{WorkerId, WorkerSignal};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
