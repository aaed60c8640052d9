//! Pluggable pool scaling strategy and the capabilities handed to it.

mod default;

use std::sync::Arc;

use crate::error::Result;
use crate::queue::QueueId;
use crate::state::PoolState;
use crate::task::TaskRef;
use crate::worker::WorkerId;

pub use default::{DefaultPoolPolicy, DEFAULT_QUEUE};

/// Operations a [`PoolPolicy`] may perform on the scheduler.
pub trait PoolManager: Send + Sync {
    /// Fails if a queue with this id already exists.
    fn create_queue(&self, queue: QueueId) -> Result<()>;

    /// Stop the queue's workers and cancel everything still queued.
    fn remove_queue(&self, queue: QueueId) -> Result<()>;

    fn create_worker(&self, queue: QueueId) -> Result<WorkerId>;

    /// With `interrupt` the running task is aborted; otherwise the worker
    /// exits once it finishes it.
    fn remove_worker(&self, queue: QueueId, worker: WorkerId, interrupt: bool);

    fn queue_task(&self, queue: QueueId, task: &TaskRef) -> Result<()>;

    /// Run the task right away on a dedicated one-shot worker.
    fn execute_immediately(&self, task: &TaskRef) -> Result<WorkerId>;

    /// Settle `incoming` with whatever `queued` settles with; `incoming`
    /// never runs itself.
    fn merge_task(&self, queued: &TaskRef, incoming: &TaskRef) -> Result<()>;
}

/// Decides how submitted tasks are routed and how the pool scales.
///
/// Hooks are called one at a time with a fresh [`PoolState`] snapshot.
/// They run while the scheduler holds its policy lock, so they must not
/// block on tasks of the same scheduler. Promise callbacks a hook triggers,
/// for instance by cancelling a task, run later on the callback executor.
pub trait PoolPolicy: Send {
    fn initialize(&mut self, manager: Arc<dyn PoolManager>) -> Result<()>;

    /// Route a newly submitted task. An error rejects the task's promise.
    fn on_task_added(&mut self, state: &PoolState, task: &TaskRef) -> Result<()>;

    fn on_task_queue_timeout(&mut self, state: &PoolState, task: &TaskRef);

    fn on_task_execution_timeout(&mut self, state: &PoolState, task: &TaskRef);

    fn on_task_finished(&mut self, state: &PoolState, task: &TaskRef);
}
