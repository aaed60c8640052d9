//! Schedulable units of work.
//!
//! A [`Task`] owns the body to run and the [`Promise`] it settles. The
//! scheduler, queues and workers only ever see the type-erased [`TaskRef`].

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, warn};

use crate::error::{AwexError, Result};
use crate::lock;
use crate::metrics::ExecutionOutcome;
use crate::promise::callbacks::panic_message;
use crate::promise::{Dispatcher, Promise};
use crate::queue::QueueId;
use crate::worker::{WorkerId, WorkerSignal};

pub type TaskId = u64;

/// Where a task is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    NotQueued,
    Queued,
    Running,
    Finished,
}

#[derive(Debug)]
struct Lifecycle {
    state: TaskState,
    queue: Option<QueueId>,
    worker: Option<WorkerId>,
}

/// Scheduling metadata shared by every task regardless of its result type.
#[derive(Debug)]
pub(crate) struct TaskHeader {
    /// 0 until submitted.
    id: AtomicU64,
    priority: i32,
    merge_key: Option<String>,
    queue_timeout: Option<Duration>,
    execution_timeout: Option<Duration>,
    lifecycle: Mutex<Lifecycle>,
    soft_cancelled: AtomicBool,
}

impl TaskHeader {
    fn new() -> Self {
        Self {
            id: AtomicU64::new(0),
            priority: 0,
            merge_key: None,
            queue_timeout: None,
            execution_timeout: None,
            lifecycle: Mutex::new(Lifecycle {
                state: TaskState::NotQueued,
                queue: None,
                worker: None,
            }),
            soft_cancelled: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> Option<TaskId> {
        match self.id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Assign the submission id. Fails if the task was already submitted.
    pub(crate) fn assign_id(&self, id: TaskId) -> Result<()> {
        self.id
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| {
                AwexError::illegal_state(format!("task {current} was already submitted"))
            })
    }

    pub(crate) fn state(&self) -> TaskState {
        lock(&self.lifecycle).state
    }

    pub(crate) fn queue(&self) -> Option<QueueId> {
        lock(&self.lifecycle).queue
    }

    pub(crate) fn worker(&self) -> Option<WorkerId> {
        lock(&self.lifecycle).worker
    }

    pub(crate) fn mark_queued(&self, queue: Option<QueueId>) {
        let mut lc = lock(&self.lifecycle);
        lc.state = TaskState::Queued;
        lc.queue = queue;
    }

    pub(crate) fn mark_running(&self, worker: WorkerId) {
        let mut lc = lock(&self.lifecycle);
        lc.state = TaskState::Running;
        lc.worker = Some(worker);
    }

    pub(crate) fn mark_finished(&self) {
        let mut lc = lock(&self.lifecycle);
        lc.state = TaskState::Finished;
        lc.worker = None;
    }

    pub(crate) fn soft_cancel(&self) {
        self.soft_cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_soft_cancelled(&self) -> bool {
        self.soft_cancelled.load(Ordering::Acquire)
    }
}

/// Result of one attempt to run a task on a worker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskRun {
    /// `None` when the task was already settled and its body never ran.
    pub outcome: Option<ExecutionOutcome>,
    pub elapsed: Duration,
}

/// Type-erased operations the scheduler needs on a task.
pub(crate) trait Job: Send + Sync {
    fn header(&self) -> &TaskHeader;

    /// Run the body on the current thread and settle the promise.
    fn execute(&self, signal: &WorkerSignal) -> TaskRun;

    /// Attach the scheduler's dispatcher and cancellation hook to the promise.
    fn bind(&self, dispatcher: Dispatcher, canceller: Box<dyn FnOnce(bool) + Send>);

    /// Make this task's promise follow `existing`, which is queued already.
    fn merge_into(self: Arc<Self>, existing: &dyn Job) -> Result<()>;

    fn cancel_promise(&self, may_interrupt: bool) -> bool;

    fn reject_promise(&self, error: AwexError) -> bool;

    fn is_settled(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}

type Body<R, P> = Box<dyn FnOnce(&TaskContext<'_, P>) -> Result<R> + Send>;

struct TaskCore<R, P> {
    header: TaskHeader,
    body: Mutex<Option<Body<R, P>>>,
    promise: Promise<R, P>,
}

impl<R, P> Job for TaskCore<R, P>
where
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn execute(&self, signal: &WorkerSignal) -> TaskRun {
        let started = Instant::now();
        let body = lock(&self.body).take();
        let Some(body) = body.filter(|_| self.promise.is_pending()) else {
            return TaskRun {
                outcome: None,
                elapsed: started.elapsed(),
            };
        };

        let notify = |progress: P| self.promise.notify_progress(progress);
        let ctx = TaskContext {
            header: &self.header,
            signal,
            notify: &notify,
        };
        let id = self.header.id().unwrap_or_default();

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))) {
            Ok(Ok(value)) => {
                if self.promise.try_resolve(value) {
                    ExecutionOutcome::Resolved
                } else {
                    ExecutionOutcome::Cancelled
                }
            }
            Ok(Err(e)) if e.is_cancellation() && (ctx.is_cancelled() || ctx.is_interrupted()) => {
                self.promise.cancel_task(false);
                ExecutionOutcome::Cancelled
            }
            Ok(Err(e)) => {
                warn!(task = id, error = %e, "task failed");
                if self.promise.try_reject(e) {
                    ExecutionOutcome::Rejected
                } else {
                    ExecutionOutcome::Cancelled
                }
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(task = id, panic = %msg, "task panicked");
                if self.promise.try_reject(AwexError::Panicked(msg)) {
                    ExecutionOutcome::Rejected
                } else {
                    ExecutionOutcome::Cancelled
                }
            }
        };

        TaskRun {
            outcome: Some(outcome),
            elapsed: started.elapsed(),
        }
    }

    fn bind(&self, dispatcher: Dispatcher, canceller: Box<dyn FnOnce(bool) + Send>) {
        self.promise.bind_dispatcher(dispatcher);
        self.promise.set_canceller(canceller);
    }

    fn merge_into(self: Arc<Self>, existing: &dyn Job) -> Result<()> {
        if existing.header().state() != TaskState::Queued || existing.is_settled() {
            return Err(AwexError::illegal_state("task to merge into is not queued"));
        }
        if self.header.state() != TaskState::NotQueued {
            return Err(AwexError::illegal_state("task to merge was already queued"));
        }
        let existing = existing
            .as_any()
            .downcast_ref::<TaskCore<R, P>>()
            .ok_or_else(|| AwexError::illegal_state("cannot merge tasks of different types"))?;

        self.header.mark_queued(existing.header.queue());
        lock(&self.body).take();
        let merged = Arc::downgrade(&self);
        self.promise.always(move || {
            if let Some(merged) = merged.upgrade() {
                merged.header.mark_finished();
            }
        });
        existing.promise.pipe(&self.promise);
        Ok(())
    }

    fn cancel_promise(&self, may_interrupt: bool) -> bool {
        self.promise.cancel_task(may_interrupt)
    }

    fn reject_promise(&self, error: AwexError) -> bool {
        self.promise.try_reject(error)
    }

    fn is_settled(&self) -> bool {
        !self.promise.is_pending()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A unit of work producing `R` and reporting progress as `P`.
///
/// Cloning shares the same task; keep a clone to cancel it later.
pub struct Task<R, P = ()> {
    core: Arc<TaskCore<R, P>>,
}

impl<R, P> Clone for Task<R, P> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<R, P> Task<R, P>
where
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    /// A task with default priority and no timeouts.
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&TaskContext<'_, P>) -> Result<R> + Send + 'static,
    {
        Self::builder(body).build()
    }

    pub fn builder<F>(body: F) -> TaskBuilder<R, P>
    where
        F: FnOnce(&TaskContext<'_, P>) -> Result<R> + Send + 'static,
    {
        TaskBuilder {
            header: TaskHeader::new(),
            body: Box::new(body),
        }
    }

    /// Id assigned at submission.
    pub fn id(&self) -> Option<TaskId> {
        self.core.header.id()
    }

    pub fn priority(&self) -> i32 {
        self.core.header.priority
    }

    pub fn state(&self) -> TaskState {
        self.core.header.state()
    }

    pub fn merge_key(&self) -> Option<&str> {
        self.core.header.merge_key.as_deref()
    }

    pub fn is_soft_cancelled(&self) -> bool {
        self.core.header.is_soft_cancelled()
    }

    pub fn promise(&self) -> &Promise<R, P> {
        &self.core.promise
    }

    pub(crate) fn task_ref(&self) -> TaskRef {
        TaskRef(self.core.clone())
    }
}

impl<R, P> fmt::Debug for Task<R, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.header.id())
            .field("priority", &self.core.header.priority)
            .field("state", &self.core.header.state())
            .finish()
    }
}

/// Builder for tasks that need a priority, a merge key or timeouts.
pub struct TaskBuilder<R, P = ()> {
    header: TaskHeader,
    body: Body<R, P>,
}

impl<R, P> TaskBuilder<R, P>
where
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    /// Higher runs first. Equal priorities run in submission order.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.header.priority = priority;
        self
    }

    /// Tasks sharing a merge key are interchangeable: a new task may be
    /// folded into a queued one instead of running twice.
    pub fn with_merge_key(mut self, key: impl Into<String>) -> Self {
        self.header.merge_key = Some(key.into());
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.header.queue_timeout = Some(timeout);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.header.execution_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Task<R, P> {
        Task {
            core: Arc::new(TaskCore {
                header: self.header,
                body: Mutex::new(Some(self.body)),
                promise: Promise::new(),
            }),
        }
    }
}

/// Handed to a task body while it runs.
pub struct TaskContext<'a, P> {
    header: &'a TaskHeader,
    signal: &'a WorkerSignal,
    notify: &'a dyn Fn(P) -> Result<()>,
}

impl<P> TaskContext<'_, P> {
    pub fn id(&self) -> TaskId {
        self.header.id().unwrap_or_default()
    }

    pub fn priority(&self) -> i32 {
        self.header.priority
    }

    /// Soft-cancel flag. Well-behaved bodies check it and stop early.
    pub fn is_cancelled(&self) -> bool {
        self.header.is_soft_cancelled()
    }

    /// Whether the worker running this task was interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.signal.is_interrupted()
    }

    /// Bail out with `?` once the task was interrupted or cancelled.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(AwexError::Interrupted)
        } else if self.is_cancelled() {
            Err(AwexError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn notify_progress(&self, progress: P) -> Result<()> {
        (self.notify)(progress)
    }
}

/// Type-erased handle to a submitted task, as seen by queues and policies.
#[derive(Clone)]
pub struct TaskRef(pub(crate) Arc<dyn Job>);

impl TaskRef {
    pub fn id(&self) -> TaskId {
        self.0.header().id().unwrap_or_default()
    }

    pub fn priority(&self) -> i32 {
        self.0.header().priority
    }

    pub fn state(&self) -> TaskState {
        self.0.header().state()
    }

    pub fn queue(&self) -> Option<QueueId> {
        self.0.header().queue()
    }

    pub fn worker(&self) -> Option<WorkerId> {
        self.0.header().worker()
    }

    pub fn merge_key(&self) -> Option<&str> {
        self.0.header().merge_key.as_deref()
    }

    pub fn queue_timeout(&self) -> Option<Duration> {
        self.0.header().queue_timeout
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.0.header().execution_timeout
    }

    pub fn is_soft_cancelled(&self) -> bool {
        self.0.header().is_soft_cancelled()
    }

    /// Whether the task's promise left `Pending`.
    pub fn is_settled(&self) -> bool {
        self.0.is_settled()
    }

    /// Cancel through the task's promise. False if it already settled.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.0.cancel_promise(may_interrupt)
    }

    /// Whether both handles point at the same task.
    pub fn same_task(&self, other: &TaskRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn header(&self) -> &TaskHeader {
        self.0.header()
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("priority", &self.priority())
            .field("state", &self.state())
            .finish()
    }
}
