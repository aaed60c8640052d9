use tracing::{debug, warn};

use super::core::Shared;
use super::Awex;
use crate::error::{AwexError, Result};
use crate::lock;
use crate::promise::combinators::{after_all_in, all_of_in, any_of_in};
use crate::promise::{MultipleResult, Promise};
use crate::task::Task;

impl Awex {
    /// Hand a task to the pool policy and return its promise.
    ///
    /// Fails if the task was submitted before, its promise already settled,
    /// the scheduler is shut down, or the policy refused it. In the last two
    /// cases the promise is rejected with the same error.
    pub fn submit<R, P>(&self, task: &Task<R, P>) -> Result<Promise<R, P>>
    where
        R: Clone + Send + 'static,
        P: Clone + Send + 'static,
    {
        let shared = &self.shared;
        let promise = task.promise().clone();
        if !promise.is_pending() {
            return Err(AwexError::illegal_state(format!(
                "cannot submit a task whose promise is {:?}",
                promise.state()
            )));
        }

        let task_ref = task.task_ref();
        let id = shared.next_task_id();
        task_ref.header().assign_id(id)?;
        task_ref
            .0
            .bind(shared.dispatcher.clone(), shared.canceller(&task_ref));

        if self.is_shut_down() {
            let err = AwexError::illegal_state("scheduler is shut down");
            task_ref.0.reject_promise(err.clone());
            return Err(err);
        }

        let queue_timeout = task_ref
            .queue_timeout()
            .or_else(|| shared.config.default_queue_timeout());
        if let Some(timeout) = queue_timeout {
            shared.schedule_check(timeout, "queue timeout", task_ref.clone(), Shared::on_queue_timeout);
        }

        if let Err(e) = shared.with_policy(|policy, state| policy.on_task_added(state, &task_ref)) {
            warn!(task = id, error = %e, "pool policy refused task");
            lock(&shared.registry).tasks.remove(&id);
            task_ref.0.reject_promise(e.clone());
            return Err(e);
        }

        debug!(task = id, priority = task_ref.priority(), state = ?task_ref.state(), "task submitted");
        Ok(promise)
    }

    /// Cancel a submitted task through its promise.
    ///
    /// A queued task is removed from its queue; a running one is interrupted
    /// only with `may_interrupt`. False if the promise had already settled.
    pub fn cancel<R, P>(&self, task: &Task<R, P>, may_interrupt: bool) -> bool
    where
        R: Clone + Send + 'static,
        P: Clone + Send + 'static,
    {
        task.promise().cancel_task(may_interrupt)
    }

    /// Pending promise delivering its callbacks through this scheduler.
    pub fn new_promise<R, P>(&self) -> Promise<R, P>
    where
        R: Clone + Send + 'static,
        P: Clone + Send + 'static,
    {
        Promise::with_dispatcher(self.shared.dispatcher.clone())
    }

    /// Already resolved promise.
    pub fn resolved<R, P>(&self, value: R) -> Promise<R, P>
    where
        R: Clone + Send + 'static,
        P: Clone + Send + 'static,
    {
        let promise = self.new_promise();
        promise.try_resolve(value);
        promise
    }

    /// Promise rejected with [`AwexError::AbsentValue`].
    pub fn absent<R, P>(&self) -> Promise<R, P>
    where
        R: Clone + Send + 'static,
        P: Clone + Send + 'static,
    {
        let promise = self.new_promise();
        promise.try_reject(AwexError::AbsentValue);
        promise
    }

    /// Resolved with `value`, or [`absent`](Self::absent) for `None`.
    pub fn of<R, P>(&self, value: Option<R>) -> Promise<R, P>
    where
        R: Clone + Send + 'static,
        P: Clone + Send + 'static,
    {
        match value {
            Some(value) => self.resolved(value),
            None => self.absent(),
        }
    }

    /// See [`all_of`](crate::promise::all_of).
    pub fn all_of<R, P>(&self, promises: Vec<Promise<R, P>>) -> Promise<Vec<R>, P>
    where
        R: Clone + Send + 'static,
        P: Clone + Send + 'static,
    {
        all_of_in(self.shared.dispatcher.clone(), promises)
    }

    /// See [`any_of`](crate::promise::any_of).
    pub fn any_of<R, P>(&self, promises: Vec<Promise<R, P>>) -> Promise<R, P>
    where
        R: Clone + Send + 'static,
        P: Clone + Send + 'static,
    {
        any_of_in(self.shared.dispatcher.clone(), promises)
    }

    /// See [`after_all`](crate::promise::after_all).
    pub fn after_all<R, P>(&self, promises: Vec<Promise<R, P>>) -> Promise<MultipleResult<R>, P>
    where
        R: Clone + Send + 'static,
        P: Clone + Send + 'static,
    {
        after_all_in(self.shared.dispatcher.clone(), promises)
    }
}
