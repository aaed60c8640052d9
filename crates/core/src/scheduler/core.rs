use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::config::AwexConfig;
use crate::error::{AwexError, Result};
use crate::lock;
use crate::metrics::PoolMetrics;
use crate::policy::PoolPolicy;
use crate::promise::dispatch::DeferGuard;
use crate::promise::{CallbackExecutor, Dispatcher, Job};
use crate::queue::{QueueId, TaskQueue};
use crate::state::{PoolState, QueueState};
use crate::task::{TaskId, TaskRef, TaskRun, TaskState};
use crate::worker::{Worker, WorkerId, WorkerListener};

/// Queues, workers and in-flight tasks. Only the scheduler mutates it.
#[derive(Default)]
pub(super) struct Registry {
    pub(super) queues: HashMap<QueueId, Arc<TaskQueue>>,
    pub(super) workers: HashMap<QueueId, HashMap<WorkerId, Worker>>,
    pub(super) immediate: HashMap<WorkerId, Worker>,
    /// Tasks queued or running, by id.
    pub(super) tasks: HashMap<TaskId, TaskRef>,
    pub(super) shut_down: bool,
}

impl Registry {
    fn snapshot(&self) -> PoolState {
        let queues = self
            .queues
            .iter()
            .map(|(&id, queue)| {
                let workers = self
                    .workers
                    .get(&id)
                    .map(|ws| ws.iter().map(|(&wid, w)| (wid, w.state())).collect())
                    .unwrap_or_default();
                let state = QueueState {
                    id,
                    size: queue.len(),
                    waiters: queue.waiters(),
                    workers,
                };
                (id, state)
            })
            .collect::<BTreeMap<_, _>>();

        let mergeable = self
            .tasks
            .values()
            .filter(|t| t.state() == TaskState::Queued)
            .filter_map(|t| Some((t.merge_key()?.to_string(), t.clone())))
            .collect();

        PoolState {
            queues,
            mergeable,
            immediate_workers: self.immediate.len(),
            taken_at: Utc::now(),
        }
    }
}

/// State shared by the [`Awex`](super::Awex) handle, the pool manager,
/// worker listeners and timers.
pub(super) struct Shared {
    pub(super) config: AwexConfig,
    pub(super) registry: Mutex<Registry>,
    /// Always locked before `registry`, never while holding it.
    pub(super) policy: Mutex<Box<dyn PoolPolicy>>,
    pub(super) metrics: RwLock<PoolMetrics>,
    pub(super) executor: Arc<CallbackExecutor>,
    pub(super) dispatcher: Dispatcher,
    pub(super) listener: Arc<dyn WorkerListener>,
    pub(super) next_task_id: AtomicU64,
    pub(super) next_worker_id: AtomicU32,
}

impl Shared {
    pub(super) fn next_task_id(&self) -> TaskId {
        self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(super) fn next_worker_id(&self) -> WorkerId {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(super) fn pool_state(&self) -> PoolState {
        lock(&self.registry).snapshot()
    }

    /// Run a policy hook with a snapshot taken under the policy lock.
    ///
    /// Promise callbacks the hook triggers are pushed to the executor.
    pub(super) fn with_policy<T>(&self, hook: impl FnOnce(&mut dyn PoolPolicy, &PoolState) -> T) -> T {
        let _deferred = DeferGuard::enter();
        let mut policy = lock(&self.policy);
        let state = self.pool_state();
        hook(&mut **policy, &state)
    }

    /// Run `job` on the callback executor instead of the calling thread.
    pub(super) fn defer(&self, kind: &'static str, job: Job) {
        self.executor.execute(kind, job);
    }

    /// Build the cancellation hook installed on a submitted task's promise.
    pub(super) fn canceller(self: &Arc<Self>, task: &TaskRef) -> Box<dyn FnOnce(bool) + Send> {
        let shared = Arc::downgrade(self);
        let job = Arc::downgrade(&task.0);
        Box::new(move |may_interrupt| {
            if let (Some(shared), Some(job)) = (shared.upgrade(), job.upgrade()) {
                shared.cancel_job(&TaskRef(job), may_interrupt);
            }
        })
    }

    /// Stop a task whose promise was just cancelled.
    ///
    /// A queued task is pulled out of its queue. Otherwise, with
    /// `may_interrupt`, the worker running it is removed and interrupted.
    /// Never both.
    pub(super) fn cancel_job(&self, task: &TaskRef, may_interrupt: bool) {
        task.header().soft_cancel();
        let id = task.id();
        let mut reg = lock(&self.registry);

        let queue = task.queue().and_then(|q| reg.queues.get(&q).cloned());
        let removed = queue.is_some_and(|q| q.remove(task).unwrap_or(false));
        if removed {
            task.header().mark_finished();
            reg.tasks.remove(&id);
            if let Ok(mut metrics) = self.metrics.write() {
                metrics.record_cancelled_in_queue();
            }
            debug!(task = id, "cancelled task removed from queue");
            return;
        }

        if may_interrupt && task.state() == TaskState::Running {
            if let Some(worker_id) = task.worker() {
                let worker = match task.queue() {
                    Some(q) => reg.workers.get_mut(&q).and_then(|ws| ws.remove(&worker_id)),
                    None => reg.immediate.remove(&worker_id),
                };
                if let Some(worker) = worker {
                    worker.interrupt();
                    info!(task = id, worker = worker_id, "interrupted worker running cancelled task");
                }
            }
        }

        if task.state() != TaskState::Running {
            reg.tasks.remove(&id);
        }
    }

    /// Detach a queue: its workers die, queued tasks are drained and the
    /// workers are interrupted. Returns the drained tasks, still pending.
    pub(super) fn detach_queue(&self, queue_id: QueueId) -> Result<Vec<TaskRef>> {
        let (queue, workers) = {
            let mut reg = lock(&self.registry);
            let queue = reg
                .queues
                .remove(&queue_id)
                .ok_or_else(|| AwexError::illegal_state(format!("unknown queue {queue_id}")))?;
            (queue, reg.workers.remove(&queue_id).unwrap_or_default())
        };

        for worker in workers.values() {
            worker.die();
        }
        let drained = queue.shut_down();
        for worker in workers.values() {
            worker.interrupt();
        }

        let mut reg = lock(&self.registry);
        for task in &drained {
            reg.tasks.remove(&task.id());
        }
        info!(
            queue = queue_id,
            workers = workers.len(),
            drained = drained.len(),
            "queue removed"
        );
        Ok(drained)
    }

    pub(super) fn shutdown(&self) {
        let (queue_ids, immediate) = {
            let mut reg = lock(&self.registry);
            if reg.shut_down {
                return;
            }
            reg.shut_down = true;
            let ids: Vec<QueueId> = reg.queues.keys().copied().collect();
            let immediate: Vec<Worker> = reg.immediate.drain().map(|(_, w)| w).collect();
            (ids, immediate)
        };

        for queue_id in queue_ids {
            if let Ok(drained) = self.detach_queue(queue_id) {
                for task in drained {
                    task.cancel(false);
                }
            }
        }
        for worker in immediate {
            worker.interrupt();
        }
        info!("awex scheduler shut down");
    }

    /// Fire `check` after `delay` on the callback executor.
    pub(super) fn schedule_check(
        self: &Arc<Self>,
        delay: Duration,
        kind: &'static str,
        task: TaskRef,
        check: fn(&Shared, &TaskRef),
    ) {
        let shared = Arc::downgrade(self);
        self.executor.schedule(
            delay,
            kind,
            Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    check(&shared, &task);
                }
            }),
        );
    }

    pub(super) fn on_queue_timeout(&self, task: &TaskRef) {
        if task.state() != TaskState::Queued || task.is_settled() || self.is_shut_down() {
            return;
        }
        debug!(task = task.id(), "queue timeout fired");
        self.with_policy(|policy, state| policy.on_task_queue_timeout(state, task));
    }

    pub(super) fn on_execution_timeout(&self, task: &TaskRef) {
        if task.state() != TaskState::Running || task.is_settled() || self.is_shut_down() {
            return;
        }
        debug!(task = task.id(), "execution timeout fired");
        self.with_policy(|policy, state| policy.on_task_execution_timeout(state, task));
    }

    fn is_shut_down(&self) -> bool {
        lock(&self.registry).shut_down
    }
}

/// Forwards worker events to metrics, bookkeeping and the policy.
pub(super) struct PoolListener {
    shared: Weak<Shared>,
}

impl PoolListener {
    pub(super) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }
}

impl WorkerListener for PoolListener {
    fn on_task_started(&self, _worker: WorkerId, task: &TaskRef) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let timeout = task
            .execution_timeout()
            .or_else(|| shared.config.default_execution_timeout());
        if let Some(timeout) = timeout {
            shared.schedule_check(timeout, "execution timeout", task.clone(), Shared::on_execution_timeout);
        }
    }

    fn on_task_finished(&self, worker: WorkerId, task: &TaskRef, run: &TaskRun) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        task.header().mark_finished();

        if let Ok(mut metrics) = shared.metrics.write() {
            match run.outcome {
                Some(outcome) => metrics.record_execution(outcome, run.elapsed),
                None => metrics.record_skipped(),
            }
        }

        {
            let mut reg = lock(&shared.registry);
            reg.tasks.remove(&task.id());
            reg.immediate.remove(&worker);
            if reg.shut_down {
                return;
            }
        }

        debug!(task = task.id(), worker, elapsed = ?run.elapsed, "task finished");
        shared.with_policy(|policy, state| policy.on_task_finished(state, task));
    }
}
