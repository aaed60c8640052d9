use std::sync::{Arc, Weak};

use tracing::{debug, info};

use super::core::Shared;
use crate::error::{AwexError, Result};
use crate::lock;
use crate::policy::PoolManager;
use crate::queue::{QueueId, TaskQueue};
use crate::task::TaskRef;
use crate::worker::{Worker, WorkerId};

/// [`PoolManager`] handed to the policy. Holds the scheduler weakly so the
/// policy it lives in does not keep the scheduler alive.
pub(super) struct ManagerHandle {
    shared: Weak<Shared>,
}

impl ManagerHandle {
    pub(super) fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    fn shared(&self) -> Result<Arc<Shared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| AwexError::illegal_state("scheduler was dropped"))
    }
}

fn unknown_queue(queue: QueueId) -> AwexError {
    AwexError::illegal_state(format!("unknown queue {queue}"))
}

fn shut_down() -> AwexError {
    AwexError::illegal_state("scheduler is shut down")
}

impl PoolManager for ManagerHandle {
    fn create_queue(&self, queue: QueueId) -> Result<()> {
        let shared = self.shared()?;
        let mut reg = lock(&shared.registry);
        if reg.shut_down {
            return Err(shut_down());
        }
        if reg.queues.contains_key(&queue) {
            return Err(AwexError::illegal_state(format!(
                "queue {queue} already exists"
            )));
        }
        reg.queues.insert(queue, Arc::new(TaskQueue::new(queue)));
        reg.workers.entry(queue).or_default();
        info!(queue, "queue created");
        Ok(())
    }

    fn remove_queue(&self, queue: QueueId) -> Result<()> {
        let shared = self.shared()?;
        let drained = shared.detach_queue(queue)?;
        // Cancel callbacks must not run under the policy lock.
        shared.defer(
            "cancel",
            Box::new(move || {
                for task in drained {
                    task.cancel(false);
                }
            }),
        );
        Ok(())
    }

    fn create_worker(&self, queue: QueueId) -> Result<WorkerId> {
        let shared = self.shared()?;
        let mut reg = lock(&shared.registry);
        if reg.shut_down {
            return Err(shut_down());
        }
        let task_queue = reg
            .queues
            .get(&queue)
            .cloned()
            .ok_or_else(|| unknown_queue(queue))?;

        let id = shared.next_worker_id();
        let worker = Worker::spawn(
            id,
            task_queue,
            Arc::clone(&shared.listener),
            &shared.config.thread_name_prefix,
        )?;
        reg.workers.entry(queue).or_default().insert(id, worker);
        info!(worker = id, queue, "worker created");
        Ok(id)
    }

    fn remove_worker(&self, queue: QueueId, worker: WorkerId, interrupt: bool) {
        let Ok(shared) = self.shared() else {
            return;
        };
        let removed = lock(&shared.registry)
            .workers
            .get_mut(&queue)
            .and_then(|workers| workers.remove(&worker));
        let Some(removed) = removed else {
            debug!(worker, queue, "worker already gone");
            return;
        };
        if interrupt {
            removed.interrupt();
        } else {
            removed.die();
        }
        info!(worker, queue, interrupt, "worker removed");
    }

    fn queue_task(&self, queue: QueueId, task: &TaskRef) -> Result<()> {
        let shared = self.shared()?;
        let mut reg = lock(&shared.registry);
        let task_queue = reg
            .queues
            .get(&queue)
            .cloned()
            .ok_or_else(|| unknown_queue(queue))?;
        task_queue.insert(task.clone())?;
        reg.tasks.insert(task.id(), task.clone());
        Ok(())
    }

    fn execute_immediately(&self, task: &TaskRef) -> Result<WorkerId> {
        let shared = self.shared()?;
        let mut reg = lock(&shared.registry);
        if reg.shut_down {
            return Err(shut_down());
        }
        let id = shared.next_worker_id();
        let worker = Worker::spawn_immediate(
            id,
            task.clone(),
            Arc::clone(&shared.listener),
            &shared.config.thread_name_prefix,
        )?;
        reg.immediate.insert(id, worker);
        reg.tasks.insert(task.id(), task.clone());
        debug!(task = task.id(), worker = id, "task executing immediately");
        Ok(id)
    }

    fn merge_task(&self, queued: &TaskRef, incoming: &TaskRef) -> Result<()> {
        Arc::clone(&incoming.0).merge_into(queued.0.as_ref())
    }
}
