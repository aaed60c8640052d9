use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{PoolManager, PoolPolicy};
use crate::config::AwexConfig;
use crate::error::{AwexError, Result};
use crate::queue::QueueId;
use crate::state::PoolState;
use crate::task::TaskRef;

/// Queue used by [`DefaultPoolPolicy`] for every non-realtime task.
pub const DEFAULT_QUEUE: QueueId = 0;

/// Single queue whose worker count floats between `min_workers` and
/// `max_workers`.
pub struct DefaultPoolPolicy {
    min_workers: usize,
    max_workers: usize,
    realtime_priority: Option<i32>,
    manager: Option<Arc<dyn PoolManager>>,
}

impl DefaultPoolPolicy {
    pub fn new(config: &AwexConfig) -> Self {
        Self {
            min_workers: config.min_workers,
            max_workers: config.resolved_max_workers(),
            realtime_priority: config.realtime_priority,
            manager: None,
        }
    }

    fn manager(&self) -> Result<&Arc<dyn PoolManager>> {
        self.manager
            .as_ref()
            .ok_or_else(|| AwexError::illegal_state("pool policy used before initialize"))
    }

    fn is_realtime(&self, task: &TaskRef) -> bool {
        self.realtime_priority
            .is_some_and(|threshold| task.priority() >= threshold)
    }

    /// Add one worker unless the queue is at its ceiling.
    fn grow(&self, state: &PoolState, reason: &'static str) {
        let Some(queue) = state.queue(DEFAULT_QUEUE) else {
            return;
        };
        if queue.worker_count() >= self.max_workers {
            return;
        }
        let Ok(manager) = self.manager() else {
            return;
        };
        match manager.create_worker(DEFAULT_QUEUE) {
            Ok(worker) => debug!(worker, reason, "pool grown"),
            Err(e) => warn!(error = %e, reason, "failed to grow pool"),
        }
    }
}

impl PoolPolicy for DefaultPoolPolicy {
    fn initialize(&mut self, manager: Arc<dyn PoolManager>) -> Result<()> {
        manager.create_queue(DEFAULT_QUEUE)?;
        for _ in 0..self.min_workers {
            manager.create_worker(DEFAULT_QUEUE)?;
        }
        info!(
            min_workers = self.min_workers,
            max_workers = self.max_workers,
            "default pool policy initialized"
        );
        self.manager = Some(manager);
        Ok(())
    }

    fn on_task_added(&mut self, state: &PoolState, task: &TaskRef) -> Result<()> {
        let manager = Arc::clone(self.manager()?);

        if self.is_realtime(task) {
            manager.execute_immediately(task)?;
            return Ok(());
        }

        if let Some(queued) = state.equal_task_in_queue(task) {
            match manager.merge_task(&queued, task) {
                Ok(()) => {
                    debug!(task = task.id(), into = queued.id(), "task merged");
                    return Ok(());
                }
                // The equal task left the queue since the snapshot.
                Err(e) => debug!(task = task.id(), error = %e, "merge skipped"),
            }
        }

        manager.queue_task(DEFAULT_QUEUE, task)?;

        let starved = state
            .queue(DEFAULT_QUEUE)
            .is_some_and(|queue| queue.size + 1 > queue.waiters);
        if starved {
            self.grow(state, "no idle worker");
        }
        Ok(())
    }

    fn on_task_queue_timeout(&mut self, state: &PoolState, task: &TaskRef) {
        info!(task = task.id(), "task waited too long in queue");
        self.grow(state, "queue timeout");
    }

    fn on_task_execution_timeout(&mut self, state: &PoolState, task: &TaskRef) {
        warn!(
            task = task.id(),
            worker = ?task.worker(),
            "task exceeded its execution timeout"
        );
        self.grow(state, "execution timeout");
    }

    fn on_task_finished(&mut self, state: &PoolState, _task: &TaskRef) {
        let Some(queue) = state.queue(DEFAULT_QUEUE) else {
            return;
        };
        // Interrupted workers leave the pool without a replacement.
        let floor = if queue.size > 0 {
            self.min_workers.max(1)
        } else {
            self.min_workers
        };
        if queue.worker_count() < floor {
            let Ok(manager) = self.manager() else {
                return;
            };
            for _ in queue.worker_count()..floor {
                match manager.create_worker(DEFAULT_QUEUE) {
                    Ok(worker) => debug!(worker, "pool replenished"),
                    Err(e) => {
                        warn!(error = %e, "failed to replenish pool");
                        return;
                    }
                }
            }
            return;
        }
        if queue.size > 0 || queue.worker_count() <= self.min_workers {
            return;
        }
        let (Some(worker), Ok(manager)) = (queue.idle_workers().next(), self.manager()) else {
            return;
        };
        manager.remove_worker(DEFAULT_QUEUE, worker, false);
        debug!(worker, "pool shrunk");
    }
}
