//! Worker threads pulling tasks from a queue, plus one-shot immediate workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{AwexError, Result};
use crate::lock;
use crate::queue::{QueueId, TaskQueue};
use crate::state::{WorkerState, WorkerStatus};
use crate::task::{TaskRef, TaskRun};

pub type WorkerId = u32;

/// Stop flags shared between a worker handle and its thread.
#[derive(Debug, Default)]
pub struct WorkerSignal {
    die: AtomicBool,
    interrupted: AtomicBool,
}

impl WorkerSignal {
    /// Hard cancel: the running task should abort at its next checkpoint.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub fn is_dying(&self) -> bool {
        self.die.load(Ordering::Acquire)
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.is_dying() || self.is_interrupted()
    }

    pub(crate) fn request_die(&self) {
        self.die.store(true, Ordering::Release);
    }

    pub(crate) fn request_interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }
}

/// Receives task lifecycle events from workers.
pub(crate) trait WorkerListener: Send + Sync {
    fn on_task_started(&self, worker: WorkerId, task: &TaskRef);

    /// Called after every execution, whatever the outcome.
    fn on_task_finished(&self, worker: WorkerId, task: &TaskRef, run: &TaskRun);
}

/// Handle to a worker thread. Dropping it does not stop the thread;
/// call [`die`](Self::die) or [`interrupt`](Self::interrupt).
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    queue: Option<Arc<TaskQueue>>,
    signal: Arc<WorkerSignal>,
    state: Arc<Mutex<WorkerState>>,
}

impl Worker {
    /// Spawn a worker servicing `queue` until told to stop.
    pub(crate) fn spawn(
        id: WorkerId,
        queue: Arc<TaskQueue>,
        listener: Arc<dyn WorkerListener>,
        name_prefix: &str,
    ) -> Result<Self> {
        let worker = Self::idle(id, Some(Arc::clone(&queue)));
        let signal = Arc::clone(&worker.signal);
        let state = Arc::clone(&worker.state);

        thread::Builder::new()
            .name(format!("{name_prefix}-worker-{id}"))
            .spawn(move || {
                debug!(worker = id, queue = queue.id(), "worker started");
                loop {
                    if signal.should_stop() {
                        break;
                    }
                    let task = match queue.take(id, &signal) {
                        Ok(Some(task)) => task,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(worker = id, error = %e, "queue unavailable");
                            break;
                        }
                    };
                    run_task(id, &task, &signal, &state, listener.as_ref());
                    if signal.is_interrupted() {
                        break;
                    }
                }
                debug!(worker = id, "worker stopped");
            })
            .map_err(|e| AwexError::Spawn(e.to_string()))?;

        Ok(worker)
    }

    /// Spawn a worker that runs `task` outside any queue and then exits.
    pub(crate) fn spawn_immediate(
        id: WorkerId,
        task: TaskRef,
        listener: Arc<dyn WorkerListener>,
        name_prefix: &str,
    ) -> Result<Self> {
        let worker = Self::idle(id, None);
        let signal = Arc::clone(&worker.signal);
        let state = Arc::clone(&worker.state);

        task.header().mark_running(id);
        thread::Builder::new()
            .name(format!("{name_prefix}-worker-{id}"))
            .spawn(move || {
                run_task(id, &task, &signal, &state, listener.as_ref());
                debug!(worker = id, task = task.id(), "immediate worker done");
            })
            .map_err(|e| AwexError::Spawn(e.to_string()))?;

        Ok(worker)
    }

    fn idle(id: WorkerId, queue: Option<Arc<TaskQueue>>) -> Self {
        Self {
            id,
            queue,
            signal: Arc::new(WorkerSignal::default()),
            state: Arc::new(Mutex::new(WorkerState {
                id,
                status: WorkerStatus::Idle,
                since: Utc::now(),
            })),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Queue serviced by this worker; `None` for an immediate worker.
    pub fn queue_id(&self) -> Option<QueueId> {
        self.queue.as_ref().map(|q| q.id())
    }

    /// Stop after the current task. An idle worker exits right away.
    pub fn die(&self) {
        self.signal.request_die();
        if let Some(queue) = &self.queue {
            queue.wake_all();
        }
    }

    /// Abort the running task and stop.
    pub fn interrupt(&self) {
        self.signal.request_interrupt();
        if let Some(queue) = &self.queue {
            queue.wake_all();
        }
        info!(worker = self.id, "worker interrupted");
    }

    pub fn state(&self) -> WorkerState {
        lock(&self.state).clone()
    }
}

fn set_status(state: &Mutex<WorkerState>, status: WorkerStatus) {
    let mut state = lock(state);
    state.status = status;
    state.since = Utc::now();
}

fn run_task(
    id: WorkerId,
    task: &TaskRef,
    signal: &WorkerSignal,
    state: &Mutex<WorkerState>,
    listener: &dyn WorkerListener,
) {
    set_status(state, WorkerStatus::Running(task.id()));
    listener.on_task_started(id, task);
    let run = task.0.execute(signal);
    set_status(state, WorkerStatus::Idle);
    listener.on_task_finished(id, task, &run);
}
