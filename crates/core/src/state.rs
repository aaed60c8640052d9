//! Read-only pool snapshots handed to [`PoolPolicy`](crate::policy::PoolPolicy).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::queue::QueueId;
use crate::task::{TaskId, TaskRef, TaskState};
use crate::worker::WorkerId;

/// What a worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerStatus {
    Idle,
    Running(TaskId),
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerState {
    pub id: WorkerId,
    pub status: WorkerStatus,
    /// When the worker entered its current status.
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub id: QueueId,
    /// Tasks waiting in the queue.
    pub size: usize,
    /// Workers blocked waiting for a task.
    pub waiters: usize,
    pub workers: BTreeMap<WorkerId, WorkerState>,
}

impl QueueState {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Idle workers, highest id first.
    pub fn idle_workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.workers
            .values()
            .rev()
            .filter(|w| w.status == WorkerStatus::Idle)
            .map(|w| w.id)
    }
}

/// Snapshot of every queue and of the queued tasks that can absorb merges.
#[derive(Debug, Clone)]
pub struct PoolState {
    pub(crate) queues: BTreeMap<QueueId, QueueState>,
    pub(crate) mergeable: HashMap<String, TaskRef>,
    pub(crate) immediate_workers: usize,
    pub(crate) taken_at: DateTime<Utc>,
}

impl PoolState {
    pub fn queue(&self, id: QueueId) -> Option<&QueueState> {
        self.queues.get(&id)
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueState> {
        self.queues.values()
    }

    /// One-shot workers currently running immediate tasks.
    pub fn immediate_workers(&self) -> usize {
        self.immediate_workers
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// A still-queued task equal to `task`, that is, sharing its merge key.
    pub fn equal_task_in_queue(&self, task: &TaskRef) -> Option<TaskRef> {
        let candidate = self.mergeable.get(task.merge_key()?)?;
        (!candidate.same_task(task) && candidate.state() == TaskState::Queued)
            .then(|| candidate.clone())
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running(task) => write!(f, "running task {task}"),
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queue {} (size={}, waiters={}) {{",
            self.id, self.size, self.waiters
        )?;
        for (i, worker) in self.workers.values().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}worker {}: {}", worker.id, worker.status)?;
        }
        write!(f, " }}")
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, queue) in self.queues.values().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{queue}")?;
        }
        write!(f, " ]")
    }
}
