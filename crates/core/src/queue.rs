//! Priority-ordered blocking task queue shared by the workers of one pool.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{AwexError, Result};
use crate::lock;
use crate::task::{TaskId, TaskRef};
use crate::worker::{WorkerId, WorkerSignal};

pub type QueueId = u32;

/// Heap entry. Orders by priority (higher first), then id (lower first).
struct Entry {
    priority: i32,
    id: TaskId,
    task: TaskRef,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct Inner {
    heap: BinaryHeap<Entry>,
    dead: bool,
}

/// Blocking priority queue pulled by workers.
pub struct TaskQueue {
    id: QueueId,
    inner: Mutex<Inner>,
    available: Condvar,
    waiters: AtomicUsize,
    size: AtomicUsize,
}

/// Keeps the waiter count accurate on every exit path of `take`.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn dead_queue(id: QueueId) -> AwexError {
    AwexError::illegal_state(format!("queue {id} is dead"))
}

impl TaskQueue {
    pub fn new(id: QueueId) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                dead: false,
            }),
            available: Condvar::new(),
            waiters: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    /// Queue a task and wake one waiting worker.
    pub fn insert(&self, task: TaskRef) -> Result<()> {
        let mut inner = self.inner();
        if inner.dead {
            return Err(dead_queue(self.id));
        }
        task.header().mark_queued(Some(self.id));
        inner.heap.push(Entry {
            priority: task.priority(),
            id: task.id(),
            task,
        });
        self.size.fetch_add(1, Ordering::SeqCst);
        self.available.notify_one();
        Ok(())
    }

    /// Block until a task is available and hand it to `worker`.
    ///
    /// Returns `None` once `signal` asks the worker to stop, or when the
    /// queue dies while waiting. The task is marked running for `worker`
    /// under the queue lock, so a failed [`remove`](Self::remove) means a
    /// worker owns the task.
    pub fn take(&self, worker: WorkerId, signal: &WorkerSignal) -> Result<Option<TaskRef>> {
        let mut inner = self.inner();
        if inner.dead {
            return Err(dead_queue(self.id));
        }

        let _waiting = WaiterGuard::enter(&self.waiters);
        loop {
            if signal.should_stop() || inner.dead {
                return Ok(None);
            }
            if let Some(entry) = inner.heap.pop() {
                self.size.fetch_sub(1, Ordering::SeqCst);
                entry.task.header().mark_running(worker);
                return Ok(Some(entry.task));
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Remove a task that has not been taken yet.
    pub fn remove(&self, task: &TaskRef) -> Result<bool> {
        let mut inner = self.inner();
        if inner.dead {
            return Err(dead_queue(self.id));
        }
        let before = inner.heap.len();
        inner.heap.retain(|entry| !entry.task.same_task(task));
        let removed = inner.heap.len() < before;
        if removed {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    /// Mark the queue dead, wake every waiter and hand back what was queued.
    pub(crate) fn shut_down(&self) -> Vec<TaskRef> {
        let drained: Vec<TaskRef> = {
            let mut inner = self.inner();
            inner.dead = true;
            self.size.store(0, Ordering::SeqCst);
            let heap = std::mem::take(&mut inner.heap);
            heap.into_sorted_vec()
                .into_iter()
                .rev()
                .map(|entry| entry.task)
                .collect()
        };
        self.available.notify_all();
        for task in &drained {
            task.header().mark_finished();
        }
        debug!(queue = self.id, drained = drained.len(), "queue shut down");
        drained
    }

    /// Kill the queue and cancel every task still in it.
    pub fn destroy(&self) {
        for task in self.shut_down() {
            task.cancel(false);
        }
    }

    /// Wake every blocked taker so it can re-check its stop signal.
    pub(crate) fn wake_all(&self) {
        let _inner = self.inner();
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Workers currently blocked waiting for a task.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    pub fn is_dead(&self) -> bool {
        self.inner().dead
    }

    /// Ids of queued tasks in the order they would be taken.
    pub fn queued_ids(&self) -> Vec<TaskId> {
        let inner = self.inner();
        let mut entries: Vec<&Entry> = inner.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.id).collect()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("id", &self.id)
            .field("size", &self.len())
            .field("waiters", &self.waiters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskState};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn submitted(id: TaskId, priority: i32) -> (Task<TaskId>, TaskRef) {
        let task: Task<TaskId> = Task::builder(move |_| Ok(id)).with_priority(priority).build();
        let task_ref = task.task_ref();
        task_ref.header().assign_id(id).unwrap();
        (task, task_ref)
    }

    #[test]
    fn take_orders_by_priority_then_id() {
        let queue = TaskQueue::new(0);
        let signal = WorkerSignal::default();
        for (id, priority) in [(1, 0), (2, 5), (3, 0), (4, 5)] {
            queue.insert(submitted(id, priority).1).unwrap();
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.queued_ids(), vec![2, 4, 1, 3]);

        let order: Vec<TaskId> = (0..4)
            .map(|_| queue.take(9, &signal).unwrap().unwrap().id())
            .collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn take_assigns_worker_and_running_state() {
        let queue = TaskQueue::new(0);
        let (task, task_ref) = submitted(1, 0);
        queue.insert(task_ref).unwrap();
        assert_eq!(task.state(), TaskState::Queued);

        let taken = queue.take(3, &WorkerSignal::default()).unwrap().unwrap();
        assert_eq!(taken.worker(), Some(3));
        assert_eq!(task.state(), TaskState::Running);
    }

    #[test]
    fn remove_only_succeeds_while_queued() {
        let queue = TaskQueue::new(0);
        let (_task, task_ref) = submitted(1, 0);
        queue.insert(task_ref.clone()).unwrap();

        assert!(queue.remove(&task_ref).unwrap());
        assert!(!queue.remove(&task_ref).unwrap());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn blocked_take_wakes_on_insert() {
        let queue = Arc::new(TaskQueue::new(0));
        let taker = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            taker
                .take(1, &WorkerSignal::default())
                .unwrap()
                .map(|t| t.id())
        });

        while queue.waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        queue.insert(submitted(7, 0).1).unwrap();

        assert_eq!(handle.join().unwrap(), Some(7));
        assert_eq!(queue.waiters(), 0);
    }

    #[test]
    fn stop_signal_releases_blocked_take() {
        let queue = Arc::new(TaskQueue::new(0));
        let signal = Arc::new(WorkerSignal::default());
        let (taker, sig) = (Arc::clone(&queue), Arc::clone(&signal));
        let handle = thread::spawn(move || taker.take(1, &sig).unwrap().is_none());

        while queue.waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        signal.request_die();
        queue.wake_all();

        assert!(handle.join().unwrap());
    }

    #[test]
    fn dead_queue_rejects_everything() {
        let queue = TaskQueue::new(3);
        let (task, task_ref) = submitted(1, 0);
        queue.insert(task_ref.clone()).unwrap();

        queue.destroy();
        assert!(queue.is_dead());
        assert!(task.promise().is_cancelled());
        assert!(matches!(queue.insert(task_ref.clone()), Err(AwexError::IllegalState(_))));
        assert!(matches!(queue.remove(&task_ref), Err(AwexError::IllegalState(_))));
        assert!(matches!(
            queue.take(1, &WorkerSignal::default()),
            Err(AwexError::IllegalState(_))
        ));
    }

    #[test]
    fn shutdown_wakes_blocked_takers() {
        let queue = Arc::new(TaskQueue::new(0));
        let taker = Arc::clone(&queue);
        let handle = thread::spawn(move || taker.take(1, &WorkerSignal::default()));

        while queue.waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(queue.shut_down().is_empty());
        assert!(matches!(handle.join().unwrap(), Ok(None)));
    }
}
