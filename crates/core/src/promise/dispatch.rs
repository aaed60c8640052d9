//! Callback dispatch: thread-affinity rules and the background executor.
//!
//! The [`CallbackExecutor`] owns a dedicated thread driving a tokio
//! current-thread runtime. It runs callbacks redirected away from the
//! context thread and hosts the per-task timeout timers.

use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::callbacks::{run_guarded, Affinity, Job};
use crate::error::{AwexError, Result};
use crate::lock;

/// A latency-sensitive thread (a UI loop, an event loop) that callbacks can
/// be pinned to.
pub trait ThreadContext: Send + Sync {
    /// Whether the calling thread is the context thread.
    fn is_current(&self) -> bool;

    /// Queue a job for execution on the context thread.
    fn post(&self, job: Job);
}

/// Single background thread running redirected callbacks and timers.
pub struct CallbackExecutor {
    handle: Handle,
    thread_id: ThreadId,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackExecutor {
    /// Spawn the executor thread and wait for its runtime to come up.
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })
            .map_err(|e| AwexError::Spawn(e.to_string()))?;

        let handle = handle_rx
            .recv()
            .map_err(|e| AwexError::Spawn(e.to_string()))?
            .map_err(AwexError::Spawn)?;

        debug!(executor = %name, "callback executor started");
        Ok(Self {
            handle,
            thread_id: thread.thread().id(),
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run a callback on the executor thread.
    pub fn execute(&self, kind: &'static str, job: Job) {
        self.handle.spawn(async move { run_guarded(kind, job) });
    }

    /// Run a job on the executor thread once `delay` has elapsed.
    pub fn schedule(&self, delay: Duration, kind: &'static str, job: Job) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            run_guarded(kind, job);
        });
    }

    /// Whether the calling thread is the executor thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stop the runtime. Jobs not yet started are dropped.
    pub fn shutdown(&self) {
        if let Some(tx) = lock(&self.shutdown).take() {
            let _ = tx.send(());
        }
        // Joining from inside the executor would wait on ourselves.
        if self.is_current() {
            return;
        }
        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                warn!("callback executor thread panicked");
            }
        }
    }
}

impl Drop for CallbackExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for CallbackExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackExecutor")
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

thread_local! {
    static DEFERRING: Cell<usize> = const { Cell::new(0) };
}

/// While alive, callbacks dispatched from this thread never run inline:
/// they go to the executor, or are posted to the context thread.
///
/// Held while the scheduler's pool lock is taken, so a callback that
/// re-enters the scheduler cannot deadlock on it.
pub(crate) struct DeferGuard(());

impl DeferGuard {
    pub(crate) fn enter() -> Self {
        DEFERRING.with(|depth| depth.set(depth.get() + 1));
        Self(())
    }

    fn active() -> bool {
        DEFERRING.with(|depth| depth.get() > 0)
    }
}

impl Drop for DeferGuard {
    fn drop(&mut self) {
        DEFERRING.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Decides on which thread a callback runs.
///
/// The default dispatcher has no context and runs everything inline on the
/// settling (or registering) thread.
#[derive(Clone, Default)]
pub struct Dispatcher {
    context: Option<Arc<dyn ThreadContext>>,
    executor: Weak<CallbackExecutor>,
}

impl Dispatcher {
    pub fn new(context: Option<Arc<dyn ThreadContext>>, executor: Weak<CallbackExecutor>) -> Self {
        Self { context, executor }
    }

    /// A dispatcher that runs every callback on the calling thread.
    pub fn inline() -> Self {
        Self::default()
    }

    pub fn context(&self) -> Option<&Arc<dyn ThreadContext>> {
        self.context.as_ref()
    }

    pub fn dispatch(&self, affinity: Affinity, kind: &'static str, job: Job) {
        let deferring = DeferGuard::active();
        match (&self.context, affinity) {
            (Some(ctx), Affinity::Context) => {
                if ctx.is_current() && !deferring {
                    run_guarded(kind, job);
                } else {
                    ctx.post(Box::new(move || run_guarded(kind, job)));
                }
            }
            (Some(ctx), Affinity::Any) if ctx.is_current() || deferring => self.redirect(kind, job),
            (None, _) if deferring => self.redirect(kind, job),
            _ => run_guarded(kind, job),
        }
    }

    fn redirect(&self, kind: &'static str, job: Job) {
        match self.executor.upgrade() {
            Some(executor) => executor.execute(kind, job),
            None => run_guarded(kind, job),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("has_context", &self.context.is_some())
            .field("has_executor", &(self.executor.strong_count() > 0))
            .finish()
    }
}
