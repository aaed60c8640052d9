//! Single-assignment promises with progress, cancellation and callbacks.
//!
//! A [`Promise`] leaves `Pending` exactly once. Callbacks registered before
//! that transition fire when it happens; callbacks registered afterwards
//! fire immediately. The promise lock is held only around check-and-set, so
//! callbacks are free to touch the promise (or any other) again.

pub mod callbacks;
pub mod combinators;
pub mod dispatch;

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{AwexError, Result};
use crate::lock;

pub use callbacks::{Affinity, Job};
pub use combinators::{after_all, all_of, any_of, MultipleResult};
pub use dispatch::{CallbackExecutor, Dispatcher, ThreadContext};

use callbacks::{panic_message, Callback, Registered};

/// Lifecycle of a promise. Monotonic: only `Pending` ever changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PromiseState {
    Pending,
    Resolved,
    Rejected,
    Cancelled,
}

/// Terminal value of a promise.
#[derive(Debug, Clone)]
pub enum Outcome<R> {
    Resolved(R),
    Rejected(AwexError),
    Cancelled,
}

impl<R> Outcome<R> {
    pub fn state(&self) -> PromiseState {
        match self {
            Self::Resolved(_) => PromiseState::Resolved,
            Self::Rejected(_) => PromiseState::Rejected,
            Self::Cancelled => PromiseState::Cancelled,
        }
    }
}

/// Invoked once when the promise is cancelled; the flag is `may_interrupt`.
pub(crate) type Canceller = Box<dyn FnOnce(bool) + Send>;

struct Slot<R, P> {
    outcome: Option<Outcome<R>>,
    progress: Option<P>,
    callbacks: Vec<Registered<R, P>>,
    canceller: Option<Canceller>,
    /// Read whenever a callback fires, so a late bind still applies.
    dispatcher: Option<Dispatcher>,
}

impl<R, P> Slot<R, P> {
    fn state(&self) -> PromiseState {
        self.outcome
            .as_ref()
            .map_or(PromiseState::Pending, Outcome::state)
    }
}

struct Shared<R, P> {
    slot: Mutex<Slot<R, P>>,
    settled: Condvar,
}

/// Handle to a future result `R` with progress updates of type `P`.
///
/// Cloning is cheap and every clone observes the same state.
pub struct Promise<R, P = ()> {
    shared: Arc<Shared<R, P>>,
}

/// Non-owning handle; combinators use it to reach their sources.
pub struct WeakPromise<R, P = ()> {
    shared: Weak<Shared<R, P>>,
}

impl<R, P> Clone for Promise<R, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R, P> Clone for WeakPromise<R, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<R, P> WeakPromise<R, P> {
    pub fn upgrade(&self) -> Option<Promise<R, P>> {
        self.shared.upgrade().map(|shared| Promise { shared })
    }
}

impl<R, P> Default for Promise<R, P>
where
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<R, P> Promise<R, P>
where
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    /// A pending promise. Callbacks run inline until a dispatcher is bound.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    outcome: None,
                    progress: None,
                    callbacks: Vec::new(),
                    canceller: None,
                    dispatcher: None,
                }),
                settled: Condvar::new(),
            }),
        }
    }

    /// A pending promise delivering callbacks through `dispatcher`.
    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        let promise = Self::new();
        promise.bind_dispatcher(dispatcher);
        promise
    }

    /// An already resolved promise.
    pub fn resolved(value: R) -> Self {
        let promise = Self::new();
        promise.try_resolve(value);
        promise
    }

    /// An already rejected promise.
    pub fn rejected(error: AwexError) -> Self {
        let promise = Self::new();
        promise.try_reject(error);
        promise
    }

    fn slot(&self) -> MutexGuard<'_, Slot<R, P>> {
        lock(&self.shared.slot)
    }

    /// Dispatcher used for the next callback to fire.
    pub fn dispatcher(&self) -> Dispatcher {
        self.slot().dispatcher.clone().unwrap_or_default()
    }

    /// Route callbacks through `dispatcher`, replacing any earlier binding.
    pub(crate) fn bind_dispatcher(&self, dispatcher: Dispatcher) {
        self.slot().dispatcher = Some(dispatcher);
    }

    /// Install the hook run when this promise gets cancelled.
    /// Dropped without running if the promise already settled.
    pub(crate) fn set_canceller(&self, canceller: Canceller) {
        let mut slot = self.slot();
        if slot.outcome.is_none() {
            slot.canceller = Some(canceller);
        }
    }

    pub fn downgrade(&self) -> WeakPromise<R, P> {
        WeakPromise {
            shared: Arc::downgrade(&self.shared),
        }
    }

    // ── State ──────────────────────────────────────────────────────

    pub fn state(&self) -> PromiseState {
        self.slot().state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == PromiseState::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == PromiseState::Rejected
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == PromiseState::Cancelled
    }

    /// Last progress value published while pending.
    pub fn last_progress(&self) -> Option<P> {
        self.slot().progress.clone()
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Move out of `Pending`. Returns the callbacks to fire and the
    /// canceller, or the state that blocked the transition.
    fn transition(
        &self,
        outcome: Outcome<R>,
    ) -> std::result::Result<(Vec<Registered<R, P>>, Option<Canceller>), PromiseState> {
        let taken = {
            let mut slot = self.slot();
            if slot.outcome.is_some() {
                return Err(slot.state());
            }
            slot.outcome = Some(outcome);
            (mem::take(&mut slot.callbacks), slot.canceller.take())
        };
        self.shared.settled.notify_all();
        Ok(taken)
    }

    fn settle(&self, outcome: Outcome<R>) -> std::result::Result<(), PromiseState> {
        let delivered = outcome.clone();
        let (callbacks, _canceller) = self.transition(outcome)?;
        for registered in callbacks {
            self.fire(registered, &delivered);
        }
        Ok(())
    }

    /// Resolve with `value`. Fails if the promise already settled.
    pub fn resolve(&self, value: R) -> Result<()> {
        self.settle(Outcome::Resolved(value))
            .map_err(|state| AwexError::illegal_state(format!("cannot resolve a {state:?} promise")))
    }

    /// Reject with `error`. Fails if the promise already settled.
    pub fn reject(&self, error: AwexError) -> Result<()> {
        self.settle(Outcome::Rejected(error))
            .map_err(|state| AwexError::illegal_state(format!("cannot reject a {state:?} promise")))
    }

    /// Resolve unless already settled; reports whether it took effect.
    pub fn try_resolve(&self, value: R) -> bool {
        self.settle(Outcome::Resolved(value)).is_ok()
    }

    /// Reject unless already settled; reports whether it took effect.
    pub fn try_reject(&self, error: AwexError) -> bool {
        self.settle(Outcome::Rejected(error)).is_ok()
    }

    /// Cancel the promise and ask the work behind it to stop.
    ///
    /// With `may_interrupt` a task already running is hard-interrupted;
    /// otherwise it is only flagged. Returns false if the promise had
    /// already settled, which makes this safe to call on any promise.
    pub fn cancel_task(&self, may_interrupt: bool) -> bool {
        let Ok((callbacks, canceller)) = self.transition(Outcome::Cancelled) else {
            return false;
        };
        if let Some(canceller) = canceller {
            canceller(may_interrupt);
        }
        for registered in callbacks {
            self.fire(registered, &Outcome::Cancelled);
        }
        true
    }

    /// Publish a progress value. Only allowed while pending.
    pub fn notify_progress(&self, progress: P) -> Result<()> {
        let listeners: Vec<_> = {
            let mut slot = self.slot();
            if slot.outcome.is_some() {
                return Err(AwexError::illegal_state(format!(
                    "cannot notify progress on a {:?} promise",
                    slot.state()
                )));
            }
            slot.progress = Some(progress.clone());
            slot.callbacks
                .iter()
                .filter_map(|r| match &r.callback {
                    Callback::Progress(f) => Some((r.affinity, Arc::clone(f))),
                    _ => None,
                })
                .collect()
        };

        let dispatcher = self.dispatcher();
        for (affinity, listener) in listeners {
            let value = progress.clone();
            dispatcher.dispatch(affinity, "progress", Box::new(move || listener(value)));
        }
        Ok(())
    }

    // ── Callbacks ──────────────────────────────────────────────────

    fn fire(&self, registered: Registered<R, P>, outcome: &Outcome<R>) {
        let Registered { affinity, callback } = registered;
        let kind = callback.kind();
        let job: Job = match (callback, outcome) {
            (Callback::Done(f), Outcome::Resolved(value)) => {
                let value = value.clone();
                Box::new(move || f(value))
            }
            (Callback::Fail(f), Outcome::Rejected(error)) => {
                let error = error.clone();
                Box::new(move || f(error))
            }
            (Callback::Cancel(f), Outcome::Cancelled) => f,
            (Callback::Always(f), _) => f,
            _ => return,
        };
        self.dispatcher().dispatch(affinity, kind, job);
    }

    fn register(&self, affinity: Affinity, callback: Callback<R, P>) -> &Self {
        let outcome = {
            let mut slot = self.slot();
            match &slot.outcome {
                None => {
                    slot.callbacks.push(Registered { affinity, callback });
                    return self;
                }
                Some(outcome) => outcome.clone(),
            }
        };
        self.fire(Registered { affinity, callback }, &outcome);
        self
    }

    pub fn done(&self, f: impl FnOnce(R) + Send + 'static) -> &Self {
        self.done_with(Affinity::Any, f)
    }

    pub fn done_with(&self, affinity: Affinity, f: impl FnOnce(R) + Send + 'static) -> &Self {
        self.register(affinity, Callback::Done(Box::new(f)))
    }

    pub fn fail(&self, f: impl FnOnce(AwexError) + Send + 'static) -> &Self {
        self.fail_with(Affinity::Any, f)
    }

    pub fn fail_with(
        &self,
        affinity: Affinity,
        f: impl FnOnce(AwexError) + Send + 'static,
    ) -> &Self {
        self.register(affinity, Callback::Fail(Box::new(f)))
    }

    /// Observe progress. Values published before registration are not replayed.
    pub fn progress(&self, f: impl Fn(P) + Send + Sync + 'static) -> &Self {
        self.progress_with(Affinity::Any, f)
    }

    pub fn progress_with(
        &self,
        affinity: Affinity,
        f: impl Fn(P) + Send + Sync + 'static,
    ) -> &Self {
        self.register(affinity, Callback::Progress(Arc::new(f)))
    }

    pub fn cancel(&self, f: impl FnOnce() + Send + 'static) -> &Self {
        self.cancel_with(Affinity::Any, f)
    }

    pub fn cancel_with(&self, affinity: Affinity, f: impl FnOnce() + Send + 'static) -> &Self {
        self.register(affinity, Callback::Cancel(Box::new(f)))
    }

    /// Runs on any terminal state.
    pub fn always(&self, f: impl FnOnce() + Send + 'static) -> &Self {
        self.always_with(Affinity::Any, f)
    }

    pub fn always_with(&self, affinity: Affinity, f: impl FnOnce() + Send + 'static) -> &Self {
        self.register(affinity, Callback::Always(Box::new(f)))
    }

    // ── Blocking accessors ─────────────────────────────────────────

    fn wait(&self, deadline: Option<(Instant, Duration)>) -> Result<Outcome<R>> {
        let mut slot = self.slot();
        loop {
            if let Some(outcome) = &slot.outcome {
                return Ok(outcome.clone());
            }
            slot = match deadline {
                None => self
                    .shared
                    .settled
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner),
                Some((at, limit)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(AwexError::Timeout(limit));
                    }
                    self.shared
                        .settled
                        .wait_timeout(slot, at - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn unwrap_outcome(outcome: Outcome<R>) -> Result<R> {
        match outcome {
            Outcome::Resolved(value) => Ok(value),
            Outcome::Rejected(error) => Err(error),
            Outcome::Cancelled => Err(AwexError::illegal_state("promise was cancelled")),
        }
    }

    /// Block until settled. A rejection returns its cause; a cancelled
    /// promise has no result and fails with `IllegalState`.
    pub fn get_result(&self) -> Result<R> {
        self.wait(None).and_then(Self::unwrap_outcome)
    }

    /// Like [`get_result`](Self::get_result) but gives up after `limit`.
    pub fn get_result_within(&self, limit: Duration) -> Result<R> {
        self.wait(Some((Instant::now() + limit, limit)))
            .and_then(Self::unwrap_outcome)
    }

    /// Block until settled, falling back to `default` unless resolved.
    pub fn get_result_or_default(&self, default: R) -> R {
        match self.wait(None) {
            Ok(Outcome::Resolved(value)) => value,
            _ => default,
        }
    }

    /// Block until settled and return the terminal outcome.
    pub fn outcome(&self) -> Outcome<R> {
        match self.wait(None) {
            Ok(outcome) => outcome,
            Err(error) => Outcome::Rejected(error),
        }
    }

    // ── Composition ────────────────────────────────────────────────

    /// Forward this promise's result, failure, progress and cancellation
    /// into `target` while `target` is still pending. Cancelling `target`
    /// leaves this promise untouched. Returns `target`.
    pub fn pipe(&self, target: &Promise<R, P>) -> Promise<R, P> {
        let to = target.clone();
        self.done(move |value| {
            to.try_resolve(value);
        });
        let to = target.clone();
        self.fail(move |error| {
            to.try_reject(error);
        });
        let to = target.downgrade();
        self.progress(move |progress| {
            if let Some(to) = to.upgrade() {
                let _ = to.notify_progress(progress);
            }
        });
        let to = target.clone();
        self.cancel(move || {
            to.cancel_task(false);
        });
        target.clone()
    }

    /// Chain another asynchronous step.
    ///
    /// When this promise resolves, `f` receives the value and returns the
    /// next promise; the returned promise settles like that one. Failure
    /// and cancellation skip `f` and propagate.
    pub fn then<U, F>(&self, f: F) -> Promise<U, P>
    where
        U: Clone + Send + 'static,
        F: FnOnce(R) -> Promise<U, P> + Send + 'static,
    {
        let chained = Promise::with_dispatcher(self.dispatcher());

        let target = chained.clone();
        self.done(move |value| {
            match panic::catch_unwind(AssertUnwindSafe(|| f(value))) {
                Ok(next) => {
                    next.pipe(&target);
                }
                Err(payload) => {
                    target.try_reject(AwexError::Panicked(panic_message(payload.as_ref())));
                }
            }
        });
        let target = chained.clone();
        self.fail(move |error| {
            target.try_reject(error);
        });
        let target = chained.downgrade();
        self.progress(move |progress| {
            if let Some(target) = target.upgrade() {
                let _ = target.notify_progress(progress);
            }
        });
        let target = chained.clone();
        self.cancel(move || {
            target.cancel_task(false);
        });

        chained
    }

    /// Resolves with whichever of the two resolves first.
    pub fn or(&self, other: &Promise<R, P>) -> Promise<R, P> {
        combinators::any_of_in(
            self.dispatcher(),
            vec![self.clone(), other.clone()],
        )
    }

    /// Resolves with both results, in order, once both resolve.
    pub fn and(&self, other: &Promise<R, P>) -> Promise<Vec<R>, P> {
        combinators::all_of_in(
            self.dispatcher(),
            vec![self.clone(), other.clone()],
        )
    }
}

impl<R, P> fmt::Debug for Promise<R, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.slot).state();
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + Clone) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v| sink.lock().unwrap().push(v))
    }

    #[test]
    fn new_promise_is_pending() {
        let promise: Promise<i32, f32> = Promise::new();
        assert_eq!(promise.state(), PromiseState::Pending);
        assert!(promise.last_progress().is_none());
    }

    #[test]
    fn resolve_sets_result() {
        let promise: Promise<i32> = Promise::new();
        promise.resolve(666).unwrap();

        assert!(promise.is_resolved());
        assert_eq!(promise.get_result().unwrap(), 666);
        assert_eq!(promise.get_result_or_default(999), 666);
    }

    #[test]
    fn second_settle_is_illegal() {
        let promise: Promise<i32> = Promise::new();
        promise.resolve(1).unwrap();

        assert!(matches!(promise.resolve(2), Err(AwexError::IllegalState(_))));
        assert!(matches!(
            promise.reject(AwexError::AbsentValue),
            Err(AwexError::IllegalState(_))
        ));
        assert_eq!(promise.get_result().unwrap(), 1);

        let rejected: Promise<i32> = Promise::new();
        rejected.reject(AwexError::AbsentValue).unwrap();
        assert!(matches!(
            rejected.reject(AwexError::AbsentValue),
            Err(AwexError::IllegalState(_))
        ));
    }

    #[test]
    fn rejected_result_returns_cause() {
        let promise: Promise<i32> = Promise::new();
        promise.reject(AwexError::Panicked("index out of bounds".into())).unwrap();

        assert!(promise.is_rejected());
        assert!(matches!(promise.get_result(), Err(AwexError::Panicked(_))));
        assert_eq!(promise.get_result_or_default(999), 999);
    }

    #[test]
    fn cancelled_result_is_illegal_state() {
        let promise: Promise<i32> = Promise::new();
        assert!(promise.cancel_task(false));

        assert!(matches!(promise.get_result(), Err(AwexError::IllegalState(_))));
        assert_eq!(promise.get_result_or_default(999), 999);
        assert!(!promise.cancel_task(true), "second cancel is a no-op");
    }

    #[test]
    fn done_before_and_after_resolve_fire_once() {
        let (seen, sink) = recorder::<i32>();
        let always = Arc::new(AtomicUsize::new(0));

        let promise: Promise<i32> = Promise::new();
        let early = sink.clone();
        let a = Arc::clone(&always);
        promise.done(move |v| early(v)).always(move || {
            a.fetch_add(1, Ordering::SeqCst);
        });
        promise.resolve(7).unwrap();

        let a = Arc::clone(&always);
        promise.done(move |v| sink(v)).always(move || {
            a.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(*seen.lock().unwrap(), vec![7, 7]);
        assert_eq!(always.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let (seen, sink) = recorder::<&'static str>();
        let promise: Promise<i32> = Promise::new();

        let s = sink.clone();
        promise.done(move |_| s("done-1"));
        let s = sink.clone();
        promise.always(move || s("always"));
        let s = sink.clone();
        promise.done(move |_| s("done-2"));
        promise.fail(move |_| sink("fail"));

        promise.resolve(1).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["done-1", "always", "done-2"]);
    }

    #[test]
    fn panicking_callback_does_not_stop_siblings() {
        let (seen, sink) = recorder::<i32>();
        let promise: Promise<i32> = Promise::new();
        promise.done(|_| panic!("callback failure"));
        promise.done(move |v| sink(v));
        promise.always(|| panic!("always failure"));

        promise.resolve(3).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[test]
    fn fail_callbacks_receive_cause() {
        let (seen, sink) = recorder::<String>();
        let promise: Promise<i32> = Promise::new();
        let early = sink.clone();
        promise.fail(move |e| early(e.to_string()));
        promise.reject(AwexError::AbsentValue).unwrap();
        promise.fail(move |e| sink(e.to_string()));

        assert_eq!(*seen.lock().unwrap(), vec!["absent value", "absent value"]);
    }

    #[test]
    fn cancel_callbacks_fire_before_and_after() {
        let count = Arc::new(AtomicUsize::new(0));
        let promise: Promise<i32> = Promise::new();

        let c = Arc::clone(&count);
        promise.cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        promise.cancel(|| panic!("cancel failure"));
        promise.cancel_task(false);
        let c = Arc::clone(&count);
        promise.cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn canceller_receives_interrupt_flag() {
        let (seen, sink) = recorder::<bool>();
        let promise: Promise<i32> = Promise::new();
        promise.set_canceller(Box::new(move |may_interrupt| sink(may_interrupt)));

        promise.cancel_task(true);
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[test]
    fn progress_only_while_pending() {
        let (seen, sink) = recorder::<f32>();
        let promise: Promise<i32, f32> = Promise::new();
        promise.progress(|_| panic!("first listener fails"));
        promise.progress(move |p| sink(p));

        promise.notify_progress(0.25).unwrap();
        promise.notify_progress(0.6).unwrap();
        assert_eq!(promise.last_progress(), Some(0.6));

        promise.resolve(1).unwrap();
        assert!(matches!(
            promise.notify_progress(1.0),
            Err(AwexError::IllegalState(_))
        ));
        assert_eq!(*seen.lock().unwrap(), vec![0.25, 0.6]);
    }

    #[test]
    fn get_result_blocks_until_resolved() {
        let promise: Promise<i32> = Promise::new();
        let resolver = promise.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.resolve(5).unwrap();
        });

        assert_eq!(promise.get_result().unwrap(), 5);
        handle.join().unwrap();
    }

    #[test]
    fn bounded_wait_times_out() {
        let promise: Promise<i32> = Promise::new();
        let err = promise
            .get_result_within(Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, AwexError::Timeout(_)));
    }

    #[test]
    fn pipe_forwards_resolution_progress_and_failure() {
        let original: Promise<i32, f32> = Promise::new();
        let piped: Promise<i32, f32> = Promise::new();
        let (progress, sink) = recorder::<f32>();
        piped.progress(move |p| sink(p));

        original.pipe(&piped);
        original.notify_progress(0.6).unwrap();
        original.resolve(666).unwrap();

        assert_eq!(*progress.lock().unwrap(), vec![0.6]);
        assert_eq!(piped.get_result().unwrap(), 666);

        let original: Promise<i32, f32> = Promise::new();
        let piped: Promise<i32, f32> = Promise::new();
        original.pipe(&piped);
        original.reject(AwexError::AbsentValue).unwrap();
        assert!(matches!(piped.get_result(), Err(AwexError::AbsentValue)));
    }

    #[test]
    fn pipe_delivers_cancellation_downstream_only() {
        let original: Promise<i32> = Promise::new();
        let piped: Promise<i32> = Promise::new();
        original.pipe(&piped);
        original.cancel_task(false);
        assert!(piped.is_cancelled());

        let original: Promise<i32> = Promise::new();
        let piped: Promise<i32> = Promise::new();
        original.pipe(&piped);
        piped.cancel_task(false);
        assert!(!original.is_cancelled());
        assert!(piped.is_cancelled());

        // Resolving the original afterwards must not fail.
        original.resolve(666).unwrap();
        assert!(piped.is_cancelled());
    }

    #[test]
    fn then_chain_runs_links_in_order() {
        let original: Promise<i32> = Promise::new();
        let first: Promise<i32> = Promise::new();
        let second: Promise<i32> = Promise::new();
        let (values, sink) = recorder::<i32>();

        let f1 = first.clone();
        let s1 = sink.clone();
        let f2 = second.clone();
        let s2 = sink.clone();
        original
            .then(move |v| {
                s1(v);
                f1
            })
            .then(move |v| {
                s2(v);
                f2
            })
            .done(move |v| sink(v));

        second.resolve(3).unwrap();
        first.resolve(2).unwrap();
        assert!(values.lock().unwrap().is_empty());

        original.resolve(1).unwrap();
        assert_eq!(*values.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn then_delivers_final_value_once_after_intermediates() {
        let original: Promise<i32> = Promise::new();
        let first: Promise<i32> = Promise::new();
        let second: Promise<i32> = Promise::new();
        let (values, sink) = recorder::<i32>();

        let (f1, f2) = (first.clone(), second.clone());
        let chain = original.then(move |_| f1).then(move |_| f2);
        chain.done(move |v| sink(v));

        original.resolve(1).unwrap();
        assert!(chain.is_pending());
        first.resolve(2).unwrap();
        assert!(chain.is_pending());
        second.resolve(3).unwrap();

        assert_eq!(*values.lock().unwrap(), vec![3]);
    }

    #[test]
    fn then_propagates_failure_and_panics() {
        let original: Promise<i32> = Promise::new();
        let chained = original.then(|v| Promise::<i32>::resolved(v + 1));
        original.reject(AwexError::AbsentValue).unwrap();
        assert!(matches!(chained.get_result(), Err(AwexError::AbsentValue)));

        let original: Promise<i32> = Promise::new();
        let chained: Promise<i32> = original.then(|_| panic!("bad link"));
        original.resolve(1).unwrap();
        assert!(matches!(chained.get_result(), Err(AwexError::Panicked(_))));
    }

    #[test]
    fn weak_promise_does_not_keep_alive() {
        let promise: Promise<i32> = Promise::new();
        let weak = promise.downgrade();
        assert!(weak.upgrade().is_some());
        drop(promise);
        assert!(weak.upgrade().is_none());
    }
}
