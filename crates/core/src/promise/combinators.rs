//! Promises derived from a set of source promises.
//!
//! Each combinator keeps its bookkeeping behind one lock, decides there
//! whether it is complete, and settles the derived promise only after the
//! lock is released. The derived promise settles at most once whatever the
//! interleaving of its sources.

use std::sync::{Arc, Mutex};

use super::{Dispatcher, Outcome, Promise, WeakPromise};
use crate::error::AwexError;
use crate::lock;

/// Per-source outcome of an [`after_all`] combination.
#[derive(Debug, Clone)]
pub struct MultipleResult<R> {
    outcomes: Vec<Outcome<R>>,
}

impl<R: Clone> MultipleResult<R> {
    pub(crate) fn new(outcomes: Vec<Outcome<R>>) -> Self {
        Self { outcomes }
    }

    /// Number of source promises.
    pub fn count(&self) -> usize {
        self.outcomes.len()
    }

    /// The value of slot `index`, or `default` if that source did not resolve.
    pub fn result_or_default(&self, index: usize, default: R) -> R {
        self.result(index).cloned().unwrap_or(default)
    }

    pub fn result(&self, index: usize) -> Option<&R> {
        match self.outcomes.get(index) {
            Some(Outcome::Resolved(value)) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self, index: usize) -> Option<&AwexError> {
        match self.outcomes.get(index) {
            Some(Outcome::Rejected(error)) => Some(error),
            _ => None,
        }
    }

    pub fn is_cancelled(&self, index: usize) -> bool {
        matches!(self.outcomes.get(index), Some(Outcome::Cancelled))
    }

    pub fn outcomes(&self) -> &[Outcome<R>] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<Outcome<R>> {
        self.outcomes
    }
}

/// Slots filled by source index plus a countdown to completion.
struct Gather<T> {
    slots: Vec<Option<T>>,
    remaining: usize,
}

impl<T> Gather<T> {
    fn new(len: usize) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            slots: (0..len).map(|_| None).collect(),
            remaining: len,
        }))
    }

    /// Record slot `index`. Returns every slot once the last one arrives.
    fn fill(&mut self, index: usize, value: T) -> Option<Vec<T>> {
        if self.remaining == 0 || self.slots[index].is_some() {
            return None;
        }
        self.slots[index] = Some(value);
        self.remaining -= 1;
        (self.remaining == 0).then(|| self.slots.iter_mut().filter_map(Option::take).collect())
    }
}

fn dispatcher_of<R, P>(sources: &[Promise<R, P>]) -> Dispatcher
where
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    sources
        .first()
        .map(Promise::dispatcher)
        .unwrap_or_default()
}

/// Cancelling `derived` cancels every source that is still alive.
pub(crate) fn cancel_sources_on_cancel<T, R, P>(derived: &Promise<T, P>, sources: &[Promise<R, P>])
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    let weak: Vec<WeakPromise<R, P>> = sources.iter().map(Promise::downgrade).collect();
    derived.set_canceller(Box::new(move |may_interrupt| {
        for source in weak.iter().filter_map(WeakPromise::upgrade) {
            source.cancel_task(may_interrupt);
        }
    }));
}

/// Resolves with every result in source order once all sources resolve.
///
/// The first rejection rejects the combination. A cancelled source cancels
/// it, and cancelling the combination cancels all sources.
pub fn all_of<R, P>(sources: Vec<Promise<R, P>>) -> Promise<Vec<R>, P>
where
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    all_of_in(dispatcher_of(&sources), sources)
}

pub(crate) fn all_of_in<R, P>(dispatcher: Dispatcher, sources: Vec<Promise<R, P>>) -> Promise<Vec<R>, P>
where
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    let combined = Promise::with_dispatcher(dispatcher);
    if sources.is_empty() {
        combined.try_resolve(Vec::new());
        return combined;
    }
    cancel_sources_on_cancel(&combined, &sources);

    let gather = Gather::new(sources.len());
    for (index, source) in sources.iter().enumerate() {
        let target = combined.clone();
        let slots = Arc::clone(&gather);
        source.done(move |value| {
            if let Some(values) = lock(&slots).fill(index, value) {
                target.try_resolve(values);
            }
        });
        let target = combined.clone();
        source.fail(move |error| {
            target.try_reject(error);
        });
        let target = combined.clone();
        source.cancel(move || {
            target.cancel_task(false);
        });
    }
    combined
}

/// Resolves with the first source to resolve.
///
/// Rejects with [`AwexError::AllFailed`] only when every source failed,
/// carrying each cause in source order.
pub fn any_of<R, P>(sources: Vec<Promise<R, P>>) -> Promise<R, P>
where
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    any_of_in(dispatcher_of(&sources), sources)
}

pub(crate) fn any_of_in<R, P>(dispatcher: Dispatcher, sources: Vec<Promise<R, P>>) -> Promise<R, P>
where
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    let combined = Promise::with_dispatcher(dispatcher);
    if sources.is_empty() {
        combined.try_reject(AwexError::AllFailed(Vec::new()));
        return combined;
    }
    cancel_sources_on_cancel(&combined, &sources);

    let failures = Gather::new(sources.len());
    for (index, source) in sources.iter().enumerate() {
        let target = combined.clone();
        source.done(move |value| {
            target.try_resolve(value);
        });
        let target = combined.clone();
        let causes = Arc::clone(&failures);
        source.fail(move |error| {
            if let Some(causes) = lock(&causes).fill(index, error) {
                target.try_reject(AwexError::AllFailed(causes));
            }
        });
        let target = combined.clone();
        source.cancel(move || {
            target.cancel_task(false);
        });
    }
    combined
}

/// Resolves once every source has settled, whatever the outcome.
pub fn after_all<R, P>(sources: Vec<Promise<R, P>>) -> Promise<MultipleResult<R>, P>
where
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    after_all_in(dispatcher_of(&sources), sources)
}

pub(crate) fn after_all_in<R, P>(
    dispatcher: Dispatcher,
    sources: Vec<Promise<R, P>>,
) -> Promise<MultipleResult<R>, P>
where
    R: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    let combined = Promise::with_dispatcher(dispatcher);
    if sources.is_empty() {
        combined.try_resolve(MultipleResult::new(Vec::new()));
        return combined;
    }
    cancel_sources_on_cancel(&combined, &sources);

    let gather = Gather::new(sources.len());
    let record = move |target: &Promise<MultipleResult<R>, P>, index: usize, outcome: Outcome<R>| {
        if let Some(outcomes) = lock(&gather).fill(index, outcome) {
            target.try_resolve(MultipleResult::new(outcomes));
        }
    };
    let record = Arc::new(record);

    for (index, source) in sources.iter().enumerate() {
        let (target, rec) = (combined.clone(), Arc::clone(&record));
        source.done(move |value| rec(&target, index, Outcome::Resolved(value)));
        let (target, rec) = (combined.clone(), Arc::clone(&record));
        source.fail(move |error| rec(&target, index, Outcome::Rejected(error)));
        let (target, rec) = (combined.clone(), Arc::clone(&record));
        source.cancel(move || rec(&target, index, Outcome::Cancelled));
    }
    combined
}
