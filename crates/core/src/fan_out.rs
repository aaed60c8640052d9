//! Split a batch across the worker pool and stitch the partial results
//! back together.
//!
//! Each partition becomes its own task. The aggregate promise resolves once
//! every partition resolved, rejects as soon as one partition fails, and is
//! cancelled when any partition is. Cancelling the aggregate cancels every
//! partition.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::debug;

use crate::error::{AwexError, Result};
use crate::promise::callbacks::panic_message;
use crate::promise::combinators::cancel_sources_on_cancel;
use crate::promise::{Outcome, Promise, WeakPromise};
use crate::scheduler::Awex;
use crate::task::{Task, TaskContext};

/// Deal `items` into `groups` partitions: item `i` lands in partition
/// `i % groups`. Always returns at least one partition, possibly empty.
pub fn round_robin<T>(items: Vec<T>, groups: usize) -> Vec<Vec<T>> {
    let groups = groups.max(1);
    let mut parts: Vec<Vec<T>> = (0..groups).map(|_| Vec::new()).collect();
    for (index, item) in items.into_iter().enumerate() {
        parts[index % groups].push(item);
    }
    parts
}

/// Join partition results in partition order.
///
/// After [`round_robin`] this is not the original item order once the
/// partitions hold more than one item each.
pub fn concat<U>(parts: Vec<Vec<U>>) -> Vec<U> {
    parts.into_iter().flatten().collect()
}

impl Awex {
    /// Apply `work` to every item on the pool.
    ///
    /// Items are dealt round-robin into `fan_out_partitions` tasks and the
    /// results concatenated in partition order.
    pub fn fan_out<T, U, F>(&self, items: Vec<T>, work: F) -> Result<Promise<Vec<U>>>
    where
        T: Send + 'static,
        U: Clone + Send + 'static,
        F: Fn(T) -> Result<U> + Send + Sync + 'static,
    {
        let groups = self.config().resolved_fan_out_partitions();
        self.fan_out_with(
            items,
            |items| round_robin(items, groups),
            move |chunk: Vec<T>, ctx: &TaskContext<'_, ()>| {
                chunk
                    .into_iter()
                    .map(|item| {
                        ctx.checkpoint()?;
                        work(item)
                    })
                    .collect::<Result<Vec<U>>>()
            },
            concat,
        )
    }

    /// Fan out with custom partitioning and reassembly.
    ///
    /// `partition` runs on the calling thread; each chunk it returns is
    /// handed to `work` on a worker. `reassemble` receives the partial
    /// results in partition order. If a partition cannot be submitted the
    /// ones already submitted are cancelled and the error returned.
    pub fn fan_out_with<I, C, V, O, S, W, A>(
        &self,
        items: I,
        partition: S,
        work: W,
        reassemble: A,
    ) -> Result<Promise<O>>
    where
        C: Send + 'static,
        V: Clone + Send + 'static,
        O: Clone + Send + 'static,
        S: FnOnce(I) -> Vec<C>,
        W: Fn(C, &TaskContext<'_, ()>) -> Result<V> + Send + Sync + 'static,
        A: FnOnce(Vec<V>) -> O + Send + 'static,
    {
        let work = Arc::new(work);
        let chunks = partition(items);
        let count = chunks.len();

        let mut partials: Vec<Promise<V>> = Vec::with_capacity(count);
        for chunk in chunks {
            let work = Arc::clone(&work);
            let task: Task<V> = Task::new(move |ctx| work(chunk, ctx));
            match self.submit(&task) {
                Ok(promise) => partials.push(promise),
                Err(e) => {
                    for submitted in &partials {
                        submitted.cancel_task(false);
                    }
                    return Err(e);
                }
            }
        }
        debug!(partitions = count, "fan-out submitted");

        let aggregate: Promise<O> = self.new_promise();
        cancel_sources_on_cancel(&aggregate, &partials);

        for partial in &partials {
            let siblings: Vec<WeakPromise<V>> = partials.iter().map(Promise::downgrade).collect();
            let target = aggregate.clone();
            partial.fail(move |error| {
                if target.try_reject(error) {
                    for sibling in siblings.iter().filter_map(WeakPromise::upgrade) {
                        sibling.cancel_task(false);
                    }
                }
            });
            let target = aggregate.clone();
            partial.cancel(move || {
                target.cancel_task(false);
            });
        }

        let target = aggregate.clone();
        self.after_all(partials).done(move |results| {
            let values = results
                .into_outcomes()
                .into_iter()
                .map(|outcome| match outcome {
                    Outcome::Resolved(value) => Some(value),
                    _ => None,
                })
                .collect::<Option<Vec<V>>>();
            let Some(values) = values else {
                return;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| reassemble(values))) {
                Ok(output) => {
                    target.try_resolve(output);
                }
                Err(payload) => {
                    target.try_reject(AwexError::Panicked(panic_message(payload.as_ref())));
                }
            }
        });

        Ok(aggregate)
    }
}
