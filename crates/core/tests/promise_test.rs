//! Behavioural properties of promises and their combinators, exercised
//! through the public API only.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use awex_core::{after_all, all_of, any_of, AwexError, Promise, PromiseState};

use common::{init_tracing, WAIT};

#[test]
fn settling_twice_fails_and_keeps_the_first_outcome() {
    init_tracing();
    let resolved: Promise<i32> = Promise::new();
    resolved.resolve(1).unwrap();
    assert!(matches!(resolved.resolve(2), Err(AwexError::IllegalState(_))));
    assert!(matches!(resolved.reject(AwexError::AbsentValue), Err(AwexError::IllegalState(_))));
    assert_eq!(resolved.state(), PromiseState::Resolved);
    assert_eq!(resolved.get_result().unwrap(), 1);

    let rejected: Promise<i32> = Promise::new();
    rejected.reject(AwexError::Interrupted).unwrap();
    assert!(matches!(rejected.reject(AwexError::AbsentValue), Err(AwexError::IllegalState(_))));
    assert!(matches!(rejected.get_result(), Err(AwexError::Interrupted)));
}

#[test]
fn early_and_late_callbacks_see_the_value_exactly_once() {
    init_tracing();
    let promise: Promise<&'static str> = Promise::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let early = Arc::clone(&seen);
    promise.done(move |v| early.lock().unwrap().push(("early", v)));

    let resolver = promise.clone();
    thread::spawn(move || resolver.resolve("value").unwrap())
        .join()
        .unwrap();

    let late = Arc::clone(&seen);
    promise.done(move |v| late.lock().unwrap().push(("late", v)));

    assert_eq!(*seen.lock().unwrap(), vec![("early", "value"), ("late", "value")]);
}

#[test]
fn all_of_orders_results_by_source_not_by_arrival() {
    init_tracing();
    let sources: Vec<Promise<i32>> = (0..3).map(|_| Promise::new()).collect();
    let combined = all_of(sources.clone());

    sources[2].resolve(3).unwrap();
    sources[0].resolve(1).unwrap();
    assert!(combined.is_pending());
    sources[1].resolve(2).unwrap();

    assert_eq!(combined.get_result().unwrap(), vec![1, 2, 3]);
}

#[test]
fn all_of_settles_once_under_concurrent_resolution() {
    init_tracing();
    let sources: Vec<Promise<usize>> = (0..16).map(|_| Promise::new()).collect();
    let combined = all_of(sources.clone());
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    combined.always(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let handles: Vec<_> = sources
        .into_iter()
        .enumerate()
        .map(|(i, p)| thread::spawn(move || p.resolve(i).unwrap()))
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(combined.get_result().unwrap(), (0..16).collect::<Vec<_>>());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn any_of_resolves_with_the_survivor_in_any_firing_order() {
    init_tracing();
    for winner_first in [true, false] {
        let sources: Vec<Promise<i32>> = (0..3).map(|_| Promise::new()).collect();
        let combined = any_of(sources.clone());

        if winner_first {
            sources[1].resolve(42).unwrap();
        }
        sources[0].reject(AwexError::AbsentValue).unwrap();
        sources[2].reject(AwexError::Interrupted).unwrap();
        if !winner_first {
            sources[1].resolve(42).unwrap();
        }

        assert_eq!(combined.get_result().unwrap(), 42);
    }
}

#[test]
fn any_of_collects_every_cause_when_all_fail() {
    init_tracing();
    let sources: Vec<Promise<i32>> = (0..3).map(|_| Promise::new()).collect();
    let combined = any_of(sources.clone());

    sources[2].reject(AwexError::Timeout(WAIT)).unwrap();
    sources[0].reject(AwexError::AbsentValue).unwrap();
    sources[1].reject(AwexError::Interrupted).unwrap();

    let err = combined.get_result().unwrap_err();
    let causes = err.causes();
    assert_eq!(causes.len(), 3);
    assert!(matches!(causes[0], AwexError::AbsentValue));
    assert!(matches!(causes[1], AwexError::Interrupted));
    assert!(matches!(causes[2], AwexError::Timeout(_)));
}

#[test]
fn after_all_reports_mixed_outcomes() {
    init_tracing();
    let a: Promise<String> = Promise::new();
    let b: Promise<String> = Promise::new();
    let combined = after_all(vec![a.clone(), b.clone()]);

    b.reject(AwexError::AbsentValue).unwrap();
    a.resolve("A".to_string()).unwrap();

    let results = combined.get_result().unwrap();
    assert_eq!(results.count(), 2);
    assert_eq!(results.result_or_default(0, "fallback".into()), "A");
    assert_eq!(results.result_or_default(1, "fallback".into()), "fallback");
    assert!(matches!(results.error(1), Some(AwexError::AbsentValue)));
}

#[test]
fn then_chain_delivers_only_the_final_value() {
    init_tracing();
    let original: Promise<i32> = Promise::new();
    let promise_a: Promise<i32> = Promise::new();
    let promise_b: Promise<i32> = Promise::new();

    let (tx, rx) = mpsc::channel();
    let (a, b) = (promise_a.clone(), promise_b.clone());
    original
        .then(move |v| {
            assert_eq!(v, 1);
            a
        })
        .then(move |v| {
            assert_eq!(v, 2);
            b
        })
        .done(move |v| tx.send(v).unwrap());

    original.resolve(1).unwrap();
    assert!(rx.try_recv().is_err());
    promise_a.resolve(2).unwrap();
    assert!(rx.try_recv().is_err());
    promise_b.resolve(3).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 3);
    assert!(rx.try_recv().is_err(), "delivered once");
}

#[test]
fn pipe_forwards_failure_but_not_downstream_cancellation() {
    init_tracing();
    let a: Promise<i32> = Promise::new();
    let b: Promise<i32> = Promise::new();
    a.pipe(&b);

    let (tx, rx) = mpsc::channel();
    b.fail(move |e| tx.send(e).unwrap());
    a.reject(AwexError::Panicked("parse error".into())).unwrap();
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), AwexError::Panicked(m) if m == "parse error"));

    let c: Promise<i32> = Promise::new();
    let d: Promise<i32> = Promise::new();
    c.pipe(&d);
    assert!(d.cancel_task(false));
    assert!(c.is_pending());
    c.resolve(5).unwrap();
    assert!(d.is_cancelled());
}

#[test]
fn blocked_reader_wakes_when_another_thread_settles() {
    init_tracing();
    let promise: Promise<u64> = Promise::new();
    let resolver = promise.clone();
    let handle = thread::spawn(move || {
        thread::sleep(std::time::Duration::from_millis(20));
        resolver.resolve(7).unwrap();
    });

    assert_eq!(promise.get_result_within(WAIT).unwrap(), 7);
    handle.join().unwrap();

    let never: Promise<u64> = Promise::new();
    let short = std::time::Duration::from_millis(10);
    assert!(matches!(never.get_result_within(short), Err(AwexError::Timeout(d)) if d == short));
}
