//! End-to-end scheduling through the public `Awex` API.

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use awex_core::{
    Affinity, Awex, AwexConfig, AwexError, PromiseState, Task, TaskContext, TaskState, DEFAULT_QUEUE,
};

use common::{init_tracing, LoopContext, WAIT};

fn config(min: usize, max: usize) -> AwexConfig {
    AwexConfig {
        min_workers: min,
        max_workers: max,
        thread_name_prefix: "it".into(),
        ..AwexConfig::default()
    }
}

#[test]
fn tasks_run_on_named_worker_threads() {
    init_tracing();
    let awex = Awex::builder().config(config(1, 1)).build().unwrap();
    let task: Task<Option<String>> = Task::new(|_| Ok(thread::current().name().map(str::to_owned)));

    let name = awex.submit(&task).unwrap().get_result_within(WAIT).unwrap();
    assert!(name.unwrap().starts_with("it-worker-"));
}

#[test]
fn progress_reaches_listeners_while_pending() {
    init_tracing();
    let awex = Awex::builder().config(config(1, 1)).build().unwrap();
    let (tx, rx) = mpsc::channel();
    let task: Task<&'static str, u32> = Task::new(|ctx: &TaskContext<'_, u32>| {
        for pct in [25, 50, 100] {
            ctx.notify_progress(pct)?;
        }
        Ok("indexed")
    });
    task.promise().progress(move |pct| {
        let _ = tx.send(pct);
    });

    let promise = awex.submit(&task).unwrap();
    assert_eq!(promise.get_result_within(WAIT).unwrap(), "indexed");
    let seen: Vec<u32> = rx.try_iter().collect();
    assert_eq!(seen, vec![25, 50, 100]);
    assert_eq!(promise.last_progress(), Some(100));
}

#[test]
fn context_callbacks_are_posted_to_the_context_thread() {
    init_tracing();
    let awex = Awex::builder()
        .config(config(1, 1))
        .thread_context(Arc::new(LoopContext::spawn("ui-loop")))
        .build()
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let task: Task<i32> = Task::new(|_| Ok(1));
    let promise = awex.submit(&task).unwrap();
    promise.done_with(Affinity::Context, move |v| {
        let _ = tx.send((v, thread::current().name().map(str::to_owned)));
    });

    let (value, thread) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(value, 1);
    assert_eq!(thread.as_deref(), Some("ui-loop"));
}

#[test]
fn chaining_before_submit_keeps_context_dispatch() {
    init_tracing();
    let awex = Awex::builder()
        .config(config(1, 1))
        .thread_context(Arc::new(LoopContext::spawn("ui-chained")))
        .build()
        .unwrap();

    let task: Task<i32> = Task::new(|_| Ok(3));
    let doubled = task.promise().then(|v| awex_core::Promise::resolved(v * 2));
    let (tx, rx) = mpsc::channel();
    awex.submit(&task).unwrap().done_with(Affinity::Context, move |v| {
        let _ = tx.send((v, thread::current().name().map(str::to_owned)));
    });

    let (value, thread) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(value, 3);
    assert_eq!(thread.as_deref(), Some("ui-chained"));
    assert_eq!(doubled.get_result_within(WAIT).unwrap(), 6);
}

#[test]
fn plain_callbacks_settled_on_the_context_thread_move_to_the_executor() {
    init_tracing();
    let context = Arc::new(LoopContext::spawn("event-loop"));
    let awex = Awex::builder()
        .config(config(1, 1))
        .thread_context(context.clone())
        .build()
        .unwrap();

    let promise = awex.new_promise::<i32, ()>();
    let (tx, rx) = mpsc::channel();
    promise.done(move |_| {
        let _ = tx.send(thread::current().name().map(str::to_owned));
    });

    let resolver = promise.clone();
    awex_core::ThreadContext::post(
        context.as_ref(),
        Box::new(move || {
            resolver.resolve(5).unwrap();
        }),
    );

    let thread = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(thread.as_deref(), Some("it-callbacks"));
}

#[test]
fn cancelled_queued_task_never_starts_and_running_one_is_interrupted() {
    init_tracing();
    let awex = Awex::builder().config(config(1, 1)).build().unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let running: Task<i32> = Task::new(move |ctx| {
        started_tx.send(()).unwrap();
        while !ctx.is_interrupted() {
            thread::sleep(Duration::from_millis(1));
        }
        ctx.checkpoint()?;
        Ok(0)
    });
    let queued: Task<i32> = Task::new(|_| panic!("must never run"));

    let running_promise = awex.submit(&running).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();
    let queued_promise = awex.submit(&queued).unwrap();

    assert!(awex.cancel(&queued, true));
    assert_eq!(queued_promise.state(), PromiseState::Cancelled);
    assert_eq!(queued.state(), TaskState::Finished);
    assert_eq!(awex.pool_state().queue(DEFAULT_QUEUE).unwrap().size, 0);

    assert!(awex.cancel(&running, true));
    assert_eq!(running_promise.state(), PromiseState::Cancelled);
    let finished = (0..500).any(|_| {
        thread::sleep(Duration::from_millis(10));
        running.state() == TaskState::Finished
    });
    assert!(finished, "interrupted task should finish");
    assert!(matches!(running_promise.get_result(), Err(AwexError::IllegalState(_))));
}

#[test]
fn config_defaults_apply_timeouts_and_toml_overrides() {
    init_tracing();
    let config = AwexConfig::from_toml_str(
        r#"
        min_workers = 2
        max_workers = 3
        queue_timeout_ms = 50
        "#,
    )
    .unwrap();
    assert_eq!(config.default_queue_timeout(), Some(Duration::from_millis(50)));
    assert_eq!(config.default_execution_timeout(), None);

    let awex = Awex::builder().config(config).build().unwrap();
    assert_eq!(awex.pool_state().queue(DEFAULT_QUEUE).unwrap().worker_count(), 2);
    let task: Task<i32> = Task::new(|_| Ok(4));
    assert_eq!(awex.submit(&task).unwrap().get_result_within(WAIT).unwrap(), 4);
}

#[test]
fn fan_out_spreads_work_over_the_pool() {
    init_tracing();
    let awex = Awex::builder()
        .config(AwexConfig {
            fan_out_partitions: 4,
            ..config(2, 4)
        })
        .build()
        .unwrap();

    let words: Vec<String> = ["alpha", "beta", "gamma", "delta", "epsilon"]
        .into_iter()
        .map(String::from)
        .collect();
    let lengths = awex
        .fan_out(words, |w: String| Ok(w.len()))
        .unwrap()
        .get_result_within(WAIT)
        .unwrap();

    // Partition order: [alpha, epsilon], [beta], [gamma], [delta].
    assert_eq!(lengths, vec![5, 7, 4, 5, 5]);
}

#[test]
fn dropping_the_scheduler_cancels_pending_work() {
    init_tracing();
    let awex = Awex::builder().config(config(1, 1)).build().unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let blocker: Task<i32> = Task::new(move |_| {
        started_tx.send(()).unwrap();
        let _ = release_rx.recv_timeout(WAIT);
        Ok(0)
    });
    awex.submit(&blocker).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();

    let pending: Task<i32> = Task::new(|_| Ok(1));
    let promise = awex.submit(&pending).unwrap();
    drop(awex);

    assert!(promise.is_cancelled());
    release_tx.send(()).unwrap();
    assert_eq!(blocker.promise().get_result_within(WAIT).unwrap(), 0);
}
