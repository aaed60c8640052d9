#![allow(dead_code)]

use std::sync::mpsc::{self, Sender};
use std::thread::{self, ThreadId};
use std::time::Duration;

use awex_core::promise::Job;
use awex_core::ThreadContext;
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(5);

/// Install a test-friendly subscriber once; `RUST_LOG` overrides the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A dedicated thread draining posted jobs, standing in for a UI loop.
pub struct LoopContext {
    thread_id: ThreadId,
    jobs: Sender<Job>,
}

impl LoopContext {
    pub fn spawn(name: &str) -> Self {
        let (jobs, rx) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .unwrap();
        Self {
            thread_id: handle.thread().id(),
            jobs,
        }
    }
}

impl ThreadContext for LoopContext {
    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn post(&self, job: Job) {
        let _ = self.jobs.send(job);
    }
}
