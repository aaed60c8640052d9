//! The scheduler façade tying queues, workers and the pool policy together.
//!
//! Split into focused submodules:
//! - `core`: shared registry, pool snapshots, cancellation and worker events
//! - `manager`: the [`PoolManager`] capability handed to the policy
//! - `submission`: task submission, cancellation and promise factories

mod core;
mod manager;
mod submission;

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::info;

use crate::config::{load_dotenv, AwexConfig};
use crate::error::Result;
use crate::lock;
use crate::metrics::PoolMetrics;
use crate::policy::{DefaultPoolPolicy, PoolManager, PoolPolicy};
use crate::promise::{CallbackExecutor, Dispatcher, ThreadContext};
use crate::state::PoolState;

use self::core::{PoolListener, Registry, Shared};
use self::manager::ManagerHandle;

/// Owns the worker pool and the callback executor.
///
/// Dropping the scheduler shuts it down: queued tasks are cancelled and
/// workers stop once their current task returns.
pub struct Awex {
    shared: Arc<Shared>,
}

/// Configures and starts an [`Awex`] scheduler.
#[derive(Default)]
pub struct AwexBuilder {
    config: Option<AwexConfig>,
    policy: Option<Box<dyn PoolPolicy>>,
    context: Option<Arc<dyn ThreadContext>>,
}

impl AwexBuilder {
    pub fn config(mut self, config: AwexConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the [`DefaultPoolPolicy`].
    pub fn policy(mut self, policy: impl PoolPolicy + 'static) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    /// Thread that `Affinity::Context` callbacks are delivered on.
    pub fn thread_context(mut self, context: Arc<dyn ThreadContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn build(self) -> Result<Awex> {
        let config = self.config.unwrap_or_default();
        let executor = Arc::new(CallbackExecutor::start(format!(
            "{}-callbacks",
            config.thread_name_prefix
        ))?);
        let dispatcher = Dispatcher::new(self.context, Arc::downgrade(&executor));
        let policy = self
            .policy
            .unwrap_or_else(|| Box::new(DefaultPoolPolicy::new(&config)));

        let shared = Arc::new_cyclic(|weak| Shared {
            config,
            registry: Mutex::new(Registry::default()),
            policy: Mutex::new(policy),
            metrics: RwLock::new(PoolMetrics::default()),
            executor,
            dispatcher,
            listener: Arc::new(PoolListener::new(weak.clone())),
            next_task_id: AtomicU64::new(0),
            next_worker_id: AtomicU32::new(0),
        });

        let awex = Awex { shared };
        let manager: Arc<dyn PoolManager> = Arc::new(ManagerHandle::new(&awex.shared));
        lock(&awex.shared.policy).initialize(manager)?;

        awex.shared.config.log_summary();
        info!("awex scheduler started");
        Ok(awex)
    }
}

impl Awex {
    /// A scheduler configured from `AWEX_*` environment variables, with a
    /// .env file loaded first when present.
    pub fn new() -> Result<Self> {
        load_dotenv();
        Self::builder().config(AwexConfig::from_env()).build()
    }

    pub fn builder() -> AwexBuilder {
        AwexBuilder::default()
    }

    pub fn config(&self) -> &AwexConfig {
        &self.shared.config
    }

    /// Dispatcher that promises created by this scheduler deliver through.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    /// Snapshot of queues and workers.
    pub fn pool_state(&self) -> PoolState {
        self.shared.pool_state()
    }

    /// Get a snapshot of the current pool metrics.
    pub fn metrics(&self) -> PoolMetrics {
        self.shared
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove every queue, cancelling what is still queued, and stop all
    /// workers. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.shared.registry).shut_down
    }
}

impl Drop for Awex {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl fmt::Display for Awex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.pool_state().fmt(f)
    }
}

impl fmt::Debug for Awex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awex")
            .field("config", &self.shared.config)
            .field("executor", &self.shared.executor)
            .finish()
    }
}
