use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How a task execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ExecutionOutcome {
    Resolved,
    Rejected,
    Cancelled,
}

/// Runs that ended with one outcome.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutcomeStats {
    pub count: u64,
    /// Summed wall time of those runs.
    pub busy: Duration,
    pub longest: Duration,
    pub last_finished: Option<DateTime<Utc>>,
}

impl OutcomeStats {
    pub fn mean(&self) -> Option<Duration> {
        let count = u32::try_from(self.count).ok().filter(|&c| c > 0)?;
        Some(self.busy / count)
    }
}

/// Where submitted work ended up, as seen by the workers and the canceller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    pub outcomes: BTreeMap<ExecutionOutcome, OutcomeStats>,
    /// Taken by a worker after their promise had already settled.
    pub tasks_skipped: u64,
    /// Pulled out of their queue by a cancel before any worker saw them.
    pub cancelled_in_queue: u64,
}

impl PoolMetrics {
    /// Account for a task body that ran on a worker.
    pub fn record_execution(&mut self, outcome: ExecutionOutcome, elapsed: Duration) {
        let stats = self.outcomes.entry(outcome).or_default();
        stats.count += 1;
        stats.busy += elapsed;
        stats.longest = stats.longest.max(elapsed);
        stats.last_finished = Some(Utc::now());
    }

    pub fn record_skipped(&mut self) {
        self.tasks_skipped += 1;
    }

    pub fn record_cancelled_in_queue(&mut self) {
        self.cancelled_in_queue += 1;
    }

    pub fn outcome(&self, outcome: ExecutionOutcome) -> Option<&OutcomeStats> {
        self.outcomes.get(&outcome)
    }

    /// Executions with the given outcome.
    pub fn executed(&self, outcome: ExecutionOutcome) -> u64 {
        self.outcome(outcome).map_or(0, |s| s.count)
    }

    /// Executions across all outcomes.
    pub fn total_executed(&self) -> u64 {
        self.outcomes.values().map(|s| s.count).sum()
    }

    /// Tasks that reached a worker or were cancelled out of a queue.
    pub fn total_accounted(&self) -> u64 {
        self.total_executed() + self.tasks_skipped + self.cancelled_in_queue
    }

    /// Share of accounted tasks that never produced a value: cancelled
    /// while queued, cancelled while running, or skipped.
    pub fn wasted_ratio(&self) -> f64 {
        let total = self.total_accounted();
        if total == 0 {
            return 0.0;
        }
        let wasted =
            self.cancelled_in_queue + self.tasks_skipped + self.executed(ExecutionOutcome::Cancelled);
        wasted as f64 / total as f64
    }
}
