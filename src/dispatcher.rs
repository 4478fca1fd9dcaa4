//! Converts a ramp plan's rate into discrete request starts.
//!
//! The dispatcher wakes on a fixed tick, asks the plan how many arrivals
//! were due since the previous tick, and hands that many starts to the
//! worker pool. The fractional remainder is carried forward so that over
//! any stretch of the plan the number of starts stays within one request of
//! the plan's integral.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, warn};

use crate::collector::{MetricsCollector, Sample};
use crate::errors::FailureReason;
use crate::metrics::{POOL_SATURATED_TOTAL, REQUESTS_TOTAL};
use crate::ramp_plan::RampPlan;
use crate::worker_pool::{SubmitError, WorkerPool};

/// Floating point slack when flooring the due count, so that exactly 1.0
/// computed as 0.9999999999 still yields a request.
const DUE_EPSILON: f64 = 1e-9;

/// Explicit fractional carry between ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ArrivalAccumulator {
    last_secs: f64,
    carry: f64,
}

impl ArrivalAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whole arrivals due between the previous call and `now_secs`.
    ///
    /// Time never moves backwards here: a `now_secs` earlier than the last
    /// call yields 0.
    pub fn advance(&mut self, plan: &RampPlan, now_secs: f64) -> u64 {
        let now = now_secs.clamp(self.last_secs, plan.total_secs().max(self.last_secs));
        let due = plan.arrivals_between(self.last_secs, now) + self.carry;
        let whole = (due + DUE_EPSILON).floor();
        self.carry = (due - whole).max(0.0);
        self.last_secs = now;
        whole as u64
    }

    pub fn carry(&self) -> f64 {
        self.carry
    }

    pub fn last_secs(&self) -> f64 {
        self.last_secs
    }
}

/// Counters for one dispatcher run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Requests handed to a worker.
    pub dispatched: u64,
    /// Arrivals recorded as `PoolSaturated`.
    pub saturated: u64,
    /// Arrivals recorded as `Cancelled` because the pool closed mid-run.
    pub rejected: u64,
    pub ticks: u64,
    /// The shutdown signal stopped dispatching before the plan ended.
    pub interrupted: bool,
}

impl DispatchStats {
    /// Every arrival the dispatcher produced, whatever happened to it.
    pub fn arrivals(&self) -> u64 {
        self.dispatched + self.saturated + self.rejected
    }
}

/// Tick loop driving one scenario's pool.
#[derive(Debug, Clone)]
pub struct ArrivalDispatcher {
    scenario: Arc<str>,
    plan: RampPlan,
    tick_interval: Duration,
    collector: Arc<MetricsCollector>,
}

impl ArrivalDispatcher {
    pub fn new(
        scenario: Arc<str>,
        plan: RampPlan,
        tick_interval: Duration,
        collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            scenario,
            plan,
            tick_interval: tick_interval.max(Duration::from_millis(1)),
            collector,
        }
    }

    pub fn plan(&self) -> &RampPlan {
        &self.plan
    }

    /// Dispatches the whole plan into `pool`, then returns.
    ///
    /// The final tick is clamped to the plan's end so the entire integral
    /// is dispatched. If `shutdown` flips to true, dispatching stops at once.
    pub async fn run(&self, pool: &WorkerPool, mut shutdown: watch::Receiver<bool>) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let mut acc = ArrivalAccumulator::new();
        let start = Instant::now();
        let total = self.plan.total_duration();
        let end = start + total;
        let mut watching = true;

        debug!(
            scenario = %self.scenario,
            plan = %self.plan,
            tick_ms = self.tick_interval.as_millis() as u64,
            "Dispatcher starting"
        );

        loop {
            if *shutdown.borrow() {
                stats.interrupted = true;
                break;
            }

            let now = Instant::now();
            let elapsed = now.saturating_duration_since(start).min(total);
            let due = acc.advance(&self.plan, elapsed.as_secs_f64());
            stats.ticks += 1;
            if due > 0 {
                self.fan_out(pool, due, &mut stats);
            }

            if elapsed >= total {
                break;
            }

            // Absolute deadlines keep the tick grid from drifting.
            let next_tick = start + self.tick_interval * (stats.ticks as u32);
            let deadline = next_tick.min(end).max(now);

            tokio::select! {
                _ = time::sleep_until(deadline) => {}
                changed = shutdown.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    }
                }
            }
        }

        if stats.saturated > 0 {
            warn!(
                scenario = %self.scenario,
                saturated = stats.saturated,
                dispatched = stats.dispatched,
                max_workers = pool.max_workers(),
                "Worker pool saturated; arrivals were dropped"
            );
        }
        debug!(
            scenario = %self.scenario,
            dispatched = stats.dispatched,
            saturated = stats.saturated,
            ticks = stats.ticks,
            interrupted = stats.interrupted,
            "Dispatcher finished"
        );

        stats
    }

    /// Starts up to `due` requests. No more than `max_workers` can start
    /// within a single tick, so the rest are saturated without asking.
    fn fan_out(&self, pool: &WorkerPool, due: u64, stats: &mut DispatchStats) {
        let cap = pool.max_workers() as u64;
        let attempts = due.min(cap);
        let mut saturated = due - attempts;
        let mut rejected = 0u64;

        for _ in 0..attempts {
            match pool.submit() {
                Ok(_) => stats.dispatched += 1,
                Err(SubmitError::Saturated) => saturated += 1,
                Err(SubmitError::Closed) => rejected += 1,
            }
        }

        if saturated == 0 && rejected == 0 {
            return;
        }

        let offset = self.collector.offset_of(Instant::now());
        let unmeasured = |count: u64, reason: FailureReason| {
            (0..count).map(move |_| Sample::unmeasured(self.scenario.clone(), offset, reason.clone()))
        };
        self.collector.record_all(
            unmeasured(saturated, FailureReason::PoolSaturated)
                .chain(unmeasured(rejected, FailureReason::Cancelled)),
        );

        if saturated > 0 {
            POOL_SATURATED_TOTAL
                .with_label_values(&[&*self.scenario])
                .inc_by(saturated);
            REQUESTS_TOTAL
                .with_label_values(&[&*self.scenario, "pool_saturated"])
                .inc_by(saturated);
        }
        if rejected > 0 {
            REQUESTS_TOTAL
                .with_label_values(&[&*self.scenario, "cancelled"])
                .inc_by(rejected);
        }

        stats.saturated += saturated;
        stats.rejected += rejected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramp_plan::Stage;

    #[test]
    fn test_accumulator_carries_fractions() {
        let plan = RampPlan::constant(2.5, Duration::from_secs(4)).unwrap();
        let mut acc = ArrivalAccumulator::new();

        // 2.5 per second: 2, 3, 2, 3
        let counts: Vec<u64> = (1..=4).map(|s| acc.advance(&plan, s as f64)).collect();
        assert_eq!(counts, vec![2, 3, 2, 3]);
        assert!(acc.carry() < 1e-6);
    }

    #[test]
    fn test_accumulator_small_ticks_match_integral() {
        let plan = RampPlan::new(vec![Stage::secs(3.0, 7.0), Stage::secs(2.0, 0.0)]).unwrap();
        let mut acc = ArrivalAccumulator::new();
        let mut total = 0u64;
        let mut t = 0.0;
        while t < plan.total_secs() {
            t = (t + 0.1).min(plan.total_secs());
            total += acc.advance(&plan, t);
            let expected = plan.cumulative_arrivals(t);
            assert!((total as f64 - expected).abs() <= 1.0, "t={} total={} expected={}", t, total, expected);
        }
        // 10.5 + 7 = 17.5 expected; the half stays in the carry.
        assert_eq!(total, 17);
    }

    #[test]
    fn test_accumulator_ignores_time_going_backwards() {
        let plan = RampPlan::constant(10.0, Duration::from_secs(2)).unwrap();
        let mut acc = ArrivalAccumulator::new();
        assert_eq!(acc.advance(&plan, 1.0), 10);
        assert_eq!(acc.advance(&plan, 0.5), 0);
        assert_eq!(acc.advance(&plan, 5.0), 10);
        assert_eq!(acc.last_secs(), 2.0);
    }

    #[test]
    fn test_stats_arrivals() {
        let stats = DispatchStats {
            dispatched: 5,
            saturated: 2,
            rejected: 1,
            ..Default::default()
        };
        assert_eq!(stats.arrivals(), 8);
    }
}
