//! A single scenario: one endpoint driven by one ramp plan.
//!
//! The runner owns the scenario's worker pool and dispatcher. A scenario is
//! complete once the dispatcher has walked the whole plan and every request
//! it started has either finished or been written off as a drain timeout.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};
use tracing::{info, warn};

use crate::client::Endpoint;
use crate::collector::MetricsCollector;
use crate::dispatcher::{ArrivalDispatcher, DispatchStats};
use crate::errors::{ConfigError, FailureReason};
use crate::ramp_plan::RampPlan;
use crate::worker_pool::{PoolConfig, WorkerPool};

pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(10);
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Everything needed to run one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioSpec {
    /// Unique within a run.
    pub name: String,
    /// Free-form grouping label, e.g. the gateway under test.
    pub tag: Option<String>,
    pub plan: RampPlan,
    pub endpoint: Arc<dyn Endpoint>,
    pub preallocated_workers: usize,
    pub max_workers: usize,
}

impl ScenarioSpec {
    pub fn new(name: impl Into<String>, plan: RampPlan, endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            name: name.into(),
            tag: None,
            plan,
            endpoint,
            preallocated_workers: 1,
            max_workers: 1,
        }
    }

    pub fn with_workers(mut self, preallocated: usize, max: usize) -> Self {
        self.preallocated_workers = preallocated;
        self.max_workers = max;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidScenario {
            scenario: self.name.clone(),
            message,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name cannot be empty".to_string()));
        }
        if self.preallocated_workers < 1 {
            return Err(invalid("preallocated_workers must be at least 1".to_string()));
        }
        if self.max_workers < self.preallocated_workers {
            return Err(invalid(format!(
                "max_workers ({}) must be >= preallocated_workers ({})",
                self.max_workers, self.preallocated_workers
            )));
        }
        Ok(())
    }
}

/// Per-run knobs shared by every scenario.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScenarioSettings {
    pub tick_interval: Duration,
    /// Grace period for in-flight requests after the plan ends.
    pub drain_timeout: Duration,
    pub expected_status: u16,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(30),
            expected_status: 200,
        }
    }
}

impl ScenarioSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval < MIN_TICK_INTERVAL || self.tick_interval > MAX_TICK_INTERVAL {
            return Err(ConfigError::InvalidSetting {
                field: "tick_interval".to_string(),
                message: format!(
                    "must be between {}ms and {}ms, got {}ms",
                    MIN_TICK_INTERVAL.as_millis(),
                    MAX_TICK_INTERVAL.as_millis(),
                    self.tick_interval.as_millis()
                ),
            });
        }
        if !(100..=599).contains(&self.expected_status) {
            return Err(ConfigError::InvalidSetting {
                field: "expected_status".to_string(),
                message: format!("{} is not an HTTP status code", self.expected_status),
            });
        }
        Ok(())
    }
}

/// What happened to one scenario, in run-epoch offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioOutcome {
    pub name: String,
    pub tag: Option<String>,
    pub target: String,
    pub planned_duration: Duration,
    pub started_at: Duration,
    pub ended_at: Duration,
    /// None when the dispatcher never reported, i.e. the scenario was forced
    /// or skipped.
    pub dispatch: Option<DispatchStats>,
    pub drain_timeouts: usize,
    pub cancelled: usize,
    pub peak_workers: usize,
    /// The scheduler cut the scenario off after its budget ran out.
    pub forced: bool,
    /// The run was shut down before this scenario started.
    pub skipped: bool,
}

impl ScenarioOutcome {
    fn base(spec: &ScenarioSpec, started_at: Duration, ended_at: Duration) -> Self {
        Self {
            name: spec.name.clone(),
            tag: spec.tag.clone(),
            target: spec.endpoint.describe(),
            planned_duration: spec.plan.total_duration(),
            started_at,
            ended_at,
            dispatch: None,
            drain_timeouts: 0,
            cancelled: 0,
            peak_workers: 0,
            forced: false,
            skipped: false,
        }
    }

    /// Outcome for a scenario that overran its budget.
    pub fn forced(
        spec: &ScenarioSpec,
        started_at: Duration,
        ended_at: Duration,
        cancelled: usize,
        peak_workers: usize,
    ) -> Self {
        Self {
            cancelled,
            peak_workers,
            forced: true,
            ..Self::base(spec, started_at, ended_at)
        }
    }

    /// Outcome for a scenario that never started.
    pub fn skipped(spec: &ScenarioSpec, at: Duration) -> Self {
        Self {
            skipped: true,
            ..Self::base(spec, at, at)
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.ended_at.saturating_sub(self.started_at)
    }
}

/// Runs one scenario against its endpoint.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    spec: ScenarioSpec,
    settings: ScenarioSettings,
    collector: Arc<MetricsCollector>,
}

impl ScenarioRunner {
    pub fn new(
        spec: ScenarioSpec,
        settings: ScenarioSettings,
        collector: Arc<MetricsCollector>,
    ) -> Result<Self, ConfigError> {
        spec.validate()?;
        settings.validate()?;
        collector.register(&spec.name);
        Ok(Self {
            spec,
            settings,
            collector,
        })
    }

    pub fn spec(&self) -> &ScenarioSpec {
        &self.spec
    }

    pub fn settings(&self) -> &ScenarioSettings {
        &self.settings
    }

    /// Fresh pool sized from the scenario. Must be called inside a runtime.
    pub fn spawn_pool(&self) -> WorkerPool {
        WorkerPool::new(
            PoolConfig {
                scenario: Arc::from(self.spec.name.as_str()),
                preallocated_workers: self.spec.preallocated_workers,
                max_workers: self.spec.max_workers,
                expected_status: self.settings.expected_status,
            },
            self.spec.endpoint.clone(),
            self.collector.clone(),
        )
    }

    /// Runs the scenario to completion on its own pool.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> ScenarioOutcome {
        let pool = self.spawn_pool();
        self.execute(&pool, shutdown).await
    }

    /// Dispatches the plan into `pool`, then drains it.
    ///
    /// Dropping this future part way leaves requests in flight on `pool`;
    /// the caller must shut the pool down.
    pub async fn execute(&self, pool: &WorkerPool, mut shutdown: watch::Receiver<bool>) -> ScenarioOutcome {
        let spec = &self.spec;
        let started_at = self.collector.offset_of(Instant::now());

        info!(
            scenario = %spec.name,
            tag = spec.tag.as_deref().unwrap_or("-"),
            target = %spec.endpoint.describe(),
            plan = %spec.plan,
            preallocated_workers = spec.preallocated_workers,
            max_workers = spec.max_workers,
            "Scenario starting"
        );

        let dispatcher = ArrivalDispatcher::new(
            Arc::from(spec.name.as_str()),
            spec.plan.clone(),
            self.settings.tick_interval,
            self.collector.clone(),
        );
        let stats = dispatcher.run(pool, shutdown.clone()).await;

        let mut drain_timeouts = 0;
        let mut cancelled = 0;
        if stats.interrupted {
            cancelled = pool.shutdown();
        } else {
            tokio::select! {
                drained = time::timeout(self.settings.drain_timeout, pool.wait_idle()) => {
                    if drained.is_err() {
                        drain_timeouts = pool.cancel_outstanding(FailureReason::DrainTimeout);
                        warn!(
                            scenario = %spec.name,
                            outstanding = drain_timeouts,
                            drain_timeout_secs = self.settings.drain_timeout.as_secs_f64(),
                            "Drain timeout elapsed with requests still in flight"
                        );
                    }
                }
                _ = shutdown_requested(&mut shutdown) => {
                    cancelled = pool.shutdown();
                    warn!(
                        scenario = %spec.name,
                        cancelled = cancelled,
                        "Shutdown requested while draining; in-flight requests cancelled"
                    );
                }
            }
        }

        let ended_at = self.collector.offset_of(Instant::now());
        let outcome = ScenarioOutcome {
            dispatch: Some(stats),
            drain_timeouts,
            cancelled,
            peak_workers: pool.peak_workers(),
            ..ScenarioOutcome::base(spec, started_at, ended_at)
        };

        info!(
            scenario = %spec.name,
            dispatched = stats.dispatched,
            saturated = stats.saturated,
            drain_timeouts = drain_timeouts,
            cancelled = cancelled,
            peak_workers = outcome.peak_workers,
            elapsed_secs = outcome.elapsed().as_secs_f64(),
            "Scenario complete"
        );

        outcome
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::EndpointResponse;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Instant200;

    #[async_trait]
    impl Endpoint for Instant200 {
        fn describe(&self) -> String {
            "instant".to_string()
        }

        async fn send(&self) -> EndpointResponse {
            EndpointResponse::status(200, Duration::ZERO)
        }
    }

    fn spec(pre: usize, max: usize) -> ScenarioSpec {
        ScenarioSpec::new(
            "s",
            RampPlan::constant(1.0, Duration::from_secs(1)).unwrap(),
            Arc::new(Instant200),
        )
        .with_workers(pre, max)
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec(1, 1).validate().is_ok());
        assert!(matches!(
            spec(0, 1).validate(),
            Err(ConfigError::InvalidScenario { .. })
        ));
        assert!(spec(4, 2).validate().is_err());

        let mut unnamed = spec(1, 1);
        unnamed.name = "  ".to_string();
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn test_settings_validation() {
        assert!(ScenarioSettings::default().validate().is_ok());
        let too_fast = ScenarioSettings {
            tick_interval: Duration::from_millis(1),
            ..Default::default()
        };
        assert!(too_fast.validate().is_err());
        let odd_status = ScenarioSettings {
            expected_status: 42,
            ..Default::default()
        };
        assert!(odd_status.validate().is_err());
    }

    #[test]
    fn test_skipped_outcome() {
        let s = spec(1, 1);
        let outcome = ScenarioOutcome::skipped(&s, Duration::from_secs(3));
        assert!(outcome.skipped);
        assert!(!outcome.forced);
        assert_eq!(outcome.elapsed(), Duration::ZERO);
        assert_eq!(outcome.target, "instant");
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_registers_and_runs() {
        let collector = Arc::new(MetricsCollector::new());
        let runner =
            ScenarioRunner::new(spec(1, 2), ScenarioSettings::default(), collector.clone()).unwrap();
        assert_eq!(collector.scenario_names(), vec!["s".to_string()]);

        let (_tx, rx) = watch::channel(false);
        let outcome = runner.run(rx).await;
        let stats = outcome.dispatch.unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(collector.count("s"), 1);
        assert!(!outcome.forced);
    }
}
