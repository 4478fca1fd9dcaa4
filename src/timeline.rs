//! Strictly sequential scenario activation.
//!
//! Scenarios never overlap: each one starts only after the previous one has
//! completed (or been force-completed) plus a fixed gap. Every scenario runs
//! under a budget of plan duration + drain timeout + safety margin, so a
//! hung target can stall one scenario but never the whole run.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};
use tracing::{info, warn};

use crate::collector::MetricsCollector;
use crate::errors::ConfigError;
use crate::scenario::{ScenarioOutcome, ScenarioRunner, ScenarioSettings, ScenarioSpec};

/// Spacing and budget settings for the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineSettings {
    /// Idle time between one scenario's completion and the next start.
    pub gap: Duration,
    /// Extra budget on top of plan + drain before a scenario is forced.
    pub safety_margin: Duration,
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self {
            gap: Duration::from_secs(5),
            safety_margin: Duration::from_secs(5),
        }
    }
}

pub struct TimelineScheduler {
    runners: Vec<ScenarioRunner>,
    settings: TimelineSettings,
    collector: Arc<MetricsCollector>,
}

impl TimelineScheduler {
    /// Validates every spec and checks names are unique.
    pub fn new(
        specs: Vec<ScenarioSpec>,
        settings: TimelineSettings,
        scenario_settings: ScenarioSettings,
        collector: Arc<MetricsCollector>,
    ) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::NoScenarios);
        }

        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateScenario(spec.name.clone()));
            }
        }

        let runners = specs
            .into_iter()
            .map(|spec| ScenarioRunner::new(spec, scenario_settings, collector.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            runners,
            settings,
            collector,
        })
    }

    pub fn settings(&self) -> &TimelineSettings {
        &self.settings
    }

    pub fn scenario_names(&self) -> Vec<&str> {
        self.runners.iter().map(|r| r.spec().name.as_str()).collect()
    }

    /// Distinct tags carried by the scenarios, in declaration order.
    pub fn scenario_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = Vec::new();
        for tag in self.runners.iter().filter_map(|r| r.spec().tag.as_deref()) {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        tags
    }

    /// Earliest start of each scenario relative to the run epoch, assuming
    /// every earlier scenario finishes exactly on plan.
    pub fn planned_offsets(&self) -> Vec<Duration> {
        let mut next = Duration::ZERO;
        self.runners
            .iter()
            .map(|runner| {
                let offset = next;
                next += runner.spec().plan.total_duration() + self.settings.gap;
                offset
            })
            .collect()
    }

    /// Planned end of the last scenario.
    pub fn planned_total(&self) -> Duration {
        let plans: Duration = self
            .runners
            .iter()
            .map(|r| r.spec().plan.total_duration())
            .sum();
        let gaps = self.settings.gap * (self.runners.len().saturating_sub(1) as u32);
        plans + gaps
    }

    /// Time a scenario may run before it is force-completed.
    pub fn budget_for(&self, runner: &ScenarioRunner) -> Duration {
        runner.spec().plan.total_duration()
            + runner.settings().drain_timeout
            + self.settings.safety_margin
    }

    /// Runs every scenario in order and returns one outcome per scenario,
    /// in declaration order.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Vec<ScenarioOutcome> {
        let epoch = self.collector.epoch();
        let planned = self.planned_offsets();
        let mut outcomes = Vec::with_capacity(self.runners.len());
        let mut earliest = Duration::ZERO;

        info!(
            scenarios = self.runners.len(),
            planned_total_secs = self.planned_total().as_secs_f64(),
            gap_secs = self.settings.gap.as_secs_f64(),
            "Timeline starting"
        );

        for (runner, planned_offset) in self.runners.iter().zip(planned) {
            let spec = runner.spec();
            let start_at = earliest.max(planned_offset);

            if !wait_until(epoch + start_at, &mut shutdown).await {
                let at = self.collector.offset_of(Instant::now());
                warn!(scenario = %spec.name, "Shutdown requested; scenario skipped");
                outcomes.push(ScenarioOutcome::skipped(spec, at));
                continue;
            }

            let pool = runner.spawn_pool();
            let started_at = self.collector.offset_of(Instant::now());
            let budget = self.budget_for(runner);

            let outcome = match time::timeout(budget, runner.execute(&pool, shutdown.clone())).await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    let cancelled = pool.shutdown();
                    let ended_at = self.collector.offset_of(Instant::now());
                    warn!(
                        scenario = %spec.name,
                        budget_secs = budget.as_secs_f64(),
                        cancelled = cancelled,
                        "Scenario exceeded its budget; force-completed"
                    );
                    ScenarioOutcome::forced(spec, started_at, ended_at, cancelled, pool.peak_workers())
                }
            };
            drop(pool);

            earliest = outcome.ended_at + self.settings.gap;
            outcomes.push(outcome);
        }

        info!(
            elapsed_secs = self.collector.offset_of(Instant::now()).as_secs_f64(),
            "Timeline finished"
        );
        outcomes
    }
}

/// Sleeps until `deadline`. Returns false if shutdown was requested first.
async fn wait_until(deadline: Instant, shutdown: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = time::sleep_until(deadline) => return true,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Nobody can signal any more; just wait.
                    time::sleep_until(deadline).await;
                    return true;
                }
            }
        }
    }
}
