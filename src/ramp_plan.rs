use std::fmt;

use serde::Serialize;
use tokio::time::Duration;

use crate::errors::ConfigError;

/// One segment of a ramp plan: over `duration`, the arrival rate moves
/// linearly from wherever the previous stage ended to `target_rate`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stage {
    #[serde(rename = "duration_secs", serialize_with = "serialize_secs")]
    pub duration: Duration,
    /// Requests per second reached at the end of the stage.
    pub target_rate: f64,
}

impl Stage {
    pub fn new(duration: Duration, target_rate: f64) -> Self {
        Self {
            duration,
            target_rate,
        }
    }

    /// Convenience constructor taking seconds as a float.
    ///
    /// Negative or non-finite seconds collapse to a zero duration, which
    /// [`RampPlan::new`] then rejects.
    pub fn secs(duration_secs: f64, target_rate: f64) -> Self {
        let duration = Duration::try_from_secs_f64(duration_secs).unwrap_or(Duration::ZERO);
        Self::new(duration, target_rate)
    }
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Immutable, validated sequence of stages describing offered load over a
/// scenario's lifetime.
///
/// The rate function is piecewise linear and continuous: it starts at
/// `start_rate` (0 unless stated otherwise), reaches each stage's target
/// exactly at the end of that stage, and drops to 0 once the plan is over.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RampPlan {
    start_rate: f64,
    stages: Vec<Stage>,
    #[serde(skip)]
    stage_ends: Vec<f64>,
    #[serde(skip)]
    area_before: Vec<f64>,
}

impl RampPlan {
    /// Builds a plan that ramps up from idle.
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        Self::with_start_rate(0.0, stages)
    }

    /// Builds a plan whose first stage interpolates from `start_rate`
    /// instead of 0.
    pub fn with_start_rate(start_rate: f64, stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if !start_rate.is_finite() || start_rate < 0.0 {
            return Err(ConfigError::InvalidStartRate(start_rate));
        }
        if stages.is_empty() {
            return Err(ConfigError::EmptyPlan);
        }

        let mut stage_ends = Vec::with_capacity(stages.len());
        let mut area_before = Vec::with_capacity(stages.len());
        let mut elapsed = 0.0;
        let mut area = 0.0;
        let mut from = start_rate;

        for (index, stage) in stages.iter().enumerate() {
            let secs = stage.duration.as_secs_f64();
            if secs <= 0.0 {
                return Err(ConfigError::NonPositiveStageDuration {
                    index,
                    duration_secs: secs,
                });
            }
            if !stage.target_rate.is_finite() || stage.target_rate < 0.0 {
                return Err(ConfigError::InvalidStageRate {
                    index,
                    rate: stage.target_rate,
                });
            }

            area_before.push(area);
            area += (from + stage.target_rate) / 2.0 * secs;
            elapsed += secs;
            stage_ends.push(elapsed);
            from = stage.target_rate;
        }

        Ok(Self {
            start_rate,
            stages,
            stage_ends,
            area_before,
        })
    }

    /// A flat plan holding `rate` for `duration`.
    pub fn constant(rate: f64, duration: Duration) -> Result<Self, ConfigError> {
        Self::with_start_rate(rate, vec![Stage::new(duration, rate)])
    }

    /// The five-stage gateway benchmark: warmup, ramp to half of peak, hold
    /// at peak, spike to 1.5x peak, ramp down to zero.
    ///
    /// `time_scale` multiplies every stage duration (1.0 gives 15s/30s/60s/30s/15s).
    pub fn gateway_benchmark(
        max_rps: f64,
        warmup_rps: f64,
        time_scale: f64,
    ) -> Result<Self, ConfigError> {
        let stage = |secs: f64, rate: f64| Stage::secs(secs * time_scale, rate);
        Self::new(vec![
            stage(15.0, warmup_rps),
            stage(30.0, (max_rps / 2.0).round()),
            stage(60.0, max_rps),
            stage(30.0, (max_rps * 1.5).round()),
            stage(15.0, 0.0),
        ])
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn start_rate(&self) -> f64 {
        self.start_rate
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn total_secs(&self) -> f64 {
        self.stage_ends.last().copied().unwrap_or(0.0)
    }

    /// Highest rate the plan ever asks for.
    pub fn peak_rate(&self) -> f64 {
        self.stages
            .iter()
            .map(|s| s.target_rate)
            .fold(self.start_rate, f64::max)
    }

    /// Target arrival rate at `elapsed_secs` since the scenario started.
    pub fn rate_at(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            return self.start_rate;
        }
        if elapsed_secs > self.total_secs() {
            return 0.0;
        }

        let index = self.stage_index(elapsed_secs);
        let (from, stage_start) = self.stage_origin(index);
        let stage = &self.stages[index];
        linear_interpolate(
            from,
            stage.target_rate,
            elapsed_secs - stage_start,
            stage.duration.as_secs_f64(),
        )
    }

    /// Expected number of arrivals in `[from_secs, to_secs]`: the exact
    /// integral of [`rate_at`](Self::rate_at), clamped to the plan window.
    pub fn arrivals_between(&self, from_secs: f64, to_secs: f64) -> f64 {
        if to_secs <= from_secs {
            return 0.0;
        }
        (self.cumulative_arrivals(to_secs) - self.cumulative_arrivals(from_secs)).max(0.0)
    }

    /// Expected arrivals from plan start up to `elapsed_secs`.
    pub fn cumulative_arrivals(&self, elapsed_secs: f64) -> f64 {
        let t = elapsed_secs.clamp(0.0, self.total_secs());
        if t == 0.0 {
            return 0.0;
        }

        let index = self.stage_index(t);
        let (from, stage_start) = self.stage_origin(index);
        let stage = &self.stages[index];
        let dur = stage.duration.as_secs_f64();
        let e = t - stage_start;
        let slope = (stage.target_rate - from) / dur;

        self.area_before[index] + from * e + slope * e * e / 2.0
    }

    /// Index of the stage containing `t`, where a stage owns its end point.
    fn stage_index(&self, t: f64) -> usize {
        self.stage_ends
            .partition_point(|end| *end < t)
            .min(self.stages.len() - 1)
    }

    /// Rate and offset at which stage `index` begins.
    fn stage_origin(&self, index: usize) -> (f64, f64) {
        if index == 0 {
            (self.start_rate, 0.0)
        } else {
            (
                self.stages[index - 1].target_rate,
                self.stage_ends[index - 1],
            )
        }
    }
}

impl fmt::Display for RampPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start_rate)?;
        for stage in &self.stages {
            write!(
                f,
                " -[{:.1}s]-> {}",
                stage.duration.as_secs_f64(),
                stage.target_rate
            )?;
        }
        write!(f, " rps")
    }
}

fn linear_interpolate(from: f64, to: f64, elapsed: f64, duration: f64) -> f64 {
    if duration <= 0.0 {
        return to;
    }
    from + (to - from) * (elapsed / duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn five_stage() -> RampPlan {
        RampPlan::new(vec![
            Stage::secs(10.0, 100.0),
            Stage::secs(10.0, 500.0),
            Stage::secs(20.0, 1000.0),
            Stage::secs(10.0, 1500.0),
            Stage::secs(10.0, 0.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_first_stage_ramps_from_idle() {
        let plan = five_stage();
        assert_eq!(plan.rate_at(0.0), 0.0);
        assert!((plan.rate_at(5.0) - 50.0).abs() < 1e-9);
        assert!((plan.rate_at(10.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_interpolates_between_stage_targets() {
        let plan = five_stage();
        // halfway through the second stage: 100 -> 500
        assert!((plan.rate_at(15.0) - 300.0).abs() < 1e-9);
        // hold at peak ramps 500 -> 1000 over 20s
        assert!((plan.rate_at(30.0) - 750.0).abs() < 1e-9);
        // ramp down
        assert!((plan.rate_at(55.0) - 750.0).abs() < 1e-9);
    }

    #[test]
    fn test_end_and_beyond() {
        let plan = five_stage();
        assert_eq!(plan.total_secs(), 60.0);
        assert_eq!(plan.rate_at(60.0), 0.0);
        assert_eq!(plan.rate_at(60.1), 0.0);

        let plateau = RampPlan::new(vec![Stage::secs(2.0, 40.0)]).unwrap();
        assert_eq!(plateau.rate_at(2.0), 40.0);
        assert_eq!(plateau.rate_at(2.0001), 0.0);
    }

    #[test]
    fn test_flat_hold_has_no_division_by_zero() {
        let plan = RampPlan::new(vec![Stage::secs(1.0, 20.0), Stage::secs(3.0, 20.0)]).unwrap();
        for t in [1.0, 1.5, 2.7, 4.0] {
            assert_eq!(plan.rate_at(t), 20.0);
        }
    }

    #[test]
    fn test_zero_duration_stage_rejected() {
        let err = RampPlan::new(vec![Stage::secs(1.0, 10.0), Stage::secs(0.0, 20.0)]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::NonPositiveStageDuration {
                index: 1,
                duration_secs: 0.0
            }
        );
        assert_eq!(RampPlan::new(vec![]).unwrap_err(), ConfigError::EmptyPlan);
        assert!(RampPlan::new(vec![Stage::secs(1.0, -1.0)]).is_err());
        assert!(RampPlan::new(vec![Stage::secs(1.0, f64::NAN)]).is_err());
        assert!(RampPlan::with_start_rate(-3.0, vec![Stage::secs(1.0, 1.0)]).is_err());
    }

    #[test]
    fn test_cumulative_arrivals_matches_area() {
        let plan = five_stage();
        // stage areas: 500, 3000, 15000, 12500, 7500
        assert!((plan.cumulative_arrivals(10.0) - 500.0).abs() < 1e-6);
        assert!((plan.cumulative_arrivals(20.0) - 3500.0).abs() < 1e-6);
        assert!((plan.cumulative_arrivals(60.0) - 38500.0).abs() < 1e-6);
        assert!((plan.cumulative_arrivals(1_000.0) - 38500.0).abs() < 1e-6);
        assert!((plan.arrivals_between(0.0, 5.0) - 125.0).abs() < 1e-6);
        assert_eq!(plan.arrivals_between(5.0, 5.0), 0.0);
    }

    #[test]
    fn test_constant_plan() {
        let plan = RampPlan::constant(10.0, Duration::from_secs(5)).unwrap();
        assert_eq!(plan.rate_at(0.0), 10.0);
        assert_eq!(plan.rate_at(2.5), 10.0);
        assert!((plan.cumulative_arrivals(5.0) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_gateway_benchmark_shape() {
        let plan = RampPlan::gateway_benchmark(2000.0, 200.0, 1.0).unwrap();
        let targets: Vec<f64> = plan.stages().iter().map(|s| s.target_rate).collect();
        assert_eq!(targets, vec![200.0, 1000.0, 2000.0, 3000.0, 0.0]);
        assert_eq!(plan.total_duration(), Duration::from_secs(150));
        assert_eq!(plan.peak_rate(), 3000.0);

        let quick = RampPlan::gateway_benchmark(2000.0, 200.0, 0.1).unwrap();
        assert!((quick.total_secs() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_display() {
        let plan = RampPlan::new(vec![Stage::secs(1.5, 10.0)]).unwrap();
        assert_eq!(plan.to_string(), "0 -[1.5s]-> 10 rps");
    }
}
