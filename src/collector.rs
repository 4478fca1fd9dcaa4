//! Per-scenario sample collection.
//!
//! Workers, the dispatcher and the drain logic all append here concurrently.
//! Samples are never modified or removed once recorded.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::errors::{FailureKind, FailureReason};
use crate::percentiles::{nearest_rank, PercentileStats};

/// Result of a single request attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure(FailureReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// One recorded request attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub scenario: Arc<str>,
    /// When the attempt started, relative to the run epoch.
    #[serde(serialize_with = "serialize_ms")]
    pub timestamp_offset: Duration,
    /// Measured latency. None when nothing was measured (saturation,
    /// drain timeout, cancellation).
    #[serde(serialize_with = "serialize_opt_ms")]
    pub latency: Option<Duration>,
    pub outcome: Outcome,
}

impl Sample {
    pub fn success(scenario: Arc<str>, timestamp_offset: Duration, latency: Duration) -> Self {
        Self {
            scenario,
            timestamp_offset,
            latency: Some(latency),
            outcome: Outcome::Success,
        }
    }

    pub fn failure(
        scenario: Arc<str>,
        timestamp_offset: Duration,
        latency: Option<Duration>,
        reason: FailureReason,
    ) -> Self {
        Self {
            scenario,
            timestamp_offset,
            latency,
            outcome: Outcome::Failure(reason),
        }
    }

    /// A failure that never produced a measurement.
    pub fn unmeasured(scenario: Arc<str>, timestamp_offset: Duration, reason: FailureReason) -> Self {
        Self::failure(scenario, timestamp_offset, None, reason)
    }
}

fn serialize_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

fn serialize_opt_ms<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&(d.as_secs_f64() * 1000.0)),
        None => s.serialize_none(),
    }
}

/// Thread-safe, append-only sample store keyed by scenario name.
///
/// Timestamps are measured against a single run epoch so samples from
/// different scenarios can be placed on one timeline.
#[derive(Debug)]
pub struct MetricsCollector {
    epoch: Instant,
    samples: Mutex<HashMap<String, Vec<Sample>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_epoch(Instant::now())
    }

    pub fn with_epoch(epoch: Instant) -> Self {
        Self {
            epoch,
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Offset of `instant` from the run epoch.
    pub fn offset_of(&self, instant: Instant) -> Duration {
        instant.saturating_duration_since(self.epoch)
    }

    /// Ensures a scenario shows up in queries even if it never records.
    pub fn register(&self, scenario: &str) {
        self.samples.lock().entry(scenario.to_string()).or_default();
    }

    pub fn record(&self, sample: Sample) {
        let mut samples = self.samples.lock();
        match samples.get_mut(sample.scenario.as_ref()) {
            Some(list) => list.push(sample),
            None => {
                samples.insert(sample.scenario.to_string(), vec![sample]);
            }
        }
    }

    pub fn record_all(&self, batch: impl IntoIterator<Item = Sample>) {
        let mut samples = self.samples.lock();
        for sample in batch {
            samples
                .entry(sample.scenario.to_string())
                .or_default()
                .push(sample);
        }
    }

    pub fn scenario_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.samples.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self, scenario: &str) -> u64 {
        self.samples
            .lock()
            .get(scenario)
            .map(|s| s.len() as u64)
            .unwrap_or(0)
    }

    /// failures / total, 0 for a scenario with no samples.
    pub fn failure_rate(&self, scenario: &str) -> f64 {
        self.snapshot(scenario).failure_rate()
    }

    pub fn percentile(&self, scenario: &str, percentile: f64) -> Option<Duration> {
        self.snapshot(scenario).percentile(percentile)
    }

    pub fn latency_stats(&self, scenario: &str) -> Option<PercentileStats> {
        self.snapshot(scenario).latency_stats()
    }

    /// Copy of every sample recorded for `scenario`, in recording order.
    pub fn samples(&self, scenario: &str) -> Vec<Sample> {
        self.samples
            .lock()
            .get(scenario)
            .cloned()
            .unwrap_or_default()
    }

    /// Aggregates a scenario's samples under one lock acquisition.
    pub fn snapshot(&self, scenario: &str) -> ScenarioSnapshot {
        let samples = self.samples.lock();
        let mut snapshot = ScenarioSnapshot::default();
        if let Some(list) = samples.get(scenario) {
            for sample in list {
                snapshot.add(sample);
            }
        }
        snapshot.latencies_us.sort_unstable();
        snapshot
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregated view over a set of samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioSnapshot {
    pub total: u64,
    pub successes: u64,
    pub failures_by_kind: BTreeMap<FailureKind, u64>,
    /// Measured latencies in microseconds, sorted ascending.
    pub latencies_us: Vec<u64>,
    pub first_offset: Option<Duration>,
    pub last_offset: Option<Duration>,
}

impl ScenarioSnapshot {
    fn add(&mut self, sample: &Sample) {
        self.total += 1;
        match &sample.outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Failure(reason) => {
                *self.failures_by_kind.entry(reason.kind()).or_insert(0) += 1;
            }
        }
        if let Some(latency) = sample.latency {
            self.latencies_us.push(latency.as_micros() as u64);
        }
        let ts = sample.timestamp_offset;
        self.first_offset = Some(self.first_offset.map_or(ts, |f| f.min(ts)));
        self.last_offset = Some(self.last_offset.map_or(ts, |l| l.max(ts)));
    }

    /// Combines several snapshots, e.g. all scenarios sharing a tag.
    pub fn merge<'a>(snapshots: impl IntoIterator<Item = &'a ScenarioSnapshot>) -> Self {
        let mut merged = ScenarioSnapshot::default();
        for s in snapshots {
            merged.total += s.total;
            merged.successes += s.successes;
            for (kind, count) in &s.failures_by_kind {
                *merged.failures_by_kind.entry(*kind).or_insert(0) += count;
            }
            merged.latencies_us.extend_from_slice(&s.latencies_us);
            merged.first_offset = match (merged.first_offset, s.first_offset) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            merged.last_offset = match (merged.last_offset, s.last_offset) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        merged.latencies_us.sort_unstable();
        merged
    }

    pub fn failures(&self) -> u64 {
        self.total - self.successes
    }

    pub fn failures_of(&self, kind: FailureKind) -> u64 {
        self.failures_by_kind.get(&kind).copied().unwrap_or(0)
    }

    /// Always within [0, 1]; 0 when there are no samples.
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failures() as f64 / self.total as f64
        }
    }

    /// Share of samples dropped because the pool was saturated.
    pub fn saturation_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failures_of(FailureKind::PoolSaturated) as f64 / self.total as f64
        }
    }

    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        nearest_rank(&self.latencies_us, percentile).map(Duration::from_micros)
    }

    pub fn latency_stats(&self) -> Option<PercentileStats> {
        PercentileStats::from_sorted(&self.latencies_us)
    }
}
