//! End-of-run report.
//!
//! Built once, after the timeline has finished and thresholds have been
//! evaluated. Renders as a comparative text summary, JSON, or one CSV row
//! per scenario.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::collector::MetricsCollector;
use crate::errors::FailureKind;
use crate::percentiles::{format_percentile_table, us_to_ms, PercentileStats};
use crate::scenario::ScenarioOutcome;
use crate::thresholds::{overall_passed, RuleResult};

/// Process exit code when a fatal threshold failed (same as k6).
pub const EXIT_THRESHOLDS_FAILED: i32 = 99;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report to {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode JSON report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to encode CSV report: {0}")]
    Csv(#[from] csv::Error),
}

/// Summary of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub tag: Option<String>,
    pub target: String,
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub failure_rate: f64,
    pub saturation_rate: f64,
    /// Failure count per kind label; every kind is listed, zeros included.
    pub failures_by_kind: BTreeMap<&'static str, u64>,
    /// Latency statistics in microseconds; None when nothing was measured.
    pub latency_us: Option<PercentileStats>,
    pub planned_duration_secs: f64,
    pub started_at_secs: f64,
    pub ended_at_secs: f64,
    /// Recorded attempts per second of active scenario time.
    pub achieved_rps: f64,
    pub dispatched: Option<u64>,
    pub drain_timeouts: usize,
    pub peak_workers: usize,
    pub forced: bool,
    pub skipped: bool,
}

impl ScenarioReport {
    fn build(collector: &MetricsCollector, outcome: &ScenarioOutcome) -> Self {
        let snapshot = collector.snapshot(&outcome.name);
        let elapsed = outcome.elapsed().as_secs_f64();
        let failures_by_kind = FailureKind::all()
            .into_iter()
            .map(|kind| (kind.label(), snapshot.failures_of(kind)))
            .collect();

        Self {
            name: outcome.name.clone(),
            tag: outcome.tag.clone(),
            target: outcome.target.clone(),
            total: snapshot.total,
            successes: snapshot.successes,
            failures: snapshot.failures(),
            failure_rate: snapshot.failure_rate(),
            saturation_rate: snapshot.saturation_rate(),
            failures_by_kind,
            latency_us: snapshot.latency_stats(),
            planned_duration_secs: outcome.planned_duration.as_secs_f64(),
            started_at_secs: outcome.started_at.as_secs_f64(),
            ended_at_secs: outcome.ended_at.as_secs_f64(),
            achieved_rps: if elapsed > 0.0 {
                snapshot.total as f64 / elapsed
            } else {
                0.0
            },
            dispatched: outcome.dispatch.map(|d| d.dispatched),
            drain_timeouts: outcome.drain_timeouts,
            peak_workers: outcome.peak_workers,
            forced: outcome.forced,
            skipped: outcome.skipped,
        }
    }

    pub fn p95_ms(&self) -> Option<f64> {
        self.latency_us.as_ref().map(|s| us_to_ms(s.p95))
    }

    fn status_label(&self) -> &'static str {
        if self.skipped {
            "skipped"
        } else if self.forced {
            "forced"
        } else {
            "complete"
        }
    }
}

/// Flat CSV row; the csv crate cannot serialize nested maps.
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    scenario: &'a str,
    tag: &'a str,
    target: &'a str,
    status: &'a str,
    total: u64,
    successes: u64,
    failures: u64,
    failure_rate: f64,
    pool_saturated: u64,
    endpoint_errors: u64,
    drain_timeouts: u64,
    cancelled: u64,
    achieved_rps: f64,
    p50_ms: Option<f64>,
    p90_ms: Option<f64>,
    p95_ms: Option<f64>,
    p99_ms: Option<f64>,
    max_ms: Option<f64>,
    mean_ms: Option<f64>,
    relative_p95: Option<f64>,
}

/// Final report of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub scenarios: Vec<ScenarioReport>,
    pub rules: Vec<RuleResult>,
    /// False iff some fatal rule was violated.
    pub passed: bool,
    pub elapsed_secs: f64,
}

impl RunReport {
    pub fn build(
        collector: &MetricsCollector,
        outcomes: &[ScenarioOutcome],
        rules: Vec<RuleResult>,
    ) -> Self {
        let scenarios: Vec<ScenarioReport> = outcomes
            .iter()
            .map(|o| ScenarioReport::build(collector, o))
            .collect();
        let elapsed_secs = scenarios
            .iter()
            .map(|s| s.ended_at_secs)
            .fold(0.0, f64::max);

        Self {
            passed: overall_passed(&rules),
            scenarios,
            rules,
            elapsed_secs,
        }
    }

    pub fn scenario(&self, name: &str) -> Option<&ScenarioReport> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed {
            0
        } else {
            EXIT_THRESHOLDS_FAILED
        }
    }

    /// p95 of each scenario divided by the lowest p95 in the run.
    pub fn relative_p95(&self) -> HashMap<String, f64> {
        let fastest = self
            .scenarios
            .iter()
            .filter_map(ScenarioReport::p95_ms)
            .filter(|p| *p > 0.0)
            .fold(f64::INFINITY, f64::min);
        if !fastest.is_finite() {
            return HashMap::new();
        }
        self.scenarios
            .iter()
            .filter_map(|s| s.p95_ms().map(|p| (s.name.clone(), p / fastest)))
            .collect()
    }

    /// Human-readable summary.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let relative = self.relative_p95();

        out.push_str("\n## Scenarios\n\n");
        out.push_str(&format!(
            "{:<20} {:<10} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>8}  {}\n",
            "Scenario", "Tag", "Requests", "Fail %", "Sat %", "RPS", "P95(ms)", "vs best", "Workers", "Status"
        ));
        out.push_str(&"-".repeat(112));
        out.push('\n');
        for s in &self.scenarios {
            let p95 = s
                .p95_ms()
                .map(|p| format!("{:.2}", p))
                .unwrap_or_else(|| "-".to_string());
            let rel = relative
                .get(&s.name)
                .map(|r| format!("{:.2}x", r))
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "{:<20} {:<10} {:>9} {:>8.2}% {:>8.2}% {:>9.1} {:>9} {:>9} {:>8}  {}\n",
                s.name,
                s.tag.as_deref().unwrap_or("-"),
                s.total,
                s.failure_rate * 100.0,
                s.saturation_rate * 100.0,
                s.achieved_rps,
                p95,
                rel,
                s.peak_workers,
                s.status_label(),
            ));
        }

        let labels: Vec<String> = self.scenarios.iter().map(|s| s.name.clone()).collect();
        let stats: HashMap<String, PercentileStats> = self
            .scenarios
            .iter()
            .filter_map(|s| s.latency_us.clone().map(|l| (s.name.clone(), l)))
            .collect();
        out.push_str(&format_percentile_table("Latency", &labels, &stats));

        out.push_str("\n## Failures\n\n");
        for s in &self.scenarios {
            let breakdown: Vec<String> = s
                .failures_by_kind
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(kind, n)| format!("{}={}", kind, n))
                .collect();
            let breakdown = if breakdown.is_empty() {
                "none".to_string()
            } else {
                breakdown.join(", ")
            };
            out.push_str(&format!("{:<20} {}\n", s.name, breakdown));
        }

        out.push_str("\n## Thresholds\n\n");
        if self.rules.is_empty() {
            out.push_str("No thresholds declared.\n");
        }
        for r in &self.rules {
            let mark = match (r.passed, r.rule.fatal) {
                (true, _) => "PASS",
                (false, true) => "FAIL",
                (false, false) => "WARN",
            };
            let observed = r
                .observed
                .map(|v| format!("{:.4}", v))
                .unwrap_or_else(|| "n/a".to_string());
            out.push_str(&format!(
                "[{}] {:<40} {:<16} observed={}{}{}\n",
                mark,
                r.rule.key,
                r.rule.expression(),
                observed,
                if r.rule.fatal { "" } else { " (non-fatal)" },
                r.note
                    .as_deref()
                    .map(|n| format!(" ({})", n))
                    .unwrap_or_default(),
            ));
        }

        out.push_str(&format!(
            "\nRun {} in {:.1}s\n",
            if self.passed { "PASSED" } else { "FAILED: fatal threshold violated" },
            self.elapsed_secs
        ));
        out
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_csv(&self) -> Result<String, ReportError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        self.write_csv_rows(&mut writer)?;
        let bytes = writer
            .into_inner()
            .map_err(|e| ReportError::Csv(csv::Error::from(e.into_error())))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn write_json(&self, path: &Path) -> Result<(), ReportError> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|source| ReportError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), ReportError> {
        let mut writer = csv::Writer::from_path(path)?;
        self.write_csv_rows(&mut writer)?;
        writer.flush().map_err(|source| ReportError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn write_csv_rows<W: std::io::Write>(&self, writer: &mut csv::Writer<W>) -> Result<(), ReportError> {
        let relative = self.relative_p95();
        for s in &self.scenarios {
            let ms = |f: fn(&PercentileStats) -> u64| s.latency_us.as_ref().map(|l| us_to_ms(f(l)));
            writer.serialize(CsvRow {
                scenario: &s.name,
                tag: s.tag.as_deref().unwrap_or(""),
                target: &s.target,
                status: s.status_label(),
                total: s.total,
                successes: s.successes,
                failures: s.failures,
                failure_rate: s.failure_rate,
                pool_saturated: s.failures_by_kind[FailureKind::PoolSaturated.label()],
                endpoint_errors: s.failures_by_kind[FailureKind::Endpoint.label()],
                drain_timeouts: s.failures_by_kind[FailureKind::DrainTimeout.label()],
                cancelled: s.failures_by_kind[FailureKind::Cancelled.label()],
                achieved_rps: s.achieved_rps,
                p50_ms: ms(|l| l.p50),
                p90_ms: ms(|l| l.p90),
                p95_ms: ms(|l| l.p95),
                p99_ms: ms(|l| l.p99),
                max_ms: ms(|l| l.max),
                mean_ms: s.latency_us.as_ref().map(|l| l.mean / 1000.0),
                relative_p95: relative.get(&s.name).copied(),
            })?;
        }
        Ok(())
    }
}
