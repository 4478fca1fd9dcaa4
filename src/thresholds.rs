//! Post-run pass/fail rules.
//!
//! Rules use k6 threshold syntax so existing benchmark definitions carry
//! over unchanged:
//!
//! ```text
//! http_req_failed{gateway:yarp}   rate<0.01
//! yarp_latency                    p(95)<50
//! http_req_duration               avg<=20
//! pool_saturated{scenario:ocelot} saturation<0.05
//! ```
//!
//! The key on the left only selects the scope (a tag, a scenario, or
//! everything). The aggregation in the expression selects the metric.
//! Latency metrics are in milliseconds.

use std::collections::HashSet;
use std::fmt;

use regex::Regex;
use serde::Serialize;

use crate::collector::{MetricsCollector, ScenarioSnapshot};
use crate::errors::ConfigError;
use crate::scenario::ScenarioOutcome;

/// What is measured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "percentile", rename_all = "snake_case")]
pub enum Metric {
    /// failures / total, in [0, 1].
    FailureRate,
    /// Nearest-rank latency percentile, ms.
    LatencyPercentile(f64),
    AvgLatency,
    MinLatency,
    MaxLatency,
    /// Share of samples dropped because the pool was saturated.
    SaturationRate,
}

impl Metric {
    /// Observed value over `snapshot`, or None when a latency metric has no
    /// measured samples.
    pub fn observe(&self, snapshot: &ScenarioSnapshot) -> Option<f64> {
        let ms = |us: u64| us as f64 / 1000.0;
        match self {
            Metric::FailureRate => Some(snapshot.failure_rate()),
            Metric::SaturationRate => Some(snapshot.saturation_rate()),
            Metric::LatencyPercentile(p) => snapshot
                .percentile(*p)
                .map(|d| d.as_secs_f64() * 1000.0),
            Metric::AvgLatency => snapshot.latency_stats().map(|s| s.mean / 1000.0),
            Metric::MinLatency => snapshot.latencies_us.first().copied().map(ms),
            Metric::MaxLatency => snapshot.latencies_us.last().copied().map(ms),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::FailureRate => f.write_str("rate"),
            Metric::LatencyPercentile(p) => write!(f, "p({})", p),
            Metric::AvgLatency => f.write_str("avg"),
            Metric::MinLatency => f.write_str("min"),
            Metric::MaxLatency => f.write_str("max"),
            Metric::SaturationRate => f.write_str("saturation"),
        }
    }
}

/// Which samples a rule looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scope {
    All,
    Scenario(String),
    Tag(String),
}

impl Scope {
    fn matches(&self, outcome: &ScenarioOutcome) -> bool {
        match self {
            Scope::All => true,
            Scope::Scenario(name) => outcome.name == *name,
            Scope::Tag(tag) => outcome.tag.as_deref() == Some(tag.as_str()),
        }
    }

    /// Parses a k6 metric key such as `http_req_failed{gateway:yarp}`,
    /// `yarp_latency` or `http_req_duration`.
    pub fn from_metric_key(key: &str) -> Result<Self, String> {
        let key = key.trim();
        if let Some(open) = key.find('{') {
            let inner = key[open + 1..]
                .strip_suffix('}')
                .ok_or_else(|| format!("unterminated tag filter in '{}'", key))?;
            let (tag_key, tag_value) = inner
                .split_once(':')
                .ok_or_else(|| format!("tag filter '{}' must be key:value", inner))?;
            let (tag_key, tag_value) = (tag_key.trim(), tag_value.trim());
            if tag_value.is_empty() {
                return Err(format!("empty tag value in '{}'", key));
            }
            return Ok(if tag_key == "scenario" {
                Scope::Scenario(tag_value.to_string())
            } else {
                Scope::Tag(tag_value.to_string())
            });
        }

        match key.strip_suffix("_latency") {
            Some(name) if !name.is_empty() => Ok(Scope::Scenario(name.to_string())),
            _ => Ok(Scope::All),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("all"),
            Scope::Scenario(name) => write!(f, "scenario:{}", name),
            Scope::Tag(tag) => write!(f, "tag:{}", tag),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl Comparator {
    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparator::Lt => observed < bound,
            Comparator::Le => observed <= bound,
            Comparator::Gt => observed > bound,
            Comparator::Ge => observed >= bound,
        }
    }

    fn parse(op: &str) -> Option<Self> {
        match op {
            "<" => Some(Comparator::Lt),
            "<=" => Some(Comparator::Le),
            ">" => Some(Comparator::Gt),
            ">=" => Some(Comparator::Ge),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        }
    }
}

lazy_static::lazy_static! {
    static ref EXPRESSION_RE: Regex = Regex::new(
        r"^\s*(rate|saturation|avg|min|max|med|p\(\s*(\d+(?:\.\d+)?)\s*\))\s*(<=|>=|<|>)\s*(-?\d+(?:\.\d+)?)\s*$"
    ).unwrap();
}

/// A declared pass/fail condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdRule {
    /// The metric key the rule was declared under, for display.
    pub key: String,
    pub metric: Metric,
    pub scope: Scope,
    pub comparator: Comparator,
    pub bound: f64,
    /// A violated fatal rule fails the run; otherwise it only annotates.
    pub fatal: bool,
}

impl ThresholdRule {
    /// Parses a k6-style rule: `key` selects the scope, `expression` the
    /// metric and bound.
    pub fn parse(key: &str, expression: &str, fatal: bool) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidThreshold {
            expression: format!("{}: {}", key, expression),
            message,
        };
        let scope = Scope::from_metric_key(key).map_err(invalid)?;
        Self::with_scope(key, scope, expression, fatal)
    }

    /// Parses `expression` with an explicit scope.
    pub fn with_scope(
        key: &str,
        scope: Scope,
        expression: &str,
        fatal: bool,
    ) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidThreshold {
            expression: expression.to_string(),
            message: message.to_string(),
        };

        let caps = EXPRESSION_RE.captures(expression).ok_or_else(|| {
            invalid("expected <aggregation><op><number>, e.g. rate<0.01 or p(95)<50")
        })?;

        let metric = match &caps[1] {
            "rate" => Metric::FailureRate,
            "saturation" => Metric::SaturationRate,
            "avg" => Metric::AvgLatency,
            "min" => Metric::MinLatency,
            "max" => Metric::MaxLatency,
            "med" => Metric::LatencyPercentile(50.0),
            _ => {
                let p: f64 = caps[2]
                    .parse()
                    .map_err(|_| invalid("percentile is not a number"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(invalid("percentile must be between 0 and 100"));
                }
                Metric::LatencyPercentile(p)
            }
        };
        let comparator =
            Comparator::parse(&caps[3]).ok_or_else(|| invalid("unsupported comparator"))?;
        let bound: f64 = caps[4].parse().map_err(|_| invalid("bound is not a number"))?;

        Ok(Self {
            key: key.trim().to_string(),
            metric,
            scope,
            comparator,
            bound,
            fatal,
        })
    }

    pub fn expression(&self) -> String {
        format!("{}{}{}", self.metric, self.comparator.symbol(), self.bound)
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key, self.expression())
    }
}

/// Outcome of one rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResult {
    pub rule: ThresholdRule,
    /// Scenarios the scope resolved to.
    pub scenarios: Vec<String>,
    pub samples: u64,
    /// None when a latency rule had nothing to measure.
    pub observed: Option<f64>,
    pub passed: bool,
    pub note: Option<String>,
}

impl RuleResult {
    /// Violated and fatal.
    pub fn is_fatal_failure(&self) -> bool {
        !self.passed && self.rule.fatal
    }
}

/// Evaluates a fixed set of rules once, after the run.
#[derive(Debug, Clone, Default)]
pub struct ThresholdEvaluator {
    rules: Vec<ThresholdRule>,
}

impl ThresholdEvaluator {
    pub fn new(rules: Vec<ThresholdRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    /// Checks that scenario and tag scopes name scenarios and tags that
    /// exist, so a misspelt key cannot pass vacuously.
    pub fn validate_against(&self, scenario_names: &[&str], tags: &[&str]) -> Result<(), ConfigError> {
        let known: HashSet<&str> = scenario_names.iter().copied().collect();
        let known_tags: HashSet<&str> = tags.iter().copied().collect();
        for rule in &self.rules {
            let unknown = match &rule.scope {
                Scope::Scenario(name) if !known.contains(name.as_str()) => {
                    format!("unknown scenario '{}'", name)
                }
                Scope::Tag(tag) if !known_tags.contains(tag.as_str()) => {
                    format!("no scenario is tagged '{}'", tag)
                }
                _ => continue,
            };
            return Err(ConfigError::InvalidThreshold {
                expression: rule.to_string(),
                message: unknown,
            });
        }
        Ok(())
    }

    pub fn evaluate(&self, collector: &MetricsCollector, outcomes: &[ScenarioOutcome]) -> Vec<RuleResult> {
        self.rules
            .iter()
            .map(|rule| evaluate_rule(rule, collector, outcomes))
            .collect()
    }
}

fn evaluate_rule(
    rule: &ThresholdRule,
    collector: &MetricsCollector,
    outcomes: &[ScenarioOutcome],
) -> RuleResult {
    let scenarios: Vec<String> = outcomes
        .iter()
        .filter(|o| rule.scope.matches(o))
        .map(|o| o.name.clone())
        .collect();
    let snapshots: Vec<ScenarioSnapshot> =
        scenarios.iter().map(|name| collector.snapshot(name)).collect();
    let merged = ScenarioSnapshot::merge(&snapshots);

    let observed = rule.metric.observe(&merged);
    let (passed, note) = match observed {
        Some(value) => (rule.comparator.holds(value, rule.bound), None),
        None => (true, Some("no data".to_string())),
    };
    let note = match (note, scenarios.is_empty()) {
        (None, true) => Some(format!("scope {} matched no scenarios", rule.scope)),
        (note, _) => note,
    };

    RuleResult {
        rule: rule.clone(),
        scenarios,
        samples: merged.total,
        observed,
        passed,
        note,
    }
}

/// True unless some fatal rule was violated.
pub fn overall_passed(results: &[RuleResult]) -> bool {
    !results.iter().any(RuleResult::is_fatal_failure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_k6_rules() {
        let rule = ThresholdRule::parse("http_req_failed{gateway:yarp}", "rate<0.01", true).unwrap();
        assert_eq!(rule.metric, Metric::FailureRate);
        assert_eq!(rule.scope, Scope::Tag("yarp".to_string()));
        assert_eq!(rule.comparator, Comparator::Lt);
        assert_eq!(rule.bound, 0.01);

        let rule = ThresholdRule::parse("ocelot_latency", "p(95)<50", false).unwrap();
        assert_eq!(rule.metric, Metric::LatencyPercentile(95.0));
        assert_eq!(rule.scope, Scope::Scenario("ocelot".to_string()));
        assert!(!rule.fatal);

        let rule = ThresholdRule::parse("http_req_duration", " avg <= 20.5 ", true).unwrap();
        assert_eq!(rule.metric, Metric::AvgLatency);
        assert_eq!(rule.comparator, Comparator::Le);
        assert_eq!(rule.scope, Scope::All);

        let rule = ThresholdRule::parse("x{scenario:b}", "p(99.9)>=1", true).unwrap();
        assert_eq!(rule.metric, Metric::LatencyPercentile(99.9));
        assert_eq!(rule.scope, Scope::Scenario("b".to_string()));
        assert_eq!(rule.expression(), "p(99.9)>=1");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ThresholdRule::parse("k", "rate=0.01", true).is_err());
        assert!(ThresholdRule::parse("k", "p(101)<5", true).is_err());
        assert!(ThresholdRule::parse("k", "count<5", true).is_err());
        assert!(ThresholdRule::parse("k{gateway}", "rate<1", true).is_err());
        assert!(ThresholdRule::parse("k{gateway:yarp", "rate<1", true).is_err());
    }

    #[test]
    fn test_comparators() {
        assert!(Comparator::Lt.holds(1.0, 2.0));
        assert!(!Comparator::Lt.holds(2.0, 2.0));
        assert!(Comparator::Le.holds(2.0, 2.0));
        assert!(Comparator::Gt.holds(3.0, 2.0));
        assert!(Comparator::Ge.holds(2.0, 2.0));
        assert!(!Comparator::Ge.holds(1.0, 2.0));
    }
}
