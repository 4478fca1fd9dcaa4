//! Integration tests for threshold evaluation over recorded samples.

mod common;

use std::sync::Arc;

use common::MockEndpoint;
use gateway_loadtest::collector::{MetricsCollector, Sample};
use gateway_loadtest::errors::{CategorizedError, FailureReason};
use gateway_loadtest::ramp_plan::RampPlan;
use gateway_loadtest::scenario::{ScenarioOutcome, ScenarioSpec};
use gateway_loadtest::thresholds::{overall_passed, ThresholdEvaluator, ThresholdRule};
use tokio::time::Duration;

fn outcome(name: &str, tag: &str) -> ScenarioOutcome {
    let spec = ScenarioSpec::new(
        name,
        RampPlan::constant(1.0, Duration::from_secs(1)).unwrap(),
        MockEndpoint::healthy(1),
    )
    .with_tag(tag);
    // Only the name and tag matter for scoping.
    ScenarioOutcome::skipped(&spec, Duration::ZERO)
}

/// yarp: 100 successes at 1..=100ms. ocelot: 98 successes at 40ms and two
/// 503s at 900ms.
fn recorded() -> (MetricsCollector, Vec<ScenarioOutcome>) {
    let collector = MetricsCollector::new();
    let ms = Duration::from_millis;
    let yarp: Arc<str> = Arc::from("yarp");
    let ocelot: Arc<str> = Arc::from("ocelot");

    for i in 1..=100 {
        collector.record(Sample::success(yarp.clone(), ms(i), ms(i)));
    }
    for i in 0..98 {
        collector.record(Sample::success(ocelot.clone(), ms(i), ms(40)));
    }
    for i in 0..2 {
        collector.record(Sample::failure(
            ocelot.clone(),
            ms(100 + i),
            Some(ms(900)),
            FailureReason::Endpoint(CategorizedError::unexpected_status(503, 200)),
        ));
    }

    (collector, vec![outcome("yarp", "yarp"), outcome("ocelot", "ocelot")])
}

fn rule(key: &str, expression: &str) -> ThresholdRule {
    ThresholdRule::parse(key, expression, true).unwrap()
}

#[test]
fn test_failure_rate_per_gateway() {
    let (collector, outcomes) = recorded();
    let results = ThresholdEvaluator::new(vec![
        rule("http_req_failed{gateway:yarp}", "rate<0.01"),
        rule("http_req_failed{gateway:ocelot}", "rate<0.01"),
        rule("http_req_failed{gateway:ocelot}", "rate<=0.02"),
    ])
    .evaluate(&collector, &outcomes);

    assert_eq!(results[0].observed, Some(0.0));
    assert!(results[0].passed);
    assert_eq!(results[1].observed, Some(0.02));
    assert!(!results[1].passed);
    assert!(results[2].passed);
    assert_eq!(results[1].scenarios, vec!["ocelot".to_string()]);
    assert!(!overall_passed(&results));
}

#[test]
fn test_latency_percentiles_include_failed_requests() {
    let (collector, outcomes) = recorded();
    let results = ThresholdEvaluator::new(vec![
        rule("yarp_latency", "p(95)<=95"),
        rule("yarp_latency", "p(95)<95"),
        rule("ocelot_latency", "p(99)<100"),
        rule("ocelot_latency", "max<1000"),
        rule("http_req_duration", "min>=1"),
    ])
    .evaluate(&collector, &outcomes);

    assert_eq!(results[0].observed, Some(95.0));
    assert!(results[0].passed);
    assert!(!results[1].passed);
    // The two slow 503s sit at the top of ocelot's distribution.
    assert_eq!(results[2].observed, Some(900.0));
    assert!(!results[2].passed);
    assert!(results[3].passed);
    assert_eq!(results[4].samples, 200);
    assert!(results[4].passed);
}

#[test]
fn test_non_fatal_violation_does_not_fail_run() {
    let (collector, outcomes) = recorded();
    let results = ThresholdEvaluator::new(vec![ThresholdRule::parse(
        "http_req_failed{gateway:ocelot}",
        "rate<0.01",
        false,
    )
    .unwrap()])
    .evaluate(&collector, &outcomes);

    assert!(!results[0].passed);
    assert!(!results[0].is_fatal_failure());
    assert!(overall_passed(&results));
}

#[test]
fn test_empty_scope_passes_with_note() {
    let (collector, outcomes) = recorded();
    let results = ThresholdEvaluator::new(vec![
        rule("http_req_failed{gateway:envoy}", "rate<0.01"),
        rule("http_req_duration{gateway:envoy}", "p(95)<1"),
    ])
    .evaluate(&collector, &outcomes);

    assert!(results.iter().all(|r| r.passed));
    assert_eq!(results[0].observed, Some(0.0));
    assert!(results[0].note.as_deref().unwrap().contains("matched no scenarios"));
    assert_eq!(results[1].observed, None);
    assert_eq!(results[1].note.as_deref(), Some("no data"));
}

#[test]
fn test_validate_against_unknown_scenario() {
    let evaluator = ThresholdEvaluator::new(vec![rule("envoy_latency", "p(95)<50")]);
    assert!(evaluator.validate_against(&["yarp", "ocelot"], &[]).is_err());
    assert!(evaluator.validate_against(&["envoy"], &[]).is_ok());
}

#[test]
fn test_validate_against_unknown_tag() {
    let evaluator = ThresholdEvaluator::new(vec![rule("http_req_failed{gateway:yrap}", "rate<0.01")]);
    let err = evaluator
        .validate_against(&["yarp", "ocelot"], &["yarp", "ocelot"])
        .unwrap_err();
    assert!(err.to_string().contains("yrap"), "{}", err);
    assert!(evaluator.validate_against(&["yarp"], &["yrap"]).is_ok());

    // Unscoped rules never fail validation.
    let all = ThresholdEvaluator::new(vec![rule("http_req_failed", "rate<0.01")]);
    assert!(all.validate_against(&["yarp"], &[]).is_ok());
}
