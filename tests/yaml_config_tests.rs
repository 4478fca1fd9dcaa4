//! Integration tests for YAML configuration files.

use std::fs;

use gateway_loadtest::thresholds::{Metric, Scope};
use gateway_loadtest::yaml_config::{YamlConfig, YamlConfigError};
use tempfile::NamedTempFile;
use tokio::time::Duration;

const FULL: &str = r#"
version: "1.0"
metadata:
  name: "YARP vs Ocelot"
  description: "Five-stage benchmark against both gateways"
config:
  method: get
  timeout: 10s
  skipTlsVerify: true
  customHeaders: "X-Bench:gateway"
  tickInterval: 200ms
  drainTimeout: 15s
  gap: 10
  safetyMargin: 2s
  expectedStatus: 204
  preAllocatedWorkers: 50
  maxWorkers: 1000
  metricsPort: 9090
scenarios:
  - name: yarp
    url: "http://localhost:8001/api/test"
    tag: yarp
    plan: benchmark
    maxRps: 500
  - name: ocelot
    url: "http://localhost:8000/api/test"
    tag: ocelot
    plan: benchmark
    maxRps: 500
    maxWorkers: 2000
thresholds:
  - metric: "http_req_failed{gateway:yarp}"
    expression: "rate<0.01"
  - metric: "http_req_failed{gateway:ocelot}"
    expression: "rate<0.01"
  - metric: http_req_duration
    scope: "tag:ocelot"
    expression: "p(99)<250"
    fatal: false
report:
  json: results/run.json
  csv: results/run.csv
"#;

#[test]
fn test_full_config_round_trip_to_run_config() {
    let run = YamlConfig::from_str(FULL).unwrap().to_run_config().unwrap();

    assert_eq!(run.method, reqwest::Method::GET);
    assert_eq!(run.client.request_timeout, Duration::from_secs(10));
    assert!(run.client.skip_tls_verify);
    assert_eq!(run.client.custom_headers.as_deref(), Some("X-Bench:gateway"));
    assert_eq!(run.scenario.tick_interval, Duration::from_millis(200));
    assert_eq!(run.scenario.drain_timeout, Duration::from_secs(15));
    assert_eq!(run.scenario.expected_status, 204);
    assert_eq!(run.timeline.gap, Duration::from_secs(10));
    assert_eq!(run.timeline.safety_margin, Duration::from_secs(2));
    assert_eq!(run.metrics_port, Some(9090));

    assert_eq!(run.targets.len(), 2);
    assert_eq!(run.targets[0].max_workers, 1000);
    assert_eq!(run.targets[1].max_workers, 2000);
    assert_eq!(run.targets[1].preallocated_workers, 50);
    // warmup defaults to max(50, 10% of maxRps)
    assert_eq!(run.targets[0].plan.stages()[0].target_rate, 50.0);
    assert_eq!(run.targets[0].plan.peak_rate(), 750.0);

    let rule = &run.thresholds[2];
    assert_eq!(rule.scope, Scope::Tag("ocelot".to_string()));
    assert_eq!(rule.metric, Metric::LatencyPercentile(99.0));
    assert!(!rule.fatal);
    println!("✅ Full YAML config converts to a run config");
}

#[test]
fn test_from_file() {
    let file = NamedTempFile::new().unwrap();
    fs::write(file.path(), FULL).unwrap();
    let config = YamlConfig::from_file(file.path()).unwrap();
    assert_eq!(config.metadata.name.as_deref(), Some("YARP vs Ocelot"));
    assert_eq!(config.scenarios.len(), 2);
}

#[test]
fn test_missing_file() {
    let err = YamlConfig::from_file("/nonexistent/gateway.yaml").unwrap_err();
    assert!(matches!(err, YamlConfigError::FileRead(_)));
}

#[test]
fn test_malformed_yaml() {
    let err = YamlConfig::from_str("version: [unclosed").unwrap_err();
    assert!(matches!(err, YamlConfigError::YamlParse(_)));
}

#[test]
fn test_missing_scenarios_field() {
    let err = YamlConfig::from_str("version: \"1.0\"\n").unwrap_err();
    assert!(matches!(err, YamlConfigError::YamlParse(_)));
}

#[test]
fn test_benchmark_and_stages_are_exclusive() {
    let yaml = r#"
version: "1.0"
scenarios:
  - name: both
    url: "http://localhost/"
    plan: benchmark
    stages:
      - { duration: 1s, target: 1 }
"#;
    let err = YamlConfig::from_str(yaml).unwrap_err().to_string();
    assert!(err.contains("scenarios[0].stages"));
    assert!(err.contains("not both"));
}

#[test]
fn test_invalid_globals_reported_with_paths() {
    let yaml = r#"
version: "1.0"
config:
  method: FETCH
  drainTimeout: forever
  preAllocatedWorkers: 10
  maxWorkers: 5
scenarios:
  - name: a
    url: "http://localhost/"
    stages:
      - { duration: 1s, target: 1 }
"#;
    let err = YamlConfig::from_str(yaml).unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, YamlConfigError::Validation(_)));
    assert!(message.contains("config.method"));
    assert!(message.contains("config.drainTimeout"));
    assert!(message.contains("config.workers"));
}

#[test]
fn test_tick_interval_out_of_range_fails_conversion() {
    let yaml = r#"
version: "1.0"
config:
  tickInterval: 5s
scenarios:
  - name: a
    url: "http://localhost/"
    stages:
      - { duration: 1s, target: 1 }
"#;
    let config = YamlConfig::from_str(yaml).unwrap();
    let err = config.to_run_config().unwrap_err();
    assert!(matches!(err, YamlConfigError::Config(_)));
    assert!(err.to_string().contains("tick_interval"));
}
