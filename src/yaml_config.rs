//! YAML configuration file support.
//!
//! A config file is the version-controlled alternative to environment
//! variables. It can give each target its own plan and worker bounds, and it
//! lists thresholds explicitly instead of deriving them:
//!
//! ```yaml
//! version: "1.0"
//! config:
//!   gap: 5s
//!   drainTimeout: 30s
//! scenarios:
//!   - name: yarp
//!     url: http://localhost:8001/api/test
//!     tag: yarp
//!     plan: benchmark
//!     maxRps: 2000
//!   - name: ocelot
//!     url: http://localhost:8000/api/test
//!     stages:
//!       - { duration: 30s, target: 500 }
//! thresholds:
//!   - metric: http_req_failed{gateway:yarp}
//!     expression: rate<0.01
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;

use crate::client::ClientConfig;
use crate::config::{ReportOutputs, RunConfig, TargetConfig};
use crate::config_validation::{
    DurationValidator, HttpMethodValidator, RateValidator, UrlValidator, ValidationContext,
    WorkerBoundsValidator,
};
use crate::errors::ConfigError;
use crate::ramp_plan::{RampPlan, Stage};
use crate::scenario::ScenarioSettings;
use crate::thresholds::{Scope, ThresholdRule};
use crate::timeline::TimelineSettings;

pub const SUPPORTED_VERSION: &str = "1.0";

/// Errors that can occur when loading or parsing YAML configuration.
#[derive(Error, Debug)]
pub enum YamlConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Duration in YAML: plain seconds or a string like "150ms" or "1.5m".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlDuration {
    Seconds(f64),
    String(String),
}

impl YamlDuration {
    pub fn to_duration(&self) -> Result<Duration, YamlConfigError> {
        match self {
            YamlDuration::Seconds(s) => Duration::try_from_secs_f64(*s)
                .map_err(|e| YamlConfigError::Validation(format!("Invalid duration {}: {}", s, e))),
            YamlDuration::String(s) => DurationValidator::parse(s)
                .map_err(|e| YamlConfigError::Validation(e.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct YamlMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Settings shared by every scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YamlGlobalConfig {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_request_timeout")]
    pub timeout: YamlDuration,
    #[serde(default)]
    pub skip_tls_verify: bool,
    pub resolve_target_addr: Option<String>,
    pub custom_headers: Option<String>,
    #[serde(default = "default_tick_interval")]
    pub tick_interval: YamlDuration,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: YamlDuration,
    #[serde(default = "default_gap")]
    pub gap: YamlDuration,
    #[serde(default = "default_safety_margin")]
    pub safety_margin: YamlDuration,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default = "default_preallocated_workers")]
    pub pre_allocated_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    pub metrics_port: Option<u16>,
}

impl Default for YamlGlobalConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            timeout: default_request_timeout(),
            skip_tls_verify: false,
            resolve_target_addr: None,
            custom_headers: None,
            tick_interval: default_tick_interval(),
            drain_timeout: default_drain_timeout(),
            gap: default_gap(),
            safety_margin: default_safety_margin(),
            expected_status: default_expected_status(),
            pre_allocated_workers: default_preallocated_workers(),
            max_workers: default_max_workers(),
            metrics_port: None,
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_request_timeout() -> YamlDuration {
    YamlDuration::String("30s".to_string())
}

fn default_tick_interval() -> YamlDuration {
    YamlDuration::String("100ms".to_string())
}

fn default_drain_timeout() -> YamlDuration {
    YamlDuration::String("30s".to_string())
}

fn default_gap() -> YamlDuration {
    YamlDuration::String("5s".to_string())
}

fn default_safety_margin() -> YamlDuration {
    YamlDuration::String("5s".to_string())
}

fn default_expected_status() -> u16 {
    200
}

fn default_preallocated_workers() -> usize {
    200
}

fn default_max_workers() -> usize {
    4000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YamlPlanKind {
    /// The five-stage gateway benchmark.
    Benchmark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlStage {
    pub duration: YamlDuration,
    pub target: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YamlScenario {
    pub name: String,
    pub url: String,
    pub tag: Option<String>,
    /// Only meaningful with explicit stages.
    pub start_rate: Option<f64>,
    #[serde(default)]
    pub stages: Vec<YamlStage>,
    pub plan: Option<YamlPlanKind>,
    pub max_rps: Option<f64>,
    pub warmup_rps: Option<f64>,
    pub stage_scale: Option<f64>,
    pub pre_allocated_workers: Option<usize>,
    pub max_workers: Option<usize>,
}

impl YamlScenario {
    fn to_plan(&self) -> Result<RampPlan, YamlConfigError> {
        match self.plan {
            Some(YamlPlanKind::Benchmark) => {
                let max_rps = self.max_rps.unwrap_or(2000.0);
                let warmup = self
                    .warmup_rps
                    .unwrap_or_else(|| 50f64.max((max_rps * 0.1).round()));
                Ok(RampPlan::gateway_benchmark(
                    max_rps,
                    warmup,
                    self.stage_scale.unwrap_or(1.0),
                )?)
            }
            None => {
                let stages = self
                    .stages
                    .iter()
                    .map(|s| Ok(Stage::new(s.duration.to_duration()?, s.target)))
                    .collect::<Result<Vec<_>, YamlConfigError>>()?;
                Ok(RampPlan::with_start_rate(self.start_rate.unwrap_or(0.0), stages)?)
            }
        }
    }
}

/// One threshold. `scope` overrides the scope implied by `metric`, and is
/// `all`, `scenario:<name>` or `tag:<value>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlThreshold {
    pub metric: String,
    pub expression: String,
    pub scope: Option<String>,
    #[serde(default = "default_fatal")]
    pub fatal: bool,
}

fn default_fatal() -> bool {
    true
}

impl YamlThreshold {
    fn to_rule(&self) -> Result<ThresholdRule, ConfigError> {
        match &self.scope {
            Some(scope) => {
                let scope = parse_scope(scope).map_err(|message| ConfigError::InvalidThreshold {
                    expression: format!("{}: {}", self.metric, self.expression),
                    message,
                })?;
                ThresholdRule::with_scope(&self.metric, scope, &self.expression, self.fatal)
            }
            None => ThresholdRule::parse(&self.metric, &self.expression, self.fatal),
        }
    }
}

fn parse_scope(scope: &str) -> Result<Scope, String> {
    let scope = scope.trim();
    if scope == "all" {
        return Ok(Scope::All);
    }
    match scope.split_once(':') {
        Some(("scenario", name)) if !name.trim().is_empty() => {
            Ok(Scope::Scenario(name.trim().to_string()))
        }
        Some(("tag", value)) if !value.trim().is_empty() => Ok(Scope::Tag(value.trim().to_string())),
        _ => Err(format!(
            "scope '{}' must be 'all', 'scenario:<name>' or 'tag:<value>'",
            scope
        )),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct YamlReport {
    pub json: Option<PathBuf>,
    pub csv: Option<PathBuf>,
}

/// Root YAML configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlConfig {
    pub version: String,

    #[serde(default)]
    pub metadata: YamlMetadata,

    #[serde(default)]
    pub config: YamlGlobalConfig,

    pub scenarios: Vec<YamlScenario>,

    #[serde(default)]
    pub thresholds: Vec<YamlThreshold>,

    #[serde(default)]
    pub report: YamlReport,
}

impl YamlConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, YamlConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse and validate configuration from a YAML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, YamlConfigError> {
        let config: YamlConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field and reports all problems at once.
    fn validate(&self) -> Result<(), YamlConfigError> {
        let mut ctx = ValidationContext::new();

        ctx.enter("version");
        if self.version.trim() != SUPPORTED_VERSION {
            ctx.field_error(format!(
                "Unsupported config version '{}', expected '{}'",
                self.version, SUPPORTED_VERSION
            ));
        }
        ctx.exit();

        ctx.enter("config");
        let global = &self.config;
        ctx.enter("method");
        ctx.check(HttpMethodValidator::parse(&global.method));
        ctx.exit();
        for (field, duration) in [
            ("timeout", &global.timeout),
            ("tickInterval", &global.tick_interval),
            ("drainTimeout", &global.drain_timeout),
            ("gap", &global.gap),
            ("safetyMargin", &global.safety_margin),
        ] {
            ctx.enter(field);
            if let Err(e) = duration.to_duration() {
                ctx.field_error(e.to_string());
            }
            ctx.exit();
        }
        ctx.enter("workers");
        ctx.check(WorkerBoundsValidator::validate(
            global.pre_allocated_workers,
            global.max_workers,
        ));
        ctx.exit();
        ctx.exit(); // config

        ctx.enter("scenarios");
        if self.scenarios.is_empty() {
            ctx.field_error("At least one scenario must be defined");
        }
        let mut names = HashSet::new();
        for (idx, scenario) in self.scenarios.iter().enumerate() {
            ctx.enter_index(idx);
            self.validate_scenario(scenario, &mut ctx);
            if !names.insert(scenario.name.as_str()) {
                ctx.field_error(format!("Duplicate scenario name '{}'", scenario.name));
            }
            ctx.exit_index();
        }
        ctx.exit();

        ctx.enter("thresholds");
        for (idx, threshold) in self.thresholds.iter().enumerate() {
            ctx.enter_index(idx);
            if let Err(e) = threshold.to_rule() {
                ctx.field_error(e.to_string());
            }
            ctx.exit_index();
        }
        ctx.exit();

        ctx.into_result()
            .map_err(|e| YamlConfigError::Validation(e.to_string()))
    }

    fn validate_scenario(&self, scenario: &YamlScenario, ctx: &mut ValidationContext) {
        ctx.enter("name");
        if scenario.name.trim().is_empty() {
            ctx.field_error("Scenario name cannot be empty");
        }
        ctx.exit();

        ctx.enter("url");
        ctx.check(UrlValidator::validate(&scenario.url));
        ctx.exit();

        if let Some(start_rate) = scenario.start_rate {
            ctx.enter("startRate");
            ctx.check(RateValidator::validate(start_rate, "startRate"));
            ctx.exit();
        }

        ctx.enter("stages");
        match scenario.plan {
            Some(YamlPlanKind::Benchmark) if !scenario.stages.is_empty() => {
                ctx.field_error("Use either 'plan: benchmark' or explicit stages, not both");
            }
            Some(YamlPlanKind::Benchmark) if scenario.start_rate.is_some() => {
                ctx.field_error("startRate only applies to explicit stages; 'plan: benchmark' starts from 0");
            }
            Some(YamlPlanKind::Benchmark) => {
                for (field, value) in [
                    ("maxRps", scenario.max_rps),
                    ("warmupRps", scenario.warmup_rps),
                ] {
                    if let Some(rate) = value {
                        ctx.check(RateValidator::validate(rate, field));
                    }
                }
                if let Some(scale) = scenario.stage_scale {
                    if !scale.is_finite() || scale <= 0.0 {
                        ctx.field_error(format!("stageScale must be positive, got {}", scale));
                    }
                }
            }
            None if scenario.stages.is_empty() => {
                ctx.field_error(format!(
                    "Scenario '{}' needs at least one stage or 'plan: benchmark'",
                    scenario.name
                ));
            }
            None => {
                for (idx, stage) in scenario.stages.iter().enumerate() {
                    ctx.enter_index(idx);
                    match stage.duration.to_duration() {
                        Ok(d) if d.is_zero() => ctx.field_error("Stage duration must be positive"),
                        Ok(_) => {}
                        Err(e) => ctx.field_error(e.to_string()),
                    }
                    ctx.check(RateValidator::validate(stage.target, "target"));
                    ctx.exit_index();
                }
            }
        }
        ctx.exit();

        ctx.enter("workers");
        ctx.check(WorkerBoundsValidator::validate(
            scenario
                .pre_allocated_workers
                .unwrap_or(self.config.pre_allocated_workers),
            scenario.max_workers.unwrap_or(self.config.max_workers),
        ));
        ctx.exit();
    }

    /// Converts the validated file into a [`RunConfig`].
    pub fn to_run_config(&self) -> Result<RunConfig, YamlConfigError> {
        let global = &self.config;

        let targets = self
            .scenarios
            .iter()
            .map(|s| {
                Ok(TargetConfig {
                    name: s.name.clone(),
                    url: s.url.clone(),
                    tag: s.tag.clone(),
                    plan: s.to_plan()?,
                    preallocated_workers: s
                        .pre_allocated_workers
                        .unwrap_or(global.pre_allocated_workers),
                    max_workers: s.max_workers.unwrap_or(global.max_workers),
                })
            })
            .collect::<Result<Vec<_>, YamlConfigError>>()?;

        let method = HttpMethodValidator::parse(&global.method)
            .map_err(|e| YamlConfigError::Validation(e.to_string()))?;

        let client = ClientConfig {
            request_timeout: global.timeout.to_duration()?,
            skip_tls_verify: global.skip_tls_verify,
            resolve_target_addr: global.resolve_target_addr.clone(),
            custom_headers: global.custom_headers.clone(),
            ..ClientConfig::default()
        };

        let thresholds = self
            .thresholds
            .iter()
            .map(YamlThreshold::to_rule)
            .collect::<Result<Vec<_>, _>>()?;

        let config = RunConfig {
            targets,
            method,
            client,
            scenario: ScenarioSettings {
                tick_interval: global.tick_interval.to_duration()?,
                drain_timeout: global.drain_timeout.to_duration()?,
                expected_status: global.expected_status,
            },
            timeline: TimelineSettings {
                gap: global.gap.to_duration()?,
                safety_margin: global.safety_margin.to_duration()?,
            },
            thresholds,
            report: ReportOutputs {
                json: self.report.json.clone(),
                csv: self.report.csv.clone(),
            },
            metrics_port: global.metrics_port,
        };
        config.validate()?;
        Ok(config)
    }
}
