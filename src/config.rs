use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::Duration;

use crate::client::{ClientConfig, HttpEndpoint};
use crate::config_validation::{HttpMethodValidator, UrlValidator, WorkerBoundsValidator};
use crate::errors::ConfigError;
use crate::ramp_plan::RampPlan;
use crate::scenario::{ScenarioSettings, ScenarioSpec};
use crate::thresholds::ThresholdRule;
use crate::timeline::TimelineSettings;
use crate::utils::{parse_duration_string, parse_target_list};
use crate::yaml_config::{YamlConfig, YamlConfigError};

pub const DEFAULT_YARP_URL: &str = "http://localhost:8001/api/test";
pub const DEFAULT_OCELOT_URL: &str = "http://localhost:8000/api/test";

/// Either source of configuration failed.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Env(#[from] ConfigError),

    #[error(transparent)]
    Yaml(#[from] YamlConfigError),
}

/// One endpoint under test and the load it gets.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetConfig {
    pub name: String,
    pub url: String,
    pub tag: Option<String>,
    pub plan: RampPlan,
    pub preallocated_workers: usize,
    pub max_workers: usize,
}

/// Where the report goes besides stdout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportOutputs {
    pub json: Option<PathBuf>,
    pub csv: Option<PathBuf>,
}

/// Fully validated configuration for a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub targets: Vec<TargetConfig>,
    pub method: reqwest::Method,
    pub client: ClientConfig,
    pub scenario: ScenarioSettings,
    pub timeline: TimelineSettings,
    pub thresholds: Vec<ThresholdRule>,
    pub report: ReportOutputs,
    pub metrics_port: Option<u16>,
}

impl RunConfig {
    /// Reads `CONFIG_FILE` if set, otherwise the environment.
    pub fn load() -> Result<Self, LoadError> {
        match env::var("CONFIG_FILE") {
            Ok(path) if !path.trim().is_empty() => {
                Ok(YamlConfig::from_file(path.trim())?.to_run_config()?)
            }
            _ => Ok(Self::from_env()?),
        }
    }

    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_rps: f64 = env_parse("MAX_RPS", 2000.0)?;
        let warmup_rps = match env_opt::<f64>("WARMUP_FRACTION")? {
            Some(fraction) => {
                if !(0.0..=1.0).contains(&fraction) {
                    return Err(invalid("WARMUP_FRACTION", format!("{} is not within 0..=1", fraction)));
                }
                (max_rps * fraction).round()
            }
            None => env_parse("WARMUP_RPS", 50f64.max((max_rps * 0.1).round()))?,
        };
        let stage_scale: f64 = env_parse("STAGE_SCALE", 1.0)?;
        if !stage_scale.is_finite() || stage_scale <= 0.0 {
            return Err(invalid("STAGE_SCALE", "must be a positive number".to_string()));
        }
        let plan = RampPlan::gateway_benchmark(max_rps, warmup_rps, stage_scale)?;

        let preallocated_workers: usize = env_parse("PRE_VUS", 200)?;
        let default_max = 1000usize.max((max_rps * 2.0).ceil() as usize);
        let max_workers: usize = env_parse("MAX_VUS", default_max)?;

        let targets = target_list()?
            .into_iter()
            .map(|(name, url)| TargetConfig {
                tag: Some(name.clone()),
                name,
                url,
                plan: plan.clone(),
                preallocated_workers,
                max_workers,
            })
            .collect::<Vec<_>>();

        let method_str = env::var("REQUEST_METHOD").unwrap_or_else(|_| "GET".to_string());
        let method = HttpMethodValidator::parse(&method_str)
            .map_err(|e| invalid("REQUEST_METHOD", e.to_string()))?;

        let client = ClientConfig {
            request_timeout: env_duration("REQUEST_TIMEOUT", Duration::from_secs(30))?,
            skip_tls_verify: env_bool("SKIP_TLS_VERIFY", false)?,
            resolve_target_addr: env::var("RESOLVE_TARGET_ADDR").ok(),
            custom_headers: env::var("CUSTOM_HEADERS").ok(),
            ..ClientConfig::default()
        };

        let scenario = ScenarioSettings {
            tick_interval: env_duration("TICK_INTERVAL", Duration::from_millis(100))?,
            drain_timeout: env_duration("DRAIN_TIMEOUT", Duration::from_secs(30))?,
            expected_status: env_parse("EXPECTED_STATUS", 200)?,
        };

        let gap_secs: f64 = env_parse("GAP_SEC", 5.0)?;
        let gap = Duration::try_from_secs_f64(gap_secs)
            .map_err(|e| invalid("GAP_SEC", e.to_string()))?;
        let timeline = TimelineSettings {
            gap,
            safety_margin: env_duration("SAFETY_MARGIN", Duration::from_secs(5))?,
        };

        let failure_rate_max: f64 = env_parse("FAILURE_RATE_MAX", 0.01)?;
        let p95_ms_max: f64 = env_parse("P95_LATENCY_MS_MAX", 50.0)?;
        let fatal = env_bool("THRESHOLDS_FATAL", true)?;
        let thresholds = default_thresholds(&targets, failure_rate_max, p95_ms_max, fatal)?;

        let report = ReportOutputs {
            json: env_opt::<String>("REPORT_JSON")?.map(PathBuf::from),
            csv: env_opt::<String>("REPORT_CSV")?.map(PathBuf::from),
        };

        let config = RunConfig {
            targets,
            method,
            client,
            scenario,
            timeline,
            thresholds,
            report,
            metrics_port: env_opt("METRICS_PORT")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks shared by both configuration sources.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoScenarios);
        }
        for target in &self.targets {
            let invalid = |message: String| ConfigError::InvalidScenario {
                scenario: target.name.clone(),
                message,
            };
            UrlValidator::validate(&target.url).map_err(|e| invalid(e.to_string()))?;
            WorkerBoundsValidator::validate(target.preallocated_workers, target.max_workers)
                .map_err(|e| invalid(e.to_string()))?;
        }
        self.scenario.validate()
    }

    /// Builds one scenario per target, all sharing `client`.
    pub fn scenario_specs(&self, client: &reqwest::Client) -> Vec<ScenarioSpec> {
        self.targets
            .iter()
            .map(|target| {
                let endpoint =
                    HttpEndpoint::new(client.clone(), self.method.clone(), target.url.clone());
                let mut spec = ScenarioSpec::new(target.name.clone(), target.plan.clone(), Arc::new(endpoint))
                    .with_workers(target.preallocated_workers, target.max_workers);
                spec.tag = target.tag.clone();
                spec
            })
            .collect()
    }

    /// Prints the configuration summary.
    pub fn print_summary(&self) {
        println!("Starting comparative load test:");
        println!("  Request: {} (expect HTTP {})", self.method, self.scenario.expected_status);
        println!("  Request timeout: {:?}", self.client.request_timeout);
        println!(
            "  Tick: {:?}  Drain timeout: {:?}  Gap: {:?}",
            self.scenario.tick_interval, self.scenario.drain_timeout, self.timeline.gap
        );
        println!("  Skip TLS Verify: {}", self.client.skip_tls_verify);
        for target in &self.targets {
            println!("  Scenario '{}' -> {}", target.name, target.url);
            println!("    Plan: {}", target.plan);
            println!(
                "    Workers: {} preallocated, {} max",
                target.preallocated_workers, target.max_workers
            );
        }
        if self.thresholds.is_empty() {
            println!("  Thresholds: none");
        } else {
            println!("  Thresholds:");
            for rule in &self.thresholds {
                println!(
                    "    {}{}",
                    rule,
                    if rule.fatal { "" } else { " (non-fatal)" }
                );
            }
        }
    }
}

/// Failure-rate and p95 rules for every target, keyed the way the k6
/// benchmark declares them.
pub fn default_thresholds(
    targets: &[TargetConfig],
    failure_rate_max: f64,
    p95_ms_max: f64,
    fatal: bool,
) -> Result<Vec<ThresholdRule>, ConfigError> {
    let mut rules = Vec::with_capacity(targets.len() * 2);
    for target in targets {
        let tag = target.tag.as_deref().unwrap_or(&target.name);
        rules.push(ThresholdRule::parse(
            &format!("http_req_failed{{gateway:{}}}", tag),
            &format!("rate<{}", failure_rate_max),
            fatal,
        )?);
        rules.push(ThresholdRule::parse(
            &format!("{}_latency", target.name),
            &format!("p(95)<{}", p95_ms_max),
            fatal,
        )?);
    }
    Ok(rules)
}

fn target_list() -> Result<Vec<(String, String)>, ConfigError> {
    match env::var("TARGETS") {
        Ok(list) if !list.trim().is_empty() => {
            parse_target_list(&list).map_err(|e| invalid("TARGETS", e))
        }
        _ => Ok(vec![
            (
                "yarp".to_string(),
                env::var("YARP_URL").unwrap_or_else(|_| DEFAULT_YARP_URL.to_string()),
            ),
            (
                "ocelot".to_string(),
                env::var("OCELOT_URL").unwrap_or_else(|_| DEFAULT_OCELOT_URL.to_string()),
            ),
        ]),
    }
}

fn invalid(field: &str, message: String) -> ConfigError {
    ConfigError::InvalidSetting {
        field: field.to_string(),
        message,
    }
}

fn env_opt<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(name, format!("'{}': {}", raw, e))),
        _ => Ok(None),
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    Ok(env_opt(name)?.unwrap_or(default))
}

fn env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "" => Ok(default),
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(invalid(name, format!("'{}' is not a boolean", other))),
        },
        Err(_) => Ok(default),
    }
}

fn env_duration(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            parse_duration_string(&raw).map_err(|e| invalid(name, e))
        }
        _ => Ok(default),
    }
}
