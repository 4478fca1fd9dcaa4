use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gateway_loadtest::client::build_client;
use gateway_loadtest::collector::MetricsCollector;
use gateway_loadtest::config::RunConfig;
use gateway_loadtest::metrics::{register_metrics, start_metrics_server};
use gateway_loadtest::report::RunReport;
use gateway_loadtest::thresholds::ThresholdEvaluator;
use gateway_loadtest::timeline::TimelineScheduler;

/// Exit code for configuration errors.
const EXIT_CONFIG_ERROR: i32 = 1;

/// Prints helpful configuration documentation.
fn print_config_help() {
    eprintln!("Targets (one scenario each, run one after another):");
    eprintln!("  TARGETS                 - Comma-separated name=url pairs");
    eprintln!("  YARP_URL                - Used when TARGETS is unset (default: http://localhost:8001/api/test)");
    eprintln!("  OCELOT_URL              - Used when TARGETS is unset (default: http://localhost:8000/api/test)");
    eprintln!("  CONFIG_FILE             - YAML config file; replaces every variable below");
    eprintln!();
    eprintln!("Load shape (five-stage benchmark: warmup, half, peak, spike, ramp-down):");
    eprintln!("  MAX_RPS                 - Peak arrival rate (default: 2000)");
    eprintln!("  WARMUP_RPS              - Warmup rate (default: max(50, 10% of MAX_RPS))");
    eprintln!("  WARMUP_FRACTION         - Warmup as a fraction of MAX_RPS; overrides WARMUP_RPS");
    eprintln!("  STAGE_SCALE             - Multiplier for every stage duration (default: 1.0)");
    eprintln!("  PRE_VUS                 - Workers started up front (default: 200)");
    eprintln!("  MAX_VUS                 - Worker ceiling (default: max(1000, 2*MAX_RPS))");
    eprintln!();
    eprintln!("Timing:");
    eprintln!("  GAP_SEC                 - Seconds between scenarios (default: 5)");
    eprintln!("  DRAIN_TIMEOUT           - Wait for in-flight requests after a plan ends (default: 30s)");
    eprintln!("  SAFETY_MARGIN           - Extra budget before a scenario is forced (default: 5s)");
    eprintln!("  TICK_INTERVAL           - Dispatch tick, 10ms to 1s (default: 100ms)");
    eprintln!();
    eprintln!("Requests:");
    eprintln!("  REQUEST_METHOD          - HTTP method (default: GET)");
    eprintln!("  REQUEST_TIMEOUT         - Per-request timeout (default: 30s)");
    eprintln!("  EXPECTED_STATUS         - Status counted as success (default: 200)");
    eprintln!("  SKIP_TLS_VERIFY         - Skip TLS certificate verification (default: false)");
    eprintln!("  RESOLVE_TARGET_ADDR     - DNS override: hostname:ip:port");
    eprintln!("  CUSTOM_HEADERS          - Comma-separated headers (use \\, for literal commas)");
    eprintln!();
    eprintln!("Thresholds and output:");
    eprintln!("  FAILURE_RATE_MAX        - Per-target failure rate bound (default: 0.01)");
    eprintln!("  P95_LATENCY_MS_MAX      - Per-target p95 bound in ms (default: 50)");
    eprintln!("  THRESHOLDS_FATAL        - Fail the run (exit 99) on violation (default: true)");
    eprintln!("  REPORT_JSON             - Write the JSON report to this path");
    eprintln!("  REPORT_CSV              - Write the CSV report to this path");
    eprintln!("  METRICS_PORT            - Serve live Prometheus metrics on this port");
    eprintln!("  METRIC_NAMESPACE        - Prometheus metric prefix (default: gateway_loadtest)");
    eprintln!("  LOG_FORMAT              - 'json' for JSON logs; filter with RUST_LOG (default: info)");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn config_error(e: impl std::fmt::Display) -> ! {
    eprintln!("Configuration error: {}\n", e);
    print_config_help();
    std::process::exit(EXIT_CONFIG_ERROR);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = match RunConfig::load() {
        Ok(c) => c,
        Err(e) => config_error(e),
    };

    let client = match build_client(&config.client) {
        Ok(c) => c,
        Err(e) => config_error(e),
    };

    let collector = Arc::new(MetricsCollector::new());
    let scheduler = match TimelineScheduler::new(
        config.scenario_specs(&client),
        config.timeline,
        config.scenario,
        collector.clone(),
    ) {
        Ok(s) => s,
        Err(e) => config_error(e),
    };

    let evaluator = ThresholdEvaluator::new(config.thresholds.clone());
    if let Err(e) = evaluator.validate_against(&scheduler.scenario_names(), &scheduler.scenario_tags()) {
        config_error(e);
    }

    config.print_summary();

    register_metrics()?;
    if let Some(port) = config.metrics_port {
        let registry = prometheus::default_registry().clone();
        tokio::spawn(async move {
            start_metrics_server(port, registry).await;
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current scenario is cancelled");
            let _ = shutdown_tx.send(true);
        }
    });

    info!(
        planned_total_secs = scheduler.planned_total().as_secs_f64(),
        "Starting timeline"
    );
    let outcomes = scheduler.run(shutdown_rx).await;

    let results = evaluator.evaluate(&collector, &outcomes);
    let report = RunReport::build(&collector, &outcomes, results);
    println!("{}", report.render_summary());

    if let Some(path) = &config.report.json {
        match report.write_json(path) {
            Ok(()) => info!(path = %path.display(), "JSON report written"),
            Err(e) => error!(error = %e, "Failed to write JSON report"),
        }
    }
    if let Some(path) = &config.report.csv {
        match report.write_csv(path) {
            Ok(()) => info!(path = %path.display(), "CSV report written"),
            Err(e) => error!(error = %e, "Failed to write CSV report"),
        }
    }

    let code = report.exit_code();
    if code != 0 {
        warn!(exit_code = code, "Fatal thresholds failed");
    }
    std::process::exit(code);
}
