//! Live Prometheus gauges and counters for a run in progress.
//!
//! These are not the source of truth for the report; the
//! [`MetricsCollector`](crate::collector::MetricsCollector) is. They exist so
//! a run can be watched from Grafana while it is still going.

use std::env;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "gateway_loadtest".to_string());

    pub static ref REQUESTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_total", "Total number of recorded request attempts")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["scenario", "outcome"]  // outcome: success, endpoint_error, pool_saturated, ...
        ).unwrap();

    pub static ref POOL_SATURATED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("pool_saturated_total", "Arrivals dropped because the worker pool was full")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["scenario"]
        ).unwrap();

    pub static ref IN_FLIGHT_REQUESTS: IntGaugeVec =
        IntGaugeVec::new(
            Opts::new("in_flight_requests", "Requests currently outstanding")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["scenario"]
        ).unwrap();

    pub static ref POOL_WORKERS: IntGaugeVec =
        IntGaugeVec::new(
            Opts::new("pool_workers", "Workers currently allocated to the scenario's pool")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["scenario"]
        ).unwrap();

    pub static ref REQUEST_DURATION_SECONDS: HistogramVec =
        HistogramVec::new(
            HistogramOpts::new(
                "request_duration_seconds",
                "Measured request latencies in seconds."
            ).namespace(METRIC_NAMESPACE.as_str()),
            &["scenario"]
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(REQUESTS_TOTAL.clone()))?;
    registry.register(Box::new(POOL_SATURATED_TOTAL.clone()))?;
    registry.register(Box::new(IN_FLIGHT_REQUESTS.clone()))?;
    registry.register(Box::new(POOL_WORKERS.clone()))?;
    registry.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    Ok(())
}

/// Encodes every metric family in `registry` in the text exposition format.
pub fn encode_metrics(registry: &Registry) -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(buffer)
}

async fn metrics_handler(
    _req: Request<Body>,
    registry: Registry,
) -> Result<Response<Body>, hyper::Error> {
    let response = match encode_metrics(&registry) {
        Ok(buffer) => Response::builder()
            .status(200)
            .header("Content-Type", TextEncoder::new().format_type())
            .body(Body::from(buffer)),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            Response::builder()
                .status(500)
                .body(Body::from(e.to_string()))
        }
    };

    Ok(response.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serves `/metrics` (any path, really) until the process exits.
pub async fn start_metrics_server(port: u16, registry: Registry) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                metrics_handler(req, registry.clone())
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(port = port, error = %e, "Metrics server failed to bind");
            return;
        }
    };
    info!(port = port, addr = %addr, "Metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics_includes_scenario_labels() {
        let registry = Registry::new();
        registry.register(Box::new(REQUESTS_TOTAL.clone())).unwrap();
        REQUESTS_TOTAL
            .with_label_values(&["metrics-unit", "success"])
            .inc();

        let text = String::from_utf8(encode_metrics(&registry).unwrap()).unwrap();
        assert!(text.contains("requests_total"));
        assert!(text.contains("scenario=\"metrics-unit\""));
    }
}
