//! Shared mock endpoints for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Duration;

use gateway_loadtest::client::{Endpoint, EndpointResponse};
use gateway_loadtest::ramp_plan::RampPlan;
use gateway_loadtest::scenario::ScenarioSpec;

/// Answers every request with `status` after `latency`.
#[derive(Debug)]
pub struct MockEndpoint {
    pub latency: Duration,
    pub status: u16,
    calls: AtomicUsize,
}

impl MockEndpoint {
    pub fn new(latency: Duration, status: u16) -> Arc<Self> {
        Arc::new(Self {
            latency,
            status,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn healthy(latency_ms: u64) -> Arc<Self> {
        Self::new(Duration::from_millis(latency_ms), 200)
    }

    /// Never answers within any realistic drain timeout.
    pub fn hung() -> Arc<Self> {
        Self::new(Duration::from_secs(3600), 200)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn describe(&self) -> String {
        format!("mock {} after {:?}", self.status, self.latency)
    }

    async fn send(&self) -> EndpointResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        EndpointResponse::status(self.status, self.latency)
    }
}

/// Freezes the generator on the first request by jumping the paused clock
/// forward by `stall`, then never answers. Only usable on a paused clock.
#[derive(Debug)]
pub struct StallingEndpoint {
    stall: Duration,
    stalled: AtomicBool,
}

impl StallingEndpoint {
    pub fn new(stall: Duration) -> Arc<Self> {
        Arc::new(Self {
            stall,
            stalled: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Endpoint for StallingEndpoint {
    fn describe(&self) -> String {
        format!("stall {:?}", self.stall)
    }

    async fn send(&self) -> EndpointResponse {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::advance(self.stall).await;
        }
        std::future::pending().await
    }
}

/// Scenario holding `rate` requests per second for `secs` seconds.
pub fn constant_spec(
    name: &str,
    rate: f64,
    secs: u64,
    endpoint: Arc<MockEndpoint>,
    max_workers: usize,
) -> ScenarioSpec {
    ScenarioSpec::new(
        name,
        RampPlan::constant(rate, Duration::from_secs(secs)).unwrap(),
        endpoint,
    )
    .with_workers(1, max_workers)
}
