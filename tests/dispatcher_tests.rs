//! Integration tests for arrival dispatch against a ramp plan.

mod common;

use std::sync::Arc;

use common::MockEndpoint;
use gateway_loadtest::collector::MetricsCollector;
use gateway_loadtest::dispatcher::ArrivalDispatcher;
use gateway_loadtest::errors::FailureKind;
use gateway_loadtest::ramp_plan::{RampPlan, Stage};
use gateway_loadtest::worker_pool::{PoolConfig, WorkerPool};
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

fn setup(max_workers: usize, latency_ms: u64) -> (WorkerPool, Arc<MetricsCollector>) {
    let collector = Arc::new(MetricsCollector::new());
    collector.register("dispatch");
    let pool = WorkerPool::new(
        PoolConfig {
            scenario: Arc::from("dispatch"),
            preallocated_workers: 1,
            max_workers,
            expected_status: 200,
        },
        MockEndpoint::healthy(latency_ms),
        collector.clone(),
    );
    (pool, collector)
}

fn dispatcher(plan: RampPlan, tick_ms: u64, collector: &Arc<MetricsCollector>) -> ArrivalDispatcher {
    ArrivalDispatcher::new(
        Arc::from("dispatch"),
        plan,
        Duration::from_millis(tick_ms),
        collector.clone(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_ramp_dispatches_plan_integral() {
    let (pool, collector) = setup(100, 1);
    // 0 -> 20 over 2s, hold 20 for 1s, down to 0 over 2s: 20 + 20 + 20
    let plan = RampPlan::new(vec![
        Stage::secs(2.0, 20.0),
        Stage::secs(1.0, 20.0),
        Stage::secs(2.0, 0.0),
    ])
    .unwrap();

    let (_tx, rx) = watch::channel(false);
    let started = Instant::now();
    let stats = dispatcher(plan, 50, &collector).run(&pool, rx).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5_010));
    pool.wait_idle().await;

    assert!((59..=60).contains(&stats.dispatched), "dispatched {}", stats.dispatched);
    assert_eq!(stats.saturated, 0);
    assert!(!stats.interrupted);
    assert_eq!(collector.count("dispatch"), stats.dispatched);
}

#[tokio::test(start_paused = true)]
async fn test_tick_size_does_not_change_total() {
    let plan = RampPlan::constant(7.0, Duration::from_secs(3)).unwrap();
    let mut totals = Vec::new();
    for tick_ms in [10, 100, 1000] {
        let (pool, collector) = setup(50, 1);
        let (_tx, rx) = watch::channel(false);
        let stats = dispatcher(plan.clone(), tick_ms, &collector).run(&pool, rx).await;
        totals.push(stats.arrivals());
    }
    for total in totals {
        assert!((20..=21).contains(&total), "total {}", total);
    }
}

#[tokio::test(start_paused = true)]
async fn test_saturation_recorded_without_latency() {
    let (pool, collector) = setup(1, 5);
    let plan = RampPlan::constant(50.0, Duration::from_secs(1)).unwrap();

    let (_tx, rx) = watch::channel(false);
    let stats = dispatcher(plan, 100, &collector).run(&pool, rx).await;
    pool.wait_idle().await;

    // One worker, five arrivals per tick: one starts, four are dropped.
    assert!((9..=10).contains(&stats.dispatched), "dispatched {}", stats.dispatched);
    assert!(stats.saturated >= 39, "saturated {}", stats.saturated);

    let snapshot = collector.snapshot("dispatch");
    assert_eq!(snapshot.failures_of(FailureKind::PoolSaturated), stats.saturated);
    assert_eq!(snapshot.latencies_us.len() as u64, stats.dispatched);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_dispatch_early() {
    let (pool, collector) = setup(10, 1);
    let plan = RampPlan::constant(10.0, Duration::from_secs(10)).unwrap();
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        time::sleep(Duration::from_millis(2_050)).await;
        let _ = tx.send(true);
    });

    let started = Instant::now();
    let stats = dispatcher(plan, 100, &collector).run(&pool, rx).await;
    assert!(stats.interrupted);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!((19..=21).contains(&stats.dispatched), "dispatched {}", stats.dispatched);
}
