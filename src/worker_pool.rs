//! Bounded, growable pool of reusable request workers.
//!
//! Each worker is a tokio task that owns a capacity-1 assignment channel and
//! runs at most one request at a time. The pool starts with
//! `preallocated_workers` idle workers and grows on demand up to
//! `max_workers`; beyond that `submit` fails fast with
//! [`SubmitError::Saturated`] instead of queueing.
//!
//! Worker slots, the idle list and the in-flight registry live under one
//! lock. A request is accounted for exactly once: whoever removes its ticket
//! from the registry (the worker on completion, or `cancel_outstanding`)
//! records its sample, and the other side drops its result.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::client::{Endpoint, EndpointResponse};
use crate::collector::{MetricsCollector, Outcome, Sample};
use crate::errors::{CategorizedError, ErrorCategory, FailureReason};
use crate::metrics::{IN_FLIGHT_REQUESTS, POOL_WORKERS, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};

/// Why a submission was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker pool saturated: every worker is busy and the pool is at max_workers")]
    Saturated,

    #[error("worker pool has been shut down")]
    Closed,
}

/// Static settings for one pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub scenario: Arc<str>,
    pub preallocated_workers: usize,
    pub max_workers: usize,
    /// Status that counts as success. Anything else is an endpoint failure.
    pub expected_status: u16,
}

#[derive(Debug, Clone, Copy)]
struct Assignment {
    ticket: u64,
    offset: Duration,
}

struct WorkerSlot {
    tx: mpsc::Sender<Assignment>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PoolState {
    workers: Vec<WorkerSlot>,
    idle: Vec<usize>,
    /// ticket -> offset at which the request started.
    in_flight: HashMap<u64, Duration>,
    next_ticket: u64,
    peak_workers: usize,
    closed: bool,
}

struct Shared {
    config: PoolConfig,
    endpoint: Arc<dyn Endpoint>,
    collector: Arc<MetricsCollector>,
    state: Mutex<PoolState>,
    in_flight_tx: watch::Sender<usize>,
}

/// Pool of workers bound to one scenario's endpoint and collector.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Creates the pool and spawns the preallocated workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: PoolConfig,
        endpoint: Arc<dyn Endpoint>,
        collector: Arc<MetricsCollector>,
    ) -> Self {
        let (in_flight_tx, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            config,
            endpoint,
            collector,
            state: Mutex::new(PoolState::default()),
            in_flight_tx,
        });

        {
            let mut state = shared.state.lock();
            let preallocated = shared
                .config
                .preallocated_workers
                .min(shared.config.max_workers);
            for _ in 0..preallocated {
                let index = spawn_worker(&shared, &mut state);
                state.idle.push(index);
            }
        }

        debug!(
            scenario = %shared.config.scenario,
            preallocated = shared.config.preallocated_workers,
            max = shared.config.max_workers,
            "Worker pool created"
        );

        Self { shared }
    }

    /// Hands one request start to an idle worker, growing the pool if needed.
    ///
    /// Never blocks. Returns the ticket of the started request.
    pub fn submit(&self) -> Result<u64, SubmitError> {
        let shared = &self.shared;
        let offset = shared.collector.offset_of(Instant::now());
        let mut state = shared.state.lock();

        if state.closed {
            return Err(SubmitError::Closed);
        }

        let index = match state.idle.pop() {
            Some(index) => index,
            None if state.workers.len() < shared.config.max_workers => {
                spawn_worker(shared, &mut state)
            }
            None => return Err(SubmitError::Saturated),
        };

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let assignment = Assignment { ticket, offset };

        if state.workers[index].tx.try_send(assignment).is_err() {
            // The worker's task is gone; put a fresh one in its slot.
            warn!(scenario = %shared.config.scenario, worker = index, "Replacing dead worker");
            let replacement = new_slot(shared, index);
            let old = std::mem::replace(&mut state.workers[index], replacement);
            old.handle.abort();
            if state.workers[index].tx.try_send(assignment).is_err() {
                state.idle.push(index);
                return Err(SubmitError::Closed);
            }
        }

        state.in_flight.insert(ticket, offset);
        shared.publish_in_flight(&state);
        Ok(ticket)
    }

    /// Records every outstanding request as `Failure(reason)` with no latency.
    ///
    /// Workers still running those requests will drop their results when
    /// they finish. Returns how many requests were cancelled.
    pub fn cancel_outstanding(&self, reason: FailureReason) -> usize {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        shared.cancel_locked(&mut state, reason)
    }

    /// Cancels outstanding requests as `Cancelled`, closes the pool and
    /// aborts every worker task.
    pub fn shutdown(&self) -> usize {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.closed {
            return 0;
        }
        state.closed = true;
        let cancelled = shared.cancel_locked(&mut state, FailureReason::Cancelled);

        let workers = std::mem::take(&mut state.workers);
        state.idle.clear();
        for slot in workers {
            slot.handle.abort();
        }
        POOL_WORKERS
            .with_label_values(&[&*shared.config.scenario])
            .set(0);

        debug!(
            scenario = %shared.config.scenario,
            cancelled = cancelled,
            "Worker pool shut down"
        );
        cancelled
    }

    /// Resolves once nothing is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.in_flight_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers.len()
    }

    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    /// Largest worker count the pool ever reached.
    pub fn peak_workers(&self) -> usize {
        self.shared.state.lock().peak_workers
    }

    pub fn max_workers(&self) -> usize {
        self.shared.config.max_workers
    }

    pub fn scenario(&self) -> &Arc<str> {
        &self.shared.config.scenario
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn publish_in_flight(&self, state: &PoolState) {
        let n = state.in_flight.len();
        self.in_flight_tx.send_replace(n);
        IN_FLIGHT_REQUESTS
            .with_label_values(&[&*self.config.scenario])
            .set(n as i64);
    }

    fn cancel_locked(&self, state: &mut PoolState, reason: FailureReason) -> usize {
        if state.in_flight.is_empty() {
            return 0;
        }
        let label = reason.kind().label();
        let mut cancelled: Vec<(u64, Duration)> = state.in_flight.drain().collect();
        cancelled.sort_unstable_by_key(|(ticket, _)| *ticket);
        let count = cancelled.len();

        self.collector.record_all(cancelled.into_iter().map(|(_, offset)| {
            Sample::unmeasured(self.config.scenario.clone(), offset, reason.clone())
        }));
        REQUESTS_TOTAL
            .with_label_values(&[&*self.config.scenario, label])
            .inc_by(count as u64);

        self.publish_in_flight(state);
        count
    }

    /// Called by a worker when its request returns.
    fn complete(&self, index: usize, assignment: Assignment, response: EndpointResponse) {
        let sample = self.sample_for(assignment.offset, response);
        let mut state = self.state.lock();

        if state.in_flight.remove(&assignment.ticket).is_some() {
            let label = match &sample.outcome {
                Outcome::Success => "success",
                Outcome::Failure(reason) => reason.kind().label(),
            };
            REQUESTS_TOTAL
                .with_label_values(&[&*self.config.scenario, label])
                .inc();
            if let Some(latency) = sample.latency {
                REQUEST_DURATION_SECONDS
                    .with_label_values(&[&*self.config.scenario])
                    .observe(latency.as_secs_f64());
            }
            self.collector.record(sample);
            self.publish_in_flight(&state);
        } else {
            debug!(
                scenario = %self.config.scenario,
                ticket = assignment.ticket,
                "Dropping result of cancelled request"
            );
        }

        if !state.closed {
            state.idle.push(index);
        }
    }

    fn sample_for(&self, offset: Duration, response: EndpointResponse) -> Sample {
        let scenario = self.config.scenario.clone();
        let latency = Some(response.elapsed);
        let expected = self.config.expected_status;

        let error = match (response.error, response.status) {
            (Some(error), _) => error,
            (None, Some(status)) if status == expected => {
                return Sample::success(scenario, offset, response.elapsed);
            }
            (None, Some(status)) => CategorizedError::unexpected_status(status, expected),
            (None, None) => {
                CategorizedError::new(ErrorCategory::OtherError, "endpoint returned no status")
            }
        };
        Sample::failure(scenario, offset, latency, FailureReason::Endpoint(error))
    }
}

fn new_slot(shared: &Arc<Shared>, index: usize) -> WorkerSlot {
    let (tx, rx) = mpsc::channel(1);
    let handle = tokio::spawn(run_worker(shared.clone(), index, rx));
    WorkerSlot { tx, handle }
}

fn spawn_worker(shared: &Arc<Shared>, state: &mut PoolState) -> usize {
    let index = state.workers.len();
    state.workers.push(new_slot(shared, index));
    state.peak_workers = state.peak_workers.max(state.workers.len());
    POOL_WORKERS
        .with_label_values(&[&*shared.config.scenario])
        .set(state.workers.len() as i64);
    index
}

async fn run_worker(shared: Arc<Shared>, index: usize, mut rx: mpsc::Receiver<Assignment>) {
    debug!(scenario = %shared.config.scenario, worker = index, "Worker started");

    while let Some(assignment) = rx.recv().await {
        let response = shared.endpoint.send().await;
        if let Some(error) = &response.error {
            debug!(
                scenario = %shared.config.scenario,
                worker = index,
                error = %error,
                "Request failed"
            );
        }
        shared.complete(index, assignment, response);
    }

    debug!(scenario = %shared.config.scenario, worker = index, "Worker stopped");
}
