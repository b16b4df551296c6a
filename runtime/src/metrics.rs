//! Prometheus metrics for the dispatch engine.
//!
//! Recorded by:
//! - the transition protocol (transitions and their latency)
//! - the claim coordinator (claims by outcome)
//! - the retry loop (transaction retries and exhausted budgets)
//! - the batch orchestrator (batches and per-item results)
//!
//! Recording is a no-op until a recorder is installed, so library code records
//! unconditionally and only binaries call [`MetricsServer::start`].
//!
//! # Example
//!
//! ```rust,no_run
//! use ride_dispatch_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use ride_dispatch_core::{DispatchError, RideState};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions, install the recorder and start serving
    /// `/metrics` on the configured address.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g. by another test), this logs a
    /// warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!("Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "dispatch_transitions_total",
        "Committed ride state transitions, labelled by from and to state"
    );
    describe_histogram!(
        "dispatch_transition_duration_seconds",
        "Time taken by a transition including retries"
    );
    describe_counter!(
        "dispatch_claims_total",
        "Claim attempts, labelled by outcome"
    );
    describe_counter!(
        "dispatch_transaction_retries_total",
        "Transaction attempts re-run after a conflict or unavailable store"
    );
    describe_counter!(
        "dispatch_transaction_exhausted_total",
        "Transactions that ran out of retry budget"
    );
    describe_counter!(
        "dispatch_batch_claims_total",
        "Batch claim requests, labelled by result"
    );
    describe_counter!(
        "dispatch_batch_items_total",
        "Individual rides processed by batch claims, labelled by result"
    );
    describe_counter!(
        "dispatch_store_commits_total",
        "Document store commits, labelled by outcome"
    );
    describe_histogram!(
        "dispatch_store_commit_duration_seconds",
        "Time taken by a successful document store commit"
    );
}

/// Transition metrics recorder.
pub struct TransitionMetrics;

impl TransitionMetrics {
    /// Record a committed transition.
    pub fn record(from: RideState, to: RideState, duration: Duration) {
        counter!(
            "dispatch_transitions_total",
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        histogram!("dispatch_transition_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Claim metrics recorder.
pub struct ClaimMetrics;

impl ClaimMetrics {
    /// Record a claim, undo or similar coordinator outcome.
    pub fn record(operation: &'static str, result: &Result<impl Sized, DispatchError>) {
        counter!(
            "dispatch_claims_total",
            "operation" => operation,
            "outcome" => outcome_label(result)
        )
        .increment(1);
    }
}

/// Transaction retry metrics recorder.
pub struct TransactionMetrics;

impl TransactionMetrics {
    /// Record a re-run attempt.
    pub fn record_retry(operation: &'static str) {
        counter!("dispatch_transaction_retries_total", "operation" => operation).increment(1);
    }

    /// Record an exhausted retry budget.
    pub fn record_exhausted(operation: &'static str) {
        counter!("dispatch_transaction_exhausted_total", "operation" => operation).increment(1);
    }
}

/// Batch claim metrics recorder.
pub struct BatchMetrics;

impl BatchMetrics {
    /// Record a batch rejected by the eligibility gate.
    pub fn record_rejected() {
        counter!("dispatch_batch_claims_total", "result" => "rejected").increment(1);
    }

    /// Record a finished batch and its per-item results.
    pub fn record_completed(succeeded: usize, failed: usize, skipped: usize) {
        counter!("dispatch_batch_claims_total", "result" => "completed").increment(1);
        counter!("dispatch_batch_items_total", "result" => "succeeded").increment(succeeded as u64);
        counter!("dispatch_batch_items_total", "result" => "failed").increment(failed as u64);
        counter!("dispatch_batch_items_total", "result" => "skipped").increment(skipped as u64);
    }
}

/// Stable label for an operation result.
#[must_use]
pub const fn outcome_label<T>(result: &Result<T, DispatchError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(DispatchError::NotFound(_)) => "not_found",
        Err(DispatchError::NotOpen { .. }) => "not_open",
        Err(DispatchError::AlreadyClaimed { .. }) => "already_claimed",
        Err(DispatchError::NotClaimedByYou { .. }) => "not_claimed_by_you",
        Err(DispatchError::StateMismatch { .. }) => "state_mismatch",
        Err(DispatchError::ClaimingClosed) => "claiming_closed",
        Err(DispatchError::Conflict { .. }) => "conflict",
        Err(DispatchError::StoreUnavailable(_)) => "unavailable",
        Err(_) => "error",
    }
}
