//! Prometheus metrics for the consumer pipeline.
//!
//! Two pieces live here:
//!
//! - [`MetricsMeter`]: a [`Meter`] that forwards counters to the `metrics` facade. The
//!   consumer only ever sees the injected `Meter`, so tests can swap in a recording meter.
//! - [`MetricsServer`]: installs the Prometheus recorder and serves the scrape endpoint.
//!   This is process bootstrap and belongs in binaries, not libraries.
//!
//! # Example
//!
//! ```rust,no_run
//! use drainpipe_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use drainpipe_core::telemetry::{KeyValue, Meter};
use metrics::{Label, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

/// Counter names emitted by the consumer.
pub mod names {
    /// Events returned by the subscription
    pub const MESSAGES_FETCHED: &str = "consumer_messages_fetched_total";
    /// Failed fetch calls
    pub const FETCH_ERRORS: &str = "consumer_fetch_errors_total";
    /// Events whose handler eventually succeeded
    pub const MESSAGES_PROCESSED: &str = "consumer_messages_processed_total";
    /// Handler calls beyond the first for one event
    pub const HANDLER_RETRIES: &str = "consumer_handler_retries_total";
    /// Events published to the dead-letter topic
    pub const MESSAGES_DEAD_LETTERED: &str = "consumer_messages_dead_lettered_total";
    /// Dead-letter publishes that failed after retrying
    pub const DEAD_LETTER_ERRORS: &str = "consumer_dead_letter_errors_total";
    /// Successful acknowledgements
    pub const COMMITS: &str = "consumer_commits_total";
    /// Failed acknowledgements
    pub const COMMIT_ERRORS: &str = "consumer_commit_errors_total";
}

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

/// [`Meter`] backed by the `metrics` facade.
///
/// Attributes become labels. Counters land in whatever recorder the process installed
/// (usually [`MetricsServer`]); with no recorder installed they are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsMeter;

impl Meter for MetricsMeter {
    fn add(&self, name: &'static str, value: u64, attributes: &[KeyValue]) {
        let labels: Vec<Label> = attributes
            .iter()
            .map(|kv| Label::new(kv.key.clone(), kv.value.to_string()))
            .collect();
        metrics::counter!(name, labels).increment(value);
    }
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

    /// Install the Prometheus recorder and start serving `/metrics`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or a different recorder is
    /// already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        register_metrics();

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics server started - available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(names::MESSAGES_FETCHED, "Total number of events fetched from the subscription");
    describe_counter!(names::FETCH_ERRORS, "Total number of failed fetch calls");
    describe_counter!(names::MESSAGES_PROCESSED, "Total number of events handled successfully");
    describe_counter!(names::HANDLER_RETRIES, "Total number of handler retries");
    describe_counter!(names::MESSAGES_DEAD_LETTERED, "Total number of events routed to the dead-letter topic");
    describe_counter!(names::DEAD_LETTER_ERRORS, "Total number of failed dead-letter publishes");
    describe_counter!(names::COMMITS, "Total number of acknowledged positions");
    describe_counter!(names::COMMIT_ERRORS, "Total number of failed acknowledgements");
}
