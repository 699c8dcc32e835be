//! # Drainpipe Runtime
//!
//! Runs the consumption pipeline defined by `drainpipe-core`.
//!
//! ## Core Components
//!
//! - **Consumer**: fetch loop feeding a bounded channel drained by a fixed worker pool
//! - **Retry**: exponential backoff around handler calls and dead-letter publishes
//! - **Dead-letter sink**: shared, close-once writer for events that exhausted their retries
//! - **Telemetry adapters**: [`TracingTracer`] and [`MetricsMeter`] bridge the injected
//!   tracer/meter onto `tracing` and `metrics`
//! - **Config**: [`ConsumerConfig`] loaded from environment variables
//!
//! ## Example
//!
//! ```ignore
//! use drainpipe_runtime::{Consumer, RetryPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! let consumer = Consumer::builder()
//!     .subscription(subscription)
//!     .dead_letter(dead_letter_publisher)
//!     .handler(handler)
//!     .retry_policy(config.retry_policy())
//!     .build()?;
//!
//! let cancel = CancellationToken::new();
//! let handle = consumer.start(cancel.clone(), config.workers)?;
//!
//! tokio::signal::ctrl_c().await?;
//! cancel.cancel();
//! handle.join().await;
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// `tracing`-backed tracer
pub mod telemetry;

/// Environment-driven configuration
pub mod config;

/// Dead-letter sink
pub mod dead_letter;

/// Consumer and its builder
pub mod consumer;

mod lifecycle;
mod worker;

pub use config::{ConsumerConfig, OffsetReset};
pub use consumer::{Consumer, ConsumerBuilder, ConsumerHandle, HeaderTags};
pub use dead_letter::{DeadLetterFailurePolicy, DeadLetterSink};
pub use metrics::{MetricsError, MetricsMeter, MetricsServer};
pub use retry::{RetryError, RetryPolicy, retry_with_backoff, retry_with_cancellation, retry_with_predicate};
pub use telemetry::TracingTracer;
