//! Subscription and publisher capabilities consumed from the log system.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   Subscription   │  topic + consumer group
//! └────────┬─────────┘
//!          │ fetch_next (single fetch task)
//!          ▼
//! ┌──────────────────┐
//! │ Dispatch channel │  bounded, capacity = workers
//! └────────┬─────────┘
//!     ┌────┴────┐
//!     ▼         ▼
//! ┌───────┐ ┌───────┐
//! │Worker │ │Worker │ ── handler ── retry ──┐
//! └───┬───┘ └───┬───┘                       │ exhausted
//!     │         │                           ▼
//!     │         │                  ┌──────────────────┐
//!     │         │                  │    Publisher     │  dead-letter topic
//!     │         │                  └──────────────────┘
//!     ▼         ▼
//!  acknowledge(position)
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once**: a position is acknowledged only after the handler outcome is
//! known. A crash between handling and acknowledging causes redelivery, so handlers
//! must be idempotent.
//!
//! # Implementations
//!
//! - `RedpandaSubscription` / `RedpandaPublisher` (drainpipe-redpanda) - Kafka-compatible
//! - `InMemorySubscription` / `RecordingPublisher` (drainpipe-testing) - For tests

use crate::error::PipelineError;
use crate::event::Event;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// The consumer-group-bound read cursor into the source log.
///
/// # Thread Safety
///
/// `acknowledge` is called concurrently from every worker, so implementations must
/// tolerate concurrent commits without corrupting committed position state. Only the
/// consumer's fetch task calls `fetch_next`.
///
/// # Dyn Compatibility
///
/// This trait uses explicit boxed futures instead of `async fn` so it can be shared
/// as `Arc<dyn Subscription>` between the fetch task and the workers.
pub trait Subscription: Send + Sync {
    /// Topic this subscription reads from.
    fn topic(&self) -> &str;

    /// Wait for the next event.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::FetchFailed`] for transient failures; the caller retries.
    /// - [`PipelineError::Cancelled`] if `cancel` fires while waiting.
    /// - [`PipelineError::Closed`] once the subscription has been closed.
    fn fetch_next<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Event, PipelineError>>;

    /// Advance the committed cursor past `event`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CommitFailed`] if the commit is rejected. The position
    /// then stays where it was and the event may be redelivered after a restart.
    fn acknowledge<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), PipelineError>>;

    /// Release the subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client fails to leave the consumer group.
    fn close(&self) -> BoxFuture<'_, Result<(), PipelineError>>;
}

/// A write-only channel to a fixed topic.
///
/// # Thread Safety
///
/// `publish` is called concurrently from every worker.
pub trait Publisher: Send + Sync {
    /// Topic this publisher writes to.
    fn topic(&self) -> &str;

    /// Publish `event` unchanged (payload, key and headers).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PublishFailed`] if the broker rejects the record or the
    /// send times out, and [`PipelineError::Closed`] after `close`.
    fn publish<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), PipelineError>>;

    /// Flush pending records and release the publisher.
    ///
    /// # Errors
    ///
    /// Returns an error if pending records could not be flushed.
    fn close(&self) -> BoxFuture<'_, Result<(), PipelineError>>;
}
