//! Dead-letter sink shared by every worker of a consumer.
//!
//! Wraps a [`Publisher`] bound to the dead-letter topic. Each publish runs under its own
//! short retry policy, inside a `dead-letter` span, and is counted. The sink is closed
//! exactly once, by the lifecycle controller, after every worker has exited.

use crate::metrics::names;
use crate::retry::{RetryPolicy, retry_with_backoff};
use drainpipe_core::telemetry::{KeyValue, Telemetry};
use drainpipe_core::{Event, PipelineError, Publisher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Shortest pause between publish rounds while holding an event.
const MIN_HOLD_DELAY: Duration = Duration::from_millis(100);

/// What to do with an event whose dead-letter publish failed.
///
/// Commits are cumulative per partition, so leaving one position unacknowledged does not
/// keep it: the next acknowledged offset on the partition covers it. Holding therefore
/// means the worker stays on the event and keeps publishing it until the dead-letter
/// topic accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadLetterFailurePolicy {
    /// Keep publishing with backoff until delivered, then acknowledge. The worker takes
    /// no other event meanwhile. On cancellation the event is left unacknowledged.
    #[default]
    HoldPosition,
    /// Acknowledge anyway. The event is lost from the main topic.
    Acknowledge,
}

/// Write-only channel to the dead-letter topic.
pub struct DeadLetterSink {
    publisher: Arc<dyn Publisher>,
    retry_policy: RetryPolicy,
    telemetry: Telemetry,
    closed: AtomicBool,
}

impl DeadLetterSink {
    /// Default policy for retrying a failed dead-letter publish.
    #[must_use]
    pub fn default_retry_policy() -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(3)
            .initial_delay(Duration::from_millis(200))
            .max_delay(Duration::from_secs(2))
            .build()
    }

    /// Create a sink over `publisher`.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>, retry_policy: RetryPolicy, telemetry: Telemetry) -> Self {
        Self {
            publisher,
            retry_policy,
            telemetry,
            closed: AtomicBool::new(false),
        }
    }

    /// Dead-letter topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.publisher.topic()
    }

    /// Publish `event` unchanged to the dead-letter topic.
    ///
    /// # Errors
    ///
    /// Returns the last publish error once the sink's retry policy is spent, or
    /// [`PipelineError::Closed`] if the sink was already closed.
    pub async fn publish(&self, event: &Event) -> Result<(), PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }

        let position = event.position();
        let mut span = self.telemetry.tracer.start_span(
            "dead-letter",
            vec![
                KeyValue::string("topic", position.topic.clone()),
                KeyValue::i64("partition", i64::from(position.partition)),
                KeyValue::i64("offset", position.offset),
                KeyValue::string("dead_letter.topic", self.topic()),
            ],
        );

        let result = retry_with_backoff(&self.retry_policy, || self.publisher.publish(event))
            .instrument(span.tracing_span())
            .await;

        match &result {
            Ok(()) => {
                self.telemetry.meter.add(
                    names::MESSAGES_DEAD_LETTERED,
                    1,
                    &[KeyValue::string("topic", position.topic.clone())],
                );
                tracing::info!(
                    position = %position,
                    dead_letter_topic = %self.topic(),
                    "Event published to dead-letter topic"
                );
            }
            Err(e) => {
                span.record_error(e);
                self.telemetry.meter.add(
                    names::DEAD_LETTER_ERRORS,
                    1,
                    &[KeyValue::string("topic", position.topic.clone())],
                );
                tracing::error!(
                    position = %position,
                    dead_letter_topic = %self.topic(),
                    error = %e,
                    "Failed to publish event to dead-letter topic"
                );
            }
        }
        span.end();
        result
    }

    /// Publish `event` in rounds until the dead-letter topic accepts it.
    ///
    /// Each round is a [`publish`](Self::publish) under the sink's retry policy. Rounds
    /// are separated by the policy's backoff delays, never shorter than 100ms.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] if `cancel` fires between rounds, or
    /// [`PipelineError::Closed`] if the sink is closed.
    pub async fn publish_until_delivered(
        &self,
        event: &Event,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut round = 1;
        loop {
            match self.publish(event).await {
                Ok(()) => return Ok(()),
                Err(PipelineError::Closed) => return Err(PipelineError::Closed),
                Err(_) => {}
            }

            let delay = self.retry_policy.delay_for_attempt(round).max(MIN_HOLD_DELAY);
            tracing::warn!(
                position = %event.position(),
                dead_letter_topic = %self.topic(),
                round,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Holding event until the dead-letter topic accepts it"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PipelineError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            round += 1;
        }
    }

    /// Flush and release the publisher. Only the first call reaches the publisher.
    ///
    /// # Errors
    ///
    /// Returns the publisher's close error.
    pub async fn close(&self) -> Result<(), PipelineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.publisher.close().await
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for DeadLetterSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterSink")
            .field("topic", &self.topic())
            .field("retry_policy", &self.retry_policy)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use drainpipe_core::Position;
    use drainpipe_testing::RecordingPublisher;

    fn event(offset: i64) -> Event {
        Event::new(Position::new("answers", 0, offset), format!("payload-{offset}").into_bytes())
            .with_header("trace-id", Some(b"abc".to_vec()))
    }

    #[tokio::test]
    async fn publishes_event_unchanged() {
        let publisher = Arc::new(RecordingPublisher::new("answers-dlq"));
        let sink = DeadLetterSink::new(publisher.clone(), RetryPolicy::no_retry(), Telemetry::noop());

        sink.publish(&event(5)).await.expect("publish");

        assert_eq!(publisher.published(), vec![event(5)]);
        assert_eq!(sink.topic(), "answers-dlq");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_publish_failures() {
        let publisher = Arc::new(RecordingPublisher::new("dlq"));
        publisher.fail_next(2);
        let sink = DeadLetterSink::new(
            publisher.clone(),
            DeadLetterSink::default_retry_policy(),
            Telemetry::noop(),
        );

        sink.publish(&event(1)).await.expect("publish after retries");

        assert_eq!(publisher.publish_calls(), 3);
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn holding_publishes_until_delivered() {
        let publisher = Arc::new(RecordingPublisher::new("dlq"));
        publisher.fail_next(4);
        let sink = DeadLetterSink::new(publisher.clone(), RetryPolicy::no_retry(), Telemetry::noop());

        sink.publish_until_delivered(&event(3), &CancellationToken::new())
            .await
            .expect("delivered after five rounds");

        assert_eq!(publisher.publish_calls(), 5);
        assert_eq!(publisher.published(), vec![event(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn holding_stops_on_cancellation() {
        let publisher = Arc::new(RecordingPublisher::new("dlq"));
        publisher.fail_always();
        let sink = Arc::new(DeadLetterSink::new(publisher.clone(), RetryPolicy::no_retry(), Telemetry::noop()));
        let cancel = CancellationToken::new();

        let task = {
            let sink = Arc::clone(&sink);
            let cancel = cancel.clone();
            tokio::spawn(async move { sink.publish_until_delivered(&event(3), &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();

        assert_eq!(task.await.expect("join"), Err(PipelineError::Cancelled));
        assert!(publisher.publish_calls() > 1);
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn close_reaches_publisher_once() {
        let publisher = Arc::new(RecordingPublisher::new("dlq"));
        let sink = DeadLetterSink::new(publisher.clone(), RetryPolicy::no_retry(), Telemetry::noop());

        sink.close().await.expect("close");
        sink.close().await.expect("second close is a no-op");

        assert_eq!(publisher.close_calls(), 1);
        assert_eq!(sink.publish(&event(1)).await, Err(PipelineError::Closed));
    }
}
