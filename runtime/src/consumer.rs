//! Consumer: fetch loop, bounded dispatch channel and worker pool.
//!
//! # Architecture
//!
//! ```text
//! Subscription ──fetch_next──▶ fetch task ──▶ [bounded channel] ──▶ worker 1..N
//!                                                                     │
//!                                              handler + retry ◀──────┤
//!                                              dead-letter sink ◀─────┤ (exhausted)
//!                                              acknowledge ◀──────────┘
//! ```
//!
//! A single fetch task owns every read from the subscription. It pushes events into a
//! bounded channel (capacity defaults to the worker count); a full channel stalls
//! fetching, which is the pipeline's only flow control.
//!
//! # Ordering
//!
//! Events are fetched in log order but complete out of order. A later offset can be
//! acknowledged while an earlier event on the same partition is still retrying; with
//! Kafka-style cumulative commits the earlier event then counts as consumed after a
//! restart. Run a single worker when per-partition ordering matters; an event held for
//! the dead-letter topic then also holds back every later offset.
//!
//! # Example
//!
//! ```rust,ignore
//! let consumer = Consumer::builder()
//!     .subscription(subscription)
//!     .dead_letter(publisher)
//!     .handler(handler)
//!     .telemetry(Telemetry::new(Arc::new(TracingTracer), Arc::new(MetricsMeter)))
//!     .build()?;
//!
//! let cancel = CancellationToken::new();
//! let handle = consumer.start(cancel.clone(), 2)?;
//!
//! // ... later
//! cancel.cancel();
//! handle.join().await;
//! ```

use crate::dead_letter::{DeadLetterFailurePolicy, DeadLetterSink};
use crate::lifecycle;
use crate::metrics::names;
use crate::retry::RetryPolicy;
use crate::worker::{SharedReceiver, Worker, WorkerContext};
use drainpipe_core::telemetry::{KeyValue, Telemetry};
use drainpipe_core::{Event, Handler, PipelineError, Publisher, Subscription};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Which event headers become labels on the fetched-messages counter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HeaderTags {
    /// No header labels
    #[default]
    None,
    /// Every header (beware of label cardinality)
    All,
    /// Only headers with these keys
    Only(Vec<String>),
}

impl HeaderTags {
    fn attributes(&self, event: &Event) -> Vec<KeyValue> {
        let selected = |key: &str| match self {
            Self::None => false,
            Self::All => true,
            Self::Only(keys) => keys.iter().any(|k| k == key),
        };
        event
            .headers()
            .iter()
            .filter(|h| selected(&h.key))
            .map(|h| KeyValue::string(h.key.clone(), h.value_lossy()))
            .collect()
    }
}

/// Pulls events from a subscription and processes them with a fixed worker pool.
///
/// Built once per (topic, consumer group) with [`Consumer::builder`] and started once
/// with [`Consumer::start`].
pub struct Consumer {
    subscription: Arc<dyn Subscription>,
    handler: Arc<dyn Handler>,
    sink: Arc<DeadLetterSink>,
    retry_policy: RetryPolicy,
    dead_letter_failure_policy: DeadLetterFailurePolicy,
    channel_capacity: Option<usize>,
    header_tags: HeaderTags,
    telemetry: Telemetry,
}

impl Consumer {
    /// Create a new builder for configuring the consumer.
    #[must_use]
    pub fn builder() -> ConsumerBuilder {
        ConsumerBuilder::default()
    }

    /// Topic this consumer reads from.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.subscription.topic()
    }

    /// Spawn `worker_count` workers and the fetch task.
    ///
    /// The consumer runs until `cancel` fires. It then stops fetching, lets each worker
    /// finish the attempt it is running, and closes the dead-letter sink and the
    /// subscription. Per-event failures are only visible through logs, metrics and
    /// spans; they never stop the consumer.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `worker_count` or the configured
    /// channel capacity is zero. Nothing is spawned in that case.
    pub fn start(
        self,
        cancel: CancellationToken,
        worker_count: usize,
    ) -> Result<ConsumerHandle, PipelineError> {
        if worker_count == 0 {
            return Err(PipelineError::InvalidConfig(
                "worker count must be greater than 0".to_string(),
            ));
        }
        let capacity = self.channel_capacity.unwrap_or(worker_count);
        if capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "channel capacity must be greater than 0".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel::<Arc<Event>>(capacity);
        let receiver: SharedReceiver = Arc::new(Mutex::new(rx));

        let context = Arc::new(WorkerContext {
            subscription: Arc::clone(&self.subscription),
            handler: Arc::clone(&self.handler),
            sink: Arc::clone(&self.sink),
            retry_policy: self.retry_policy.clone(),
            dead_letter_failure_policy: self.dead_letter_failure_policy,
            telemetry: self.telemetry.clone(),
        });

        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            let worker = Worker::new(id, Arc::clone(&context), Arc::clone(&receiver));
            workers.spawn(worker.run(cancel.clone()));
        }

        tracing::info!(
            topic = %self.topic(),
            dead_letter_topic = %self.sink.topic(),
            workers = worker_count,
            channel_capacity = capacity,
            max_attempts = self.retry_policy.attempts(),
            "Consumer started"
        );

        let fetch_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            self.fetch_loop(&fetch_cancel, tx).await;
            lifecycle::teardown(&mut workers, &self.sink, self.subscription.as_ref()).await;
        });

        Ok(ConsumerHandle { task, cancel })
    }

    /// Fetch until cancelled, the subscription closes, or every worker is gone.
    async fn fetch_loop(&self, cancel: &CancellationToken, tx: mpsc::Sender<Arc<Event>>) {
        let topic = self.topic().to_string();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut span = self
                .telemetry
                .tracer
                .start_span("fetch", vec![KeyValue::string("topic", topic.clone())]);

            let fetched = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(PipelineError::Cancelled),
                result = self.subscription.fetch_next(cancel).instrument(span.tracing_span()) => result,
            };

            let event = match fetched {
                Ok(event) => event,
                Err(e) if e.is_terminal() => {
                    span.end();
                    if !matches!(e, PipelineError::Cancelled) {
                        tracing::warn!(topic = %topic, error = %e, "Subscription closed, stopping fetch loop");
                    }
                    break;
                }
                Err(e) => {
                    span.record_error(&e);
                    span.end();
                    self.telemetry.meter.add(
                        names::FETCH_ERRORS,
                        1,
                        &[KeyValue::string("topic", topic.clone())],
                    );
                    tracing::error!(topic = %topic, error = %e, "Failed to fetch message");
                    continue;
                }
            };

            let position = event.position();
            span.set_attribute(KeyValue::i64("partition", i64::from(position.partition)));
            span.set_attribute(KeyValue::i64("offset", position.offset));
            span.end();

            let mut attributes = vec![KeyValue::string("topic", topic.clone())];
            attributes.extend(self.header_tags.attributes(&event));
            self.telemetry.meter.add(names::MESSAGES_FETCHED, 1, &attributes);
            tracing::debug!(position = %position, "Fetched event");

            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                sent = tx.send(Arc::new(event)) => sent,
            };
            if sent.is_err() {
                tracing::warn!(topic = %topic, "All workers exited, stopping fetch loop");
                break;
            }
        }

        tracing::info!(topic = %topic, "Fetch loop stopped");
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("topic", &self.topic())
            .field("sink", &self.sink)
            .field("retry_policy", &self.retry_policy)
            .field("channel_capacity", &self.channel_capacity)
            .finish_non_exhaustive()
    }
}

/// Handle to a running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ConsumerHandle {
    /// Cancel the consumer's token, starting teardown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Whether teardown has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for teardown to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Consumer task failed");
        }
    }
}

/// Builder for configuring a [`Consumer`].
///
/// # Example
///
/// ```rust,ignore
/// let consumer = Consumer::builder()
///     .subscription(subscription)
///     .dead_letter(publisher)
///     .handler(handler)
///     .retry_policy(RetryPolicy::builder().max_attempts(3).build())
///     .channel_capacity(16)
///     .build()?;
/// ```
#[derive(Default)]
pub struct ConsumerBuilder {
    subscription: Option<Arc<dyn Subscription>>,
    dead_letter: Option<Arc<dyn Publisher>>,
    handler: Option<Arc<dyn Handler>>,
    retry_policy: Option<RetryPolicy>,
    dead_letter_retry_policy: Option<RetryPolicy>,
    dead_letter_failure_policy: DeadLetterFailurePolicy,
    channel_capacity: Option<usize>,
    header_tags: HeaderTags,
    telemetry: Option<Telemetry>,
}

impl ConsumerBuilder {
    /// Set the subscription to read from (required).
    #[must_use]
    pub fn subscription(mut self, subscription: Arc<dyn Subscription>) -> Self {
        self.subscription = Some(subscription);
        self
    }

    /// Set the dead-letter publisher (required).
    #[must_use]
    pub fn dead_letter(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.dead_letter = Some(publisher);
        self
    }

    /// Set the event handler (required).
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the handler retry policy.
    ///
    /// Default: [`RetryPolicy::default`] (3 attempts).
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Set the retry policy for dead-letter publishes.
    ///
    /// Default: [`DeadLetterSink::default_retry_policy`].
    #[must_use]
    pub fn dead_letter_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.dead_letter_retry_policy = Some(policy);
        self
    }

    /// Decide what happens to an event whose dead-letter publish failed.
    ///
    /// Default: [`DeadLetterFailurePolicy::HoldPosition`].
    #[must_use]
    pub const fn dead_letter_failure_policy(mut self, policy: DeadLetterFailurePolicy) -> Self {
        self.dead_letter_failure_policy = policy;
        self
    }

    /// Set the dispatch channel capacity.
    ///
    /// Default: the worker count passed to [`Consumer::start`].
    #[must_use]
    pub const fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = Some(capacity);
        self
    }

    /// Choose which headers label the fetched-messages counter.
    #[must_use]
    pub fn header_tags(mut self, tags: HeaderTags) -> Self {
        self.header_tags = tags;
        self
    }

    /// Inject the tracer and meter.
    ///
    /// Default: [`Telemetry::noop`].
    #[must_use]
    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Build the [`Consumer`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the subscription, dead-letter
    /// publisher or handler is missing, or if the dead-letter topic is the source topic.
    pub fn build(self) -> Result<Consumer, PipelineError> {
        let subscription = self
            .subscription
            .ok_or_else(|| PipelineError::InvalidConfig("subscription not configured".to_string()))?;
        let dead_letter = self
            .dead_letter
            .ok_or_else(|| PipelineError::InvalidConfig("dead-letter publisher not configured".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| PipelineError::InvalidConfig("handler not configured".to_string()))?;

        if dead_letter.topic() == subscription.topic() {
            return Err(PipelineError::InvalidConfig(format!(
                "dead-letter topic must differ from source topic '{}'",
                subscription.topic()
            )));
        }

        let telemetry = self.telemetry.unwrap_or_default();
        let sink = DeadLetterSink::new(
            dead_letter,
            self.dead_letter_retry_policy
                .unwrap_or_else(DeadLetterSink::default_retry_policy),
            telemetry.clone(),
        );

        Ok(Consumer {
            subscription,
            handler,
            sink: Arc::new(sink),
            retry_policy: self.retry_policy.unwrap_or_default(),
            dead_letter_failure_policy: self.dead_letter_failure_policy,
            channel_capacity: self.channel_capacity,
            header_tags: self.header_tags,
            telemetry,
        })
    }
}
