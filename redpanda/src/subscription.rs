//! Kafka-backed [`Subscription`].

use crate::transport::{BrokerProbe, ConnectionSettings, Dial};
use drainpipe_core::{
    BoxFuture, CancellationToken, DateTime, Event, PipelineError, Position, Subscription, Utc,
};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::error::KafkaResult;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Largest fetch response requested from a broker.
const FETCH_MAX_BYTES: u32 = 10_000_000;

/// Subscription to one topic as a member of a consumer group.
///
/// Offsets are committed only through [`Subscription::acknowledge`]; auto-commit is off.
/// Commits are synchronous, so a broker rejecting a commit surfaces as
/// [`PipelineError::CommitFailed`] instead of being lost in the background.
/// A fetch error re-probes the brokers so that dial spans show whether the cluster is
/// reachable at all.
///
/// # Example
///
/// ```no_run
/// use drainpipe_redpanda::RedpandaSubscription;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let subscription = RedpandaSubscription::builder()
///     .brokers("localhost:9092")
///     .topic("answers")
///     .group_id("answers-consumer")
///     .auto_offset_reset("earliest")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaSubscription {
    consumer: Arc<StreamConsumer>,
    topic: String,
    group_id: String,
    probe: BrokerProbe,
    closed: AtomicBool,
}

impl RedpandaSubscription {
    /// Create a new builder for configuring the subscription.
    #[must_use]
    pub fn builder() -> RedpandaSubscriptionBuilder {
        RedpandaSubscriptionBuilder::default()
    }

    /// Consumer group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

impl Subscription for RedpandaSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn fetch_next<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Event, PipelineError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(PipelineError::Closed);
            }

            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PipelineError::Cancelled),
                received = self.consumer.recv() => received,
            };
            match received.map(|message| to_event(&message)) {
                Ok(event) => Ok(event),
                Err(e) => Err(reprobe_after_fetch_error(&self.topic, &self.probe, e.to_string()).await),
            }
        })
    }

    fn acknowledge<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(PipelineError::Closed);
            }

            let position = event.position();
            let commit_failed = |reason: String| PipelineError::CommitFailed {
                position: position.clone(),
                reason,
            };

            let offsets = commit_offsets(position).map_err(|e| commit_failed(e.to_string()))?;

            // Sync commit waits for the broker's reply
            let consumer = Arc::clone(&self.consumer);
            tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
                .await
                .map_err(|e| commit_failed(format!("commit task failed: {e}")))?
                .map_err(|e| commit_failed(e.to_string()))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), PipelineError>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.consumer.unsubscribe();
            tracing::info!(topic = %self.topic, group_id = %self.group_id, "Subscription closed");
            Ok(())
        })
    }
}

impl std::fmt::Debug for RedpandaSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaSubscription")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .field("probe", &self.probe)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Offsets to commit once `position` is handled: the next offset to read.
fn commit_offsets(position: &Position) -> KafkaResult<TopicPartitionList> {
    let mut offsets = TopicPartitionList::new();
    offsets.add_partition_offset(
        &position.topic,
        position.partition,
        Offset::Offset(position.offset.saturating_add(1)),
    )?;
    Ok(offsets)
}

/// Re-dial the brokers after a failed receive so the dial spans land under the
/// caller's fetch span, then report the fetch failure.
async fn reprobe_after_fetch_error(topic: &str, probe: &BrokerProbe, reason: String) -> PipelineError {
    tracing::warn!(topic = %topic, error = %reason, "Failed to receive message");
    if let Err(e) = probe.check().await {
        tracing::error!(topic = %topic, error = %e, "Brokers unreachable after fetch error");
    }
    PipelineError::FetchFailed(reason)
}

/// Copy a broker message into an owned [`Event`].
fn to_event(message: &BorrowedMessage<'_>) -> Event {
    let position = Position::new(message.topic(), message.partition(), message.offset());
    let mut event = Event::new(position, message.payload().map(<[u8]>::to_vec).unwrap_or_default());

    if let Some(key) = message.key() {
        event = event.with_key(key.to_vec());
    }
    if let Some(headers) = message.headers() {
        for i in 0..headers.count() {
            let header = headers.get(i);
            event = event.with_header(header.key, header.value.map(<[u8]>::to_vec));
        }
    }
    if let Some(timestamp) = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
    {
        event = event.with_timestamp(timestamp);
    }
    event
}

/// Builder for configuring a [`RedpandaSubscription`].
#[derive(Default)]
pub struct RedpandaSubscriptionBuilder {
    connection: ConnectionSettings,
    topic: Option<String>,
    group_id: Option<String>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
}

impl RedpandaSubscriptionBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: &str) -> Self {
        self.connection.set_brokers(brokers);
        self
    }

    /// Set the topic to consume (required).
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the consumer group id (required).
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Set where a group without committed offsets starts: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the group session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Set the broker dial timeout.
    ///
    /// Default: 10 seconds
    #[must_use]
    pub const fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.connection.dial_timeout = Some(timeout);
        self
    }

    /// Set the TCP keep-alive period. Zero disables keep-alive.
    ///
    /// Default: 30 seconds
    #[must_use]
    pub const fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.connection.keep_alive = Some(keep_alive);
        self
    }

    /// Set the dialer used for broker probes, typically an
    /// [`InstrumentedDialer`](crate::InstrumentedDialer).
    #[must_use]
    pub fn dialer(mut self, dialer: Arc<dyn Dial>) -> Self {
        self.connection.dialer = Some(dialer);
        self
    }

    /// Probe the brokers, create the consumer and subscribe to the topic.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::InvalidConfig`] if brokers, topic or group id are missing or a
    ///   broker address is not `host:port`.
    /// - [`PipelineError::ConnectionFailed`] if no broker is reachable or the client
    ///   cannot be created or subscribed.
    pub async fn build(self) -> Result<RedpandaSubscription, PipelineError> {
        let topic = self
            .topic
            .ok_or_else(|| PipelineError::InvalidConfig("topic not configured".to_string()))?;
        let group_id = self
            .group_id
            .ok_or_else(|| PipelineError::InvalidConfig("consumer group not configured".to_string()))?;
        let auto_offset_reset = self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string());
        let session_timeout = self.session_timeout.unwrap_or(Duration::from_secs(6));

        let probe = self.connection.probe();
        probe.check().await?;

        // Manual commit for at-least-once delivery
        let consumer: StreamConsumer = self
            .connection
            .client_config()
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &auto_offset_reset)
            .set("session.timeout.ms", session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false")
            .set("fetch.max.bytes", FETCH_MAX_BYTES.to_string())
            .create()
            .map_err(|e| PipelineError::ConnectionFailed(format!("Failed to create consumer: {e}")))?;

        consumer.subscribe(&[topic.as_str()]).map_err(|e| {
            PipelineError::ConnectionFailed(format!("Failed to subscribe to '{topic}': {e}"))
        })?;

        tracing::info!(
            topic = %topic,
            group_id = %group_id,
            brokers = ?probe.brokers(),
            auto_offset_reset = %auto_offset_reset,
            manual_commit = true,
            "Subscribed to topic"
        );

        Ok(RedpandaSubscription {
            consumer: Arc::new(consumer),
            topic,
            group_id,
            probe,
            closed: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::transport::{InstrumentedDialer, TcpDialer};
    use drainpipe_core::{KeyValue, Span, Tracer};
    use drainpipe_runtime::TracingTracer;
    use std::sync::Mutex;
    use tracing::Instrument;

    /// Wraps [`TracingTracer`], noting the current `tracing` span whenever a span opens.
    #[derive(Default)]
    struct ParentTracker {
        parents: Mutex<Vec<(&'static str, Option<tracing::Id>)>>,
    }

    impl Tracer for ParentTracker {
        fn start_span(&self, name: &'static str, attributes: Vec<KeyValue>) -> Box<dyn Span> {
            self.parents
                .lock()
                .unwrap()
                .push((name, tracing::Span::current().id()));
            TracingTracer.start_span(name, attributes)
        }
    }

    async fn closed_port() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[test]
    fn redpanda_subscription_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaSubscription>();
        assert_sync::<RedpandaSubscription>();
    }

    #[tokio::test]
    async fn build_requires_topic_and_group() {
        let missing_topic = RedpandaSubscription::builder()
            .brokers("localhost:9092")
            .group_id("g")
            .build()
            .await;
        assert_eq!(
            missing_topic.err(),
            Some(PipelineError::InvalidConfig("topic not configured".to_string()))
        );

        let missing_group = RedpandaSubscription::builder()
            .brokers("localhost:9092")
            .topic("answers")
            .build()
            .await;
        assert!(matches!(missing_group, Err(PipelineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn build_rejects_bad_broker_address_before_dialing() {
        let result = RedpandaSubscription::builder()
            .brokers("not-a-broker")
            .topic("answers")
            .group_id("g")
            .build()
            .await;

        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn commit_targets_the_next_offset() {
        let offsets = commit_offsets(&Position::new("answers", 3, 41)).unwrap();

        let elements = offsets.elements();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].topic(), "answers");
        assert_eq!(elements[0].partition(), 3);
        assert_eq!(elements[0].offset(), Offset::Offset(42));
    }

    #[tokio::test]
    async fn acknowledge_reports_commits_the_broker_never_confirms() {
        let address = closed_port().await;
        let consumer: StreamConsumer = rdkafka::ClientConfig::new()
            .set("bootstrap.servers", &address)
            .set("group.id", "ack-failures")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "1000")
            .set("heartbeat.interval.ms", "100")
            .create()
            .unwrap();
        let subscription = RedpandaSubscription {
            consumer: Arc::new(consumer),
            topic: "answers".to_string(),
            group_id: "ack-failures".to_string(),
            probe: BrokerProbe::new(vec![address], Arc::new(TcpDialer::default())),
            closed: AtomicBool::new(false),
        };
        let event = Event::new(Position::new("answers", 0, 9), b"answer".to_vec());

        let result = tokio::time::timeout(Duration::from_secs(30), subscription.acknowledge(&event))
            .await
            .expect("commit should give up without a coordinator");

        match result {
            Err(PipelineError::CommitFailed { position, .. }) => assert_eq!(&position, event.position()),
            other => panic!("expected CommitFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reprobe_dial_spans_nest_under_the_fetch_span() {
        let _subscriber = tracing::subscriber::set_default(tracing_subscriber::registry());
        let tracker = Arc::new(ParentTracker::default());
        let probe = BrokerProbe::new(
            vec![closed_port().await],
            Arc::new(InstrumentedDialer::new(TcpDialer::default(), tracker.clone())),
        );

        let fetch = TracingTracer.start_span("fetch", vec![KeyValue::string("topic", "answers")]);
        let fetch_span = fetch.tracing_span();
        let error = reprobe_after_fetch_error("answers", &probe, "transport failure".to_string())
            .instrument(fetch_span.clone())
            .await;
        fetch.end();

        assert_eq!(error, PipelineError::FetchFailed("transport failure".to_string()));
        assert!(fetch_span.id().is_some());
        assert_eq!(
            tracker.parents.lock().unwrap().as_slice(),
            &[("kafka.dial", fetch_span.id())]
        );
    }

    #[tokio::test]
    async fn build_fails_when_no_broker_is_reachable() {
        let address = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let result = RedpandaSubscription::builder()
            .brokers(&address)
            .topic("answers")
            .group_id("g")
            .dial_timeout(Duration::from_millis(500))
            .build()
            .await;

        assert!(matches!(result, Err(PipelineError::ConnectionFailed(_))));
    }
}
