//! Kafka-backed [`Publisher`], used as the dead-letter writer.

use crate::transport::{ConnectionSettings, Dial};
use drainpipe_core::{BoxFuture, Event, PipelineError, Publisher};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Publisher bound to one topic.
///
/// Records are written with the source event's payload, key and headers. Partitioning
/// follows the key, as the client's default partitioner does.
///
/// # Example
///
/// ```no_run
/// use drainpipe_redpanda::RedpandaPublisher;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dead_letters = RedpandaPublisher::builder()
///     .brokers("localhost:9092")
///     .topic("answers-dlq")
///     .producer_acks("all")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
    closed: AtomicBool,
}

impl RedpandaPublisher {
    /// Create a new builder for configuring the publisher.
    #[must_use]
    pub fn builder() -> RedpandaPublisherBuilder {
        RedpandaPublisherBuilder::default()
    }
}

impl Publisher for RedpandaPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn publish<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(PipelineError::Closed);
            }

            let mut record = FutureRecord::<[u8], [u8]>::to(&self.topic).payload(event.payload());
            if let Some(key) = event.key() {
                record = record.key(key);
            }
            if !event.headers().is_empty() {
                let headers = event
                    .headers()
                    .iter()
                    .fold(OwnedHeaders::new_with_capacity(event.headers().len()), |headers, h| {
                        headers.insert(Header {
                            key: &h.key,
                            value: h.value.as_deref(),
                        })
                    });
                record = record.headers(headers);
            }

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %self.topic,
                        partition = partition,
                        offset = offset,
                        source = %event.position(),
                        "Event published successfully"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %self.topic,
                        source = %event.position(),
                        error = %kafka_error,
                        "Failed to publish event"
                    );
                    Err(PipelineError::PublishFailed {
                        topic: self.topic.clone(),
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), PipelineError>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }

            let failed = |reason: String| PipelineError::PublishFailed {
                topic: self.topic.clone(),
                reason,
            };

            // flush blocks until queued records are delivered or the timeout expires
            let producer = self.producer.clone();
            let timeout = self.timeout;
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| failed(format!("flush task failed: {e}")))?
                .map_err(|e| failed(format!("flush failed: {e}")))?;

            tracing::info!(topic = %self.topic, "Publisher closed");
            Ok(())
        })
    }
}

impl std::fmt::Debug for RedpandaPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaPublisher")
            .field("topic", &self.topic)
            .field("timeout", &self.timeout)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`RedpandaPublisher`].
#[derive(Default)]
pub struct RedpandaPublisherBuilder {
    connection: ConnectionSettings,
    topic: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl RedpandaPublisherBuilder {
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

    /// Set the topic to publish to (required).
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the producer acknowledgment mode.
    ///
    /// # Parameters
    ///
    /// - `acks`: "0" (no acks), "1" (leader ack), "all" (all replicas ack)
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the send and flush timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
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

    /// Set the dialer used for broker probes.
    #[must_use]
    pub fn dialer(mut self, dialer: Arc<dyn Dial>) -> Self {
        self.connection.dialer = Some(dialer);
        self
    }

    /// Probe the brokers and create the producer.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::InvalidConfig`] if brokers or topic are missing or a broker
    ///   address is not `host:port`.
    /// - [`PipelineError::ConnectionFailed`] if no broker is reachable or the producer
    ///   cannot be created.
    pub async fn build(self) -> Result<RedpandaPublisher, PipelineError> {
        let topic = self
            .topic
            .ok_or_else(|| PipelineError::InvalidConfig("topic not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        self.connection.probe().check().await?;

        let producer: FutureProducer = self
            .connection
            .client_config()
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| PipelineError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            topic = %topic,
            brokers = ?self.connection.brokers,
            acks = acks,
            compression = compression,
            "Publisher created"
        );

        Ok(RedpandaPublisher {
            producer,
            topic,
            timeout,
            closed: AtomicBool::new(false),
        })
    }
}
