//! Integration tests for [`RedpandaSubscription`] and [`RedpandaPublisher`] with a real
//! Kafka instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Publish/fetch round-trip with key and headers intact
//! - Manual commits: acknowledged offsets are not redelivered to the group
//! - The full consumer pipeline dead-lettering a failing event
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//! - Can be flaky due to Kafka's distributed nature and timing
//!
//! To run explicitly:
//! ```bash
//! cargo test -p drainpipe-redpanda --test integration_tests -- --ignored
//! ```
//!
//! # Panics
//!
//! These tests use `expect()` and `panic!()` for setup failures, which is acceptable in test code.

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use drainpipe_core::{CancellationToken, Event, Position, Publisher, Subscription};
use drainpipe_redpanda::{InstrumentedDialer, RedpandaPublisher, RedpandaSubscription, TcpDialer};
use drainpipe_runtime::{Consumer, RetryPolicy};
use drainpipe_testing::{ScriptedHandler, recording_telemetry};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

/// Start Kafka and return the container with its broker address.
async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

async fn publisher(brokers: &str, topic: &str) -> RedpandaPublisher {
    RedpandaPublisher::builder()
        .brokers(brokers)
        .topic(topic)
        .build()
        .await
        .expect("Failed to create publisher")
}

async fn subscription(brokers: &str, topic: &str, group: &str) -> RedpandaSubscription {
    RedpandaSubscription::builder()
        .brokers(brokers)
        .topic(topic)
        .group_id(group)
        .auto_offset_reset("earliest") // Read from beginning for testing
        .build()
        .await
        .expect("Failed to subscribe")
}

/// Publish until the topic is auto-created and accepts writes.
async fn publish_with_warmup(publisher: &RedpandaPublisher, event: &Event) {
    for attempt in 1..=60 {
        if publisher.publish(event).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(attempt != 60, "Kafka did not accept writes to {}", publisher.topic());
    }
}

fn event(topic: &str, payload: &[u8]) -> Event {
    Event::new(Position::new(topic, 0, 0), payload.to_vec())
}

#[tokio::test]
#[ignore]
async fn test_publish_and_fetch_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let source = event("round-trip", b"{\"answer\":42}")
        .with_key(b"survey-1".to_vec())
        .with_header("trace-id", Some(b"abc".to_vec()))
        .with_header("empty", None);

    let writer = publisher(&brokers, "round-trip").await;
    publish_with_warmup(&writer, &source).await;

    let reader = subscription(&brokers, "round-trip", "round-trip-group").await;
    let cancel = CancellationToken::new();
    let fetched = tokio::time::timeout(Duration::from_secs(30), reader.fetch_next(&cancel))
        .await
        .expect("Timed out waiting for event")
        .expect("Fetch failed");

    assert_eq!(fetched.payload(), source.payload());
    assert_eq!(fetched.key(), Some(&b"survey-1"[..]));
    assert_eq!(fetched.header("trace-id"), Some(&b"abc"[..]));
    assert!(fetched.headers().iter().any(|h| h.key == "empty" && h.value.is_none()));
    assert!(fetched.timestamp().is_some());
    assert_eq!(fetched.position().topic, "round-trip");

    reader.close().await.expect("close");
    writer.close().await.expect("close");
}

#[tokio::test]
#[ignore]
async fn test_acknowledged_offsets_are_not_redelivered() {
    let (_kafka, brokers) = start_kafka().await;
    let writer = publisher(&brokers, "commits").await;
    publish_with_warmup(&writer, &event("commits", b"first")).await;
    writer.publish(&event("commits", b"second")).await.expect("publish");

    let cancel = CancellationToken::new();
    {
        let reader = subscription(&brokers, "commits", "commit-group").await;
        let first = tokio::time::timeout(Duration::from_secs(30), reader.fetch_next(&cancel))
            .await
            .expect("Timed out")
            .expect("Fetch failed");
        assert_eq!(first.payload(), b"first");
        reader.acknowledge(&first).await.expect("commit");

        // Async commit; give the broker a moment before leaving the group
        tokio::time::sleep(Duration::from_secs(2)).await;
        reader.close().await.expect("close");
    }

    let reader = subscription(&brokers, "commits", "commit-group").await;
    let next = tokio::time::timeout(Duration::from_secs(30), reader.fetch_next(&cancel))
        .await
        .expect("Timed out")
        .expect("Fetch failed");
    assert_eq!(next.payload(), b"second");
}

#[tokio::test]
#[ignore]
async fn test_consumer_dead_letters_failing_events() {
    let (_kafka, brokers) = start_kafka().await;
    let (telemetry, tracer, _meter) = recording_telemetry();
    let dialer = Arc::new(InstrumentedDialer::new(
        TcpDialer::default(),
        telemetry.tracer.clone(),
    ));

    let writer = publisher(&brokers, "answers").await;
    publish_with_warmup(&writer, &event("answers", b"poison")).await;

    let dead_letters = RedpandaPublisher::builder()
        .brokers(&brokers)
        .topic("answers-dlq")
        .dialer(dialer.clone())
        .build()
        .await
        .expect("dead-letter publisher");
    let source = RedpandaSubscription::builder()
        .brokers(&brokers)
        .topic("answers")
        .group_id("pipeline-group")
        .dialer(dialer)
        .build()
        .await
        .expect("subscription");
    assert!(!tracer.spans_named("kafka.dial").is_empty());

    let cancel = CancellationToken::new();
    let handle = Consumer::builder()
        .subscription(Arc::new(source))
        .dead_letter(Arc::new(dead_letters))
        .handler(Arc::new(ScriptedHandler::failing()))
        .retry_policy(RetryPolicy::builder().max_attempts(2).initial_delay(Duration::from_millis(10)).build())
        .telemetry(telemetry)
        .build()
        .expect("consumer")
        .start(cancel.clone(), 2)
        .expect("start");

    // The dead-letter topic receives the event unchanged
    let dlq_reader = subscription(&brokers, "answers-dlq", "dlq-reader").await;
    let dead_lettered = tokio::time::timeout(Duration::from_secs(60), dlq_reader.fetch_next(&cancel))
        .await
        .expect("Timed out waiting for dead letter")
        .expect("Fetch failed");
    assert_eq!(dead_lettered.payload(), b"poison");

    cancel.cancel();
    handle.join().await;
}
