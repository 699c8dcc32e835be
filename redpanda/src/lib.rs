//! Redpanda/Kafka boundaries for drainpipe.
//!
//! This crate implements the [`Subscription`](drainpipe_core::Subscription) and
//! [`Publisher`](drainpipe_core::Publisher) traits from `drainpipe-core` with rdkafka,
//! plus an instrumented dialer for broker reachability probes.
//!
//! # Why Redpanda?
//!
//! - **Kafka-compatible**: Uses standard Kafka protocol, works with any Kafka-compatible system
//! - **Vendor swappable**: Can use Redpanda, Apache Kafka, AWS MSK, Azure Event Hubs, etc.
//!
//! # Architecture
//!
//! ```text
//!               ┌──────────────────────┐
//!  brokers ───▶ │ RedpandaSubscription │ ──fetch_next──▶ Consumer (drainpipe-runtime)
//!     ▲         └──────────────────────┘ ◀─acknowledge──      │
//!     │                                                       │ exhausted retries
//!     │         ┌──────────────────────┐                      ▼
//!     └──────── │  RedpandaPublisher   │ ◀──────publish─── dead-letter sink
//!               └──────────────────────┘
//!
//!  BrokerProbe ──dial──▶ InstrumentedDialer ──▶ TcpDialer   (kafka.dial spans)
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed only when the consumer acknowledges an event, synchronously,
//!   so a rejected commit is reported to the caller
//! - If the process crashes before commit, events will be redelivered
//! - Handlers MUST be idempotent
//! - Commits are cumulative per partition: acknowledging a later offset also covers
//!   earlier, possibly unfinished, events on that partition
//!
//! # Example
//!
//! ```no_run
//! use drainpipe_core::Telemetry;
//! use drainpipe_redpanda::{InstrumentedDialer, RedpandaPublisher, RedpandaSubscription, TcpDialer};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let telemetry = Telemetry::noop();
//! let dialer = Arc::new(InstrumentedDialer::new(
//!     TcpDialer::new(Duration::from_secs(10), Duration::from_secs(30)),
//!     telemetry.tracer.clone(),
//! ));
//!
//! let subscription = RedpandaSubscription::builder()
//!     .brokers("localhost:9092")
//!     .topic("answers")
//!     .group_id("answers-consumer")
//!     .dialer(dialer.clone())
//!     .build()
//!     .await?;
//!
//! let dead_letters = RedpandaPublisher::builder()
//!     .brokers("localhost:9092")
//!     .topic("answers-dlq")
//!     .dialer(dialer)
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Kafka-backed publisher
pub mod publisher;

/// Kafka-backed subscription
pub mod subscription;

/// Broker dialing and reachability probes
pub mod transport;

pub use publisher::{RedpandaPublisher, RedpandaPublisherBuilder};
pub use subscription::{RedpandaSubscription, RedpandaSubscriptionBuilder};
pub use transport::{BrokerProbe, Dial, InstrumentedDialer, TcpDialer, validate_broker_address};
