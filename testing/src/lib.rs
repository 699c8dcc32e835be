//! # Drainpipe Testing
//!
//! In-memory stand-ins for the boundaries of a drainpipe consumer.
//!
//! This crate provides:
//! - [`InMemorySubscription`]: a subscription fed from the test, recording acknowledgements
//! - [`RecordingPublisher`]: a dead-letter publisher that keeps every published event
//! - [`ScriptedHandler`]: a handler that fails a scripted number of times per event
//! - [`RecordingTracer`] / [`RecordingMeter`]: telemetry that can be asserted on
//! - [`properties`]: proptest strategies for events
//!
//! ## Example
//!
//! ```ignore
//! use drainpipe_testing::{InMemorySubscription, RecordingPublisher, ScriptedHandler};
//!
//! #[tokio::test]
//! async fn failing_event_is_dead_lettered() {
//!     let subscription = Arc::new(InMemorySubscription::new("answers"));
//!     let dead_letters = Arc::new(RecordingPublisher::new("answers-dlq"));
//!     subscription.push(b"payload".to_vec());
//!
//!     let consumer = Consumer::builder()
//!         .subscription(subscription.clone())
//!         .dead_letter(dead_letters.clone())
//!         .handler(Arc::new(ScriptedHandler::failing()))
//!         .build()?;
//!     // ...
//! }
//! ```

mod handler_mocks;
mod subscription_mocks;
mod telemetry_mocks;

/// Property-based testing utilities using proptest.
pub mod properties {
    use drainpipe_core::{Event, Position};
    use proptest::prelude::*;

    /// Strategy for a single event on `topic` with an arbitrary position, payload,
    /// key and up to four headers.
    pub fn event(topic: &'static str) -> impl Strategy<Value = Event> {
        (
            0..8i32,
            0..1_000_000i64,
            proptest::collection::vec(any::<u8>(), 0..256),
            proptest::option::of(proptest::collection::vec(any::<u8>(), 1..16)),
            proptest::collection::vec(("[a-z-]{1,12}", proptest::option::of("[ -~]{0,16}")), 0..4),
        )
            .prop_map(move |(partition, offset, payload, key, headers)| {
                let mut event = Event::new(Position::new(topic, partition, offset), payload);
                if let Some(key) = key {
                    event = event.with_key(key);
                }
                for (name, value) in headers {
                    event = event.with_header(name, value.map(String::into_bytes));
                }
                event
            })
    }
}

pub use handler_mocks::ScriptedHandler;
pub use subscription_mocks::{InMemorySubscription, RecordingPublisher};
pub use telemetry_mocks::{RecordedMeasurement, RecordedSpan, RecordingMeter, RecordingTracer, recording_telemetry};
