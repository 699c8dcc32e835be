//! Telemetry that records what it was given.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use drainpipe_core::{AttributeValue, KeyValue, Meter, Span, Telemetry, Tracer};
use std::fmt;
use std::sync::{Arc, Mutex};

/// A span as seen by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSpan {
    /// Span name
    pub name: &'static str,
    /// Attributes in the order they were set
    pub attributes: Vec<KeyValue>,
    /// Message of the last recorded error
    pub error: Option<String>,
    /// Whether `end` was called
    pub ended: bool,
}

impl RecordedSpan {
    /// Last value set for `key`.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .rev()
            .find(|kv| kv.key == key)
            .map(|kv| &kv.value)
    }
}

/// Tracer that keeps every span in memory.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl RecordingTracer {
    /// Create an empty tracer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All spans started so far, in start order.
    #[must_use]
    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.spans.lock().unwrap().clone()
    }

    /// Spans named `name`.
    #[must_use]
    pub fn spans_named(&self, name: &str) -> Vec<RecordedSpan> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }
}

impl Tracer for RecordingTracer {
    fn start_span(&self, name: &'static str, attributes: Vec<KeyValue>) -> Box<dyn Span> {
        let mut spans = self.spans.lock().unwrap();
        spans.push(RecordedSpan {
            name,
            attributes,
            error: None,
            ended: false,
        });
        Box::new(RecordingSpan {
            index: spans.len() - 1,
            spans: Arc::clone(&self.spans),
        })
    }
}

struct RecordingSpan {
    index: usize,
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl RecordingSpan {
    fn update(&self, f: impl FnOnce(&mut RecordedSpan)) {
        if let Some(span) = self.spans.lock().unwrap().get_mut(self.index) {
            f(span);
        }
    }
}

impl Span for RecordingSpan {
    fn set_attribute(&mut self, attribute: KeyValue) {
        self.update(|span| span.attributes.push(attribute));
    }

    fn record_error(&mut self, error: &dyn fmt::Display) {
        let message = error.to_string();
        self.update(|span| span.error = Some(message));
    }

    fn end(self: Box<Self>) {
        self.update(|span| span.ended = true);
    }
}

/// One `Meter::add` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMeasurement {
    /// Counter name
    pub name: &'static str,
    /// Increment
    pub value: u64,
    /// Attributes passed with the increment
    pub attributes: Vec<KeyValue>,
}

/// Meter that keeps every increment in memory.
#[derive(Debug, Default)]
pub struct RecordingMeter {
    measurements: Mutex<Vec<RecordedMeasurement>>,
}

impl RecordingMeter {
    /// Create an empty meter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All increments so far.
    #[must_use]
    pub fn measurements(&self) -> Vec<RecordedMeasurement> {
        self.measurements.lock().unwrap().clone()
    }

    /// Sum of the increments of counter `name`.
    #[must_use]
    pub fn total(&self, name: &str) -> u64 {
        self.measurements
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.name == name)
            .map(|m| m.value)
            .sum()
    }
}

impl Meter for RecordingMeter {
    fn add(&self, name: &'static str, value: u64, attributes: &[KeyValue]) {
        self.measurements.lock().unwrap().push(RecordedMeasurement {
            name,
            value,
            attributes: attributes.to_vec(),
        });
    }
}

/// Telemetry wired to a fresh recording tracer and meter.
#[must_use]
pub fn recording_telemetry() -> (Telemetry, Arc<RecordingTracer>, Arc<RecordingMeter>) {
    let tracer = Arc::new(RecordingTracer::new());
    let meter = Arc::new(RecordingMeter::new());
    let telemetry = Telemetry::new(tracer.clone(), meter.clone());
    (telemetry, tracer, meter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_record_attributes_errors_and_end() {
        let tracer = RecordingTracer::new();
        let mut span = tracer.start_span("fetch", vec![KeyValue::string("topic", "answers")]);
        span.set_attribute(KeyValue::i64("offset", 7));
        span.record_error(&"boom");
        span.end();

        let recorded = tracer.spans_named("fetch");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].attribute("offset"), Some(&AttributeValue::I64(7)));
        assert_eq!(recorded[0].error.as_deref(), Some("boom"));
        assert!(recorded[0].ended);
    }

    #[test]
    fn meter_sums_by_name() {
        let (telemetry, _tracer, meter) = recording_telemetry();
        telemetry.meter.add("a", 2, &[]);
        telemetry.meter.add("a", 3, &[]);
        telemetry.meter.add("b", 1, &[]);

        assert_eq!(meter.total("a"), 5);
        assert_eq!(meter.measurements().len(), 3);
    }
}
