//! [`Tracer`] backed by the `tracing` crate.
//!
//! Spans are created with a fixed field set so attributes can be recorded after the
//! span is opened. The span name goes into `otel.name`, the field
//! `tracing-opentelemetry` uses to rename exported spans. Attributes whose key is not in
//! the field set are dropped by `tracing`.

use drainpipe_core::telemetry::{AttributeValue, KeyValue, Span, Tracer};
use std::time::Instant;
use tracing::field::Empty;

/// Tracer that opens `tracing` spans at INFO level.
///
/// New spans are children of the current `tracing` span, so dial spans opened while a
/// fetch is in flight nest under the fetch span.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn start_span(&self, name: &'static str, attributes: Vec<KeyValue>) -> Box<dyn Span> {
        let span = tracing::info_span!(
            "drainpipe",
            otel.name = name,
            otel.status_code = Empty,
            topic = Empty,
            partition = Empty,
            offset = Empty,
            worker = Empty,
            attempts = Empty,
            network = Empty,
            address = Empty,
            dial.duration_ms = Empty,
            dial.error = Empty,
            dead_letter.topic = Empty,
            error = Empty,
        );

        let mut span = TracingSpan {
            name,
            span,
            started: Instant::now(),
        };
        for attribute in attributes {
            span.set_attribute(attribute);
        }
        Box::new(span)
    }
}

struct TracingSpan {
    name: &'static str,
    span: tracing::Span,
    started: Instant,
}

impl Span for TracingSpan {
    fn set_attribute(&mut self, attribute: KeyValue) {
        let key = attribute.key.as_str();
        match attribute.value {
            AttributeValue::String(value) => {
                self.span.record(key, value.as_str());
            }
            AttributeValue::I64(value) => {
                self.span.record(key, value);
            }
            AttributeValue::Bool(value) => {
                self.span.record(key, value);
            }
        }
    }

    fn record_error(&mut self, error: &dyn std::fmt::Display) {
        let message = error.to_string();
        self.span.record("otel.status_code", "ERROR");
        self.span.record("error", message.as_str());
    }

    fn end(self: Box<Self>) {
        tracing::trace!(
            parent: &self.span,
            span = self.name,
            elapsed_us = u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "span closed"
        );
    }

    fn tracing_span(&self) -> tracing::Span {
        self.span.clone()
    }
}
