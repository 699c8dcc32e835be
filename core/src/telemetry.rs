//! Tracer and meter capabilities.
//!
//! The pipeline never reaches for a process-wide tracer or meter. Both are passed in
//! at construction as a [`Telemetry`] bundle, so tests can substitute no-op or
//! recording implementations and several consumers in one process can report to
//! different backends.
//!
//! Span names used by the pipeline: `fetch`, `process`, `dead-letter`, `commit` and
//! `kafka.dial`.

use std::fmt;
use std::sync::Arc;

/// Attribute value attached to a span or counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// String value
    String(String),
    /// Integer value
    I64(i64),
    /// Boolean value
    Bool(bool),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::I64(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A key/value attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Attribute key
    pub key: String,
    /// Attribute value
    pub value: AttributeValue,
}

impl KeyValue {
    /// String attribute.
    #[must_use]
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: AttributeValue::String(value.into()),
        }
    }

    /// Integer attribute.
    #[must_use]
    pub fn i64(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value: AttributeValue::I64(value),
        }
    }

    /// Boolean attribute.
    #[must_use]
    pub fn bool(key: impl Into<String>, value: bool) -> Self {
        Self {
            key: key.into(),
            value: AttributeValue::Bool(value),
        }
    }
}

/// An open span. Ending consumes it.
pub trait Span: Send {
    /// Attach or overwrite an attribute.
    fn set_attribute(&mut self, attribute: KeyValue);

    /// Mark the span as failed with `error`.
    fn record_error(&mut self, error: &dyn fmt::Display) {
        self.set_attribute(KeyValue::string("error", error.to_string()));
    }

    /// Close the span.
    fn end(self: Box<Self>);

    /// `tracing` span to instrument the work done while this span is open.
    ///
    /// Lets spans opened by nested operations (dial spans under a fetch span) pick up
    /// this span as their parent. Backends that do not bridge to `tracing` keep the
    /// default.
    fn tracing_span(&self) -> tracing::Span {
        tracing::Span::none()
    }
}

/// Starts spans.
pub trait Tracer: Send + Sync {
    /// Open a span named `name` with initial `attributes`.
    fn start_span(&self, name: &'static str, attributes: Vec<KeyValue>) -> Box<dyn Span>;
}

/// Records counters.
pub trait Meter: Send + Sync {
    /// Add `value` to the counter `name` with the given attributes as labels.
    fn add(&self, name: &'static str, value: u64, attributes: &[KeyValue]);
}

/// Tracer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

struct NoopSpan;

impl Span for NoopSpan {
    fn set_attribute(&mut self, _attribute: KeyValue) {}

    fn end(self: Box<Self>) {}
}

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &'static str, _attributes: Vec<KeyValue>) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }
}

/// Meter that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMeter;

impl Meter for NoopMeter {
    fn add(&self, _name: &'static str, _value: u64, _attributes: &[KeyValue]) {}
}

/// Tracer and meter injected into the pipeline.
#[derive(Clone)]
pub struct Telemetry {
    /// Span source
    pub tracer: Arc<dyn Tracer>,
    /// Counter sink
    pub meter: Arc<dyn Meter>,
}

impl Telemetry {
    /// Bundle a tracer and a meter.
    #[must_use]
    pub fn new(tracer: Arc<dyn Tracer>, meter: Arc<dyn Meter>) -> Self {
        Self { tracer, meter }
    }

    /// Telemetry that records nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopTracer), Arc::new(NoopMeter))
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}
