//! # Drainpipe Core
//!
//! Core traits and types for the drainpipe consumption pipeline.
//!
//! This crate defines the vocabulary shared by every other crate in the workspace:
//!
//! - **Event**: one immutable record read from a log topic, with its [`Position`]
//! - **Subscription**: the consumer-group-bound read cursor (fetch, acknowledge, close)
//! - **Publisher**: a write-only channel to a secondary (dead-letter) topic
//! - **Handler**: the user-supplied capability that processes an event
//! - **Telemetry**: injected tracer and meter capabilities
//!
//! The runtime crate drives these capabilities; the redpanda crate implements the
//! subscription and publisher on top of Kafka; the testing crate implements them in memory.
//!
//! ## Example
//!
//! ```
//! use drainpipe_core::{Event, Position, handler_fn};
//!
//! let handler = handler_fn(|_cancel, event| async move {
//!     tracing::info!(offset = event.position().offset, "handled");
//!     Ok(())
//! });
//!
//! let event = Event::new(Position::new("answers", 0, 42), b"{}".to_vec());
//! assert_eq!(event.position().offset, 42);
//! # let _ = handler;
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use futures::future::BoxFuture;
pub use smallvec::SmallVec;
pub use tokio_util::sync::CancellationToken;

/// Event, header and position types
pub mod event;

/// Error types shared across the pipeline
pub mod error;

/// Handler capability invoked for every event
pub mod handler;

/// Subscription and publisher capabilities provided by the log system
pub mod subscription;

/// Tracer and meter capabilities
pub mod telemetry;

pub use error::PipelineError;
pub use event::{Event, Header, Position};
pub use handler::{FnHandler, Handler, HandlerError, HandlerFuture, handler_fn};
pub use subscription::{Publisher, Subscription};
pub use telemetry::{AttributeValue, KeyValue, Meter, NoopMeter, NoopTracer, Span, Telemetry, Tracer};
