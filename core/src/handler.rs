//! The handler capability supplied by the owning service.
//!
//! A handler turns one [`Event`] into success or failure. The pipeline treats every
//! failure as retryable: it calls the handler again under the retry policy and, once
//! the attempt budget is spent, routes the event to the dead-letter topic. Handlers
//! that want to drop a malformed event without dead-lettering it should log and
//! return `Ok(())`.
//!
//! Handlers receive the consumer's [`CancellationToken`]. The pipeline never aborts a
//! handler call that is already running; long-running handlers that want to stop early
//! on shutdown must observe the token themselves.
//!
//! # Example
//!
//! ```
//! use drainpipe_core::handler::{Handler, HandlerError, HandlerFuture};
//! use drainpipe_core::{CancellationToken, Event};
//! use std::sync::Arc;
//!
//! struct RejectEmpty;
//!
//! impl Handler for RejectEmpty {
//!     fn handle(&self, _cancel: CancellationToken, event: Arc<Event>) -> HandlerFuture<'_> {
//!         Box::pin(async move {
//!             if event.payload().is_empty() {
//!                 return Err(HandlerError::new("empty payload"));
//!             }
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::event::Event;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by [`Handler::handle`].
pub type HandlerFuture<'a> = BoxFuture<'a, Result<(), HandlerError>>;

/// Failure reported by a handler.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl HandlerError {
    /// Create an error from a message.
    #[must_use]
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
            source: None,
        }
    }

    /// Wrap an underlying error, keeping it as the error source.
    #[must_use]
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Processes one event.
///
/// # Dyn Compatibility
///
/// Returns an explicit boxed future instead of using `async fn` so handlers can be
/// shared across workers as `Arc<dyn Handler>`.
pub trait Handler: Send + Sync {
    /// Process `event`.
    ///
    /// # Errors
    ///
    /// Any error is treated as retryable by the pipeline.
    fn handle(&self, cancel: CancellationToken, event: Arc<Event>) -> HandlerFuture<'_>;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn handle(&self, cancel: CancellationToken, event: Arc<Event>) -> HandlerFuture<'_> {
        (**self).handle(cancel, event)
    }
}

/// Handler backed by a closure. Created with [`handler_fn`].
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Adapt an async closure into a [`Handler`].
///
/// # Example
///
/// ```
/// use drainpipe_core::{CancellationToken, Event, Handler, HandlerError, Position, handler_fn};
/// use std::sync::Arc;
///
/// let handler = handler_fn(|_cancel, event| async move {
///     if event.payload().starts_with(b"bad") {
///         Err(HandlerError::new("rejected"))
///     } else {
///         Ok(())
///     }
/// });
///
/// # tokio_test::block_on(async {
/// let event = Arc::new(Event::new(Position::new("answers", 0, 0), b"bad input".to_vec()));
/// assert!(handler.handle(CancellationToken::new(), event).await.is_err());
/// # });
/// ```
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(CancellationToken, Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CancellationToken, Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, cancel: CancellationToken, event: Arc<Event>) -> HandlerFuture<'_> {
        Box::pin((self.f)(cancel, event))
    }
}
