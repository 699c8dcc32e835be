//! Error types for the consumption pipeline.

use crate::event::Position;
use thiserror::Error;

/// Errors raised by subscriptions, publishers and consumer construction.
///
/// Per-event errors (fetch, commit, publish) are contained by the runtime: they are
/// logged and counted but never terminate the consumer. Only construction errors
/// reach the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Failed to connect to the log system
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Construction parameters are missing or invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Fetching the next event failed (timeout, transient I/O)
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// Acknowledging an event's position failed
    #[error("Commit failed for {position}: {reason}")]
    CommitFailed {
        /// The position that could not be committed
        position: Position,
        /// The reason for failure
        reason: String,
    },

    /// Publishing an event to a topic failed
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// The operation observed cancellation before completing
    #[error("Operation cancelled")]
    Cancelled,

    /// The subscription or publisher has already been closed
    #[error("Already closed")]
    Closed,
}

impl PipelineError {
    /// Whether the error means the resource can never yield again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }
}
