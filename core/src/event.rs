//! Event types for the consumption pipeline.
//!
//! An [`Event`] is one record read from the source log. It carries an opaque payload,
//! an optional partitioning key, an ordered list of headers, an optional broker timestamp,
//! and the [`Position`] that identifies where it lives in the log.
//!
//! Events are immutable once fetched: fields are private and only exposed through
//! accessors. The builder-style `with_*` methods consume the event and are meant to be
//! used by subscription implementations while assembling a freshly fetched record.
//!
//! # Example
//!
//! ```
//! use drainpipe_core::event::{Event, Position};
//!
//! let event = Event::new(Position::new("answers", 2, 17), b"payload".to_vec())
//!     .with_key(b"user-1".to_vec())
//!     .with_header("source", Some(b"web".to_vec()));
//!
//! assert_eq!(event.header("source"), Some(&b"web"[..]));
//! assert_eq!(event.position().to_string(), "answers[2]@17");
//! ```

use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use std::fmt;

/// Location of an event in the source log.
///
/// Offsets are monotonically increasing within a partition. Acknowledging a position
/// advances the consumer group's committed cursor for that partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    /// Topic the event was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl Position {
    /// Create a new position.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A single message header.
///
/// Kafka headers may repeat keys and may carry a null value, so headers are kept as an
/// ordered list rather than a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header key
    pub key: String,
    /// Header value (`None` for a null header)
    pub value: Option<Vec<u8>>,
}

impl Header {
    /// Header value decoded as UTF-8, replacing invalid sequences.
    ///
    /// Returns an empty string for null headers.
    #[must_use]
    pub fn value_lossy(&self) -> String {
        self.value
            .as_deref()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default()
    }
}

/// One unit of data read from the source log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    position: Position,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    headers: SmallVec<[Header; 4]>,
    timestamp: Option<DateTime<Utc>>,
}

impl Event {
    /// Create an event with a payload and no key, headers or timestamp.
    #[must_use]
    pub fn new(position: Position, payload: Vec<u8>) -> Self {
        Self {
            position,
            key: None,
            payload,
            headers: SmallVec::new(),
            timestamp: None,
        }
    }

    /// Attach a partitioning key.
    #[must_use]
    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    /// Append a header. Repeated keys are kept in order.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        self.headers.push(Header {
            key: key.into(),
            value,
        });
        self
    }

    /// Attach the broker timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Position of this event in the source log.
    #[must_use]
    pub const fn position(&self) -> &Position {
        &self.position
    }

    /// Partitioning key, if any.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Opaque payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// All headers in broker order.
    #[must_use]
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Value of the first header with the given key.
    ///
    /// Returns `None` both when the header is missing and when its value is null.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .and_then(|h| h.value.as_deref())
    }

    /// Broker timestamp, if the log system supplied one.
    #[must_use]
    pub const fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}
