//! In-memory subscription and publisher.
//!
//! - [`InMemorySubscription`]: events pushed by the test, acknowledgements recorded
//! - [`RecordingPublisher`]: keeps every published event, with injectable failures

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned mutex

use drainpipe_core::{BoxFuture, Event, PipelineError, Position, Publisher, Subscription};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

/// Decrement `counter` if it is positive. Returns whether a failure was consumed.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// Subscription backed by an unbounded in-memory queue.
///
/// Events are delivered in push order. `fetch_next` waits for the next push or for
/// cancellation, whichever comes first.
///
/// # Example
///
/// ```
/// use drainpipe_core::{CancellationToken, Subscription};
/// use drainpipe_testing::InMemorySubscription;
///
/// # tokio_test::block_on(async {
/// let subscription = InMemorySubscription::new("answers");
/// subscription.push(b"hello".to_vec());
///
/// let event = subscription.fetch_next(&CancellationToken::new()).await.unwrap();
/// assert_eq!(event.payload(), b"hello");
/// assert_eq!(event.position().offset, 0);
/// # });
/// ```
#[derive(Debug)]
pub struct InMemorySubscription {
    topic: String,
    sender: mpsc::UnboundedSender<Event>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
    next_offset: AtomicI64,
    acknowledged: Mutex<Vec<Position>>,
    ack_notify: Notify,
    fetch_calls: AtomicUsize,
    fetches_after_cancel: AtomicUsize,
    fetch_failures: AtomicUsize,
    ack_failures: AtomicUsize,
    close_calls: AtomicUsize,
    closed: AtomicBool,
}

impl InMemorySubscription {
    /// Create an empty subscription for `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            topic: topic.into(),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            next_offset: AtomicI64::new(0),
            acknowledged: Mutex::new(Vec::new()),
            ack_notify: Notify::new(),
            fetch_calls: AtomicUsize::new(0),
            fetches_after_cancel: AtomicUsize::new(0),
            fetch_failures: AtomicUsize::new(0),
            ack_failures: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a payload on partition 0 at the next offset. Returns its position.
    pub fn push(&self, payload: Vec<u8>) -> Position {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        let position = Position::new(self.topic.clone(), 0, offset);
        self.push_event(Event::new(position.clone(), payload));
        position
    }

    /// Queue a fully built event.
    pub fn push_event(&self, event: Event) {
        // The receiver lives as long as `self`, so the send cannot fail.
        let _ = self.sender.send(event);
    }

    /// Make the next `count` fetches fail with [`PipelineError::FetchFailed`].
    pub fn fail_next_fetches(&self, count: usize) {
        self.fetch_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` acknowledgements fail with [`PipelineError::CommitFailed`].
    pub fn fail_next_acks(&self, count: usize) {
        self.ack_failures.store(count, Ordering::SeqCst);
    }

    /// Positions acknowledged so far, in acknowledgement order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<Position> {
        self.acknowledged.lock().unwrap().clone()
    }

    /// Number of successful acknowledgements of `position`.
    #[must_use]
    pub fn ack_count(&self, position: &Position) -> usize {
        self.acknowledged
            .lock()
            .unwrap()
            .iter()
            .filter(|p| *p == position)
            .count()
    }

    /// Wait until at least `count` acknowledgements were recorded.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_acks(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.ack_notify.notified();
                if self.acknowledged.lock().unwrap().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// Total `fetch_next` calls.
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// `fetch_next` calls that started with the token already cancelled.
    #[must_use]
    pub fn fetches_after_cancel(&self) -> usize {
        self.fetches_after_cancel.load(Ordering::SeqCst)
    }

    /// Total `close` calls.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl Subscription for InMemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn fetch_next<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Event, PipelineError>> {
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if cancel.is_cancelled() {
                self.fetches_after_cancel.fetch_add(1, Ordering::SeqCst);
                return Err(PipelineError::Cancelled);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(PipelineError::Closed);
            }
            if take_failure(&self.fetch_failures) {
                return Err(PipelineError::FetchFailed("injected fetch failure".to_string()));
            }

            let mut receiver = self.receiver.lock().await;
            tokio::select! {
                () = cancel.cancelled() => Err(PipelineError::Cancelled),
                event = receiver.recv() => event.ok_or(PipelineError::Closed),
            }
        })
    }

    fn acknowledge<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PipelineError::Closed);
            }
            if take_failure(&self.ack_failures) {
                return Err(PipelineError::CommitFailed {
                    position: event.position().clone(),
                    reason: "injected commit failure".to_string(),
                });
            }
            self.acknowledged.lock().unwrap().push(event.position().clone());
            self.ack_notify.notify_waiters();
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), PipelineError>> {
        Box::pin(async move {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Publisher that records every event it is given.
#[derive(Debug)]
pub struct RecordingPublisher {
    topic: String,
    published: Mutex<Vec<Event>>,
    publish_calls: AtomicUsize,
    close_calls: AtomicUsize,
    failures: AtomicUsize,
    always_fail: AtomicBool,
    closed: AtomicBool,
}

impl RecordingPublisher {
    /// Create a publisher for `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            published: Mutex::new(Vec::new()),
            publish_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            always_fail: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Make the next `count` publishes fail with [`PipelineError::PublishFailed`].
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Make every publish fail from now on.
    pub fn fail_always(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    /// Events published so far.
    #[must_use]
    pub fn published(&self) -> Vec<Event> {
        self.published.lock().unwrap().clone()
    }

    /// Total `publish` calls, failed ones included.
    #[must_use]
    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    /// Total `close` calls.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl Publisher for RecordingPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn publish<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(async move {
            self.publish_calls.fetch_add(1, Ordering::SeqCst);
            if self.closed.load(Ordering::SeqCst) {
                return Err(PipelineError::Closed);
            }
            if self.always_fail.load(Ordering::SeqCst) || take_failure(&self.failures) {
                return Err(PipelineError::PublishFailed {
                    topic: self.topic.clone(),
                    reason: "injected publish failure".to_string(),
                });
            }
            self.published.lock().unwrap().push(event.clone());
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), PipelineError>> {
        Box::pin(async move {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}
