//! Worker loop: process, retry, dead-letter, acknowledge.
//!
//! Each worker repeatedly races cancellation against the next event on the shared
//! dispatch channel. For every event it:
//!
//! 1. opens a `process` span,
//! 2. runs the handler under the retry policy, checking cancellation between attempts,
//! 3. publishes the event to the dead-letter sink if every attempt failed, holding on
//!    it until the publish succeeds unless the failure policy says to acknowledge,
//! 4. acknowledges the position under a `commit` span.
//!
//! An event whose retries or held publish are cut short by cancellation is abandoned:
//! it is neither dead-lettered nor acknowledged.

use crate::dead_letter::{DeadLetterFailurePolicy, DeadLetterSink};
use crate::metrics::names;
use crate::retry::{RetryError, RetryPolicy, retry_with_cancellation};
use drainpipe_core::telemetry::{KeyValue, Telemetry};
use drainpipe_core::{Event, Handler, Subscription};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Receiving half of the dispatch channel, shared by all workers.
pub(crate) type SharedReceiver = Arc<Mutex<mpsc::Receiver<Arc<Event>>>>;

/// How one event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Handler succeeded
    Handled,
    /// Handler exhausted its attempts and the event went to the dead-letter topic
    DeadLettered,
    /// Handler exhausted its attempts and the dead-letter publish failed with
    /// [`DeadLetterFailurePolicy::Acknowledge`] in force
    DeadLetterFailed,
    /// Cancellation interrupted the handler retries or a held dead-letter publish
    Abandoned,
}

impl Resolution {
    const fn should_acknowledge(self, policy: DeadLetterFailurePolicy) -> bool {
        match self {
            Self::Handled | Self::DeadLettered => true,
            Self::DeadLetterFailed => matches!(policy, DeadLetterFailurePolicy::Acknowledge),
            Self::Abandoned => false,
        }
    }
}

/// Everything a worker needs, shared by the whole pool.
pub(crate) struct WorkerContext {
    pub(crate) subscription: Arc<dyn Subscription>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) sink: Arc<DeadLetterSink>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) dead_letter_failure_policy: DeadLetterFailurePolicy,
    pub(crate) telemetry: Telemetry,
}

pub(crate) struct Worker {
    id: usize,
    context: Arc<WorkerContext>,
    receiver: SharedReceiver,
}

impl Worker {
    pub(crate) const fn new(id: usize, context: Arc<WorkerContext>, receiver: SharedReceiver) -> Self {
        Self {
            id,
            context,
            receiver,
        }
    }

    /// Run until cancellation or until the dispatch channel is closed and drained.
    pub(crate) async fn run(self, cancel: CancellationToken) {
        tracing::info!(worker = self.id, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                event = next_event(&self.receiver) => event,
            };
            let Some(event) = next else {
                break;
            };
            self.process(&cancel, event).await;
        }

        tracing::info!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, cancel: &CancellationToken, event: Arc<Event>) {
        let ctx = &self.context;
        let position = event.position().clone();
        let mut span = ctx.telemetry.tracer.start_span(
            "process",
            vec![
                KeyValue::string("topic", position.topic.clone()),
                KeyValue::i64("partition", i64::from(position.partition)),
                KeyValue::i64("offset", position.offset),
                KeyValue::i64("worker", i64::try_from(self.id).unwrap_or(i64::MAX)),
            ],
        );

        let outcome = retry_with_cancellation(&ctx.retry_policy, cancel, |attempt| {
            if attempt > 1 {
                ctx.telemetry.meter.add(
                    names::HANDLER_RETRIES,
                    1,
                    &[KeyValue::string("topic", position.topic.clone())],
                );
            }
            ctx.handler.handle(cancel.clone(), Arc::clone(&event))
        })
        .instrument(span.tracing_span())
        .await;

        let resolution = match outcome {
            Ok(()) => {
                span.set_attribute(KeyValue::bool("handled", true));
                ctx.telemetry.meter.add(
                    names::MESSAGES_PROCESSED,
                    1,
                    &[KeyValue::string("topic", position.topic.clone())],
                );
                tracing::info!(worker = self.id, position = %position, "Event processed");
                Resolution::Handled
            }
            Err(RetryError::Exhausted { attempts, last_error }) => {
                span.set_attribute(KeyValue::i64("attempts", i64::try_from(attempts).unwrap_or(i64::MAX)));
                span.record_error(&last_error);
                tracing::error!(
                    worker = self.id,
                    position = %position,
                    attempts,
                    error = %last_error,
                    "Handler failed after all attempts, dead-lettering event"
                );
                match ctx.sink.publish(&event).instrument(span.tracing_span()).await {
                    Ok(()) => Resolution::DeadLettered,
                    Err(_) => match ctx.dead_letter_failure_policy {
                        DeadLetterFailurePolicy::Acknowledge => Resolution::DeadLetterFailed,
                        DeadLetterFailurePolicy::HoldPosition => {
                            self.hold(cancel, &event).instrument(span.tracing_span()).await
                        }
                    },
                }
            }
            Err(RetryError::Cancelled { attempts, last_error }) => {
                span.set_attribute(KeyValue::i64("attempts", i64::try_from(attempts).unwrap_or(i64::MAX)));
                span.record_error(&last_error);
                tracing::warn!(
                    worker = self.id,
                    position = %position,
                    attempts,
                    error = %last_error,
                    "Shutdown interrupted retries, event left for redelivery"
                );
                Resolution::Abandoned
            }
        };

        if resolution == Resolution::DeadLetterFailed {
            tracing::error!(
                worker = self.id,
                position = %position,
                "Dead-letter publish failed, acknowledging and dropping event"
            );
        }
        if resolution.should_acknowledge(ctx.dead_letter_failure_policy) {
            self.acknowledge(&event).instrument(span.tracing_span()).await;
        }
        span.end();
    }

    /// Stay on `event` until the dead-letter topic takes it. A later acknowledgement on
    /// the same partition would otherwise commit past it.
    async fn hold(&self, cancel: &CancellationToken, event: &Event) -> Resolution {
        tracing::error!(
            worker = self.id,
            position = %event.position(),
            "Dead-letter publish failed, holding position"
        );
        match self.context.sink.publish_until_delivered(event, cancel).await {
            Ok(()) => Resolution::DeadLettered,
            Err(e) => {
                tracing::warn!(
                    worker = self.id,
                    position = %event.position(),
                    error = %e,
                    "Stopped holding event, left for redelivery"
                );
                Resolution::Abandoned
            }
        }
    }

    async fn acknowledge(&self, event: &Event) {
        let ctx = &self.context;
        let position = event.position();
        let mut span = ctx.telemetry.tracer.start_span(
            "commit",
            vec![
                KeyValue::string("topic", position.topic.clone()),
                KeyValue::i64("partition", i64::from(position.partition)),
                KeyValue::i64("offset", position.offset),
            ],
        );

        match ctx.subscription.acknowledge(event).await {
            Ok(()) => {
                ctx.telemetry.meter.add(
                    names::COMMITS,
                    1,
                    &[KeyValue::string("topic", position.topic.clone())],
                );
                tracing::debug!(worker = self.id, position = %position, "Position committed");
            }
            Err(e) => {
                span.record_error(&e);
                ctx.telemetry.meter.add(
                    names::COMMIT_ERRORS,
                    1,
                    &[KeyValue::string("topic", position.topic.clone())],
                );
                tracing::error!(
                    worker = self.id,
                    position = %position,
                    error = %e,
                    "Failed to commit position (event may be redelivered)"
                );
            }
        }
        span.end();
    }
}

async fn next_event(receiver: &SharedReceiver) -> Option<Arc<Event>> {
    receiver.lock().await.recv().await
}
