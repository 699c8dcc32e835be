//! Teardown ordering for a consumer.
//!
//! Runs on the fetch task once the fetch loop has stopped:
//!
//! 1. wait for every worker to exit (each finishes the attempt it is running),
//! 2. close the dead-letter sink,
//! 3. close the subscription.
//!
//! Closing the sink after the workers are gone means no worker can publish into a
//! closed sink. Close failures are logged and do not stop the remaining steps.

use crate::dead_letter::DeadLetterSink;
use drainpipe_core::Subscription;
use tokio::task::JoinSet;

pub(crate) async fn teardown(
    workers: &mut JoinSet<()>,
    sink: &DeadLetterSink,
    subscription: &dyn Subscription,
) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Worker task failed");
        }
    }

    if let Err(e) = sink.close().await {
        tracing::error!(topic = %sink.topic(), error = %e, "Failed to close dead-letter sink");
    }

    if let Err(e) = subscription.close().await {
        tracing::error!(topic = %subscription.topic(), error = %e, "Failed to close subscription");
    }

    tracing::info!(topic = %subscription.topic(), "Consumer stopped");
}
