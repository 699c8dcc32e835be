//! Answer consumer service.
//!
//! Run with:
//! ```bash
//! KAFKA_BROKER_URI=localhost:9092 \
//! KAFKA_CONSUMER_TOPIC=answers \
//! KAFKA_DEADLETTER_TOPIC=answers-dlq \
//! KAFKA_CONSUMER_GROUP=answer-consumer \
//! cargo run -p answer-consumer
//! ```

use answer_consumer::{AnswerHandler, InMemoryAnswerStore};
use anyhow::Context;
use drainpipe_core::{CancellationToken, Telemetry};
use drainpipe_redpanda::{InstrumentedDialer, RedpandaPublisher, RedpandaSubscription, TcpDialer};
use drainpipe_runtime::{Consumer, ConsumerConfig, MetricsMeter, MetricsServer, TracingTracer};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on draining in-flight events after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "answer_consumer=info,drainpipe_runtime=info,drainpipe_redpanda=info".into()
        }))
        .with(fmt::layer())
        .init();

    let config = ConsumerConfig::from_env().context("Failed to load configuration")?;
    info!(
        topic = %config.topic,
        dead_letter_topic = %config.dead_letter_topic,
        group_id = %config.group_id,
        workers = config.workers,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr);
    metrics.start().context("Failed to start metrics server")?;

    let telemetry = Telemetry::new(Arc::new(TracingTracer), Arc::new(MetricsMeter));
    let dialer = Arc::new(InstrumentedDialer::new(
        TcpDialer::new(config.dial_timeout(), config.dial_keep_alive()),
        telemetry.tracer.clone(),
    ));
    let brokers = config.bootstrap_servers();

    let subscription = RedpandaSubscription::builder()
        .brokers(&brokers)
        .topic(config.topic.clone())
        .group_id(config.group_id.clone())
        .auto_offset_reset(config.auto_offset_reset.as_str())
        .dial_timeout(config.dial_timeout())
        .keep_alive(config.dial_keep_alive())
        .dialer(dialer.clone())
        .build()
        .await
        .context("Failed to subscribe to answers topic")?;

    let dead_letters = RedpandaPublisher::builder()
        .brokers(&brokers)
        .topic(config.dead_letter_topic.clone())
        .dial_timeout(config.dial_timeout())
        .keep_alive(config.dial_keep_alive())
        .dialer(dialer)
        .build()
        .await
        .context("Failed to create dead-letter publisher")?;

    let store = Arc::new(InMemoryAnswerStore::new());
    let consumer = Consumer::builder()
        .subscription(Arc::new(subscription))
        .dead_letter(Arc::new(dead_letters))
        .handler(Arc::new(AnswerHandler::new(store)))
        .retry_policy(config.retry_policy())
        .channel_capacity(config.channel_capacity)
        .telemetry(telemetry)
        .build()
        .context("Failed to build consumer")?;

    let cancel = CancellationToken::new();
    let handle = consumer
        .start(cancel.clone(), config.workers)
        .context("Failed to start consumer")?;

    shutdown_signal().await;
    info!("Shutting down consumer");
    cancel.cancel();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle.join()).await.is_err() {
        tracing::warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "Consumer did not stop in time");
    }

    info!("Consumer stopped");
    Ok(())
}

/// Returns when the process receives SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
