//! Broker dialing.
//!
//! The Kafka client owns its broker sockets, so dialing here serves reachability
//! probes: [`BrokerProbe`] dials the configured brokers when a subscription or publisher
//! is built and again after a fetch fails. Wrapping the dialer in [`InstrumentedDialer`]
//! gives every probe a `kafka.dial` span with its duration and error. The same timeout
//! and keep-alive settings are forwarded to the client's own connections.

use drainpipe_core::{BoxFuture, KeyValue, PipelineError, Tracer};
use rdkafka::config::ClientConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tracing::Instrument;

/// Default dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default TCP keep-alive period.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Opens TCP connections.
pub trait Dial: Send + Sync {
    /// Connect to `address` (`host:port`) over `network` (`tcp`, `tcp4` or `tcp6`).
    ///
    /// # Errors
    ///
    /// Returns the resolution or connection error, or [`io::ErrorKind::TimedOut`].
    fn dial<'a>(&'a self, network: &'a str, address: &'a str) -> BoxFuture<'a, io::Result<TcpStream>>;
}

impl<D: Dial + ?Sized> Dial for Arc<D> {
    fn dial<'a>(&'a self, network: &'a str, address: &'a str) -> BoxFuture<'a, io::Result<TcpStream>> {
        (**self).dial(network, address)
    }
}

/// Plain TCP dialer with a connect timeout and TCP keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpDialer {
    timeout: Duration,
    keep_alive: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT, DEFAULT_KEEP_ALIVE)
    }
}

impl TcpDialer {
    /// Create a dialer. A zero `keep_alive` disables TCP keep-alive.
    #[must_use]
    pub const fn new(timeout: Duration, keep_alive: Duration) -> Self {
        Self { timeout, keep_alive }
    }

    /// Connect timeout, covering resolution and every candidate address.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Keep-alive period, zero when disabled.
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    async fn connect(&self, network: &str, address: &str) -> io::Result<TcpStream> {
        let family: fn(&SocketAddr) -> bool = match network {
            "tcp" => |_| true,
            "tcp4" => SocketAddr::is_ipv4,
            "tcp6" => SocketAddr::is_ipv6,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported network '{other}'"),
                ));
            }
        };

        let mut last_error = None;
        for addr in lookup_host(address).await?.filter(family) {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(!self.keep_alive.is_zero())?;
            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {network} address found for {address}"),
            )
        }))
    }
}

impl Dial for TcpDialer {
    fn dial<'a>(&'a self, network: &'a str, address: &'a str) -> BoxFuture<'a, io::Result<TcpStream>> {
        Box::pin(async move {
            tokio::time::timeout(self.timeout, self.connect(network, address))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("dial {address} timed out after {}ms", self.timeout.as_millis()),
                    )
                })?
        })
    }
}

/// Dialer that wraps every dial in a `kafka.dial` span.
///
/// The span carries `network` and `address`, then `dial.duration_ms` and, on failure,
/// `dial.error`. The inner result is returned unchanged.
pub struct InstrumentedDialer<D> {
    inner: D,
    tracer: Arc<dyn Tracer>,
}

impl<D: Dial> InstrumentedDialer<D> {
    /// Wrap `inner`, reporting spans to `tracer`.
    pub fn new(inner: D, tracer: Arc<dyn Tracer>) -> Self {
        Self { inner, tracer }
    }

    /// The wrapped dialer.
    pub const fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: Dial> Dial for InstrumentedDialer<D> {
    fn dial<'a>(&'a self, network: &'a str, address: &'a str) -> BoxFuture<'a, io::Result<TcpStream>> {
        Box::pin(async move {
            let mut span = self.tracer.start_span(
                "kafka.dial",
                vec![
                    KeyValue::string("network", network),
                    KeyValue::string("address", address),
                ],
            );

            tracing::info!(network, address, "Kafka dial initiated");
            let started = Instant::now();
            let result = self
                .inner
                .dial(network, address)
                .instrument(span.tracing_span())
                .await;
            let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
            tracing::info!(network, address, elapsed_ms, "Kafka dial complete");

            span.set_attribute(KeyValue::i64("dial.duration_ms", elapsed_ms));
            if let Err(e) = &result {
                span.set_attribute(KeyValue::string("dial.error", e.to_string()));
                span.record_error(e);
            }
            span.end();
            result
        })
    }
}

impl<D: std::fmt::Debug> std::fmt::Debug for InstrumentedDialer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentedDialer")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

/// Split `host:port`, rejecting anything else.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if the host is empty or the port is not a
/// valid `u16`.
pub fn validate_broker_address(address: &str) -> Result<(), PipelineError> {
    let invalid = || PipelineError::InvalidConfig(format!("invalid broker address '{address}' (expected host:port)"));
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}

/// Checks that at least one broker accepts TCP connections.
#[derive(Clone)]
pub struct BrokerProbe {
    brokers: Vec<String>,
    dialer: Arc<dyn Dial>,
}

impl BrokerProbe {
    /// Probe `brokers` with `dialer`.
    pub fn new(brokers: Vec<String>, dialer: Arc<dyn Dial>) -> Self {
        Self { brokers, dialer }
    }

    /// Brokers probed, in dial order.
    #[must_use]
    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    /// Dial the brokers in order until one connects.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::InvalidConfig`] if there are no brokers or one is not `host:port`.
    /// - [`PipelineError::ConnectionFailed`] if every dial failed.
    pub async fn check(&self) -> Result<(), PipelineError> {
        if self.brokers.is_empty() {
            return Err(PipelineError::InvalidConfig("no brokers configured".to_string()));
        }
        for broker in &self.brokers {
            validate_broker_address(broker)?;
        }

        let mut failures = Vec::with_capacity(self.brokers.len());
        for broker in &self.brokers {
            match self.dialer.dial("tcp", broker).await {
                Ok(_stream) => {
                    tracing::debug!(broker = %broker, "Broker reachable");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(broker = %broker, error = %e, "Broker unreachable");
                    failures.push(format!("{broker}: {e}"));
                }
            }
        }

        Err(PipelineError::ConnectionFailed(format!(
            "no broker reachable ({})",
            failures.join("; ")
        )))
    }
}

impl std::fmt::Debug for BrokerProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerProbe")
            .field("brokers", &self.brokers)
            .finish_non_exhaustive()
    }
}

/// Broker list and dial settings shared by the subscription and publisher builders.
#[derive(Clone, Default)]
pub(crate) struct ConnectionSettings {
    pub(crate) brokers: Vec<String>,
    pub(crate) dial_timeout: Option<Duration>,
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) dialer: Option<Arc<dyn Dial>>,
}

impl ConnectionSettings {
    pub(crate) fn set_brokers(&mut self, brokers: &str) {
        self.brokers = brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect();
    }

    fn dial_timeout(&self) -> Duration {
        self.dial_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT)
    }

    fn keep_alive(&self) -> Duration {
        self.keep_alive.unwrap_or(DEFAULT_KEEP_ALIVE)
    }

    /// Probe using the configured dialer, or a plain [`TcpDialer`] with these settings.
    pub(crate) fn probe(&self) -> BrokerProbe {
        let dialer = self.dialer.clone().unwrap_or_else(|| {
            Arc::new(TcpDialer::new(self.dial_timeout(), self.keep_alive())) as Arc<dyn Dial>
        });
        BrokerProbe::new(self.brokers.clone(), dialer)
    }

    /// Client configuration with the bootstrap servers and socket settings applied.
    pub(crate) fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set(
                "socket.connection.setup.timeout.ms",
                self.dial_timeout().as_millis().to_string(),
            )
            .set(
                "socket.keepalive.enable",
                if self.keep_alive().is_zero() { "false" } else { "true" },
            );
        config
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use drainpipe_core::NoopTracer;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct SpanLog(Mutex<Vec<(&'static str, Vec<KeyValue>)>>);

    struct LoggedSpan {
        name: &'static str,
        attributes: Vec<KeyValue>,
        log: Arc<SpanLog>,
    }

    impl drainpipe_core::Span for LoggedSpan {
        fn set_attribute(&mut self, attribute: KeyValue) {
            self.attributes.push(attribute);
        }

        fn end(self: Box<Self>) {
            self.log.0.lock().unwrap().push((self.name, self.attributes));
        }
    }

    struct LogTracer(Arc<SpanLog>);

    impl Tracer for LogTracer {
        fn start_span(&self, name: &'static str, attributes: Vec<KeyValue>) -> Box<dyn drainpipe_core::Span> {
            Box::new(LoggedSpan {
                name,
                attributes,
                log: Arc::clone(&self.0),
            })
        }
    }

    fn has_key(attributes: &[KeyValue], key: &str) -> bool {
        attributes.iter().any(|kv| kv.key == key)
    }

    #[tokio::test]
    async fn tcp_dialer_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let dialer = TcpDialer::new(Duration::from_secs(1), Duration::ZERO);

        let stream = dialer.dial("tcp", &address).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().to_string(), address);
    }

    #[tokio::test]
    async fn tcp_dialer_filters_by_network() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let dialer = TcpDialer::default();

        assert!(dialer.dial("tcp4", &address).await.is_ok());
        let err = dialer.dial("tcp6", &address).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
        let err = dialer.dial("udp", &address).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn instrumented_dialer_records_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let log = Arc::new(SpanLog::default());
        let dialer = InstrumentedDialer::new(TcpDialer::default(), Arc::new(LogTracer(log.clone())));

        dialer.dial("tcp", &address).await.unwrap();

        let spans = log.0.lock().unwrap();
        assert_eq!(spans.len(), 1);
        let (name, attributes) = &spans[0];
        assert_eq!(*name, "kafka.dial");
        assert!(attributes.contains(&KeyValue::string("network", "tcp")));
        assert!(attributes.contains(&KeyValue::string("address", address.clone())));
        assert!(has_key(attributes, "dial.duration_ms"));
        assert!(!has_key(attributes, "dial.error"));
    }

    #[tokio::test]
    async fn instrumented_dialer_records_failure_and_passes_error_through() {
        // Bind then drop to get a port nothing listens on
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let log = Arc::new(SpanLog::default());
        let dialer = InstrumentedDialer::new(TcpDialer::default(), Arc::new(LogTracer(log.clone())));

        let err = dialer.dial("tcp", &address).await.unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        let spans = log.0.lock().unwrap();
        assert!(has_key(&spans[0].1, "dial.error"));
        assert!(has_key(&spans[0].1, "dial.duration_ms"));
    }

    #[test]
    fn broker_addresses_need_host_and_port() {
        assert!(validate_broker_address("kafka-0:9092").is_ok());
        assert!(validate_broker_address("[::1]:9092").is_ok());
        assert!(validate_broker_address("kafka-0").is_err());
        assert!(validate_broker_address(":9092").is_err());
        assert!(validate_broker_address("kafka-0:port").is_err());
    }

    #[tokio::test]
    async fn probe_succeeds_when_any_broker_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reachable = listener.local_addr().unwrap().to_string();
        let unreachable = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let probe = BrokerProbe::new(vec![unreachable, reachable], Arc::new(TcpDialer::default()));

        probe.check().await.unwrap();
    }

    #[tokio::test]
    async fn probe_reports_invalid_and_unreachable_brokers() {
        let dialer: Arc<dyn Dial> = Arc::new(InstrumentedDialer::new(TcpDialer::default(), Arc::new(NoopTracer)));

        let invalid = BrokerProbe::new(vec!["no-port".to_string()], dialer.clone());
        assert!(matches!(invalid.check().await, Err(PipelineError::InvalidConfig(_))));

        let empty = BrokerProbe::new(Vec::new(), dialer.clone());
        assert!(matches!(empty.check().await, Err(PipelineError::InvalidConfig(_))));

        let unreachable = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let down = BrokerProbe::new(vec![unreachable], dialer);
        assert!(matches!(down.check().await, Err(PipelineError::ConnectionFailed(_))));
    }

    #[test]
    fn client_config_forwards_socket_settings() {
        let mut settings = ConnectionSettings::default();
        settings.set_brokers("a:9092, b:9092,");
        settings.dial_timeout = Some(Duration::from_secs(3));
        settings.keep_alive = Some(Duration::ZERO);

        let config = settings.client_config();
        assert_eq!(config.get("bootstrap.servers"), Some("a:9092,b:9092"));
        assert_eq!(config.get("socket.connection.setup.timeout.ms"), Some("3000"));
        assert_eq!(config.get("socket.keepalive.enable"), Some("false"));
        assert_eq!(settings.probe().brokers().len(), 2);
    }
}
