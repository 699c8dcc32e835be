//! Consumer configuration.
//!
//! Loaded from environment variables with defaults. Required variables have no default
//! and produce [`PipelineError::InvalidConfig`] when missing.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `KAFKA_BROKER_URI` | required, comma separated |
//! | `KAFKA_CONSUMER_TOPIC` | required |
//! | `KAFKA_DEADLETTER_TOPIC` | required |
//! | `KAFKA_CONSUMER_GROUP` | required, `POD_NAME` appended when set |
//! | `CONSUMER_WORKERS` | 2 |
//! | `CONSUMER_CHANNEL_CAPACITY` | worker count |
//! | `CONSUMER_MAX_ATTEMPTS` | 3 |
//! | `CONSUMER_RETRY_INITIAL_DELAY_MS` | 3000 |
//! | `CONSUMER_RETRY_MAX_DELAY_MS` | 30000 |
//! | `KAFKA_DIAL_TIMEOUT_MS` | 10000 |
//! | `KAFKA_DIAL_KEEPALIVE_MS` | 30000 (0 disables) |
//! | `KAFKA_AUTO_OFFSET_RESET` | `earliest` |
//! | `METRICS_ADDR` | `0.0.0.0:9090` |

use crate::retry::RetryPolicy;
use drainpipe_core::PipelineError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable names.
pub mod env {
    /// Comma-separated broker addresses
    pub const BROKERS: &str = "KAFKA_BROKER_URI";
    /// Source topic
    pub const TOPIC: &str = "KAFKA_CONSUMER_TOPIC";
    /// Dead-letter topic
    pub const DEAD_LETTER_TOPIC: &str = "KAFKA_DEADLETTER_TOPIC";
    /// Consumer group id prefix
    pub const GROUP: &str = "KAFKA_CONSUMER_GROUP";
    /// Pod name appended to the group id
    pub const POD_NAME: &str = "POD_NAME";
    /// Worker count
    pub const WORKERS: &str = "CONSUMER_WORKERS";
    /// Dispatch channel capacity
    pub const CHANNEL_CAPACITY: &str = "CONSUMER_CHANNEL_CAPACITY";
    /// Handler attempts per event
    pub const MAX_ATTEMPTS: &str = "CONSUMER_MAX_ATTEMPTS";
    /// First retry delay in milliseconds
    pub const RETRY_INITIAL_DELAY_MS: &str = "CONSUMER_RETRY_INITIAL_DELAY_MS";
    /// Retry delay cap in milliseconds
    pub const RETRY_MAX_DELAY_MS: &str = "CONSUMER_RETRY_MAX_DELAY_MS";
    /// Broker dial timeout in milliseconds
    pub const DIAL_TIMEOUT_MS: &str = "KAFKA_DIAL_TIMEOUT_MS";
    /// TCP keep-alive period in milliseconds
    pub const DIAL_KEEPALIVE_MS: &str = "KAFKA_DIAL_KEEPALIVE_MS";
    /// Offset reset policy for new groups
    pub const AUTO_OFFSET_RESET: &str = "KAFKA_AUTO_OFFSET_RESET";
    /// Prometheus listener address
    pub const METRICS_ADDR: &str = "METRICS_ADDR";
}

/// Where a consumer group without a committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Oldest retained message
    #[default]
    Earliest,
    /// Only messages produced after the group joins
    Latest,
}

impl OffsetReset {
    /// Value for the Kafka client's `auto.offset.reset` setting.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            other => Err(PipelineError::InvalidConfig(format!(
                "invalid offset reset '{other}' (expected earliest or latest)"
            ))),
        }
    }
}

/// Consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Broker addresses (`host:port`)
    pub brokers: Vec<String>,
    /// Source topic
    pub topic: String,
    /// Dead-letter topic
    pub dead_letter_topic: String,
    /// Consumer group id (pod suffix already applied)
    pub group_id: String,
    /// Number of worker tasks
    pub workers: usize,
    /// Dispatch channel capacity
    pub channel_capacity: usize,
    /// Handler attempts per event, first call included
    pub max_attempts: usize,
    /// Delay before the first retry in milliseconds
    pub retry_initial_delay_ms: u64,
    /// Upper bound for retry delays in milliseconds
    pub retry_max_delay_ms: u64,
    /// Broker dial timeout in milliseconds
    pub dial_timeout_ms: u64,
    /// TCP keep-alive period in milliseconds (0 disables keep-alive)
    pub dial_keep_alive_ms: u64,
    /// Offset reset policy
    pub auto_offset_reset: OffsetReset,
    /// Prometheus listener address
    pub metrics_addr: SocketAddr,
}

impl ConsumerConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if a required variable is missing or a
    /// value does not parse.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if a required variable is missing or a
    /// value does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| PipelineError::InvalidConfig(format!("{key} is not set")))
        };

        let brokers: Vec<String> = required(env::BROKERS)?
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect();
        if brokers.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "{} contains no broker addresses",
                env::BROKERS
            )));
        }

        let mut group_id = required(env::GROUP)?;
        if let Some(pod) = get(env::POD_NAME) {
            group_id.push_str(&pod);
        }

        let workers = parse_or(get(env::WORKERS), env::WORKERS, 2)?;
        let channel_capacity = parse_or(get(env::CHANNEL_CAPACITY), env::CHANNEL_CAPACITY, workers)?;

        let config = Self {
            brokers,
            topic: required(env::TOPIC)?,
            dead_letter_topic: required(env::DEAD_LETTER_TOPIC)?,
            group_id,
            workers,
            channel_capacity,
            max_attempts: parse_or(get(env::MAX_ATTEMPTS), env::MAX_ATTEMPTS, 3)?,
            retry_initial_delay_ms: parse_or(
                get(env::RETRY_INITIAL_DELAY_MS),
                env::RETRY_INITIAL_DELAY_MS,
                3000,
            )?,
            retry_max_delay_ms: parse_or(get(env::RETRY_MAX_DELAY_MS), env::RETRY_MAX_DELAY_MS, 30_000)?,
            dial_timeout_ms: parse_or(get(env::DIAL_TIMEOUT_MS), env::DIAL_TIMEOUT_MS, 10_000)?,
            dial_keep_alive_ms: parse_or(get(env::DIAL_KEEPALIVE_MS), env::DIAL_KEEPALIVE_MS, 30_000)?,
            auto_offset_reset: get(env::AUTO_OFFSET_RESET)
                .map_or(Ok(OffsetReset::default()), |v| v.parse())?,
            metrics_addr: parse_or(
                get(env::METRICS_ADDR),
                env::METRICS_ADDR,
                SocketAddr::from(([0, 0, 0, 0], 9090)),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.brokers.is_empty() {
            return Err(PipelineError::InvalidConfig("no brokers configured".to_string()));
        }
        if self.workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "worker count must be greater than 0".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "channel capacity must be greater than 0".to_string(),
            ));
        }
        if self.topic == self.dead_letter_topic {
            return Err(PipelineError::InvalidConfig(format!(
                "dead-letter topic must differ from source topic '{}'",
                self.topic
            )));
        }
        Ok(())
    }

    /// Handler retry policy described by this configuration (multiplier 2).
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .multiplier(2.0)
            .build()
    }

    /// Broker dial timeout.
    #[must_use]
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// TCP keep-alive period, `Duration::ZERO` when disabled.
    #[must_use]
    pub const fn dial_keep_alive(&self) -> Duration {
        Duration::from_millis(self.dial_keep_alive_ms)
    }

    /// Brokers joined for the Kafka client's `bootstrap.servers`.
    #[must_use]
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, PipelineError> {
    value.map_or(Ok(default), |v| {
        v.trim()
            .parse()
            .map_err(|_| PipelineError::InvalidConfig(format!("{key} has invalid value '{v}'")))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        (env::BROKERS, "kafka-0:9092, kafka-1:9092"),
        (env::TOPIC, "answers"),
        (env::DEAD_LETTER_TOPIC, "answers-dlq"),
        (env::GROUP, "answers-consumer"),
    ];

    #[test]
    fn defaults_apply() {
        let config = ConsumerConfig::from_lookup(lookup(REQUIRED)).unwrap();

        assert_eq!(config.brokers, vec!["kafka-0:9092", "kafka-1:9092"]);
        assert_eq!(config.bootstrap_servers(), "kafka-0:9092,kafka-1:9092");
        assert_eq!(config.group_id, "answers-consumer");
        assert_eq!(config.workers, 2);
        assert_eq!(config.channel_capacity, 2);
        assert_eq!(config.auto_offset_reset, OffsetReset::Earliest);
        assert_eq!(config.dial_timeout(), Duration::from_secs(10));
        assert_eq!(config.dial_keep_alive(), Duration::from_secs(30));
        assert_eq!(config.metrics_addr, "0.0.0.0:9090".parse().unwrap());

        let policy = config.retry_policy();
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(6));
    }

    #[test]
    fn pod_name_suffixes_group() {
        let mut vars = REQUIRED.to_vec();
        vars.push((env::POD_NAME, "-pod-7"));
        let config = ConsumerConfig::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.group_id, "answers-consumer-pod-7");
    }

    #[test]
    fn channel_capacity_follows_workers_unless_set() {
        let mut vars = REQUIRED.to_vec();
        vars.push((env::WORKERS, "8"));
        let config = ConsumerConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.channel_capacity, 8);

        vars.push((env::CHANNEL_CAPACITY, "64"));
        let config = ConsumerConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.channel_capacity, 64);
    }

    #[test]
    fn missing_required_is_invalid() {
        let result = ConsumerConfig::from_lookup(lookup(&REQUIRED[1..]));

        assert_eq!(
            result,
            Err(PipelineError::InvalidConfig("KAFKA_BROKER_URI is not set".to_string()))
        );
    }

    #[test]
    fn rejects_bad_values() {
        for (key, value) in [
            (env::WORKERS, "0"),
            (env::WORKERS, "many"),
            (env::AUTO_OFFSET_RESET, "middle"),
            (env::METRICS_ADDR, "nowhere"),
            (env::BROKERS, " , "),
            (env::DEAD_LETTER_TOPIC, "answers"),
        ] {
            let mut vars: Vec<_> = REQUIRED.iter().filter(|(k, _)| *k != key).copied().collect();
            vars.push((key, value));
            let result = ConsumerConfig::from_lookup(lookup(&vars));
            assert!(
                matches!(result, Err(PipelineError::InvalidConfig(_))),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn offset_reset_parses_case_insensitively() {
        assert_eq!("Latest".parse::<OffsetReset>().unwrap(), OffsetReset::Latest);
        assert_eq!(OffsetReset::Earliest.as_str(), "earliest");
    }

    #[test]
    fn serializes_to_json() {
        let config = ConsumerConfig::from_lookup(lookup(REQUIRED)).unwrap();
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["auto_offset_reset"], "earliest");
        assert_eq!(json["workers"], 2);
    }
}
