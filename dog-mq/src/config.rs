//! Broker configuration.
//!
//! One immutable [`BrokerConfig`] value is built at startup and handed to every
//! component constructor. It can be assembled in code, from key/value pairs, or
//! from the environment using the `PREFIX__KEY` override convention:
//!
//! ```text
//! export DOGMQ__MAX_CLAIM_TTL=600        # max_claim_ttl = 600
//! export DOGMQ__RETRY__MAX_ATTEMPTS=20   # retry.max_attempts = 20
//! ```

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};
use crate::types::{Flavor, Pool};

/// Smallest ttl accepted for messages, claims and claim grace periods
pub const MIN_TTL_SECS: u64 = 60;

/// Behaviour of `QueueController::stats` for a queue that does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingQueueStats {
    #[default]
    NotFound,
    Zeroed,
}

impl FromStr for MissingQueueStats {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "not_found" | "notfound" => Ok(Self::NotFound),
            "zeroed" | "zero" => Ok(Self::Zeroed),
            other => Err(BrokerError::InvalidConfig(format!(
                "missing_queue_stats: unknown value {other}"
            ))),
        }
    }
}

/// Backend retry tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts for transient failures (and for conflicting message posts)
    pub max_attempts: u32,
    pub max_retry_sleep: Duration,
    pub max_retry_jitter: Duration,
    /// Attempts for connection-loss failures
    pub max_reconnect_attempts: u32,
    /// Base of the exponential reconnect backoff
    pub reconnect_sleep: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1000,
            max_retry_sleep: Duration::from_millis(100),
            max_retry_jitter: Duration::from_millis(5),
            max_reconnect_attempts: 10,
            reconnect_sleep: Duration::from_millis(20),
        }
    }
}

impl RetryConfig {
    /// No sleeping between attempts; handy for tests
    pub fn immediate(max_attempts: u32, max_reconnect_attempts: u32) -> Self {
        Self {
            max_attempts,
            max_retry_sleep: Duration::ZERO,
            max_retry_jitter: Duration::ZERO,
            max_reconnect_attempts,
            reconnect_sleep: Duration::ZERO,
        }
    }
}

/// Limits, defaults and registrations for one broker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub max_queues_per_page: usize,
    /// Page size ceiling for listings and the per-request message batch limit
    pub max_messages_per_page: usize,
    pub max_messages_per_claim_or_pop: usize,
    /// Serialized metadata size ceiling, bytes
    pub max_queue_metadata: usize,
    /// Aggregate body size ceiling per post, bytes
    pub max_messages_post_size: usize,
    pub max_message_ttl: u64,
    pub max_message_delay: u64,
    pub max_claim_ttl: u64,
    pub max_claim_grace: u64,
    pub default_message_ttl: u64,
    pub default_message_delay: u64,
    pub default_claim_ttl: u64,
    pub default_claim_grace: u64,
    /// Pool group used for queues without a flavor
    pub default_pool_group: Option<String>,
    pub missing_queue_stats: MissingQueueStats,
    pub retry: RetryConfig,
    pub pools: Vec<Pool>,
    pub flavors: Vec<Flavor>,
    /// Secret for queues with `_enable_encrypt_messages`; unset disables encryption
    #[serde(default, skip_serializing)]
    pub message_encryption_key: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_queues_per_page: 20,
            max_messages_per_page: 20,
            max_messages_per_claim_or_pop: 20,
            max_queue_metadata: 64 * 1024,
            max_messages_post_size: 256 * 1024,
            max_message_ttl: 1_209_600,
            max_message_delay: 900,
            max_claim_ttl: 43_200,
            max_claim_grace: 43_200,
            default_message_ttl: 3600,
            default_message_delay: 0,
            default_claim_ttl: 300,
            default_claim_grace: 60,
            default_pool_group: None,
            missing_queue_stats: MissingQueueStats::NotFound,
            retry: RetryConfig::default(),
            pools: Vec::new(),
            flavors: Vec::new(),
            message_encryption_key: None,
        }
    }
}

impl BrokerConfig {
    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn with_flavor(mut self, flavor: Flavor) -> Self {
        self.flavors.push(flavor);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_encryption_key(mut self, secret: impl Into<String>) -> Self {
        self.message_encryption_key = Some(secret.into());
        self
    }

    /// Build from defaults overridden by `(key, value)` pairs.
    ///
    /// Keys are case-insensitive; retry tuning may be given with or without a
    /// `retry.` prefix. Durations are fractional seconds.
    pub fn from_pairs<I, K, V>(pairs: I) -> BrokerResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.apply(key.as_ref(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Build from environment variables starting with `{prefix}__`
    pub fn from_env(prefix: &str) -> BrokerResult<Self> {
        let head = format!("{}__", prefix);
        let pairs = std::env::vars().filter_map(|(k, v)| {
            k.strip_prefix(&head)
                .map(|rest| (rest.to_lowercase().replace("__", "."), v))
        });
        Self::from_pairs(pairs)
    }

    fn apply(&mut self, key: &str, value: &str) -> BrokerResult<()> {
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "max_queues_per_page" => self.max_queues_per_page = parse(&key, value)?,
            "max_messages_per_page" => self.max_messages_per_page = parse(&key, value)?,
            "max_messages_per_claim_or_pop" => {
                self.max_messages_per_claim_or_pop = parse(&key, value)?
            }
            "max_queue_metadata" => self.max_queue_metadata = parse(&key, value)?,
            "max_messages_post_size" => self.max_messages_post_size = parse(&key, value)?,
            "max_message_ttl" => self.max_message_ttl = parse(&key, value)?,
            "max_message_delay" => self.max_message_delay = parse(&key, value)?,
            "max_claim_ttl" => self.max_claim_ttl = parse(&key, value)?,
            "max_claim_grace" => self.max_claim_grace = parse(&key, value)?,
            "default_message_ttl" => self.default_message_ttl = parse(&key, value)?,
            "default_message_delay" => self.default_message_delay = parse(&key, value)?,
            "default_claim_ttl" => self.default_claim_ttl = parse(&key, value)?,
            "default_claim_grace" => self.default_claim_grace = parse(&key, value)?,
            "default_pool_group" => {
                self.default_pool_group = (!value.is_empty()).then(|| value.to_string())
            }
            "missing_queue_stats" => self.missing_queue_stats = value.parse()?,
            "message_encryption_key" => {
                self.message_encryption_key = (!value.is_empty()).then(|| value.to_string())
            }
            "max_attempts" | "retry.max_attempts" => self.retry.max_attempts = parse(&key, value)?,
            "max_retry_sleep" | "retry.max_retry_sleep" => {
                self.retry.max_retry_sleep = parse_secs(&key, value)?
            }
            "max_retry_jitter" | "retry.max_retry_jitter" => {
                self.retry.max_retry_jitter = parse_secs(&key, value)?
            }
            "max_reconnect_attempts" | "retry.max_reconnect_attempts" => {
                self.retry.max_reconnect_attempts = parse(&key, value)?
            }
            "reconnect_sleep" | "retry.reconnect_sleep" => {
                self.retry.reconnect_sleep = parse_secs(&key, value)?
            }
            other => debug!(key = other, "ignoring unknown broker config key"),
        }
        Ok(())
    }

    /// Reject limits that could never be satisfied together
    pub fn validate(&self) -> BrokerResult<()> {
        let fail = |msg: String| Err(BrokerError::InvalidConfig(msg));

        if self.max_message_ttl < MIN_TTL_SECS {
            return fail(format!("max_message_ttl must be at least {MIN_TTL_SECS}"));
        }
        if self.max_claim_ttl < MIN_TTL_SECS || self.max_claim_grace < MIN_TTL_SECS {
            return fail(format!(
                "max_claim_ttl and max_claim_grace must be at least {MIN_TTL_SECS}"
            ));
        }
        if !(MIN_TTL_SECS..=self.max_message_ttl).contains(&self.default_message_ttl) {
            return fail("default_message_ttl is outside the allowed ttl range".into());
        }
        if self.default_message_delay > self.max_message_delay {
            return fail("default_message_delay exceeds max_message_delay".into());
        }
        if !(MIN_TTL_SECS..=self.max_claim_ttl).contains(&self.default_claim_ttl) {
            return fail("default_claim_ttl is outside the allowed claim ttl range".into());
        }
        if !(MIN_TTL_SECS..=self.max_claim_grace).contains(&self.default_claim_grace) {
            return fail("default_claim_grace is outside the allowed grace range".into());
        }
        if self.max_messages_per_page == 0
            || self.max_queues_per_page == 0
            || self.max_messages_per_claim_or_pop == 0
        {
            return fail("page and batch limits must be positive".into());
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be positive".into());
        }
        if matches!(&self.message_encryption_key, Some(k) if k.is_empty()) {
            return fail("message_encryption_key must not be empty".into());
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> BrokerResult<T> {
    value
        .parse()
        .map_err(|_| BrokerError::InvalidConfig(format!("{key}: cannot parse {value:?}")))
}

fn parse_secs(key: &str, value: &str) -> BrokerResult<Duration> {
    let secs: f64 = parse(key, value)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| BrokerError::InvalidConfig(format!("{key}: invalid duration {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_claim_ttl, 300);
        assert_eq!(config.max_messages_post_size, 262_144);
        assert_eq!(config.retry.max_attempts, 1000);
    }

    #[test]
    fn pairs_override_defaults() {
        let config = BrokerConfig::from_pairs([
            ("max_messages_per_page", "50"),
            ("retry.max_retry_sleep", "0.25"),
            ("MISSING_QUEUE_STATS", "zeroed"),
            ("something_else", "whatever"),
        ])
        .unwrap();

        assert_eq!(config.max_messages_per_page, 50);
        assert_eq!(config.retry.max_retry_sleep, Duration::from_millis(250));
        assert_eq!(config.missing_queue_stats, MissingQueueStats::Zeroed);
        assert_eq!(config.message_encryption_key, None);
    }

    #[test]
    fn encryption_key_is_never_serialized() {
        let config = BrokerConfig::from_pairs([("message_encryption_key", "hunter2")]).unwrap();
        assert_eq!(config.message_encryption_key.as_deref(), Some("hunter2"));
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn unparsable_values_are_rejected() {
        let err = BrokerConfig::from_pairs([("max_claim_ttl", "forever")]).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));
    }

    #[test]
    fn inconsistent_limits_are_rejected() {
        let err = BrokerConfig::from_pairs([("max_claim_ttl", "30")]).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));

        let err = BrokerConfig::from_pairs([("default_message_delay", "901")]).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));
    }

    #[test]
    fn env_keys_use_double_underscore_nesting() {
        std::env::set_var("DOGMQ_CFG_TEST__MAX_CLAIM_GRACE", "120");
        std::env::set_var("DOGMQ_CFG_TEST__RETRY__MAX_ATTEMPTS", "7");

        let config = BrokerConfig::from_env("DOGMQ_CFG_TEST").unwrap();
        assert_eq!(config.max_claim_grace, 120);
        assert_eq!(config.retry.max_attempts, 7);
    }
}
