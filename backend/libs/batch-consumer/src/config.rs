use std::env;
use std::time::Duration;

use serde::Deserialize;
use stream_metrics::SharedMetrics;

use crate::deadlock_retry::{DeadlockRetry, DEFAULT_MAX_RETRIES};
use crate::error::{BatchError, BatchResult};
use crate::mass_updater::MassUpdater;
use crate::persisting::PersistOptions;
use crate::slicer::SliceOptions;

/// Settings for a batch consumer: Kafka connection, batching, and persistence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchConsumerConfig {
    /// Comma-separated broker list
    #[serde(default = "default_brokers")]
    pub brokers: String,
    pub group_id: String,
    pub topics: Vec<String>,
    /// Maximum messages collected into one batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum time spent collecting one batch
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Pause after a failed batch before it is redelivered
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_offset_reset")]
    pub auto_offset_reset: String,
    /// Keep only the last message per key
    #[serde(default)]
    pub compacted: bool,
    /// Messages carry no meaningful keys
    #[serde(default)]
    pub no_keys: bool,
    /// Cap on records per bulk statement
    #[serde(default)]
    pub max_db_batch_size: Option<usize>,
    /// Replace a parent's children instead of merging into them
    #[serde(default)]
    pub replace_associations: bool,
    #[serde(default = "default_deadlock_retries")]
    pub deadlock_max_retries: u32,
    #[serde(default = "default_deadlock_delay_ms")]
    pub deadlock_delay_ms: u64,
    #[serde(default = "default_deadlock_delay_ms")]
    pub deadlock_jitter_ms: u64,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_wait_ms() -> u64 {
    1000
}

fn default_retry_backoff_ms() -> u64 {
    5000
}

fn default_offset_reset() -> String {
    "earliest".to_string()
}

fn default_deadlock_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_deadlock_delay_ms() -> u64 {
    5000
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl BatchConsumerConfig {
    /// Minimal configuration with defaults for everything else.
    pub fn new(group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            brokers: default_brokers(),
            group_id: group_id.into(),
            topics,
            batch_size: default_batch_size(),
            max_wait_ms: default_max_wait_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            auto_offset_reset: default_offset_reset(),
            compacted: false,
            no_keys: false,
            max_db_batch_size: None,
            replace_associations: false,
            deadlock_max_retries: default_deadlock_retries(),
            deadlock_delay_ms: default_deadlock_delay_ms(),
            deadlock_jitter_ms: default_deadlock_delay_ms(),
        }
    }

    /// Load from `KAFKA_*` and `BATCH_*` environment variables.
    pub fn from_env() -> BatchResult<Self> {
        let group_id = env::var("KAFKA_CONSUMER_GROUP")
            .map_err(|_| BatchError::Config("KAFKA_CONSUMER_GROUP is required".to_string()))?;
        let topics = env::var("KAFKA_TOPICS")
            .map_err(|_| BatchError::Config("KAFKA_TOPICS is required".to_string()))?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut config = Self::new(group_id, topics);
        if let Ok(brokers) = env::var("KAFKA_BROKERS") {
            config.brokers = brokers;
        }
        if let Ok(reset) = env::var("KAFKA_AUTO_OFFSET_RESET") {
            config.auto_offset_reset = reset;
        }
        config.batch_size = parse_var("BATCH_SIZE").unwrap_or(config.batch_size);
        config.max_wait_ms = parse_var("BATCH_MAX_WAIT_MS").unwrap_or(config.max_wait_ms);
        config.retry_backoff_ms =
            parse_var("BATCH_RETRY_BACKOFF_MS").unwrap_or(config.retry_backoff_ms);
        config.compacted = parse_var("BATCH_COMPACTED").unwrap_or(false);
        config.no_keys = parse_var("BATCH_NO_KEYS").unwrap_or(false);
        config.max_db_batch_size = parse_var("BATCH_MAX_DB_BATCH_SIZE");
        config.replace_associations = parse_var("BATCH_REPLACE_ASSOCIATIONS").unwrap_or(false);
        config.deadlock_max_retries =
            parse_var("BATCH_DEADLOCK_MAX_RETRIES").unwrap_or(config.deadlock_max_retries);
        config.deadlock_delay_ms =
            parse_var("BATCH_DEADLOCK_DELAY_MS").unwrap_or(config.deadlock_delay_ms);
        config.deadlock_jitter_ms =
            parse_var("BATCH_DEADLOCK_JITTER_MS").unwrap_or(config.deadlock_jitter_ms);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BatchResult<()> {
        if self.group_id.trim().is_empty() {
            return Err(BatchError::Config("group_id must not be empty".to_string()));
        }
        if self.topics.is_empty() {
            return Err(BatchError::Config("at least one topic is required".to_string()));
        }
        if self.batch_size == 0 {
            return Err(BatchError::Config("batch_size must be positive".to_string()));
        }
        if self.max_db_batch_size == Some(0) {
            return Err(BatchError::Config(
                "max_db_batch_size must be positive when set".to_string(),
            ));
        }
        if !matches!(self.auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(BatchError::Config(format!(
                "auto_offset_reset must be earliest or latest, got {}",
                self.auto_offset_reset
            )));
        }
        Ok(())
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn persist_options(&self) -> PersistOptions {
        PersistOptions {
            slice: SliceOptions {
                compacted: self.compacted,
                no_keys: self.no_keys,
            },
            max_db_batch_size: self.max_db_batch_size,
        }
    }

    pub fn mass_updater(&self) -> MassUpdater {
        MassUpdater::new().replace_associations(self.replace_associations)
    }

    pub fn deadlock_retry(&self, metrics: SharedMetrics) -> DeadlockRetry {
        DeadlockRetry::new(metrics)
            .with_max_retries(self.deadlock_max_retries)
            .with_delay(
                Duration::from_millis(self.deadlock_delay_ms),
                Duration::from_millis(self.deadlock_jitter_ms),
            )
    }
}
