use std::env;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::Deserialize;

use crate::error::{PollerError, PollerResult};

/// Rows fetched per page.
pub const BATCH_SIZE: usize = 1000;

/// Settings for the state-based mode.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StateBasedConfig {
    /// Column holding the publish state of each row
    pub state_column: String,
    /// State written after a page is published
    pub published_state: String,
    /// State written after a page fails; without it failed rows stay pending
    #[serde(default)]
    pub failed_state: Option<String>,
    /// Extra column stamped with the publish time
    #[serde(default)]
    pub publish_timestamp_column: Option<String>,
    /// State marking a row as pending; `None` means the state column is NULL
    #[serde(default)]
    pub pending_state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeConfig {
    /// Follow a `(timestamp, id)` cursor
    #[default]
    TimeBased,
    /// Pick up rows by state and mark them once handled
    StateBased(StateBasedConfig),
}

/// Settings for one polling producer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PollerConfig {
    /// Checkpoint identity; one active poller per producer
    pub producer: String,
    pub table: String,
    pub topic: String,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Row field used as the message key; the row id when unset
    #[serde(default)]
    pub key_column: Option<String>,
    /// Minimum time between polls
    #[serde(default = "default_run_every_ms")]
    pub run_every_ms: u64,
    /// Rows newer than this are left for the next poll
    #[serde(default = "default_delay_time_ms")]
    pub delay_time_ms: u64,
    /// Re-attempts of a failed page before it is counted as errored
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Drop pages the stream rejects as too large instead of retrying them
    #[serde(default)]
    pub skip_too_large_messages: bool,
    /// A new checkpoint starts at the epoch instead of now
    #[serde(default = "default_true")]
    pub start_from_beginning: bool,
    /// Every time-based cycle scans from the epoch
    #[serde(default)]
    pub full_table: bool,
    #[serde(default)]
    pub mode: ModeConfig,
}

fn default_timestamp_column() -> String {
    "updated_at".to_string()
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_run_every_ms() -> u64 {
    60_000
}

fn default_delay_time_ms() -> u64 {
    2_000
}

fn default_retries() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    BATCH_SIZE
}

fn default_true() -> bool {
    true
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl PollerConfig {
    /// Time-based configuration with defaults for everything else.
    pub fn new(
        producer: impl Into<String>,
        table: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            producer: producer.into(),
            table: table.into(),
            topic: topic.into(),
            timestamp_column: default_timestamp_column(),
            id_column: default_id_column(),
            key_column: None,
            run_every_ms: default_run_every_ms(),
            delay_time_ms: default_delay_time_ms(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            batch_size: default_batch_size(),
            skip_too_large_messages: false,
            start_from_beginning: true,
            full_table: false,
            mode: ModeConfig::TimeBased,
        }
    }

    pub fn state_based(mut self, state: StateBasedConfig) -> Self {
        self.mode = ModeConfig::StateBased(state);
        self
    }

    /// Load from `DB_POLLER_*` environment variables.
    ///
    /// Setting `DB_POLLER_STATE_COLUMN` selects the state-based mode.
    pub fn from_env() -> PollerResult<Self> {
        let required = |name: &str| {
            env::var(name).map_err(|_| PollerError::Config(format!("{name} is required")))
        };

        let mut config = Self::new(
            required("DB_POLLER_PRODUCER")?,
            required("DB_POLLER_TABLE")?,
            required("DB_POLLER_TOPIC")?,
        );
        if let Ok(column) = env::var("DB_POLLER_TIMESTAMP_COLUMN") {
            config.timestamp_column = column;
        }
        if let Ok(column) = env::var("DB_POLLER_ID_COLUMN") {
            config.id_column = column;
        }
        config.key_column = env::var("DB_POLLER_KEY_COLUMN").ok();
        config.run_every_ms = parse_var("DB_POLLER_RUN_EVERY_MS").unwrap_or(config.run_every_ms);
        config.delay_time_ms =
            parse_var("DB_POLLER_DELAY_TIME_MS").unwrap_or(config.delay_time_ms);
        config.retries = parse_var("DB_POLLER_RETRIES").unwrap_or(config.retries);
        config.retry_delay_ms =
            parse_var("DB_POLLER_RETRY_DELAY_MS").unwrap_or(config.retry_delay_ms);
        config.batch_size = parse_var("DB_POLLER_BATCH_SIZE").unwrap_or(config.batch_size);
        config.skip_too_large_messages =
            parse_var("DB_POLLER_SKIP_TOO_LARGE_MESSAGES").unwrap_or(false);
        config.start_from_beginning =
            parse_var("DB_POLLER_START_FROM_BEGINNING").unwrap_or(true);
        config.full_table = parse_var("DB_POLLER_FULL_TABLE").unwrap_or(false);

        if let Ok(state_column) = env::var("DB_POLLER_STATE_COLUMN") {
            config.mode = ModeConfig::StateBased(StateBasedConfig {
                state_column,
                published_state: required("DB_POLLER_PUBLISHED_STATE")?,
                failed_state: env::var("DB_POLLER_FAILED_STATE").ok(),
                publish_timestamp_column: env::var("DB_POLLER_PUBLISH_TIMESTAMP_COLUMN").ok(),
                pending_state: env::var("DB_POLLER_PENDING_STATE").ok(),
            });
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PollerResult<()> {
        for (name, value) in [
            ("producer", &self.producer),
            ("table", &self.table),
            ("topic", &self.topic),
            ("timestamp_column", &self.timestamp_column),
            ("id_column", &self.id_column),
        ] {
            if value.trim().is_empty() {
                return Err(PollerError::Config(format!("{name} must not be empty")));
            }
        }
        if self.batch_size == 0 {
            return Err(PollerError::Config("batch_size must be positive".to_string()));
        }
        if let ModeConfig::StateBased(state) = &self.mode {
            if state.state_column.trim().is_empty() || state.published_state.trim().is_empty() {
                return Err(PollerError::Config(
                    "state-based polling needs state_column and published_state".to_string(),
                ));
            }
            if self.full_table {
                return Err(PollerError::Config(
                    "full_table only applies to time-based polling".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn run_every(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.run_every_ms as i64)
    }

    pub fn delay_time(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.delay_time_ms as i64)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
