//! Persisted poll progress, one row per producer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::error::PollerResult;

/// Checkpoint lifecycle markers stored in `poll_info.state`.
pub const STATE_RUNNING: &str = "running";
pub const STATE_STOPPED: &str = "stopped";

/// Progress of one polling producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollInfo {
    pub producer: String,
    /// Timestamp of the last published row, or of the last empty poll
    pub last_sent: DateTime<Utc>,
    /// Id of the last published row, tie-breaker for equal timestamps
    pub last_sent_id: i64,
    pub state: Option<String>,
}

impl PollInfo {
    pub fn new(producer: impl Into<String>, last_sent: DateTime<Utc>) -> Self {
        Self {
            producer: producer.into(),
            last_sent,
            last_sent_id: 0,
            state: None,
        }
    }
}

/// Storage for [`PollInfo`] rows.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the producer's checkpoint, creating it at `initial` when missing.
    async fn load_or_create(&self, producer: &str, initial: DateTime<Utc>)
        -> PollerResult<PollInfo>;

    /// Persist cursor and state.
    async fn save(&self, info: &PollInfo) -> PollerResult<()>;
}

pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `poll_info` table if needed.
    pub async fn migrate(&self) -> PollerResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run poll_info migration: {e}"))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load_or_create(
        &self,
        producer: &str,
        initial: DateTime<Utc>,
    ) -> PollerResult<PollInfo> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO poll_info (producer, last_sent, last_sent_id)
            VALUES ($1, $2, 0)
            ON CONFLICT (producer) DO NOTHING
            "#,
        )
        .bind(producer)
        .bind(initial)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            info!(producer, last_sent = %initial, "Created poll checkpoint");
        }

        let row = sqlx::query(
            r#"
            SELECT producer, last_sent, last_sent_id, state
            FROM poll_info
            WHERE producer = $1
            "#,
        )
        .bind(producer)
        .fetch_one(&self.pool)
        .await?;

        Ok(PollInfo {
            producer: row.try_get("producer")?,
            last_sent: row.try_get("last_sent")?,
            last_sent_id: row.try_get::<Option<i64>, _>("last_sent_id")?.unwrap_or(0),
            state: row.try_get("state")?,
        })
    }

    async fn save(&self, info: &PollInfo) -> PollerResult<()> {
        sqlx::query(
            r#"
            UPDATE poll_info
            SET last_sent = $2,
                last_sent_id = $3,
                state = $4
            WHERE producer = $1
            "#,
        )
        .bind(&info.producer)
        .bind(info.last_sent)
        .bind(info.last_sent_id)
        .bind(&info.state)
        .execute(&self.pool)
        .await?;

        debug!(
            producer = %info.producer,
            last_sent = %info.last_sent,
            last_sent_id = info.last_sent_id,
            "Checkpoint saved"
        );
        Ok(())
    }
}
