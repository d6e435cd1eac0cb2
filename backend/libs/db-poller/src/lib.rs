//! # DB Poller Library
//!
//! Republishes changed database rows to Kafka from a checkpointed polling loop.
//!
//! ## Modes
//!
//! - **Time-based**: follows a `(timestamp, id)` cursor stored in `poll_info`.
//!   Rows younger than `delay_time` are left for the next poll so writes that
//!   have not committed yet are not skipped.
//! - **State-based**: picks up rows whose state column marks them pending and
//!   sets it to the published (or failed) state once the page is handled.
//!
//! ## Failure Handling
//!
//! A page the stream rejects as too large is skipped when
//! `skip_too_large_messages` is set, and retried otherwise. Other failures are
//! retried `retries` times, then the page is counted as errored and polling
//! moves on. The loop itself only ends when stopped.
//!
//! ## Architecture
//!
//! ```text
//! PostgreSQL ─fetch page─→ DbPoller ─encode─→ Publisher ─→ Kafka
//!      ↑                       │
//!      └── poll_info / state ──┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use db_poller::{spawn_postgres, PollerConfig};
//!
//! # async fn example(pool: sqlx::PgPool, producer: rdkafka::producer::FutureProducer)
//! #     -> db_poller::PollerResult<()> {
//! let config = PollerConfig::from_env()?;
//! let handle = spawn_postgres(config, pool, producer, stream_metrics::noop())?;
//!
//! tokio::signal::ctrl_c().await.ok();
//! handle.shutdown().await
//! # }
//! ```
//!
//! Prerequisites: the `poll_info` table from `migrations/` (see
//! [`PgCheckpointStore::migrate`]).

use std::sync::Arc;

use rdkafka::producer::FutureProducer;
use sqlx::PgPool;
use stream_metrics::SharedMetrics;

pub mod checkpoint;
pub mod config;
mod error;
pub mod memory;
pub mod poller;
pub mod publisher;
pub mod source;
pub mod state_based;
pub mod time_based;

pub use checkpoint::{CheckpointStore, PgCheckpointStore, PollInfo};
pub use config::{ModeConfig, PollerConfig, StateBasedConfig, BATCH_SIZE};
pub use error::{PollerError, PollerResult, PublishError, PublishFailure, OVERSIZED_CODES};
pub use memory::{MemoryCheckpointStore, MemorySourceTable};
pub use poller::{
    DbPoller, PageOutcome, PollMode, PollStatus, PollerCore, PollerHandle, PollerState, StopHandle,
};
pub use publisher::{JsonRowEncoder, KafkaPublisher, OutboundMessage, Publisher, RowEncoder};
pub use source::{
    PgStateBasedSource, PgTimeBasedSource, PolledRow, StateBasedSource, TimeBasedSource,
    TimeWindow,
};
pub use state_based::StateBased;
pub use time_based::TimeBased;

/// Start a PostgreSQL-to-Kafka poller in the mode `config` selects.
pub fn spawn_postgres(
    config: PollerConfig,
    pool: PgPool,
    producer: FutureProducer,
    metrics: SharedMetrics,
) -> PollerResult<PollerHandle> {
    let table = config.table.clone();
    let id_column = config.id_column.clone();
    let timestamp_column = config.timestamp_column.clone();
    let mode = config.mode.clone();

    let publisher = Arc::new(KafkaPublisher::new(producer, config.topic.clone()));
    let checkpoints = Arc::new(PgCheckpointStore::new(pool.clone()));
    let core = PollerCore::new(config, checkpoints, publisher, metrics)?;

    let handle = match mode {
        ModeConfig::TimeBased => {
            let source = PgTimeBasedSource::new(pool, table, id_column, timestamp_column);
            DbPoller::new(core, TimeBased::new(source)).spawn()
        }
        ModeConfig::StateBased(state) => {
            let source =
                PgStateBasedSource::new(pool, table, id_column, timestamp_column, state.clone());
            DbPoller::new(core, StateBased::new(source, state)).spawn()
        }
    };
    Ok(handle)
}
