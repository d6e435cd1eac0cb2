//! # Batch Consumer Library
//!
//! Consumes Kafka messages in batches and persists them into relational
//! tables idempotently: every batch is applied in one transaction, stream
//! offsets are committed only after that transaction commits, and
//! redelivered batches converge to the same rows.
//!
//! ## Problem
//!
//! Writing one row per message does not keep up with high-volume topics,
//! but naive bulk writes break on two things:
//! - **Repeated keys**: a bulk upsert cannot touch the same row twice, and a
//!   delete followed by an insert of the same key must keep its order
//! - **Contention**: concurrent consumers writing overlapping rows deadlock
//!
//! ## Solution
//!
//! - [`BatchSlicer`] splits a batch into slices with at most one message per key
//! - [`MassUpdater`] turns each slice into bulk upserts and deletes, including
//!   child rows of associations
//! - [`DeadlockRetry`] re-runs the whole transaction on deadlock or
//!   serialization failure
//! - [`BatchConsumption`] decodes the batch, calls the handler, and reports metrics
//!
//! ## Architecture
//!
//! ```text
//! Kafka → KafkaBatchRunner → BatchConsumption → PersistingHandler
//!              ↑ commit                              ↓
//!              └──────── Ok ──── DeadlockRetry(BatchSlicer → MassUpdater) → PostgreSQL
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use batch_consumer::{
//!     BatchConsumerConfig, BatchConsumption, JsonDecoder, JsonRecordMapper, KafkaBatchRunner,
//!     PersistingHandler, PgBatchStore, PlainKeyDecoder, TableSpec,
//! };
//!
//! # async fn example(pool: sqlx::PgPool) -> batch_consumer::BatchResult<()> {
//! let config = BatchConsumerConfig::from_env()?;
//! let metrics = stream_metrics::noop();
//!
//! let widgets = TableSpec::new("widgets").key_columns(["sku"]).with_timestamps();
//! let handler = PersistingHandler::new(
//!     "widgets",
//!     JsonRecordMapper::new(widgets),
//!     PgBatchStore::new(pool),
//!     config.deadlock_retry(metrics.clone()),
//! )
//! .with_options(config.persist_options());
//!
//! let consumption =
//!     BatchConsumption::new(PlainKeyDecoder, JsonDecoder::new(), handler, metrics);
//! let runner = KafkaBatchRunner::new(config, consumption)?;
//! runner.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```
//!
//! ## Testing
//!
//! [`MemoryBatchStore`] implements the store traits in memory with fault
//! injection, so batch semantics can be exercised without a database. Tests
//! against PostgreSQL live in `tests/` and are ignored unless `DATABASE_URL`
//! points at a scratch database.

pub mod config;
pub mod consumption;
pub mod deadlock_retry;
mod error;
pub mod kafka;
pub mod mass_updater;
pub mod memory;
pub mod message;
pub mod persisting;
pub mod postgres;
pub mod record;
pub mod slicer;
pub mod store;

pub use config::BatchConsumerConfig;
pub use consumption::{BatchConsumption, BatchHandler, BatchPhase};
pub use deadlock_retry::{DeadlockRetry, RetryBudget};
pub use error::{BatchError, BatchResult, DecodeError};
pub use kafka::{
    group_by_partition, Admission, KafkaBatchRunner, OffsetAction, PartitionBatch, PartitionGate,
};
pub use mass_updater::MassUpdater;
pub use memory::{Fault, MemoryBatchStore};
pub use message::{
    BatchMetadata, Decoder, JsonDecoder, JsonKeyDecoder, Message, MessageKey, PlainKeyDecoder,
    RawMessage,
};
pub use persisting::{JsonRecordMapper, PersistOptions, PersistingHandler, RecordMapper};
pub use postgres::{ColumnTypes, PgBatchStore, PgBatchTx};
pub use record::{
    uuid_id_generator, Attribute, Attributes, BatchRecord, BatchRecordList, ColumnValue,
    IdGenerator, TableSpec,
};
pub use slicer::{BatchSlicer, Slice, SliceOptions};
pub use store::{BatchStore, BatchWriter, DeleteStatement, Predicate, UpsertStatement};
