//! Handler that persists batches through [`MassUpdater`].
//!
//! The batch is sliced so no slice repeats a key. All slices are applied in one
//! [`DeadlockRetry`] transaction; each bulk chunk runs inside a savepoint so a
//! chunk hitting a deadlock can be re-run without replaying the slices before
//! it. Chunk retries and transaction retries share one [`RetryBudget`] per
//! batch. Serialization failures always go back to the transaction loop.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use stream_metrics::Tag;
use tracing::{debug, warn};

use crate::consumption::{BatchHandler, BatchPhase};
use crate::deadlock_retry::{DeadlockRetry, RetryBudget};
use crate::error::{BatchError, BatchResult};
use crate::mass_updater::MassUpdater;
use crate::message::{BatchMetadata, Message, MessageKey};
use crate::record::{
    uuid_id_generator, Attribute, Attributes, BatchRecord, BatchRecordList, ColumnValue,
    IdGenerator, TableSpec,
};
use crate::slicer::{BatchSlicer, SliceOptions};
use crate::store::{BatchStore, BatchWriter};

const CHUNK_SAVEPOINT: &str = "batch_consumer_chunk";

/// Maps decoded messages onto rows of one table.
pub trait RecordMapper<K, P>: Send + Sync {
    fn table(&self) -> Arc<TableSpec>;

    /// Attributes to upsert for a message. `None` skips the message.
    fn record_attributes(&self, payload: &P, key: Option<&K>) -> BatchResult<Option<Attributes>>;

    /// Columns identifying the row for `key`. Merged into upserted attributes
    /// and used to match rows for tombstones.
    fn record_key(&self, key: &K) -> BatchResult<BTreeMap<String, ColumnValue>>;

    /// Final filter on a built record.
    fn should_consume(&self, _record: &BatchRecord) -> bool {
        true
    }
}

/// Maps JSON object payloads field-by-field. Fields named after an association
/// of the table are read as arrays of child objects.
#[derive(Debug, Clone)]
pub struct JsonRecordMapper {
    table: Arc<TableSpec>,
    key_column: Option<String>,
}

impl JsonRecordMapper {
    pub fn new(table: TableSpec) -> Self {
        Self {
            table: Arc::new(table),
            key_column: None,
        }
    }

    /// Column receiving scalar message keys; defaults to the first conflict column.
    pub fn key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = Some(column.into());
        self
    }

    fn to_attributes(table: &TableSpec, value: &serde_json::Value) -> BatchResult<Attributes> {
        let object = value.as_object().ok_or_else(|| {
            BatchError::InvalidRecord(format!("expected a JSON object for table {}", table.name))
        })?;

        let mut attributes = Attributes::new();
        for (field, value) in object {
            let attribute = match (table.find_association(field), value) {
                (Some(association), serde_json::Value::Array(rows)) => Attribute::Children(
                    rows.iter()
                        .map(|row| Self::to_attributes(&association.table, row))
                        .collect::<BatchResult<Vec<_>>>()?,
                ),
                _ => Attribute::Value(ColumnValue::from_json(value.clone())),
            };
            attributes.insert(field.clone(), attribute);
        }
        Ok(attributes)
    }
}

impl RecordMapper<MessageKey, serde_json::Value> for JsonRecordMapper {
    fn table(&self) -> Arc<TableSpec> {
        self.table.clone()
    }

    fn record_attributes(
        &self,
        payload: &serde_json::Value,
        _key: Option<&MessageKey>,
    ) -> BatchResult<Option<Attributes>> {
        Self::to_attributes(&self.table, payload).map(Some)
    }

    fn record_key(&self, key: &MessageKey) -> BatchResult<BTreeMap<String, ColumnValue>> {
        if let MessageKey::Composite(fields) = key {
            return Ok(fields
                .iter()
                .map(|(column, value)| (column.clone(), ColumnValue::from(value.clone())))
                .collect());
        }

        let column = match &self.key_column {
            Some(column) => column.clone(),
            None => {
                let columns = self.table.conflict_columns();
                if columns.len() != 1 {
                    return Err(BatchError::InvalidRecord(format!(
                        "scalar key {key} cannot identify a row of {} keyed by {:?}",
                        self.table.name, columns
                    )));
                }
                columns[0].clone()
            }
        };
        Ok(BTreeMap::from([(column, ColumnValue::from(key.clone()))]))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOptions {
    pub slice: SliceOptions,
    /// Cap on records per bulk statement; `None` sends each slice whole
    pub max_db_batch_size: Option<usize>,
}

#[derive(Debug, Default)]
struct SlicePlan {
    upserts: Vec<BatchRecord>,
    deletes: Vec<BTreeMap<String, ColumnValue>>,
}

#[derive(Clone, Copy)]
enum Chunk<'a> {
    Upsert(&'a [BatchRecord]),
    Delete(&'a TableSpec, &'a [BTreeMap<String, ColumnValue>]),
}

fn chunked<T>(items: &[T], cap: Option<usize>) -> Vec<&[T]> {
    match cap {
        _ if items.is_empty() => Vec::new(),
        Some(cap) if cap > 0 => items.chunks(cap).collect(),
        _ => vec![items],
    }
}

pub struct PersistingHandler<M, S> {
    name: String,
    mapper: M,
    store: S,
    updater: MassUpdater,
    retry: DeadlockRetry,
    options: PersistOptions,
    id_generator: IdGenerator,
}

impl<M, S> PersistingHandler<M, S> {
    pub fn new(name: impl Into<String>, mapper: M, store: S, retry: DeadlockRetry) -> Self {
        Self {
            name: name.into(),
            mapper,
            store,
            updater: MassUpdater::new(),
            retry,
            options: PersistOptions::default(),
            id_generator: uuid_id_generator(),
        }
    }

    pub fn with_updater(mut self, updater: MassUpdater) -> Self {
        self.updater = updater;
        self
    }

    pub fn with_options(mut self, options: PersistOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_id_generator(mut self, id_generator: IdGenerator) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<M, S> PersistingHandler<M, S>
where
    S: BatchStore,
{
    fn plan<K, P>(&self, slice: Vec<Message<K, P>>) -> BatchResult<SlicePlan>
    where
        M: RecordMapper<K, P>,
    {
        let table = self.mapper.table();
        let mut plan = SlicePlan::default();

        for message in slice {
            match (message.payload, message.key) {
                (None, Some(key)) => plan.deletes.push(self.mapper.record_key(&key)?),
                (None, None) => {
                    warn!(handler = %self.name, "Skipping tombstone without a key");
                }
                (Some(payload), key) => {
                    let Some(mut attributes) =
                        self.mapper.record_attributes(&payload, key.as_ref())?
                    else {
                        continue;
                    };
                    if let Some(key) = &key {
                        for (column, value) in self.mapper.record_key(key)? {
                            attributes.insert(column, Attribute::Value(value));
                        }
                    }
                    let record =
                        BatchRecord::new(table.clone(), attributes, Some(&self.id_generator))?;
                    if self.mapper.should_consume(&record) {
                        plan.upserts.push(record);
                    }
                }
            }
        }
        Ok(plan)
    }

    async fn apply(
        &self,
        tx: &mut S::Tx,
        table: &TableSpec,
        plans: &[SlicePlan],
        budget: &RetryBudget,
        tags: &[Tag<'_>],
    ) -> BatchResult<()> {
        let cap = self.options.max_db_batch_size;
        for (index, plan) in plans.iter().enumerate() {
            debug!(
                handler = %self.name,
                phase = %BatchPhase::Applying,
                slice = index,
                upserts = plan.upserts.len(),
                deletes = plan.deletes.len(),
                "Applying slice"
            );
            for chunk in chunked(&plan.upserts, cap) {
                self.run_chunk(tx, Chunk::Upsert(chunk), budget, tags).await?;
            }
            for chunk in chunked(&plan.deletes, cap) {
                self.run_chunk(tx, Chunk::Delete(table, chunk), budget, tags)
                    .await?;
            }
        }
        Ok(())
    }

    /// Execute one chunk, re-running it from a savepoint on lock conflicts
    /// while `budget` lasts.
    async fn run_chunk(
        &self,
        tx: &mut S::Tx,
        chunk: Chunk<'_>,
        budget: &RetryBudget,
        tags: &[Tag<'_>],
    ) -> BatchResult<()> {
        loop {
            tx.savepoint(CHUNK_SAVEPOINT).await?;
            let outcome = match chunk {
                Chunk::Upsert(records) => self
                    .updater
                    .mass_update(tx, &BatchRecordList::from(records.to_vec()))
                    .await
                    .map(|_| ()),
                Chunk::Delete(table, keys) => {
                    self.updater.delete(tx, table, keys).await.map(|_| ())
                }
            };

            let err = match outcome {
                Ok(()) => {
                    tx.release_savepoint(CHUNK_SAVEPOINT).await?;
                    return Ok(());
                }
                Err(err) => err,
            };

            if let Err(rollback_err) = tx.rollback_to_savepoint(CHUNK_SAVEPOINT).await {
                warn!(error = %rollback_err, "Rollback to chunk savepoint failed");
                return Err(err);
            }
            tx.release_savepoint(CHUNK_SAVEPOINT).await?;

            if !err.is_savepoint_retryable() || !self.retry.should_retry(&err, budget) {
                return Err(err);
            }
            self.retry.retry_after(&err, budget, tags).await;
        }
    }
}

#[async_trait]
impl<K, P, M, S> BatchHandler<K, P> for PersistingHandler<M, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Send + Sync + 'static,
    M: RecordMapper<K, P>,
    S: BatchStore,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume_batch(
        &self,
        messages: Vec<Message<K, P>>,
        metadata: &BatchMetadata,
    ) -> BatchResult<()> {
        let total = messages.len();
        let slices = BatchSlicer::slice(messages, self.options.slice);
        debug!(
            handler = %self.name,
            phase = %BatchPhase::Slicing,
            topic = %metadata.topic,
            messages = total,
            slices = slices.len(),
            "Sliced batch"
        );

        let plans = slices
            .into_iter()
            .map(|slice| self.plan(slice))
            .collect::<BatchResult<Vec<_>>>()?;
        if plans.is_empty() {
            return Ok(());
        }

        let table = self.mapper.table();
        let tags = [("topic", metadata.topic.as_str())];
        let budget = RetryBudget::new();
        let (table, plans, tags, shared) = (table.as_ref(), &plans[..], &tags[..], &budget);
        self.retry
            .run_with_budget(&self.store, tags, &budget, move |mut tx| async move {
                let result = self.apply(&mut tx, table, plans, shared, tags).await;
                (tx, result)
            })
            .await
    }
}
