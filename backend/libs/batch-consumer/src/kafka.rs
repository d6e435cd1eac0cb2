//! Kafka driver: collects messages into per-partition batches, runs them
//! through a [`BatchConsumption`], and commits offsets only for batches that
//! were persisted.
//!
//! A failed batch blocks its partition in a [`PartitionGate`] until the
//! failed offset is delivered again. Later batches of that partition are
//! neither processed nor committed meanwhile, so a failed seek cannot let a
//! commit skip past unpersisted messages.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Message as _, OwnedMessage};
use rdkafka::{Offset, TopicPartitionList};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::BatchConsumerConfig;
use crate::consumption::{BatchConsumption, BatchHandler};
use crate::error::{BatchError, BatchResult};
use crate::message::{BatchMetadata, Decoder, RawMessage};

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages of one topic-partition, in offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionBatch {
    pub topic: String,
    pub partition: i32,
    pub messages: Vec<RawMessage>,
}

impl PartitionBatch {
    pub fn metadata(&self) -> BatchMetadata {
        BatchMetadata::for_messages(&self.topic, self.partition, &self.messages)
    }

    /// Offset to commit once the batch is persisted.
    pub fn next_offset(&self) -> Option<i64> {
        self.messages.last().map(|m| m.offset + 1)
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.messages.first().map(|m| m.offset)
    }
}

/// Split collected messages by topic-partition, keeping first-seen partition
/// order and arrival order inside each partition.
pub fn group_by_partition(messages: Vec<(String, i32, RawMessage)>) -> Vec<PartitionBatch> {
    let mut batches: Vec<PartitionBatch> = Vec::new();
    for (topic, partition, message) in messages {
        match batches
            .iter_mut()
            .find(|b| b.partition == partition && b.topic == topic)
        {
            Some(batch) => batch.messages.push(message),
            None => batches.push(PartitionBatch {
                topic,
                partition,
                messages: vec![message],
            }),
        }
    }
    batches
}

/// Offset handling decided for one partition batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetAction {
    /// Persisted; commit this next offset.
    Commit(i64),
    /// Not persisted; seek back here so it is delivered again.
    Rewind(i64),
    /// Nothing to commit or replay.
    Nothing,
}

/// Whether a collected batch may be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Process,
    /// The partition is waiting for an earlier failed offset.
    Hold { rewind_to: i64 },
}

/// Partitions whose failed batch has not been redelivered yet, keyed by
/// topic-partition with the first offset of the failed batch.
#[derive(Debug, Default)]
pub struct PartitionGate {
    blocked: HashMap<(String, i32), i64>,
}

impl PartitionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a batch starting at or before the blocked offset and lift the
    /// block; hold anything later.
    pub fn admit(&mut self, batch: &BatchMetadata) -> Admission {
        let key = (batch.topic.clone(), batch.partition);
        let Some(&blocked_at) = self.blocked.get(&key) else {
            return Admission::Process;
        };
        if batch.batch_size > 0 && batch.first_offset <= blocked_at {
            self.blocked.remove(&key);
            return Admission::Process;
        }
        Admission::Hold {
            rewind_to: blocked_at,
        }
    }

    /// Record the outcome of a processed batch and decide its offset action.
    pub fn settle(&mut self, batch: &BatchMetadata, persisted: bool) -> OffsetAction {
        if batch.batch_size == 0 {
            return OffsetAction::Nothing;
        }
        if persisted {
            return OffsetAction::Commit(batch.last_offset + 1);
        }
        let first = batch.first_offset;
        self.blocked
            .entry((batch.topic.clone(), batch.partition))
            .and_modify(|offset| *offset = (*offset).min(first))
            .or_insert(first);
        OffsetAction::Rewind(first)
    }

    pub fn blocked_at(&self, topic: &str, partition: i32) -> Option<i64> {
        self.blocked.get(&(topic.to_string(), partition)).copied()
    }
}

fn to_raw(message: &OwnedMessage) -> (String, i32, RawMessage) {
    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    (
        message.topic().to_string(),
        message.partition(),
        RawMessage {
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            offset: message.offset(),
            timestamp,
        },
    )
}

pub struct KafkaBatchRunner<KD, PD, H> {
    consumer: StreamConsumer,
    consumption: BatchConsumption<KD, PD, H>,
    config: BatchConsumerConfig,
    gate: Mutex<PartitionGate>,
}

impl<KD, PD, H> KafkaBatchRunner<KD, PD, H>
where
    KD: Decoder,
    PD: Decoder,
    KD::Output: 'static,
    PD::Output: 'static,
    H: BatchHandler<KD::Output, PD::Output>,
{
    /// Create the consumer and subscribe to the configured topics.
    pub fn new(
        config: BatchConsumerConfig,
        consumption: BatchConsumption<KD, PD, H>,
    ) -> BatchResult<Self> {
        config.validate()?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                BatchError::Kafka(e)
            })?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(|e| {
            error!("Failed to subscribe to topics {:?}: {}", topics, e);
            BatchError::Kafka(e)
        })?;

        info!(
            group_id = %config.group_id,
            topics = ?config.topics,
            batch_size = config.batch_size,
            "Batch consumer subscribed"
        );

        Ok(Self {
            consumer,
            consumption,
            config,
            gate: Mutex::new(PartitionGate::new()),
        })
    }

    pub fn consumption(&self) -> &BatchConsumption<KD, PD, H> {
        &self.consumption
    }

    /// Consume until `shutdown` resolves. A batch already being processed is
    /// finished before returning.
    pub async fn run_until<F>(&self, shutdown: F) -> BatchResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Batch consumer shutting down");
                    return Ok(());
                }
                collected = self.collect() => match collected {
                    Ok(messages) if messages.is_empty() => {}
                    Ok(messages) => self.dispatch(group_by_partition(messages)).await,
                    Err(e) => {
                        error!("Kafka consumer error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
    }

    /// Wait for up to `batch_size` messages or `max_wait`, whichever comes first.
    async fn collect(&self) -> BatchResult<Vec<(String, i32, RawMessage)>> {
        let deadline = Instant::now() + self.config.max_wait();
        let mut collected = Vec::with_capacity(self.config.batch_size);

        while collected.len() < self.config.batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => collected.push(to_raw(&message.detach())),
                Ok(Err(e)) if collected.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    warn!("Kafka receive failed, processing partial batch: {}", e);
                    break;
                }
            }
        }
        Ok(collected)
    }

    fn gate(&self) -> MutexGuard<'_, PartitionGate> {
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn dispatch(&self, batches: Vec<PartitionBatch>) {
        let mut failed = false;
        for batch in batches {
            let metadata = batch.metadata();
            let admission = self.gate().admit(&metadata);
            if let Admission::Hold { rewind_to } = admission {
                failed = true;
                warn!(
                    topic = %metadata.topic,
                    partition = metadata.partition,
                    first_offset = metadata.first_offset,
                    rewind_to,
                    "Holding batch until the failed offset is redelivered"
                );
                self.rewind(&metadata.topic, metadata.partition, rewind_to);
                continue;
            }

            let persisted = self
                .consumption
                .process_batch(batch.messages, &metadata)
                .await
                .is_ok();

            let action = self.gate().settle(&metadata, persisted);
            match action {
                OffsetAction::Commit(offset) => {
                    self.commit(&metadata.topic, metadata.partition, offset)
                }
                OffsetAction::Rewind(offset) => {
                    failed = true;
                    self.rewind(&metadata.topic, metadata.partition, offset);
                }
                OffsetAction::Nothing => {}
            }
        }

        if failed {
            tokio::time::sleep(self.config.retry_backoff()).await;
        }
    }

    fn commit(&self, topic: &str, partition: i32, offset: i64) {
        let mut tpl = TopicPartitionList::new();
        if let Err(e) = tpl.add_partition_offset(topic, partition, Offset::Offset(offset)) {
            warn!("Failed to build commit for {}/{}: {}", topic, partition, e);
            return;
        }
        match self.consumer.commit(&tpl, CommitMode::Async) {
            Ok(()) => debug!(topic, partition, offset, "Committed offset"),
            Err(e) => warn!("Failed to commit offset: {}", e),
        }
    }

    /// Move the partition back so the failed batch is delivered again.
    fn rewind(&self, topic: &str, partition: i32, offset: i64) {
        if let Err(e) = self
            .consumer
            .seek(topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
        {
            error!(
                topic,
                partition, offset, "Failed to rewind partition after batch error: {}", e
            );
        }
    }
}
