//! Batch consumption orchestrator.
//!
//! Decodes a raw batch in order, hands it to a [`BatchHandler`], and reports
//! the outcome through the metrics sink and the log. The caller commits the
//! stream offset only when [`BatchConsumption::process_batch`] returns `Ok`.

use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use stream_metrics::SharedMetrics;
use tracing::{info, warn};

use crate::error::{BatchError, BatchResult};
use crate::message::{BatchMetadata, Decoder, Message, RawMessage};

/// Stages a batch moves through. `Error` is reachable from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Received,
    Decoding,
    Slicing,
    Applying,
    Done,
    Error,
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchPhase::Received => "received",
            BatchPhase::Decoding => "decoding",
            BatchPhase::Slicing => "slicing",
            BatchPhase::Applying => "applying",
            BatchPhase::Done => "done",
            BatchPhase::Error => "error",
        };
        f.write_str(name)
    }
}

impl BatchPhase {
    /// Stage a handler failure belongs to. Records that cannot be mapped are
    /// rejected while slicing, before anything is written.
    pub fn of_handler_error(err: &BatchError) -> Self {
        match err {
            BatchError::InvalidRecord(_) => BatchPhase::Slicing,
            _ => BatchPhase::Applying,
        }
    }
}

/// Consumes decoded batches.
#[async_trait]
pub trait BatchHandler<K, P>: Send + Sync
where
    K: Send + 'static,
    P: Send + 'static,
{
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Process one batch. The default refuses with `NotImplemented`.
    async fn consume_batch(
        &self,
        messages: Vec<Message<K, P>>,
        metadata: &BatchMetadata,
    ) -> BatchResult<()> {
        let _ = (messages, metadata);
        Err(BatchError::NotImplemented(self.name().to_string()))
    }
}

pub struct BatchConsumption<KD, PD, H> {
    key_decoder: KD,
    payload_decoder: PD,
    handler: H,
    metrics: SharedMetrics,
}

impl<KD, PD, H> BatchConsumption<KD, PD, H>
where
    KD: Decoder,
    PD: Decoder,
    KD::Output: 'static,
    PD::Output: 'static,
    H: BatchHandler<KD::Output, PD::Output>,
{
    pub fn new(key_decoder: KD, payload_decoder: PD, handler: H, metrics: SharedMetrics) -> Self {
        Self {
            key_decoder,
            payload_decoder,
            handler,
            metrics,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Decode keys and payloads in batch order. Missing or empty payloads
    /// become tombstones; any malformed part fails the whole batch.
    pub fn decode(
        &self,
        raw: Vec<RawMessage>,
    ) -> BatchResult<Vec<Message<KD::Output, PD::Output>>> {
        raw.into_iter()
            .map(|message| -> BatchResult<Message<KD::Output, PD::Output>> {
                let key = match message.key.as_deref() {
                    Some(bytes) if !bytes.is_empty() => Some(
                        self.key_decoder
                            .decode(bytes)
                            .map_err(|e| e.at_offset(message.offset))?,
                    ),
                    _ => None,
                };
                let payload = match message.payload.as_deref() {
                    Some(bytes) if !bytes.is_empty() => Some(
                        self.payload_decoder
                            .decode(bytes)
                            .map_err(|e| e.at_offset(message.offset))?,
                    ),
                    _ => None,
                };
                Ok(Message::new(key, payload))
            })
            .collect()
    }

    /// Decode and consume one batch from a single topic-partition.
    pub async fn process_batch(
        &self,
        raw: Vec<RawMessage>,
        metadata: &BatchMetadata,
    ) -> BatchResult<()> {
        let topic = metadata.topic.as_str();
        let batch_size = raw.len() as u64;

        self.metrics
            .increment("handler", &[("status", "batch_received"), ("topic", topic)], 1);
        self.metrics
            .increment("handler", &[("status", "received"), ("topic", topic)], batch_size);
        if let Some(oldest) = metadata.oldest_timestamp {
            let lag = (Utc::now() - oldest).num_milliseconds().max(0) as f64 / 1000.0;
            self.metrics
                .histogram("handler", lag, &[("time", "time_delay"), ("topic", topic)]);
        }

        info!(
            handler = self.handler.name(),
            topic,
            partition = metadata.partition,
            first_offset = metadata.first_offset,
            last_offset = metadata.last_offset,
            batch_size,
            "Received batch"
        );

        let started = Instant::now();
        let mut phase = BatchPhase::Decoding;
        let result = match self.decode(raw) {
            Ok(messages) => {
                phase = BatchPhase::Slicing;
                let result = self.handler.consume_batch(messages, metadata).await;
                if let Err(err) = &result {
                    phase = BatchPhase::of_handler_error(err);
                }
                result
            }
            Err(err) => Err(err),
        };
        let elapsed = started.elapsed();
        self.metrics.histogram(
            "handler",
            elapsed.as_secs_f64(),
            &[("time", "consume_batch"), ("topic", topic)],
        );

        match result {
            Ok(()) => {
                self.metrics
                    .increment("handler", &[("status", "batch_success"), ("topic", topic)], 1);
                self.metrics
                    .increment("handler", &[("status", "success"), ("topic", topic)], batch_size);
                info!(
                    handler = self.handler.name(),
                    topic,
                    partition = metadata.partition,
                    batch_size,
                    elapsed_ms = elapsed.as_millis() as u64,
                    phase = %BatchPhase::Done,
                    "Finished batch"
                );
                Ok(())
            }
            Err(err) => {
                self.metrics
                    .increment("handler", &[("status", "batch_error"), ("topic", topic)], 1);
                warn!(
                    handler = self.handler.name(),
                    topic,
                    partition = metadata.partition,
                    first_offset = metadata.first_offset,
                    last_offset = metadata.last_offset,
                    failed_in = %phase,
                    phase = %BatchPhase::Error,
                    error_kind = err.kind(),
                    error = %err,
                    "Error consuming batch"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{JsonDecoder, MessageKey, PlainKeyDecoder};
    use std::sync::{Arc, Mutex};
    use stream_metrics::RecordingMetricsSink;

    type Seen = Arc<Mutex<Vec<Message<MessageKey, serde_json::Value>>>>;

    struct Collecting {
        seen: Seen,
        fail: bool,
    }

    #[async_trait]
    impl BatchHandler<MessageKey, serde_json::Value> for Collecting {
        fn name(&self) -> &str {
            "collecting"
        }

        async fn consume_batch(
            &self,
            messages: Vec<Message<MessageKey, serde_json::Value>>,
            _metadata: &BatchMetadata,
        ) -> BatchResult<()> {
            if self.fail {
                return Err(BatchError::Store("boom".into()));
            }
            self.seen.lock().unwrap().extend(messages);
            Ok(())
        }
    }

    struct Unimplemented;

    impl BatchHandler<MessageKey, serde_json::Value> for Unimplemented {
        fn name(&self) -> &str {
            "unimplemented"
        }
    }

    fn raw(offset: i64, key: &str, payload: Option<&str>) -> RawMessage {
        RawMessage {
            key: Some(key.as_bytes().to_vec()),
            payload: payload.map(|p| p.as_bytes().to_vec()),
            offset,
            timestamp: Some(Utc::now()),
        }
    }

    fn consumption<H: BatchHandler<MessageKey, serde_json::Value>>(
        handler: H,
        sink: &Arc<RecordingMetricsSink>,
    ) -> BatchConsumption<PlainKeyDecoder, JsonDecoder<serde_json::Value>, H> {
        BatchConsumption::new(PlainKeyDecoder, JsonDecoder::new(), handler, sink.clone())
    }

    #[tokio::test]
    async fn test_success_decodes_in_order_and_reports() {
        let sink = Arc::new(RecordingMetricsSink::default());
        let seen: Seen = Arc::default();
        let batch = vec![
            raw(5, "a", Some(r#"{"v": 1}"#)),
            raw(6, "b", None),
            raw(7, "a", Some(r#"{"v": 2}"#)),
        ];
        let metadata = BatchMetadata::for_messages("widgets", 0, &batch);

        consumption(Collecting { seen: seen.clone(), fail: false }, &sink)
            .process_batch(batch, &metadata)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].payload, Some(serde_json::json!({"v": 1})));
        assert!(seen[1].is_tombstone());
        assert_eq!(seen[1].key, Some(MessageKey::Text("b".into())));

        let topic = ("topic", "widgets");
        assert_eq!(sink.counter_total("handler", &[("status", "batch_received"), topic]), 1);
        assert_eq!(sink.counter_total("handler", &[("status", "received"), topic]), 3);
        assert_eq!(sink.counter_total("handler", &[("status", "batch_success"), topic]), 1);
        assert_eq!(sink.counter_total("handler", &[("status", "success"), topic]), 3);
        assert_eq!(sink.counter_total("handler", &[("status", "batch_error")]), 0);
        assert_eq!(sink.histogram_count("handler", &[("time", "consume_batch")]), 1);
        assert_eq!(sink.histogram_count("handler", &[("time", "time_delay")]), 1);
    }

    #[tokio::test]
    async fn test_handler_error_is_reported_and_returned() {
        let sink = Arc::new(RecordingMetricsSink::default());
        let batch = vec![raw(1, "a", Some("{}"))];
        let metadata = BatchMetadata::for_messages("widgets", 2, &batch);

        let err = consumption(Collecting { seen: Arc::default(), fail: true }, &sink)
            .process_batch(batch, &metadata)
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::Store(_)));
        assert_eq!(sink.counter_total("handler", &[("status", "batch_error")]), 1);
        assert_eq!(sink.counter_total("handler", &[("status", "batch_success")]), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_whole_batch() {
        let sink = Arc::new(RecordingMetricsSink::default());
        let seen: Seen = Arc::default();
        let batch = vec![raw(1, "a", Some("{}")), raw(2, "b", Some("not json"))];
        let metadata = BatchMetadata::for_messages("widgets", 0, &batch);

        let err = consumption(Collecting { seen: seen.clone(), fail: false }, &sink)
            .process_batch(batch, &metadata)
            .await
            .unwrap_err();

        match err {
            BatchError::Decode(decode) => assert_eq!(decode.offset, Some(2)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(sink.counter_total("handler", &[("status", "batch_error")]), 1);
    }

    #[tokio::test]
    async fn test_default_consume_batch_is_not_implemented() {
        let sink = Arc::new(RecordingMetricsSink::default());
        let batch = vec![raw(1, "a", Some("{}"))];
        let metadata = BatchMetadata::for_messages("widgets", 0, &batch);

        let err = consumption(Unimplemented, &sink)
            .process_batch(batch, &metadata)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::NotImplemented(ref name) if name == "unimplemented"));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(BatchPhase::Applying.to_string(), "applying");
        assert_eq!(BatchPhase::Slicing.to_string(), "slicing");
    }

    #[test]
    fn test_invalid_record_fails_in_slicing() {
        let err = BatchError::InvalidRecord("key is not composite".into());
        assert_eq!(BatchPhase::of_handler_error(&err), BatchPhase::Slicing);
        let err = BatchError::Store("check constraint violated".into());
        assert_eq!(BatchPhase::of_handler_error(&err), BatchPhase::Applying);
        let err = BatchError::PersistenceConflict("deadlock detected".into());
        assert_eq!(BatchPhase::of_handler_error(&err), BatchPhase::Applying);
    }
}
