//! Turning polled rows into stream messages and sending them.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use tracing::{debug, warn};

use crate::error::{PollerError, PollerResult, PublishError, PublishFailure};
use crate::source::PolledRow;

/// An encoded message ready for the stream. A `None` payload is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
}

/// Sends a page of messages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish every message or report which ones failed.
    async fn publish(&self, messages: &[OutboundMessage]) -> Result<(), PublishError>;
}

/// Builds the message for a polled row.
pub trait RowEncoder: Send + Sync {
    fn encode(&self, row: &PolledRow) -> PollerResult<OutboundMessage>;
}

/// Publishes the row's JSON, keyed by `key_field` or by the row id.
#[derive(Debug, Clone, Default)]
pub struct JsonRowEncoder {
    key_field: Option<String>,
}

impl JsonRowEncoder {
    pub fn new(key_field: Option<String>) -> Self {
        Self { key_field }
    }
}

impl RowEncoder for JsonRowEncoder {
    fn encode(&self, row: &PolledRow) -> PollerResult<OutboundMessage> {
        let key = match &self.key_field {
            None => row.id.to_string(),
            Some(field) => match row.data.get(field) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) | None => {
                    return Err(PollerError::Encode(format!(
                        "row {} has no value for key field {}",
                        row.id, field
                    )))
                }
                Some(other) => other.to_string(),
            },
        };
        Ok(OutboundMessage {
            key: Some(key),
            payload: Some(serde_json::to_vec(&row.data)?),
        })
    }
}

fn failure_code(err: &rdkafka::error::KafkaError) -> String {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => "msg_size_too_large".to_string(),
        Some(RDKafkaErrorCode::InvalidMessageSize) => "invalid_msg_size".to_string(),
        Some(code) => format!("{code:?}"),
        None => "unknown".to_string(),
    }
}

/// Kafka publisher for one topic.
///
/// The producer should be configured with `enable.idempotence = true` and
/// `acks = all`; a page may be re-sent after a partial failure.
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            delivery_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, messages: &[OutboundMessage]) -> Result<(), PublishError> {
        let deliveries = messages.iter().map(|message| {
            let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&self.topic);
            if let Some(key) = &message.key {
                record = record.key(key.as_str());
            }
            if let Some(payload) = &message.payload {
                record = record.payload(payload.as_slice());
            }
            self.producer.send(record, self.delivery_timeout)
        });

        let failures: Vec<PublishFailure> = join_all(deliveries)
            .await
            .into_iter()
            .enumerate()
            .filter_map(|(index, result)| {
                result.err().map(|(err, _)| PublishFailure {
                    index,
                    code: failure_code(&err),
                    reason: err.to_string(),
                })
            })
            .collect();

        if failures.is_empty() {
            debug!(topic = %self.topic, count = messages.len(), "Published page to Kafka");
            return Ok(());
        }
        warn!(
            topic = %self.topic,
            failed = failures.len(),
            total = messages.len(),
            first_code = %failures[0].code,
            "Kafka rejected part of the page"
        );
        Err(PublishError::Partial { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(id: i64, data: serde_json::Value) -> PolledRow {
        PolledRow {
            id,
            timestamp: Utc::now(),
            data,
        }
    }

    #[test]
    fn test_encoder_keys_by_id_by_default() {
        let message = JsonRowEncoder::default()
            .encode(&row(7, serde_json::json!({"id": 7, "name": "bolt"})))
            .unwrap();
        assert_eq!(message.key.as_deref(), Some("7"));
        let payload: serde_json::Value =
            serde_json::from_slice(message.payload.as_deref().unwrap()).unwrap();
        assert_eq!(payload["name"], "bolt");
    }

    #[test]
    fn test_encoder_key_field() {
        let encoder = JsonRowEncoder::new(Some("sku".into()));
        let message = encoder
            .encode(&row(1, serde_json::json!({"sku": "W-1"})))
            .unwrap();
        assert_eq!(message.key.as_deref(), Some("W-1"));

        let numeric = encoder.encode(&row(1, serde_json::json!({"sku": 42}))).unwrap();
        assert_eq!(numeric.key.as_deref(), Some("42"));

        assert!(matches!(
            encoder.encode(&row(2, serde_json::json!({"name": "x"}))),
            Err(PollerError::Encode(_))
        ));
    }

    #[test]
    fn test_failure_codes() {
        let too_large = rdkafka::error::KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageSizeTooLarge,
        );
        assert_eq!(failure_code(&too_large), "msg_size_too_large");
        let invalid =
            rdkafka::error::KafkaError::MessageProduction(RDKafkaErrorCode::InvalidMessageSize);
        assert_eq!(failure_code(&invalid), "invalid_msg_size");
    }
}
