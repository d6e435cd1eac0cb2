//! Stream message model and decoders.

use std::fmt;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// A decoded stream message. A `None` payload is a tombstone (delete intent).
#[derive(Debug, Clone, PartialEq)]
pub struct Message<K, P> {
    pub key: Option<K>,
    pub payload: Option<P>,
}

impl<K, P> Message<K, P> {
    pub fn new(key: Option<K>, payload: Option<P>) -> Self {
        Self { key, payload }
    }

    pub fn tombstone(key: K) -> Self {
        Self {
            key: Some(key),
            payload: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }
}

/// Undecoded message as delivered by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Information about a batch delivered together from one topic-partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub topic: String,
    pub partition: i32,
    pub first_offset: i64,
    pub last_offset: i64,
    pub batch_size: usize,
    /// Timestamp of the oldest message in the batch, when the transport provides one
    pub oldest_timestamp: Option<DateTime<Utc>>,
}

impl BatchMetadata {
    /// Build metadata for `messages`, which must come from a single topic-partition.
    pub fn for_messages(topic: &str, partition: i32, messages: &[RawMessage]) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            first_offset: messages.first().map(|m| m.offset).unwrap_or_default(),
            last_offset: messages.last().map(|m| m.offset).unwrap_or_default(),
            batch_size: messages.len(),
            oldest_timestamp: messages.iter().filter_map(|m| m.timestamp).min(),
        }
    }
}

/// Comparable message key.
///
/// Schema-encoded keys that are records become `Composite`, with fields sorted
/// by name so equal keys compare equal regardless of field order on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKey {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Composite(Vec<(String, MessageKey)>),
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKey::Int(v) => write!(f, "{v}"),
            MessageKey::Text(v) => write!(f, "{v}"),
            MessageKey::Bytes(v) => write!(f, "0x{}", v.iter().map(|b| format!("{b:02x}")).collect::<String>()),
            MessageKey::Composite(fields) => {
                let parts: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, "{{{}}}", parts.join(","))
            }
        }
    }
}

impl MessageKey {
    fn from_json(value: serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(MessageKey::Int)
                .ok_or_else(|| format!("non-integer numeric key {n}")),
            serde_json::Value::String(s) => Ok(MessageKey::Text(s)),
            serde_json::Value::Object(map) => {
                let mut fields = map
                    .into_iter()
                    .map(|(k, v)| MessageKey::from_json(v).map(|key| (k, key)))
                    .collect::<Result<Vec<_>, _>>()?;
                fields.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(MessageKey::Composite(fields))
            }
            other => Err(format!("unsupported key value {other}")),
        }
    }
}

/// Turns raw bytes into a structured value.
pub trait Decoder: Send + Sync {
    type Output: Send + Sync;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Output, DecodeError>;
}

/// Deserializes JSON payloads into `T`.
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonDecoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonDecoder")
            .field("output", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Decoder for JsonDecoder<T>
where
    T: DeserializeOwned + Send + Sync,
{
    type Output = T;

    fn decode(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::new("payload", e.to_string()))
    }
}

/// Key decoder used when no key schema is configured: UTF-8 text, raw bytes otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainKeyDecoder;

impl Decoder for PlainKeyDecoder {
    type Output = MessageKey;

    fn decode(&self, bytes: &[u8]) -> Result<MessageKey, DecodeError> {
        Ok(match std::str::from_utf8(bytes) {
            Ok(text) => MessageKey::Text(text.to_string()),
            Err(_) => MessageKey::Bytes(bytes.to_vec()),
        })
    }
}

/// Key decoder for JSON-encoded keys: integers, strings, or flat records.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonKeyDecoder;

impl Decoder for JsonKeyDecoder {
    type Output = MessageKey;

    fn decode(&self, bytes: &[u8]) -> Result<MessageKey, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::new("key", e.to_string()))?;
        MessageKey::from_json(value).map_err(|reason| DecodeError::new("key", reason))
    }
}
