//! Raw inbound event shapes as delivered by the external session.
//!
//! Only the fields the normalizer reads are modelled; everything else in the
//! payload is ignored during deserialization.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a batch of raw events was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    /// Live delivery.
    #[default]
    Notify,
    /// History fill or re-delivery.
    Append,
    #[serde(other)]
    Other,
}

/// Addressing information of a raw event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    #[serde(default)]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub participant: Option<String>,
}

/// Extended (quoted or link-preview) text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedText {
    #[serde(default)]
    pub text: Option<String>,
}

/// Media attachment; only the caption matters here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    #[serde(default)]
    pub caption: Option<String>,
}

/// Message body. At most a few of these are set on any one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text_message: Option<ExtendedText>,
    #[serde(default)]
    pub image_message: Option<Media>,
    #[serde(default)]
    pub video_message: Option<Media>,
    #[serde(default)]
    pub document_message: Option<Media>,
    #[serde(default)]
    pub audio_message: Option<Value>,
}

/// One raw inbound event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default)]
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<MessageContent>,
    #[serde(default)]
    pub message_timestamp: Option<Value>,
    #[serde(default)]
    pub push_name: Option<String>,
}

impl RawEvent {
    /// Timestamp in Unix seconds.
    ///
    /// Accepts an integer, a numeric string, or a `{low, high}` 64-bit pair.
    /// Anything else yields `0`.
    #[must_use]
    pub fn timestamp_secs(&self) -> i64 {
        match &self.message_timestamp {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_u64().and_then(|v| i64::try_from(v).ok()))
                .unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            Some(Value::Object(obj)) => {
                let low = obj.get("low").and_then(Value::as_i64).unwrap_or(0);
                let high = obj.get("high").and_then(Value::as_i64).unwrap_or(0);
                (high << 32) | (low & 0xFFFF_FFFF)
            }
            _ => 0,
        }
    }
}
