//! Message envelope
//!
//! Wraps an opaque payload with its routing name, identity and delivery metadata.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A message flowing through the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Engine-assigned identity, preserved across redeliveries.
    pub id: String,

    /// Routing name, selects the handler.
    pub name: String,

    /// Opaque payload bytes. `Broker::send` stores JSON here.
    pub payload: Vec<u8>,

    /// Free-form headers carried alongside the payload.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// When the message was first created.
    pub enqueued_at: DateTime<Utc>,

    /// Earliest time the handler may see this message.
    #[serde(default)]
    pub deliver_at: Option<DateTime<Utc>>,

    /// Number of failed attempts so far.
    #[serde(default)]
    pub reconsume_count: u32,
}

impl Message {
    pub fn new(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name: name.into(),
            payload: payload.into(),
            headers: BTreeMap::new(),
            enqueued_at: Utc::now(),
            deliver_at: None,
            reconsume_count: 0,
        }
    }

    /// Create a message with a JSON-encoded payload.
    pub fn json<T: Serialize + ?Sized>(
        name: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(name, serde_json::to_vec(payload)?))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Decode the payload as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// The payload as UTF-8, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Whether this delivery is a retry of an earlier failed attempt.
    pub fn is_redelivery(&self) -> bool {
        self.reconsume_count > 0
    }

    /// Whether the message may be handled at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.deliver_at.is_none_or(|at| at <= now)
    }

    /// Time since the message was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

/// A message handed out by a transport, paired with the receipt used to ack or nack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,

    /// Transport-specific receipt (queue tag, stream entry id, ...).
    pub tag: String,
}

impl Delivery {
    pub fn new(message: Message, tag: impl Into<String>) -> Self {
        Self {
            message,
            tag: tag.into(),
        }
    }
}
