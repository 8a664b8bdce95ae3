//! Transport adapters
//!
//! The broker core only talks to a backend through [`Transport`]. Adapters:
//! - `MemoryTransport`: in-process queue with native delay, used by tests and demos
//! - `RedisStreamTransport`: Redis Streams with a consumer group (feature `redis`)

mod memory;
#[cfg(feature = "redis")]
mod redis_stream;

pub use memory::MemoryTransport;
#[cfg(feature = "redis")]
pub use redis_stream::{RedisStreamTransport, RedisTransportConfig};

use crate::delay::DelayMode;
use crate::error::TransportError;
use crate::message::{Delivery, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Capability set every backend must provide.
///
/// All methods take `&self`; adapters are shared between the publisher side and
/// every worker task. An adapter returns an error for which
/// [`TransportError::is_connection`] is true when the link is lost, which makes the
/// broker start reconnecting.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short backend name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// How the backend delays messages.
    fn delay_mode(&self) -> DelayMode;

    /// Establish (or re-establish) the link. Must be safe to call repeatedly.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Publish a message for immediate delivery.
    async fn publish(&self, message: &Message) -> Result<(), TransportError>;

    /// Publish a message that must not be delivered before `deliver_at`.
    async fn publish_delayed(
        &self,
        _message: &Message,
        _deliver_at: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("delayed delivery"))
    }

    /// Wait up to `wait` for the next delivery. `Ok(None)` means nothing arrived.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, TransportError>;

    /// Acknowledge a delivery so the backend drops it.
    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Reject a delivery. With `requeue`, `delivery.message` (including its
    /// updated `reconsume_count`) is delivered again; otherwise it is dropped.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError>;

    /// Release backend resources. Must be idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}
