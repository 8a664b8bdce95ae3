//! Delay scheduling
//!
//! Normalizes "deliver at time T" across transports. The strategy is resolved once
//! from the transport's [`DelayMode`] when the scheduler is built:
//!
//! - **Native**: the backend defers visibility itself, the scheduler only computes
//!   the target time and passes it through.
//! - **Emulated**: the adapter parks the message in a holding structure and
//!   re-publishes it when due. Requires an explicit opt-in on the adapter.
//! - **Unsupported**: delayed sends fail with `TransportError::Unsupported`.

use crate::error::{BrokerError, TransportError};
use crate::message::Message;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

/// How a transport implements delayed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayMode {
    Native,
    Emulated,
    Unsupported,
}

impl DelayMode {
    pub fn mechanism(&self) -> Option<DelayMechanism> {
        match self {
            DelayMode::Native => Some(DelayMechanism::Native),
            DelayMode::Emulated => Some(DelayMechanism::Emulated),
            DelayMode::Unsupported => None,
        }
    }
}

/// Mechanism used for one delayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayMechanism {
    Native,
    Emulated,
}

impl DelayMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelayMechanism::Native => "native",
            DelayMechanism::Emulated => "emulated",
        }
    }
}

/// When and how a delayed message will become visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayDescriptor {
    /// Never earlier than the message's `enqueued_at`.
    pub target_time: DateTime<Utc>,
    pub mechanism: DelayMechanism,
}

#[derive(Debug, Clone, Copy)]
pub struct DelayScheduler {
    mode: DelayMode,
}

impl DelayScheduler {
    pub fn new(mode: DelayMode) -> Self {
        Self { mode }
    }

    pub fn for_transport(transport: &dyn Transport) -> Self {
        Self::new(transport.delay_mode())
    }

    pub fn mode(&self) -> DelayMode {
        self.mode
    }

    /// Work out the target time for `message` sent now with `delay`.
    ///
    /// Returns `None` for a zero delay, which is an ordinary publish.
    pub fn plan(
        &self,
        message: &Message,
        delay: Duration,
    ) -> Result<Option<DelayDescriptor>, BrokerError> {
        if delay.is_zero() {
            return Ok(None);
        }

        let mechanism = self
            .mode
            .mechanism()
            .ok_or(TransportError::Unsupported("delayed delivery"))?;

        let offset = chrono::Duration::from_std(delay)
            .map_err(|e| BrokerError::InvalidDelay(format!("{delay:?}: {e}")))?;
        let target_time = Utc::now()
            .checked_add_signed(offset)
            .ok_or_else(|| BrokerError::InvalidDelay(format!("{delay:?} overflows the clock")))?
            .max(message.enqueued_at);

        Ok(Some(DelayDescriptor {
            target_time,
            mechanism,
        }))
    }

    /// Publish `message` so that it is not handled before `now + delay`.
    pub async fn schedule(
        &self,
        transport: &dyn Transport,
        mut message: Message,
        delay: Duration,
    ) -> Result<Option<DelayDescriptor>, BrokerError> {
        let Some(descriptor) = self.plan(&message, delay)? else {
            transport.publish(&message).await?;
            return Ok(None);
        };

        message.deliver_at = Some(descriptor.target_time);
        transport
            .publish_delayed(&message, descriptor.target_time)
            .await?;

        debug!(
            message_id = %message.id,
            name = %message.name,
            target_time = %descriptor.target_time,
            mechanism = descriptor.mechanism.as_str(),
            "Scheduled delayed message"
        );

        Ok(Some(descriptor))
    }
}
