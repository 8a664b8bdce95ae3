//! Broker configuration
//!
//! This module provides `BrokerConfig` for configuring the broker engine.

use crate::backoff::BackoffConfig;
use core_config::{env_flag, env_or_default, env_parse, ConfigError, FromEnv};
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Message ordering guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Ordering {
    /// Messages may be handled concurrently and out of order.
    #[default]
    Unordered,
    /// One message at a time, in transport order. Forces a single worker loop.
    Strict,
}

/// How messages are shared between broker instances on the same queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DeliveryMode {
    /// Each message goes to exactly one instance.
    #[default]
    Competing,
    /// Every instance receives every message.
    Broadcast,
}

/// Configuration for the broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Queue (stream / topic) name
    pub queue: String,

    /// Number of parallel worker loops
    pub concurrency: usize,

    /// Total handler attempts per message before it is abandoned
    pub max_reconsume: u32,

    /// Opt in to emulated delayed delivery on transports without native support
    pub delayed_delivery: bool,

    /// Consumer group / subscription name
    pub consumer_group: String,

    /// Unique consumer ID (auto-generated if not provided)
    pub consumer_id: String,

    pub ordering: Ordering,

    pub delivery: DeliveryMode,

    /// Upper bound on a single blocking receive, also the shutdown reaction time
    pub receive_timeout: Duration,

    /// Backoff used while reconnecting to the transport
    pub reconnect: BackoffConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new("bee")
    }
}

impl BrokerConfig {
    /// Create a new BrokerConfig for a queue with defaults
    pub fn new(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            consumer_group: format!("{queue}_workers"),
            queue,
            concurrency: 1,
            max_reconsume: 3,
            delayed_delivery: false,
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            ordering: Ordering::Unordered,
            delivery: DeliveryMode::Competing,
            receive_timeout: Duration::from_secs(1),
            reconnect: BackoffConfig::default(),
        }
    }

    /// Set the number of worker loops (minimum 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the total attempt budget (minimum 1)
    pub fn with_max_reconsume(mut self, max_reconsume: u32) -> Self {
        self.max_reconsume = max_reconsume.max(1);
        self
    }

    pub fn with_delayed_delivery(mut self, enable: bool) -> Self {
        self.delayed_delivery = enable;
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn with_ordering(mut self, ordering: Ordering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Number of loops actually started. Strict ordering runs a single loop.
    pub fn effective_concurrency(&self) -> usize {
        match self.ordering {
            Ordering::Strict => 1,
            Ordering::Unordered => self.concurrency.max(1),
        }
    }
}

impl FromEnv for BrokerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let queue = env_or_default("BROKER_QUEUE", "bee");
        let defaults = Self::new(queue.clone());

        let ordering = env_or_default("BROKER_ORDERING", "unordered")
            .parse::<Ordering>()
            .map_err(|e| ConfigError::ParseError {
                key: "BROKER_ORDERING".to_string(),
                details: e.to_string(),
            })?;

        let delivery = env_or_default("BROKER_DELIVERY_MODE", "competing")
            .parse::<DeliveryMode>()
            .map_err(|e| ConfigError::ParseError {
                key: "BROKER_DELIVERY_MODE".to_string(),
                details: e.to_string(),
            })?;

        let concurrency: usize = env_parse("BROKER_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid(
                "BROKER_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        Ok(defaults
            .with_concurrency(concurrency)
            .with_max_reconsume(env_parse("BROKER_MAX_RECONSUME", 3)?)
            .with_delayed_delivery(env_flag("BROKER_DELAYED_DELIVERY", false)?)
            .with_consumer_group(env_or_default(
                "BROKER_CONSUMER_GROUP",
                &format!("{queue}_workers"),
            ))
            .with_consumer_id(env_or_default(
                "BROKER_CONSUMER_ID",
                &format!("worker-{}", Uuid::new_v4()),
            ))
            .with_ordering(ordering)
            .with_delivery(delivery)
            .with_receive_timeout(Duration::from_millis(env_parse(
                "BROKER_RECEIVE_TIMEOUT_MS",
                1000u64,
            )?)))
    }
}
