//! Shared test utilities for broker testing
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: deterministic, per-test queue and consumer names (always available)
//!
//! # Usage
//!
//! Add `features = ["redis"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let names = TestDataBuilder::from_test_name("my_redis_test");
//!     let queue = names.queue("orders");
//!     // connect a transport to redis.url() and use `queue`
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test names with deterministic seeding
///
/// Tests sharing one Redis instance stay isolated by using their own queue names.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_delay_is_honored");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Queue name unique to this test.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let queue = TestDataBuilder::new(7).queue("bee");
    /// assert_eq!(queue, "test:bee:7");
    /// ```
    pub fn queue(&self, prefix: &str) -> String {
        format!("test:{}:{}", prefix, self.seed)
    }

    /// Consumer group name unique to this test.
    pub fn group(&self, prefix: &str) -> String {
        format!("test-{}-{}-group", prefix, self.seed)
    }

    /// Deterministic consumer id, stable across restarts within a test.
    pub fn consumer_id(&self, index: u32) -> String {
        format!("worker-{}-{}", self.seed, index)
    }

    /// Deterministic UUID derived from the seed.
    pub fn uuid(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.uuid(), builder2.uuid());
        assert_eq!(builder1.queue("bee"), builder2.queue("bee"));
        assert_eq!(builder1.consumer_id(1), "worker-42-1");
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.queue("bee"), builder2.queue("bee"));
        assert_ne!(builder1.group("bee"), builder2.group("bee"));
    }
}
