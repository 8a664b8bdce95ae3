//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that runs a Redis container for transport tests.

use redis::aio::MultiplexedConnection;
use redis::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    url: String,
}

impl TestRedis {
    /// Start a Redis 8 Alpine container (streams and sorted sets included).
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let url = format!("redis://127.0.0.1:{}", host_port);

        let connection = Client::open(url.clone())
            .expect("Failed to create Redis client")
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            url,
        }
    }

    /// URL for transports under test
    pub fn url(&self) -> &str {
        &self.url
    }

    /// A side connection for inspecting keys the transport wrote
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Length of a stream, 0 if it does not exist
    pub async fn stream_len(&self, stream: &str) -> i64 {
        let mut conn = self.connection();
        redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .expect("XLEN failed")
    }

    /// Number of entries pending (delivered, not acked) in a consumer group
    pub async fn pending_count(&self, stream: &str, group: &str) -> i64 {
        let mut conn = self.connection();
        let (count, _, _, _): (i64, Option<String>, Option<String>, Option<Vec<(String, String)>>) =
            redis::cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .query_async(&mut conn)
                .await
                .expect("XPENDING failed");
        count
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}
