//! Containerized Redis for integration tests.

use redis::aio::ConnectionManager;
use redis::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// A throwaway Redis instance, one per test.
///
/// The container is stopped and removed when the value is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::start().await;
/// let manager = redis.manager().await;
/// // hand `manager` to the code under test
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    host: String,
    port: u16,
}

impl TestRedis {
    /// Start a fresh Redis container (7-alpine: first generation with
    /// the full XAUTOCLAIM reply shape).
    pub async fn start() -> Self {
        let container = Redis::default()
            .with_tag("7-alpine")
            .start()
            .await
            .expect("failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("failed to resolve Redis port");

        tracing::debug!(port = port, "Test Redis ready");

        Self {
            container,
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `redis://` URL of the container.
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }

    /// A fresh auto-reconnecting connection to the container.
    pub async fn manager(&self) -> ConnectionManager {
        let client = Client::open(self.url()).expect("failed to create Redis client");
        ConnectionManager::new(client)
            .await
            .expect("failed to connect to test Redis")
    }
}
