//! The `QTask` facade.
//!
//! Composes partitioner, publisher and consumer manager behind a small
//! lifecycle: construct with validated configuration, `connect()` to
//! the store, then `publish` / `register` freely, and `stop()` to wind
//! everything down. The facade owns the store session; components
//! borrow it, so there is no hidden process-wide client.

use redis::aio::ConnectionManager;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::QTaskConfig;
use crate::connection::{self, RetryConfig};
use crate::error::{QTaskError, Result};
use crate::manager::{ConsumerManager, RegisterOptions};
use crate::partitioner::Partitioner;
use crate::publisher::{PublishOptions, Publisher};

struct Session {
    redis: ConnectionManager,
    publisher: Publisher,
    manager: Mutex<ConsumerManager>,
}

/// Partitioned task-queue runtime handle.
///
/// # Example
///
/// ```rust,ignore
/// use qtask::{QTask, QTaskConfig, RegisterOptions};
///
/// let mut queue = QTask::new(QTaskConfig::new("localhost", 6379, 8))?;
/// queue.connect().await?;
/// queue.register(RegisterOptions::new("billing", "billing_workers", handler)).await?;
/// queue.publish("billing", "account-42", &serde_json::json!({"op": "charge"}), None).await?;
/// ```
pub struct QTask {
    config: QTaskConfig,
    partitioner: Partitioner,
    session: Option<Session>,
}

impl QTask {
    /// Validate the configuration and build the partition mapping.
    ///
    /// The logger and partitioner come up eagerly so configuration
    /// mistakes surface here; everything that needs the store waits for
    /// [`connect`](Self::connect).
    pub fn new(config: QTaskConfig) -> Result<Self> {
        config.validate()?;
        crate::telemetry::init_logging(&config.log);
        let partitioner = Partitioner::new(config.total_partitions)?;
        Ok(Self {
            config,
            partitioner,
            session: None,
        })
    }

    /// Connect to the store. Fails loudly on an unreachable endpoint.
    pub async fn connect(&mut self) -> Result<()> {
        self.connect_inner(None).await
    }

    /// Connect with a startup retry policy, for deployments where the
    /// store may come up after the worker.
    pub async fn connect_with_retry(&mut self, retry: RetryConfig) -> Result<()> {
        self.connect_inner(Some(retry)).await
    }

    async fn connect_inner(&mut self, retry: Option<RetryConfig>) -> Result<()> {
        if self.session.is_some() {
            warn!("connect() ignored: already connected");
            return Ok(());
        }

        let settings = self.config.connection_settings();
        let redis = match retry {
            Some(retry) => connection::connect_with_retry(&settings, retry).await?,
            None => connection::connect(&settings).await?,
        };

        let publisher = Publisher::new(redis.clone(), self.partitioner);
        let manager = Mutex::new(ConsumerManager::new(redis.clone(), self.partitioner));
        self.session = Some(Session {
            redis,
            publisher,
            manager,
        });

        info!(
            total_partitions = self.partitioner.total_partitions(),
            "Queue runtime connected"
        );
        Ok(())
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(QTaskError::NotConnected)
    }

    /// Whether `connect()` has succeeded and `stop()` has not run.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// The partition mapping used by this runtime.
    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    /// A clone of the store session, for callers that need direct
    /// access (health probes, admin tooling).
    pub fn redis(&self) -> Result<ConnectionManager> {
        Ok(self.session()?.redis.clone())
    }

    /// Publish a payload to a logical topic, partitioned by key.
    pub async fn publish(
        &self,
        base_topic: &str,
        partition_key: &str,
        payload: &Value,
        options: Option<PublishOptions>,
    ) -> Result<String> {
        self.session()?
            .publisher
            .publish(base_topic, partition_key, payload, options)
            .await
    }

    /// Register a subscription; see [`RegisterOptions`].
    pub async fn register(&self, options: RegisterOptions) -> Result<()> {
        let session = self.session()?;
        session.manager.lock().await.register(options).await
    }

    /// Registry keys of the running consumers.
    pub async fn consumer_keys(&self) -> Result<Vec<String>> {
        let session = self.session()?;
        let manager = session.manager.lock().await;
        Ok(manager.consumer_keys())
    }

    /// Stop all consumers and release the session.
    ///
    /// Afterwards `publish` and `register` fail with `NotConnected`
    /// until `connect()` is called again. Idempotent.
    pub async fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.manager.lock().await.stop_all().await;
        drop(session);
        info!("Queue runtime stopped");
    }
}
