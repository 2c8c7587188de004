//! Consumer manager: fleet-aware registration and lifecycle.
//!
//! `register` turns a subscription request into one `PartitionConsumer`
//! per owned partition: it derives the static fleet assignment, creates
//! the consumer group on every owned partition stream, and starts the
//! consumers. The manager exclusively owns its consumers; nothing else
//! holds a handle to them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tracing::{info, warn};

use crate::assignment::FleetAssignment;
use crate::consumer::{ensure_group, ConsumerTunables, PartitionConsumer};
use crate::error::{QTaskError, Result};
use crate::handler::PartitionHandler;
use crate::partitioner::Partitioner;

/// A subscription request for one logical topic.
pub struct RegisterOptions {
    /// Logical topic whose partition streams to consume.
    pub base_topic: String,

    /// Consumer group name; one group spans all partitions of the
    /// subscription.
    pub group: String,

    /// Handler invoked for every delivered message.
    pub handler: Arc<dyn PartitionHandler>,

    /// Explicit fleet slot. Falls back to `INSTANCE_ID` /
    /// `INSTANCE_COUNT` from the environment, then to `(0, 1)`.
    pub partitioning: Option<FleetAssignment>,

    /// Prefix for consumer identities. Defaults to `consumer-{group}`.
    pub consumer_id_base: Option<String>,

    /// Timing knobs applied to every consumer of this registration.
    pub tunables: ConsumerTunables,
}

impl RegisterOptions {
    pub fn new(
        base_topic: impl Into<String>,
        group: impl Into<String>,
        handler: Arc<dyn PartitionHandler>,
    ) -> Self {
        Self {
            base_topic: base_topic.into(),
            group: group.into(),
            handler,
            partitioning: None,
            consumer_id_base: None,
            tunables: ConsumerTunables::default(),
        }
    }

    pub fn with_partitioning(mut self, assignment: FleetAssignment) -> Self {
        self.partitioning = Some(assignment);
        self
    }

    pub fn with_consumer_id_base(mut self, base: impl Into<String>) -> Self {
        self.consumer_id_base = Some(base.into());
        self
    }

    pub fn with_tunables(mut self, tunables: ConsumerTunables) -> Self {
        self.tunables = tunables;
        self
    }
}

/// Owns and runs the partition consumers of this process.
pub struct ConsumerManager {
    redis: ConnectionManager,
    partitioner: Partitioner,
    /// Distinguishes this process's consumers inside the shared group,
    /// so a restarted process registers fresh identities.
    process_identity: String,
    consumers: HashMap<String, PartitionConsumer>,
}

impl ConsumerManager {
    pub fn new(redis: ConnectionManager, partitioner: Partitioner) -> Self {
        Self {
            redis,
            partitioner,
            process_identity: format!("{}-{}", std::process::id(), short_uuid()),
            consumers: HashMap::new(),
        }
    }

    /// Register a subscription: create groups on the owned partition
    /// streams and start one consumer per owned partition.
    pub async fn register(&mut self, options: RegisterOptions) -> Result<()> {
        if options.base_topic.is_empty() {
            return Err(QTaskError::InvalidArgument(
                "base_topic is required".to_string(),
            ));
        }
        if options.group.is_empty() {
            return Err(QTaskError::InvalidArgument("group is required".to_string()));
        }

        let assignment = match options.partitioning {
            Some(assignment) => assignment,
            None => FleetAssignment::from_env()?,
        };

        let owned = assignment.owned_partitions(self.partitioner.total_partitions());
        if owned.is_empty() {
            warn!(
                topic = %options.base_topic,
                instance_id = assignment.instance_id(),
                instance_count = assignment.instance_count(),
                total_partitions = self.partitioner.total_partitions(),
                "Instance owns no partitions; registration is a no-op"
            );
            return Ok(());
        }

        info!(
            topic = %options.base_topic,
            group = %options.group,
            instance_id = assignment.instance_id(),
            instance_count = assignment.instance_count(),
            partitions = ?owned,
            "Registering partition consumers"
        );

        let consumer_id_base = options
            .consumer_id_base
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", options.group));

        for partition in owned {
            let stream = self.partitioner.stream_name(&options.base_topic, partition)?;

            match ensure_group(&self.redis, &stream, &options.group).await {
                Ok(()) => {}
                Err(e) if e.is_connection_error() => {
                    // Startup without a store is fatal for the whole
                    // registration, not just this partition.
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        stream = %stream,
                        group = %options.group,
                        error = %e,
                        "Group creation failed; skipping partition"
                    );
                    continue;
                }
            }

            let consumer_id = format!(
                "{}-{}-{}",
                consumer_id_base, self.process_identity, partition
            );
            let key = consumer_key(&stream, &options.group, &consumer_id);
            if self.consumers.contains_key(&key) {
                warn!(key = %key, "Consumer already registered; ignoring");
                continue;
            }

            let consumer = PartitionConsumer::new(
                self.redis.clone(),
                stream,
                options.group.clone(),
                consumer_id,
                partition,
                options.tunables.clone(),
                Arc::clone(&options.handler),
            );
            consumer.start();
            self.consumers.insert(key, consumer);
        }

        Ok(())
    }

    /// Registry keys of the currently owned consumers.
    pub fn consumer_keys(&self) -> Vec<String> {
        self.consumers.keys().cloned().collect()
    }

    /// Stop one consumer by its registry key.
    pub async fn stop(&mut self, key: &str) {
        if let Some(consumer) = self.consumers.remove(key) {
            let wait_ms = consumer.block_timeout_ms() + 500;
            consumer.stop();
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }
    }

    /// Stop every consumer and wait for in-flight blocking reads to
    /// unwind. There is no forced cancellation: the wait is bounded by
    /// the largest block timeout plus a grace interval.
    pub async fn stop_all(&mut self) {
        if self.consumers.is_empty() {
            return;
        }

        let mut max_block_ms = 0u64;
        for consumer in self.consumers.values() {
            max_block_ms = max_block_ms.max(consumer.block_timeout_ms());
            consumer.stop();
        }
        let count = self.consumers.len();
        self.consumers.clear();

        tokio::time::sleep(Duration::from_millis(max_block_ms + 500)).await;
        info!(consumers = count, "All partition consumers stopped");
    }
}

fn consumer_key(stream: &str, group: &str, consumer_id: &str) -> String {
    format!("{}:{}:{}", stream, group, consumer_id)
}

fn short_uuid() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
