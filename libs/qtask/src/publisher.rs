//! Publisher: payload encoding and appends to partition streams.

use redis::aio::ConnectionManager;
use serde_json::Value;
use tracing::{debug, error};

use crate::codec::encode_payload;
use crate::error::{QTaskError, Result};
use crate::partitioner::Partitioner;

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Explicit entry id. Defaults to `"*"` (server-assigned).
    pub id: Option<String>,
}

/// Appends encoded payloads to the partition stream a key maps to.
///
/// The publisher does not retry: an append error is logged with the
/// target stream and returned to the caller, who decides whether the
/// message is worth retrying.
#[derive(Clone)]
pub struct Publisher {
    redis: ConnectionManager,
    partitioner: Partitioner,
}

impl Publisher {
    pub fn new(redis: ConnectionManager, partitioner: Partitioner) -> Self {
        Self { redis, partitioner }
    }

    /// Publish a payload to `base_topic`, partitioned by `partition_key`.
    ///
    /// Returns the entry id assigned by the store.
    pub async fn publish(
        &self,
        base_topic: &str,
        partition_key: &str,
        payload: &Value,
        options: Option<PublishOptions>,
    ) -> Result<String> {
        if base_topic.is_empty() {
            return Err(QTaskError::InvalidArgument(
                "base_topic is required".to_string(),
            ));
        }
        if partition_key.is_empty() {
            return Err(QTaskError::InvalidArgument(
                "partition_key is required".to_string(),
            ));
        }
        if payload.is_null() {
            return Err(QTaskError::InvalidArgument(
                "payload is required".to_string(),
            ));
        }

        let partition = self.partitioner.partition_for(Some(partition_key));
        let stream = self.partitioner.stream_name(base_topic, partition)?;
        let entry_id = options.and_then(|o| o.id).unwrap_or_else(|| "*".to_string());
        let fields = encode_payload(payload);

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&stream).arg(&entry_id);
        for (field, value) in &fields {
            cmd.arg(field).arg(value);
        }

        let mut conn = self.redis.clone();
        match cmd.query_async::<String>(&mut conn).await {
            Ok(assigned_id) => {
                debug!(
                    stream = %stream,
                    partition = partition,
                    entry_id = %assigned_id,
                    fields = fields.len(),
                    "Appended entry"
                );
                Ok(assigned_id)
            }
            Err(e) => {
                error!(stream = %stream, partition = partition, error = %e, "Append failed");
                Err(e.into())
            }
        }
    }

    /// Publish any serializable value by converting it to JSON first.
    pub async fn publish_serde<T: serde::Serialize>(
        &self,
        base_topic: &str,
        partition_key: &str,
        payload: &T,
    ) -> Result<String> {
        let value = serde_json::to_value(payload)?;
        self.publish(base_topic, partition_key, &value, None).await
    }

    /// The partition a key maps to, for callers that need to know the
    /// target without publishing.
    pub fn partition_for(&self, partition_key: &str) -> u32 {
        self.partitioner.partition_for(Some(partition_key))
    }
}
