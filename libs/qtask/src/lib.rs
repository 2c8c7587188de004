//! QTask: partitioned task queues on Redis Streams.
//!
//! Producers publish messages addressed to a logical topic with a
//! partition key; a fleet of workers consumes the per-partition streams
//! in parallel with at-least-once delivery, consumer-group semantics
//! and automatic recovery of stalled deliveries.
//!
//! ## Features
//!
//! - **Deterministic partitioning**: the interchange string hash maps a
//!   key to the same `topic:index` stream from any producer
//! - **Consumer groups**: each entry handled by exactly one member of a
//!   group, across all partitions
//! - **Stalled-entry reclaim**: deliveries abandoned mid-flight are
//!   claimed by a live consumer after a configurable idle time
//! - **Static fleet assignment**: `instance_id mod instance_count`
//!   ownership, no external coordinator
//! - **Framework-side acks**: a handler returning `Ok` acks exactly
//!   once; a failing handler leaves the entry pending for redelivery
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use qtask::{Message, PartitionHandler, QTask, QTaskConfig, RegisterOptions, Result};
//!
//! struct PrintHandler;
//!
//! #[async_trait::async_trait]
//! impl PartitionHandler for PrintHandler {
//!     async fn handle(&self, message: &Message) -> Result<()> {
//!         println!("{} on partition {}", message.id, message.partition);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let mut queue = QTask::new(QTaskConfig::new("localhost", 6379, 8))?;
//! queue.connect().await?;
//! queue
//!     .register(RegisterOptions::new("jobs", "job_workers", Arc::new(PrintHandler)))
//!     .await?;
//! queue
//!     .publish("jobs", "user-1", &serde_json::json!({"op": "sync"}), None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod assignment;
pub mod codec;
mod config;
mod connection;
mod consumer;
mod error;
mod handler;
mod manager;
mod message;
mod partitioner;
mod publisher;
mod runtime;
mod telemetry;

pub use assignment::FleetAssignment;
pub use config::{LogConfig, LogLevel, QTaskConfig};
pub use connection::{connect, connect_with_retry, ConnectionSettings, RetryConfig};
pub use consumer::{ConsumerState, ConsumerTunables, PartitionConsumer};
pub use error::{QTaskError, Result};
pub use handler::PartitionHandler;
pub use manager::{ConsumerManager, RegisterOptions};
pub use message::Message;
pub use partitioner::Partitioner;
pub use publisher::{PublishOptions, Publisher};
pub use runtime::QTask;
pub use telemetry::init_logging;
