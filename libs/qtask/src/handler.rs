//! Handler trait for processing partitioned messages.
//!
//! The runtime performs the acknowledgement: a handler that returns
//! `Ok` gets its entry acked exactly once, a handler that returns `Err`
//! leaves the entry pending so the reclaim loop can re-deliver it after
//! `min_idle_time_ms`. Handlers must therefore be idempotent.

use async_trait::async_trait;
use tracing::error;

use crate::error::{QTaskError, Result};
use crate::message::Message;

/// Processes messages delivered from one or more partition streams.
///
/// # Example
///
/// ```rust,ignore
/// use qtask::{Message, PartitionHandler, QTaskError};
///
/// struct SendNotification;
///
/// #[async_trait::async_trait]
/// impl PartitionHandler for SendNotification {
///     async fn handle(&self, message: &Message) -> Result<(), QTaskError> {
///         let to = message
///             .get("to")
///             .ok_or_else(|| QTaskError::Handler("missing 'to' field".into()))?;
///         deliver(to).await.map_err(|e| QTaskError::Handler(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait PartitionHandler: Send + Sync {
    /// Process a single message.
    ///
    /// `Ok(())` acknowledges the entry; `Err` leaves it in the pending
    /// entries list for later reclaim.
    async fn handle(&self, message: &Message) -> Result<()>;

    /// Hook invoked for runtime-level errors on the consumer that
    /// delivers to this handler (read failures, reclaim failures,
    /// unparseable entries). `context` names the failing activity.
    ///
    /// The default implementation logs and moves on; override it to
    /// surface errors into application-side monitoring.
    async fn on_error(&self, err: &QTaskError, context: &str) {
        error!(context = %context, error = %err, "consumer error");
    }
}
