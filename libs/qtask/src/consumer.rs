//! Per-partition consumer: blocking read loop plus reclaim ticker.
//!
//! Each consumer is bound to a single `(stream, group, consumer_id)`
//! triple and runs two tasks while running: a loop issuing blocking
//! group-reads for new entries, and a ticker that periodically claims
//! pending entries whose previous owner went quiet. Both feed the same
//! dispatch path, which invokes the handler and acks on success.
//!
//! Shutdown is cooperative: `stop()` flips the state and signals a
//! watch channel. The ticker cancels immediately; the read loop exits
//! once the in-flight blocking read returns, so a stop is observed
//! within `block_timeout_ms` plus at most one retry sleep.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{parse_autoclaim_reply, parse_read_reply, value_to_string, RawEntry};
use crate::error::{QTaskError, Result};
use crate::handler::PartitionHandler;
use crate::message::Message;

/// How many pending entries one reclaim tick asks for. Restarting the
/// scan at `0-0` with a bounded count keeps per-tick work constant
/// without a persistent cursor.
const RECLAIM_COUNT: usize = 10;

/// Timing knobs for a partition consumer.
#[derive(Debug, Clone)]
pub struct ConsumerTunables {
    /// Upper bound on one blocking group-read; also bounds how long a
    /// stopping consumer waits before observing the stop signal.
    pub block_timeout_ms: u64,

    /// Cadence of the stalled-entry reclaim scan.
    pub claim_interval_ms: u64,

    /// How stale a pending entry must be before it is taken over.
    /// Should exceed the typical p99 handler runtime.
    pub min_idle_time_ms: u64,
}

impl Default for ConsumerTunables {
    fn default() -> Self {
        Self {
            block_timeout_ms: 2000,
            claim_interval_ms: 300_000,
            min_idle_time_ms: 60_000,
        }
    }
}

impl ConsumerTunables {
    pub fn with_block_timeout_ms(mut self, ms: u64) -> Self {
        self.block_timeout_ms = ms;
        self
    }

    pub fn with_claim_interval_ms(mut self, ms: u64) -> Self {
        self.claim_interval_ms = ms;
        self
    }

    pub fn with_min_idle_time_ms(mut self, ms: u64) -> Self {
        self.min_idle_time_ms = ms;
        self
    }
}

/// Lifecycle of a partition consumer. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct StateCell(AtomicU8);

impl StateCell {
    const IDLE: u8 = 0;
    const RUNNING: u8 = 1;
    const STOPPING: u8 = 2;
    const STOPPED: u8 = 3;

    fn new() -> Self {
        Self(AtomicU8::new(Self::IDLE))
    }

    fn get(&self) -> ConsumerState {
        match self.0.load(Ordering::SeqCst) {
            Self::IDLE => ConsumerState::Idle,
            Self::RUNNING => ConsumerState::Running,
            Self::STOPPING => ConsumerState::Stopping,
            _ => ConsumerState::Stopped,
        }
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.0
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn set(&self, to: u8) {
        self.0.store(to, Ordering::SeqCst);
    }
}

struct Core {
    redis: ConnectionManager,
    stream: String,
    group: String,
    consumer_id: String,
    partition: u32,
    tunables: ConsumerTunables,
    handler: Arc<dyn PartitionHandler>,
    state: StateCell,
    /// Serializes handler invocations between the read loop and the
    /// reclaim ticker: handlers never run concurrently on one partition.
    dispatch_lock: tokio::sync::Mutex<()>,
}

/// A long-running consumer for one partition stream.
pub struct PartitionConsumer {
    core: Arc<Core>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PartitionConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        redis: ConnectionManager,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer_id: impl Into<String>,
        partition: u32,
        tunables: ConsumerTunables,
        handler: Arc<dyn PartitionHandler>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(Core {
                redis,
                stream: stream.into(),
                group: group.into(),
                consumer_id: consumer_id.into(),
                partition,
                tunables,
                handler,
                state: StateCell::new(),
                dispatch_lock: tokio::sync::Mutex::new(()),
            }),
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn stream(&self) -> &str {
        &self.core.stream
    }

    pub fn group(&self) -> &str {
        &self.core.group
    }

    pub fn consumer_id(&self) -> &str {
        &self.core.consumer_id
    }

    pub fn partition(&self) -> u32 {
        self.core.partition
    }

    pub fn block_timeout_ms(&self) -> u64 {
        self.core.tunables.block_timeout_ms
    }

    pub fn state(&self) -> ConsumerState {
        self.core.state.get()
    }

    /// Start the read loop and the reclaim ticker.
    ///
    /// Idempotent: starting a running consumer is a warned no-op, and a
    /// stopped consumer cannot be restarted.
    pub fn start(&self) {
        if !self
            .core
            .state
            .transition(StateCell::IDLE, StateCell::RUNNING)
        {
            warn!(
                stream = %self.core.stream,
                consumer = %self.core.consumer_id,
                state = ?self.state(),
                "start() ignored: consumer is not idle"
            );
            return;
        }

        info!(
            stream = %self.core.stream,
            group = %self.core.group,
            consumer = %self.core.consumer_id,
            partition = self.core.partition,
            "Starting partition consumer"
        );

        let read_core = Arc::clone(&self.core);
        let read_shutdown = self.shutdown.subscribe();
        let read_task = tokio::spawn(async move {
            read_core.run_read_loop(read_shutdown).await;
        });

        let claim_core = Arc::clone(&self.core);
        let claim_shutdown = self.shutdown.subscribe();
        let claim_task = tokio::spawn(async move {
            claim_core.run_reclaim_ticker(claim_shutdown).await;
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(read_task);
            tasks.push(claim_task);
        }
    }

    /// Signal the consumer to stop.
    ///
    /// The reclaim ticker cancels immediately (a tick in flight is
    /// allowed to finish but will not re-arm); the read loop exits once
    /// its blocking read returns. Idempotent.
    pub fn stop(&self) {
        if self
            .core
            .state
            .transition(StateCell::RUNNING, StateCell::STOPPING)
        {
            info!(
                stream = %self.core.stream,
                consumer = %self.core.consumer_id,
                "Stopping partition consumer"
            );
            let _ = self.shutdown.send(true);
        } else if self.core.state.transition(StateCell::IDLE, StateCell::STOPPED) {
            debug!(stream = %self.core.stream, "Consumer stopped before start");
        } else {
            debug!(
                stream = %self.core.stream,
                consumer = %self.core.consumer_id,
                "stop() ignored: consumer already stopping or stopped"
            );
        }
    }
}

impl Drop for PartitionConsumer {
    fn drop(&mut self) {
        // Dropping a running consumer must not leave orphan loops.
        self.stop();
    }
}

impl Core {
    fn is_active(&self) -> bool {
        self.state.get() == ConsumerState::Running
    }

    async fn run_read_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.read_loop(&mut shutdown).await {
            self.handler.on_error(&e, "fatal_loop_error").await;
        }
        self.state.set(StateCell::STOPPED);
        debug!(
            stream = %self.stream,
            consumer = %self.consumer_id,
            "Read loop exited"
        );
    }

    async fn read_loop(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() || !self.is_active() {
                break;
            }

            match self.read_new_entries().await {
                Ok(entries) => {
                    // Entries are handled in server id order, and the
                    // next read only goes out after the whole batch has
                    // been dispatched.
                    for entry in entries {
                        self.dispatch(entry).await;
                    }
                }
                Err(e) if e.is_block_timeout() => continue,
                // A credential rejection cannot heal through backoff or
                // group re-creation; it escapes the loop and lands the
                // consumer in Stopped via `fatal_loop_error`.
                Err(e) if e.is_auth_error() => return Err(e),
                Err(e) if e.is_connection_error() => {
                    self.handler.on_error(&e, "readloop_redis_conn").await;
                    let backoff = self.tunables.block_timeout_ms.max(5000);
                    self.sleep_or_shutdown(Duration::from_millis(backoff), shutdown)
                        .await;
                }
                Err(e) if e.is_nogroup_error() => {
                    self.handler.on_error(&e, "readloop_nogroup").await;
                    if let Err(create_err) =
                        ensure_group(&self.redis, &self.stream, &self.group).await
                    {
                        warn!(
                            stream = %self.stream,
                            group = %self.group,
                            error = %create_err,
                            "Consumer group re-creation failed, will retry"
                        );
                    }
                    self.sleep_or_shutdown(Duration::from_millis(5000), shutdown)
                        .await;
                }
                Err(e) => {
                    self.handler.on_error(&e, "readloop_xreadgroup").await;
                    self.sleep_or_shutdown(Duration::from_millis(2000), shutdown)
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn run_reclaim_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.tunables.claim_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if !self.is_active() {
                        break;
                    }
                    match self.reclaim_once().await {
                        Ok(0) => {}
                        Ok(claimed) => {
                            info!(
                                stream = %self.stream,
                                consumer = %self.consumer_id,
                                claimed = claimed,
                                "Reclaimed stalled entries"
                            );
                        }
                        Err(e) if e.is_unsupported_command() => {
                            // Server predates XAUTOCLAIM: degrade to
                            // read-only operation, permanently.
                            self.handler.on_error(&e, "autoclaim_unsupported").await;
                            break;
                        }
                        Err(e) if e.is_connection_error() => {
                            self.handler.on_error(&e, "autoclaim_redis_conn").await;
                        }
                        Err(e) if e.is_nogroup_error() => {
                            self.handler.on_error(&e, "autoclaim_nogroup").await;
                            if let Err(create_err) =
                                ensure_group(&self.redis, &self.stream, &self.group).await
                            {
                                warn!(
                                    stream = %self.stream,
                                    group = %self.group,
                                    error = %create_err,
                                    "Consumer group re-creation failed, will retry"
                                );
                            }
                        }
                        Err(e) => {
                            self.handler.on_error(&e, "autoclaim").await;
                        }
                    }
                }
            }
        }

        debug!(
            stream = %self.stream,
            consumer = %self.consumer_id,
            "Reclaim ticker exited"
        );
    }

    async fn read_new_entries(&self) -> Result<Vec<RawEntry>> {
        let mut conn = self.redis.clone();
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer_id)
            .arg("BLOCK")
            .arg(self.tunables.block_timeout_ms)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;
        Ok(parse_read_reply(&reply))
    }

    /// One reclaim scan. The scan always restarts at `0-0`: with a
    /// bounded COUNT this gives constant per-tick cost and needs no
    /// cursor carried across ticks.
    async fn reclaim_once(&self) -> Result<usize> {
        let mut conn = self.redis.clone();
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer_id)
            .arg(self.tunables.min_idle_time_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(RECLAIM_COUNT)
            .query_async(&mut conn)
            .await?;

        let (_next_id, entries) = parse_autoclaim_reply(&reply);
        let claimed = entries.len();
        for entry in entries {
            self.dispatch(entry).await;
        }
        Ok(claimed)
    }

    /// Reconstruct an entry into a message and hand it to the handler.
    /// The ack only goes out when the handler returns success; a failed
    /// handler leaves the entry pending so the reclaim scan can hand it
    /// to a live consumer after `min_idle_time_ms`.
    async fn dispatch(&self, entry: RawEntry) {
        if entry.fields.is_empty() || entry.fields.len() % 2 != 0 {
            warn!(
                stream = %self.stream,
                entry_id = %entry.id,
                field_count = entry.fields.len(),
                "Dropping entry with malformed field list"
            );
            return;
        }

        let message = match self.reconstruct(&entry) {
            Ok(message) => message,
            Err(e) => {
                let context = format!("parse_message_{}", entry.id);
                self.handler.on_error(&e, &context).await;
                return;
            }
        };

        let _serialized = self.dispatch_lock.lock().await;
        match self.handler.handle(&message).await {
            Ok(()) => {
                if let Err(e) = self.ack(&entry.id).await {
                    error!(
                        stream = %self.stream,
                        entry_id = %entry.id,
                        error = %e,
                        "Failed to ack handled entry"
                    );
                }
            }
            Err(e) => {
                warn!(
                    stream = %self.stream,
                    entry_id = %entry.id,
                    partition = self.partition,
                    error = %e,
                    "Handler failed, leaving entry pending"
                );
            }
        }
    }

    fn reconstruct(&self, entry: &RawEntry) -> Result<Message> {
        let mut pairs = Vec::with_capacity(entry.fields.len() / 2);
        for chunk in entry.fields.chunks_exact(2) {
            let field = value_to_string(&chunk[0]).ok_or_else(|| {
                QTaskError::MessageParsing(format!("unreadable field name in entry {}", entry.id))
            })?;
            let value = value_to_string(&chunk[1]).ok_or_else(|| {
                QTaskError::MessageParsing(format!(
                    "unreadable value for field '{}' in entry {}",
                    field, entry.id
                ))
            })?;
            pairs.push((field, value));
        }
        Ok(Message::new(entry.id.clone(), pairs, self.partition))
    }

    async fn ack(&self, entry_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _acked: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        debug!(stream = %self.stream, entry_id = %entry_id, "Acked entry");
        Ok(())
    }

    /// Sleep that wakes early when stop is signaled, so backoff never
    /// extends the shutdown window.
    async fn sleep_or_shutdown(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Create the consumer group on a stream, creating the stream as well
/// if it does not exist yet. An already-existing group (BUSYGROUP) is
/// success: group creation is idempotent by design of the protocol.
pub(crate) async fn ensure_group(
    redis: &ConnectionManager,
    stream: &str,
    group: &str,
) -> Result<()> {
    let mut conn = redis.clone();
    let result: std::result::Result<(), redis::RedisError> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg("0")
        .arg("MKSTREAM")
        .query_async(&mut conn)
        .await;

    match result {
        Ok(()) => {
            info!(stream = %stream, group = %group, "Created consumer group");
            Ok(())
        }
        Err(e) if e.to_string().contains("BUSYGROUP") => {
            debug!(stream = %stream, group = %group, "Consumer group already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
