//! End-to-end tests against a containerized Redis.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use qtask::{
    ConsumerState, ConsumerTunables, FleetAssignment, Message, PartitionConsumer,
    PartitionHandler, Partitioner, PublishOptions, Publisher, QTask, QTaskConfig, QTaskError,
    RegisterOptions, Result,
};
use redis::aio::ConnectionManager;
use serde_json::json;
use test_utils::TestRedis;

/// Handler that records everything it sees and optionally fails.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Message>>,
    fail: AtomicBool,
}

impl Recorder {
    fn failing() -> Self {
        let recorder = Self::default();
        recorder.fail.store(true, Ordering::SeqCst);
        recorder
    }

    fn seen(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl PartitionHandler for Recorder {
    async fn handle(&self, message: &Message) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QTaskError::Handler("simulated failure".to_string()));
        }
        self.seen.lock().unwrap().push(message.clone());
        Ok(())
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

fn value_text(value: &redis::Value) -> String {
    match value {
        redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
        redis::Value::SimpleString(s) => s.clone(),
        redis::Value::Int(n) => n.to_string(),
        other => panic!("unexpected reply value: {:?}", other),
    }
}

async fn range_entries(
    conn: &ConnectionManager,
    stream: &str,
) -> Vec<(String, Vec<(String, String)>)> {
    let mut conn = conn.clone();
    let reply: redis::Value = redis::cmd("XRANGE")
        .arg(stream)
        .arg("-")
        .arg("+")
        .query_async(&mut conn)
        .await
        .unwrap_or(redis::Value::Nil);

    let mut entries = Vec::new();
    if let redis::Value::Array(items) = reply {
        for item in items {
            let redis::Value::Array(parts) = item else { continue };
            let id = value_text(&parts[0]);
            let mut fields = Vec::new();
            if let redis::Value::Array(flat) = &parts[1] {
                for pair in flat.chunks_exact(2) {
                    fields.push((value_text(&pair[0]), value_text(&pair[1])));
                }
            }
            entries.push((id, fields));
        }
    }
    entries
}

async fn pending_count(conn: &ConnectionManager, stream: &str, group: &str) -> i64 {
    let mut conn = conn.clone();
    let reply: redis::Value = redis::cmd("XPENDING")
        .arg(stream)
        .arg(group)
        .query_async(&mut conn)
        .await
        .unwrap_or(redis::Value::Nil);
    match reply {
        redis::Value::Array(parts) => match parts.first() {
            Some(redis::Value::Int(n)) => *n,
            _ => 0,
        },
        _ => 0,
    }
}

async fn wait_for_pending(
    conn: &ConnectionManager,
    stream: &str,
    group: &str,
    expected: i64,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pending_count(conn, stream, group).await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn create_group(conn: &ConnectionManager, stream: &str, group: &str) {
    let mut conn = conn.clone();
    let result: std::result::Result<(), redis::RedisError> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg("0")
        .arg("MKSTREAM")
        .query_async(&mut conn)
        .await;
    if let Err(e) = result {
        assert!(e.to_string().contains("BUSYGROUP"), "XGROUP CREATE: {}", e);
    }
}

mod publish_tests {
    use super::*;

    #[tokio::test]
    async fn publish_routes_to_hashed_partition() {
        let redis = TestRedis::start().await;
        let manager = redis.manager().await;
        let publisher = Publisher::new(manager.clone(), Partitioner::new(4).unwrap());

        // hash("abc") = 96354; 96354 % 4 = 2
        publisher
            .publish("T", "abc", &json!({"to": "x"}), None)
            .await
            .unwrap();

        let entries = range_entries(&manager, "T:2").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].1,
            vec![("to".to_string(), "x".to_string())]
        );

        for other in ["T:0", "T:1", "T:3"] {
            assert!(range_entries(&manager, other).await.is_empty());
        }
    }

    #[tokio::test]
    async fn publish_encodings() {
        let redis = TestRedis::start().await;
        let manager = redis.manager().await;
        let publisher = Publisher::new(manager.clone(), Partitioner::new(1).unwrap());

        publisher
            .publish("enc", "k", &json!("hello"), None)
            .await
            .unwrap();
        publisher
            .publish("enc", "k", &json!({"a": 1, "b": 2}), None)
            .await
            .unwrap();
        publisher.publish("enc", "k", &json!({}), None).await.unwrap();

        let entries = range_entries(&manager, "enc:0").await;
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0].1,
            vec![("message".to_string(), "hello".to_string())]
        );
        assert_eq!(
            entries[1].1,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
        assert_eq!(
            entries[2].1,
            vec![("_placeholder".to_string(), "empty_object".to_string())]
        );
    }

    #[tokio::test]
    async fn publish_with_explicit_id() {
        let redis = TestRedis::start().await;
        let manager = redis.manager().await;
        let publisher = Publisher::new(manager.clone(), Partitioner::new(1).unwrap());

        let id = publisher
            .publish(
                "ids",
                "k",
                &json!({"v": "1"}),
                Some(PublishOptions {
                    id: Some("42-1".to_string()),
                }),
            )
            .await
            .unwrap();
        assert_eq!(id, "42-1");
    }

    #[tokio::test]
    async fn publish_rejects_missing_arguments() {
        let redis = TestRedis::start().await;
        let manager = redis.manager().await;
        let publisher = Publisher::new(manager.clone(), Partitioner::new(1).unwrap());

        let err = publisher.publish("", "k", &json!("x"), None).await.unwrap_err();
        assert!(matches!(err, QTaskError::InvalidArgument(_)));

        let err = publisher.publish("t", "", &json!("x"), None).await.unwrap_err();
        assert!(matches!(err, QTaskError::InvalidArgument(_)));

        let err = publisher.publish("t", "k", &json!(null), None).await.unwrap_err();
        assert!(matches!(err, QTaskError::InvalidArgument(_)));

        // Nothing was appended anywhere.
        assert!(range_entries(&manager, "t:0").await.is_empty());
    }
}

mod consumer_tests {
    use super::*;

    fn fast_tunables() -> ConsumerTunables {
        ConsumerTunables::default()
            .with_block_timeout_ms(200)
            .with_claim_interval_ms(60_000)
            .with_min_idle_time_ms(60_000)
    }

    #[tokio::test]
    async fn round_trip_preserves_fields_and_acks_once() {
        let redis = TestRedis::start().await;
        let manager = redis.manager().await;
        let partitioner = Partitioner::new(2).unwrap();
        let publisher = Publisher::new(manager.clone(), partitioner);

        let partition = partitioner.partition_for(Some("order-7"));
        let stream = partitioner.stream_name("rt", partition).unwrap();
        create_group(&manager, &stream, "workers").await;

        let handler = Arc::new(Recorder::default());
        let consumer = PartitionConsumer::new(
            manager.clone(),
            stream.clone(),
            "workers",
            "c-rt-0",
            partition,
            fast_tunables(),
            handler.clone(),
        );
        consumer.start();

        publisher
            .publish("rt", "order-7", &json!({"sku": "A-1", "qty": 3}), None)
            .await
            .unwrap();

        assert!(wait_until(|| handler.count() == 1, Duration::from_secs(5)).await);

        let seen = handler.seen();
        assert_eq!(
            seen[0].fields,
            vec![
                ("sku".to_string(), "A-1".to_string()),
                ("qty".to_string(), "3".to_string()),
            ]
        );
        assert_eq!(seen[0].partition, partition);

        // Handler success means exactly one ack: the PEL drains.
        assert!(wait_for_pending(&manager, &stream, "workers", 0, Duration::from_secs(5)).await);

        consumer.stop();
    }

    #[tokio::test]
    async fn failed_handler_leaves_entry_pending() {
        let redis = TestRedis::start().await;
        let manager = redis.manager().await;
        let partitioner = Partitioner::new(1).unwrap();
        let publisher = Publisher::new(manager.clone(), partitioner);

        create_group(&manager, "fail:0", "workers").await;

        let handler = Arc::new(Recorder::failing());
        let consumer = PartitionConsumer::new(
            manager.clone(),
            "fail:0",
            "workers",
            "c-fail-0",
            0,
            fast_tunables(),
            handler.clone(),
        );
        consumer.start();

        publisher.publish("fail", "k", &json!({"v": "1"}), None).await.unwrap();

        // The entry must be delivered, rejected, and stay pending.
        assert!(wait_for_pending(&manager, "fail:0", "workers", 1, Duration::from_secs(5)).await);
        assert_eq!(handler.count(), 0);

        consumer.stop();
    }

    #[tokio::test]
    async fn stalled_entry_is_reclaimed_by_peer() {
        let redis = TestRedis::start().await;
        let manager = redis.manager().await;
        let partitioner = Partitioner::new(1).unwrap();
        let publisher = Publisher::new(manager.clone(), partitioner);

        create_group(&manager, "claim:0", "workers").await;

        // First consumer rejects everything, so the entry stays in the
        // PEL under its name.
        let failing = Arc::new(Recorder::failing());
        let first = PartitionConsumer::new(
            manager.clone(),
            "claim:0",
            "workers",
            "c-claim-a",
            0,
            fast_tunables(),
            failing.clone(),
        );
        first.start();

        publisher.publish("claim", "k", &json!({"v": "1"}), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        // Peer with an aggressive reclaim cadence takes the entry over
        // once it has been idle past min_idle_time.
        let recording = Arc::new(Recorder::default());
        let second = PartitionConsumer::new(
            manager.clone(),
            "claim:0",
            "workers",
            "c-claim-b",
            0,
            ConsumerTunables::default()
                .with_block_timeout_ms(200)
                .with_claim_interval_ms(250)
                .with_min_idle_time_ms(500),
            recording.clone(),
        );
        second.start();

        assert!(
            wait_until(|| recording.count() == 1, Duration::from_secs(10)).await,
            "peer consumer never reclaimed the stalled entry"
        );

        first.stop();
        second.stop();
    }

    #[tokio::test]
    async fn stop_is_observed_within_block_timeout() {
        let redis = TestRedis::start().await;
        let manager = redis.manager().await;

        create_group(&manager, "stopb:0", "workers").await;

        let handler = Arc::new(Recorder::default());
        let consumer = PartitionConsumer::new(
            manager.clone(),
            "stopb:0",
            "workers",
            "c-stop-0",
            0,
            ConsumerTunables::default().with_block_timeout_ms(2000),
            handler,
        );
        consumer.start();

        // Let the read loop enter its blocking read.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        consumer.stop();
        assert!(
            wait_until(
                || consumer.state() == ConsumerState::Stopped,
                Duration::from_millis(2500)
            )
            .await,
            "consumer did not stop in time"
        );
        assert!(started.elapsed() <= Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let redis = TestRedis::start().await;
        let manager = redis.manager().await;

        create_group(&manager, "idem:0", "workers").await;

        let handler = Arc::new(Recorder::default());
        let consumer = PartitionConsumer::new(
            manager.clone(),
            "idem:0",
            "workers",
            "c-idem-0",
            0,
            ConsumerTunables::default().with_block_timeout_ms(200),
            handler,
        );
        consumer.start();
        consumer.start();
        assert_eq!(consumer.state(), ConsumerState::Running);

        consumer.stop();
        consumer.stop();
        assert!(
            wait_until(
                || consumer.state() == ConsumerState::Stopped,
                Duration::from_secs(2)
            )
            .await
        );

        // Terminal: a stopped consumer does not restart.
        consumer.start();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }
}

mod fleet_tests {
    use super::*;

    #[tokio::test]
    async fn two_instance_fleet_handles_everything_exactly_once() {
        let redis = TestRedis::start().await;
        let manager_conn = redis.manager().await;
        let partitioner = Partitioner::new(4).unwrap();
        let publisher = Publisher::new(manager_conn.clone(), partitioner);

        let tunables = ConsumerTunables::default()
            .with_block_timeout_ms(200)
            .with_claim_interval_ms(60_000)
            .with_min_idle_time_ms(60_000);

        let first_handler = Arc::new(Recorder::default());
        let mut first = qtask::ConsumerManager::new(manager_conn.clone(), partitioner);
        first
            .register(
                RegisterOptions::new("fleet", "fleet_workers", first_handler.clone())
                    .with_partitioning(FleetAssignment::new(0, 2).unwrap())
                    .with_tunables(tunables.clone()),
            )
            .await
            .unwrap();
        assert_eq!(first.consumer_keys().len(), 2);

        let second_handler = Arc::new(Recorder::default());
        let mut second = qtask::ConsumerManager::new(manager_conn.clone(), partitioner);
        second
            .register(
                RegisterOptions::new("fleet", "fleet_workers", second_handler.clone())
                    .with_partitioning(FleetAssignment::new(1, 2).unwrap())
                    .with_tunables(tunables),
            )
            .await
            .unwrap();
        assert_eq!(second.consumer_keys().len(), 2);

        const TOTAL: usize = 40;
        for i in 0..TOTAL {
            publisher
                .publish("fleet", &format!("key-{}", i), &json!({"n": i}), None)
                .await
                .unwrap();
        }

        assert!(
            wait_until(
                || first_handler.count() + second_handler.count() == TOTAL,
                Duration::from_secs(15)
            )
            .await,
            "fleet saw {} of {} messages",
            first_handler.count() + second_handler.count(),
            TOTAL
        );

        // Exactly once across the fleet: no id delivered twice.
        let mut ids: Vec<String> = first_handler
            .seen()
            .into_iter()
            .chain(second_handler.seen())
            .map(|m| m.id)
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), TOTAL);

        // Each instance only touched the partitions it owns.
        assert!(first_handler.seen().iter().all(|m| m.partition % 2 == 0));
        assert!(second_handler.seen().iter().all(|m| m.partition % 2 == 1));

        first.stop_all().await;
        second.stop_all().await;
    }

    #[tokio::test]
    async fn duplicate_registration_is_ignored() {
        let redis = TestRedis::start().await;
        let manager_conn = redis.manager().await;
        let partitioner = Partitioner::new(2).unwrap();

        let handler = Arc::new(Recorder::default());
        let mut manager = qtask::ConsumerManager::new(manager_conn.clone(), partitioner);

        let options = || {
            RegisterOptions::new("dup", "dup_workers", handler.clone())
                .with_partitioning(FleetAssignment::new(0, 1).unwrap())
                .with_tunables(ConsumerTunables::default().with_block_timeout_ms(200))
        };

        manager.register(options()).await.unwrap();
        let keys_before = manager.consumer_keys().len();
        manager.register(options()).await.unwrap();
        assert_eq!(manager.consumer_keys().len(), keys_before);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn empty_ownership_registers_nothing() {
        let redis = TestRedis::start().await;
        let manager_conn = redis.manager().await;
        let partitioner = Partitioner::new(2).unwrap();

        let handler = Arc::new(Recorder::default());
        let mut manager = qtask::ConsumerManager::new(manager_conn, partitioner);

        // Instance 5 of 8 owns no partition of a 2-partition topic.
        manager
            .register(
                RegisterOptions::new("sparse", "sparse_workers", handler)
                    .with_partitioning(FleetAssignment::new(5, 8).unwrap()),
            )
            .await
            .unwrap();
        assert!(manager.consumer_keys().is_empty());
    }
}

mod facade_tests {
    use super::*;

    #[tokio::test]
    async fn facade_lifecycle() {
        let redis = TestRedis::start().await;

        let mut queue = QTask::new(
            QTaskConfig::new(redis.host(), redis.port(), 4).with_log_service_name("facade-test"),
        )
        .unwrap();

        // Not connected yet.
        let err = queue.publish("T", "k", &json!("x"), None).await.unwrap_err();
        assert!(matches!(err, QTaskError::NotConnected));

        queue.connect().await.unwrap();
        assert!(queue.is_connected());

        let handler = Arc::new(Recorder::default());
        queue
            .register(
                RegisterOptions::new("T", "t_workers", handler.clone()).with_tunables(
                    ConsumerTunables::default()
                        .with_block_timeout_ms(200)
                        .with_claim_interval_ms(60_000),
                ),
            )
            .await
            .unwrap();

        queue.publish("T", "abc", &json!({"to": "x"}), None).await.unwrap();

        assert!(wait_until(|| handler.count() == 1, Duration::from_secs(5)).await);
        let seen = handler.seen();
        // hash("abc") % 4 = 2
        assert_eq!(seen[0].partition, 2);
        assert_eq!(seen[0].get("to"), Some("x"));

        queue.stop().await;
        let err = queue.publish("T", "k", &json!("x"), None).await.unwrap_err();
        assert!(matches!(err, QTaskError::NotConnected));
    }

    #[tokio::test]
    async fn facade_connect_is_idempotent() {
        let redis = TestRedis::start().await;
        let mut queue = QTask::new(QTaskConfig::new(redis.host(), redis.port(), 2)).unwrap();
        queue.connect().await.unwrap();
        queue.connect().await.unwrap();
        assert!(queue.is_connected());
        queue.stop().await;
    }

    #[tokio::test]
    async fn facade_connect_fails_on_bad_endpoint() {
        let mut queue = QTask::new(QTaskConfig::new("127.0.0.1", 1, 2)).unwrap();
        assert!(queue.connect().await.is_err());
        assert!(!queue.is_connected());
    }
}
