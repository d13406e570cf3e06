//! End-to-end outbox relay scenarios: rows accumulate while the event bus is
//! unavailable and drain once it recovers, and per-aggregate ordering holds
//! across concurrently-published groups.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;

use sagaflow_runtime::bus::{EventBus, InMemoryEventBus};
use sagaflow_runtime::config::OutboxConfig;
use sagaflow_runtime::outbox::OutboxRelay;
use sagaflow_runtime::store::{InMemoryOutboxStore, OutboxStore};
use sagaflow_runtime::types::{BusError, BusMessage, OutboxRow};

/// Wraps an `InMemoryEventBus`, failing the first `fail_count` publishes and
/// delegating (and recording) every one after that.
struct FlakyEventBus {
    inner: InMemoryEventBus,
    remaining_failures: AtomicUsize,
    published: Mutex<Vec<BusMessage>>,
}

impl FlakyEventBus {
    fn new(fail_count: usize) -> Self {
        Self {
            inner: InMemoryEventBus::new(),
            remaining_failures: AtomicUsize::new(fail_count),
            published: Mutex::new(Vec::new()),
        }
    }

    async fn published(&self) -> Vec<BusMessage> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl EventBus for FlakyEventBus {
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BusError> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(BusError::PublishFailed {
                aggregate_id: message.key.clone(),
                reason: "bus unavailable".to_string(),
            });
        }
        self.published.lock().await.push(message.clone());
        self.inner.publish(topic, message).await
    }

    async fn subscribe(&self, topic: &str) -> tokio::sync::mpsc::Receiver<BusMessage> {
        self.inner.subscribe(topic).await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

fn fast_outbox_config() -> OutboxConfig {
    OutboxConfig {
        poll_interval: Duration::from_millis(5),
        batch_size: 100,
        dead_attempts: 50,
    }
}

// S5: bus unavailable for a period — rows accumulate PENDING, then all
// publish in per-aggregate order once the bus recovers, with no row
// dead-lettered.
#[tokio::test]
async fn outbox_rows_accumulate_then_drain_in_order_once_bus_recovers() {
    let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
    let bus = Arc::new(FlakyEventBus::new(2));

    let base = SystemTime::now();
    let mut row_created = OutboxRow::new("Order", "order-1", "OrderCreated", b"{}".to_vec());
    let mut row_reserved = OutboxRow::new("Order", "order-1", "InventoryReserved", b"{}".to_vec());
    let mut row_charged = OutboxRow::new("Order", "order-1", "PaymentCharged", b"{}".to_vec());
    row_created.created_at = base;
    row_reserved.created_at = base + Duration::from_millis(1);
    row_charged.created_at = base + Duration::from_millis(2);

    for row in [&row_created, &row_reserved, &row_charged] {
        store.insert(row).await.unwrap();
    }

    let relay = OutboxRelay::new(store.clone(), bus.clone() as Arc<dyn EventBus>, "orders", fast_outbox_config());
    let _handle = relay.spawn();

    for _ in 0..200 {
        if bus.published().await.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let published = bus.published().await;
    assert_eq!(published.len(), 3, "all three rows must eventually publish once the bus recovers");
    assert_eq!(
        published.iter().map(|m| m.event_type.as_str()).collect::<Vec<_>>(),
        vec!["OrderCreated", "InventoryReserved", "PaymentCharged"],
        "a single aggregate's rows must publish in creation order even after earlier retries"
    );

    let pending = store.fetch_pending(10).await.unwrap();
    assert!(pending.is_empty(), "no row should remain pending once delivered");
}

// Property 4: per-aggregate FIFO ordering holds even though different
// aggregates' groups publish concurrently.
#[tokio::test]
async fn relay_preserves_per_aggregate_order_across_concurrent_groups() {
    let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let mut rx = bus.subscribe("orders").await;

    let base = SystemTime::now();
    let specs = [("order-1", 0u64), ("order-1", 1), ("order-1", 2), ("order-2", 0), ("order-2", 1)];
    for (aggregate_id, seq) in specs {
        let mut row = OutboxRow::new("Order", aggregate_id, format!("Event{seq}"), b"{}".to_vec());
        row.created_at = base + Duration::from_millis(seq);
        store.insert(&row).await.unwrap();
    }

    let relay = OutboxRelay::new(store.clone(), bus.clone(), "orders", fast_outbox_config());
    let _handle = relay.spawn();

    let mut received = Vec::new();
    for _ in 0..specs.len() {
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("relay must publish every row within the timeout")
            .expect("bus channel must stay open");
        received.push(message);
    }

    for aggregate_id in ["order-1", "order-2"] {
        let timestamps: Vec<_> = received.iter().filter(|m| m.key == aggregate_id).map(|m| m.created_at).collect();
        assert!(
            timestamps.windows(2).all(|w| w[0] <= w[1]),
            "{aggregate_id}'s events must arrive in creation order"
        );
    }
}
