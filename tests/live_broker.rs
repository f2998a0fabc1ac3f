//! Round-trip tests against a real broker. Ignored by default; run with a
//! RabbitMQ instance reachable through the `RABBITMQ_*` environment
//! variables:
//!
//!   cargo test --test live_broker -- --ignored

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use rabbit_router::{
    ConnectionManager, ConsumeBinding, ConsumerEngine, ConsumerSettings, EventHandler,
    EventPublisher, HandlerRegistry, PublishBinding, PublisherRoutingBuilder, RabbitSettings,
    ConsumerRoutingBuilder,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderCreated {
    order_id: String,
    customer_id: String,
    total: f64,
}

struct ForwardingHandler {
    tx: mpsc::UnboundedSender<OrderCreated>,
}

#[async_trait]
impl EventHandler<OrderCreated> for ForwardingHandler {
    async fn handle(&self, event: OrderCreated, _shutdown: CancellationToken) -> anyhow::Result<()> {
        self.tx.send(event)?;
        Ok(())
    }
}

struct FaultingHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler<OrderCreated> for FaultingHandler {
    async fn handle(&self, _event: OrderCreated, _shutdown: CancellationToken) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("downstream unavailable"))
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

fn connection() -> Arc<ConnectionManager> {
    let settings = RabbitSettings::from_env().expect("broker settings");
    Arc::new(ConnectionManager::new(&settings))
}

#[tokio::test]
#[ignore]
async fn concurrent_channel_requests_share_one_connection() {
    init_tracing();
    let connection = connection();

    let mut requests = Vec::new();
    for _ in 0..8 {
        let connection = connection.clone();
        requests.push(tokio::spawn(async move { connection.channel().await }));
    }

    let mut ids = std::collections::HashSet::new();
    for request in requests {
        let channel = request.await.expect("task").expect("channel");
        ids.insert(channel.id());
    }

    // Channel ids are unique per connection and start at 1, so eight
    // distinct ids means every caller was served by the same underlying
    // connection; separate connections would collide on id 1.
    assert_eq!(ids.len(), 8);

    connection.close().await;
}

#[tokio::test]
#[ignore]
async fn published_event_reaches_its_registered_handler() {
    init_tracing();
    let connection = connection();
    let suffix = Uuid::new_v4().simple().to_string();
    let exchange = format!("rabbit-router-test-{suffix}");
    let queue = format!("orders.created.{suffix}");

    let publisher = EventPublisher::new(
        connection.clone(),
        Arc::new(
            PublisherRoutingBuilder::new()
                .map::<OrderCreated>(PublishBinding::new(&exchange, "order.created"))
                .build(),
        ),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handlers = Arc::new(HandlerRegistry::new().register::<OrderCreated, _>(ForwardingHandler { tx }));
    let engine = ConsumerEngine::new(
        connection.clone(),
        Arc::new(
            ConsumerRoutingBuilder::new()
                .bind::<OrderCreated>(
                    ConsumeBinding::new(&queue, &exchange, "order.created").auto_delete(true),
                )
                .build(),
        ),
        handlers,
        ConsumerSettings::default(),
    );

    engine.start().await.expect("engine start");

    let sent = OrderCreated {
        order_id: "o-1".to_string(),
        customer_id: "c-1".to_string(),
        total: 59.99,
    };
    publisher.publish(&sent).await.expect("publish");

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery within 5s")
        .expect("handler still running");
    assert_eq!(received.order_id, sent.order_id);
    assert_eq!(received.customer_id, sent.customer_id);

    engine.shutdown().await;
    connection.close().await;
}

#[tokio::test]
#[ignore]
async fn faulting_handler_exhausts_retries_and_the_message_is_not_redelivered() {
    init_tracing();
    let connection = connection();
    let suffix = Uuid::new_v4().simple().to_string();
    let exchange = format!("rabbit-router-test-{suffix}");
    let queue = format!("orders.created.{suffix}");

    let publisher = EventPublisher::new(
        connection.clone(),
        Arc::new(
            PublisherRoutingBuilder::new()
                .map::<OrderCreated>(PublishBinding::new(&exchange, "order.created"))
                .build(),
        ),
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let handlers = Arc::new(
        HandlerRegistry::new().register::<OrderCreated, _>(FaultingHandler { calls: calls.clone() }),
    );
    let engine = ConsumerEngine::new(
        connection.clone(),
        Arc::new(
            ConsumerRoutingBuilder::new()
                .bind::<OrderCreated>(
                    ConsumeBinding::new(&queue, &exchange, "order.created").auto_delete(true),
                )
                .build(),
        ),
        handlers,
        ConsumerSettings {
            max_retries: 2,
            retry_delay_ms: 10,
            ..ConsumerSettings::default()
        },
    );

    engine.start().await.expect("engine start");
    publisher
        .publish(&OrderCreated {
            order_id: "o-2".to_string(),
            customer_id: "c-2".to_string(),
            total: 10.0,
        })
        .await
        .expect("publish");

    // Reject-without-requeue: after the retry budget the broker must not
    // hand the message back.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    engine.shutdown().await;
    connection.close().await;
}
