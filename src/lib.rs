//! Typed event routing over RabbitMQ.
//!
//! Application code maps event types to broker topology at startup, then
//! publishes serialized events and consumes them through registered
//! handlers with manual acknowledgment:
//!
//! ```no_run
//! use std::sync::Arc;
//! use rabbit_router::{
//!     ConnectionManager, ConsumeBinding, ConsumerEngine, ConsumerRoutingBuilder,
//!     ConsumerSettings, EventPublisher, PublishBinding, PublisherRoutingBuilder,
//!     RabbitSettings,
//! };
//! # use rabbit_router::{EventHandler, HandlerRegistry};
//! # use serde::{Deserialize, Serialize};
//! # use tokio_util::sync::CancellationToken;
//! # #[derive(Serialize, Deserialize)]
//! # struct OrderCreated { order_id: String }
//! # struct OrderHandler;
//! # #[async_trait::async_trait]
//! # impl EventHandler<OrderCreated> for OrderHandler {
//! #     async fn handle(&self, _e: OrderCreated, _s: CancellationToken) -> anyhow::Result<()> { Ok(()) }
//! # }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = RabbitSettings::from_env()?;
//! let connection = Arc::new(ConnectionManager::new(&settings));
//!
//! let publish_routes = Arc::new(
//!     PublisherRoutingBuilder::new()
//!         .map::<OrderCreated>(PublishBinding::new("domain", "order.created"))
//!         .build(),
//! );
//! let publisher = EventPublisher::new(connection.clone(), publish_routes);
//!
//! let consume_routes = Arc::new(
//!     ConsumerRoutingBuilder::new()
//!         .bind::<OrderCreated>(ConsumeBinding::new("orders.created", "domain", "order.created"))
//!         .build(),
//! );
//! let handlers = Arc::new(HandlerRegistry::new().register::<OrderCreated, _>(OrderHandler));
//! let engine = ConsumerEngine::new(connection, consume_routes, handlers, ConsumerSettings::default());
//!
//! engine.start().await?;
//! publisher.publish(&OrderCreated { order_id: "o-1".into() }).await?;
//! # engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod handler;
pub mod publisher;
pub mod routing;

pub use config::{ConsumerSettings, RabbitSettings};
pub use connection::ConnectionManager;
pub use consumer::{ConsumeFailure, ConsumerEngine, FailureHook, FailureKind, LogFailureHook, Outcome};
pub use errors::{ConnectionError, ConsumeError, PublishError};
pub use handler::{ErasedEventHandler, Event, EventHandler, HandlerRegistry, HandlerResolver};
pub use publisher::EventPublisher;
pub use routing::{
    ConsumeBinding, ConsumeRoute, ConsumerRoutingBuilder, PublishBinding, PublisherRoutingBuilder,
    RoutingTable,
};
