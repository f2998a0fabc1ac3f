use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use lapin::types::FieldTable;
use lapin::ExchangeKind;
use serde::de::Error as _;

use crate::handler::Event;

/// Where events of one type are published: exchange, routing key, and the
/// exchange kind declared before the first publish.
#[derive(Debug, Clone)]
pub struct PublishBinding {
    pub exchange: String,
    pub routing_key: String,
    pub kind: ExchangeKind,
}

impl PublishBinding {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        PublishBinding {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            kind: ExchangeKind::Topic,
        }
    }

    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Queue topology for one consumed event type. Declared idempotently on the
/// broker when the route is provisioned; `arguments` (TTL, max length, ...)
/// pass through to the queue declaration uncritically.
#[derive(Debug, Clone)]
pub struct ConsumeBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Option<FieldTable>,
}

impl ConsumeBinding {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        ConsumeBinding {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: None,
        }
    }

    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = Some(arguments);
        self
    }
}

pub(crate) type EventDecoder =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, serde_json::Error> + Send + Sync>;

/// A consume-table entry: the queue binding plus the decode capability for
/// the statically-known event type, captured at `bind` time so payloads are
/// decoded before any handler is resolved.
#[derive(Clone)]
pub struct ConsumeRoute {
    pub binding: ConsumeBinding,
    pub(crate) key: TypeId,
    pub(crate) event_type: &'static str,
    decoder: EventDecoder,
}

impl ConsumeRoute {
    fn new<E: Event>(binding: ConsumeBinding) -> Self {
        ConsumeRoute {
            binding,
            key: TypeId::of::<E>(),
            event_type: type_name::<E>(),
            decoder: Arc::new(|bytes| {
                // UTF-8 first, then JSON: a non-text body is a decode
                // failure, not a transport error.
                let text = std::str::from_utf8(bytes).map_err(serde_json::Error::custom)?;
                let event: E = serde_json::from_str(text)?;
                Ok(Box::new(event) as Box<dyn Any + Send>)
            }),
        }
    }

    pub(crate) fn decode(&self, payload: &[u8]) -> Result<Box<dyn Any + Send>, serde_json::Error> {
        (self.decoder)(payload)
    }

    pub fn event_type(&self) -> &'static str {
        self.event_type
    }
}

/// Immutable mapping from event type identity to a binding. Built once by a
/// routing builder, then shared read-only; lookups are by `TypeId`, so two
/// identically-named types in different modules never collide.
pub struct RoutingTable<V> {
    entries: HashMap<TypeId, V>,
}

impl<V> RoutingTable<V> {
    pub fn get<E: Event>(&self) -> Option<&V> {
        self.entries.get(&TypeId::of::<E>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }
}

/// Accumulates publish routes. Registration is overwrite-wins: mapping the
/// same event type twice keeps the last binding.
#[derive(Default)]
pub struct PublisherRoutingBuilder {
    routes: HashMap<TypeId, PublishBinding>,
    exchange_prefix: Option<String>,
}

impl PublisherRoutingBuilder {
    pub fn new() -> Self {
        PublisherRoutingBuilder::default()
    }

    /// Prefix joined with `.` onto every exchange name at build time.
    pub fn exchange_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.exchange_prefix = Some(prefix.into());
        self
    }

    pub fn map<E: Event>(mut self, binding: PublishBinding) -> Self {
        self.routes.insert(TypeId::of::<E>(), binding);
        self
    }

    pub fn build(self) -> RoutingTable<PublishBinding> {
        let prefix = self.exchange_prefix;
        let entries = self
            .routes
            .into_iter()
            .map(|(key, mut binding)| {
                if let Some(prefix) = &prefix {
                    binding.exchange = format!("{prefix}.{}", binding.exchange);
                }
                (key, binding)
            })
            .collect();
        RoutingTable { entries }
    }
}

/// Accumulates consume routes; same overwrite-wins policy as the publish
/// side.
#[derive(Default)]
pub struct ConsumerRoutingBuilder {
    routes: HashMap<TypeId, ConsumeRoute>,
    queue_prefix: Option<String>,
}

impl ConsumerRoutingBuilder {
    pub fn new() -> Self {
        ConsumerRoutingBuilder::default()
    }

    /// Prefix joined with `.` onto every queue name at build time, so one
    /// service's queues share a namespace.
    pub fn queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = Some(prefix.into());
        self
    }

    pub fn bind<E: Event>(mut self, binding: ConsumeBinding) -> Self {
        self.routes
            .insert(TypeId::of::<E>(), ConsumeRoute::new::<E>(binding));
        self
    }

    pub fn build(self) -> RoutingTable<ConsumeRoute> {
        let prefix = self.queue_prefix;
        let entries = self
            .routes
            .into_iter()
            .map(|(key, mut route)| {
                if let Some(prefix) = &prefix {
                    route.binding.queue = format!("{prefix}.{}", route.binding.queue);
                }
                (key, route)
            })
            .collect();
        RoutingTable { entries }
    }
}
