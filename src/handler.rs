use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Anything that can travel through a routing table: serializable both ways,
/// owned, and thread-safe. Blanket-implemented; no manual impls needed.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Event for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Application-side processing logic for one event type.
///
/// A fault (any `Err`) routes the delivery to the reject-without-requeue
/// path after the engine's retry budget is spent; handlers should observe
/// the shutdown token during long-running work.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: E, shutdown: CancellationToken) -> anyhow::Result<()>;
}

/// Type-erased handler as the consumer engine sees it. The event arrives
/// already decoded; implementations downcast back to their concrete type.
#[async_trait]
pub trait ErasedEventHandler: Send + Sync {
    async fn call(&self, event: Box<dyn Any + Send>, shutdown: CancellationToken)
        -> anyhow::Result<()>;
}

struct TypedHandler<E, H> {
    inner: Arc<H>,
    _marker: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> ErasedEventHandler for TypedHandler<E, H>
where
    E: Event,
    H: EventHandler<E> + 'static,
{
    async fn call(
        &self,
        event: Box<dyn Any + Send>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let event = event.downcast::<E>().map_err(|_| {
            anyhow!(
                "delivery decoded as a different type than the handler registered for {}",
                std::any::type_name::<E>()
            )
        })?;
        self.inner.handle(*event, shutdown).await
    }
}

/// Resolves the handler for an event type key. Resolution happens once per
/// delivery, so implementations may hand out per-message instances.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, key: TypeId) -> Option<Arc<dyn ErasedEventHandler>>;
}

type HandlerFactory = Arc<dyn Fn() -> Arc<dyn ErasedEventHandler> + Send + Sync>;

/// Explicit registry mapping event types to handlers, resolved by type
/// identity rather than by name. Registering the same type twice keeps the
/// last handler, matching the overwrite-wins policy of the routing tables.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<TypeId, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Registers a shared handler instance. Every delivery of `E` is
    /// dispatched to this same instance.
    pub fn register<E, H>(mut self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let shared: Arc<dyn ErasedEventHandler> = Arc::new(TypedHandler {
            inner: Arc::new(handler),
            _marker: PhantomData::<fn() -> E>,
        });
        self.factories
            .insert(TypeId::of::<E>(), Arc::new(move || shared.clone()));
        self
    }

    /// Registers a factory invoked once per delivery, so handler-local state
    /// never leaks across messages.
    pub fn register_scoped<E, H, F>(mut self, factory: F) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.factories.insert(
            TypeId::of::<E>(),
            Arc::new(move || {
                let handler: Arc<dyn ErasedEventHandler> = Arc::new(TypedHandler {
                    inner: Arc::new(factory()),
                    _marker: PhantomData::<fn() -> E>,
                });
                handler
            }),
        );
        self
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, key: TypeId) -> Option<Arc<dyn ErasedEventHandler>> {
        self.factories.get(&key).map(|factory| factory())
    }
}
