use std::sync::Arc;

use futures_lite::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Consumer};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConsumerSettings;
use crate::connection::ConnectionManager;
use crate::errors::ConsumeError;
use crate::handler::HandlerResolver;
use crate::routing::{ConsumeRoute, RoutingTable};

/// Why a delivery was rejected.
#[derive(Debug, Clone)]
pub enum FailureKind {
    /// Payload was not valid UTF-8 JSON for the route's event type. The
    /// handler is never consulted on this path.
    Decode(String),
    /// No handler registered for the route's event type.
    HandlerMissing,
    /// Handler faulted on every attempt within the retry budget.
    Handler(String),
}

/// One rejected delivery, as reported to the failure hook. Rejections never
/// requeue, so the broker's dead-letter path is the only place the message
/// goes next.
#[derive(Debug, Clone)]
pub struct ConsumeFailure {
    pub kind: FailureKind,
    pub queue: String,
    pub event_type: &'static str,
    pub delivery_tag: u64,
}

/// Observability seam for rejected deliveries. The engine calls this once
/// per rejection, before the nack goes out.
pub trait FailureHook: Send + Sync {
    fn on_failure(&self, failure: &ConsumeFailure);
}

/// Default hook: a structured error line per rejection.
pub struct LogFailureHook;

impl FailureHook for LogFailureHook {
    fn on_failure(&self, failure: &ConsumeFailure) {
        error!(
            queue = %failure.queue,
            event_type = failure.event_type,
            delivery_tag = failure.delivery_tag,
            "delivery rejected without requeue: {:?}",
            failure.kind
        );
    }
}

/// Terminal fate of one delivery. Every delivery gets exactly one.
#[derive(Debug)]
pub enum Outcome {
    Ack,
    RejectNoRequeue(FailureKind),
}

/// Drives one consumption loop per consume route.
///
/// `start` provisions every route on its own channel; each route's loop and
/// every per-delivery pipeline run as tracked tasks so `shutdown` can drain
/// them. Channels are never shared between loops, so no per-channel locking
/// exists anywhere in the engine.
pub struct ConsumerEngine {
    connection: Arc<ConnectionManager>,
    routes: Arc<RoutingTable<ConsumeRoute>>,
    resolver: Arc<dyn HandlerResolver>,
    settings: ConsumerSettings,
    hook: Arc<dyn FailureHook>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    channels: Mutex<Vec<Channel>>,
}

impl ConsumerEngine {
    pub fn new(
        connection: Arc<ConnectionManager>,
        routes: Arc<RoutingTable<ConsumeRoute>>,
        resolver: Arc<dyn HandlerResolver>,
        settings: ConsumerSettings,
    ) -> Self {
        ConsumerEngine {
            connection,
            routes,
            resolver,
            settings,
            hook: Arc::new(LogFailureHook),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failure_hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Token observed by route loops, in-flight handlers, and retry waits.
    /// Hand it to whatever drives process shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Provisions every route and starts its receive loop.
    ///
    /// Routes fail independently: one queue that cannot be provisioned is
    /// logged and skipped while its siblings start. Only when every route
    /// fails does the error reach the caller.
    pub async fn start(&self) -> Result<(), ConsumeError> {
        let mut started = 0usize;
        let mut last_error = None;

        for route in self.routes.values() {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.provision(route).await {
                Ok(consumer) => {
                    self.spawn_route_loop(route.clone(), consumer);
                    started += 1;
                }
                Err(e) => {
                    error!(queue = %route.binding.queue, "failed to provision consume route: {e}");
                    last_error = Some(e);
                }
            }
        }

        info!(routes = started, "consumer engine started");
        match last_error {
            Some(e) if started == 0 && !self.routes.is_empty() => Err(e),
            _ => Ok(()),
        }
    }

    /// Declares the route's topology on a dedicated channel and registers
    /// the consumer with manual acknowledgment.
    async fn provision(&self, route: &ConsumeRoute) -> Result<Consumer, ConsumeError> {
        let binding = &route.binding;
        let provisioning = |source| ConsumeError::Provisioning {
            queue: binding.queue.clone(),
            source,
        };

        let channel = self.connection.channel().await?;

        channel
            .basic_qos(
                self.settings.prefetch_count,
                BasicQosOptions { global: false },
            )
            .await
            .map_err(provisioning)?;

        channel
            .exchange_declare(
                &binding.exchange,
                binding.kind.clone(),
                ExchangeDeclareOptions {
                    durable: binding.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(provisioning)?;

        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: binding.durable,
                    exclusive: binding.exclusive,
                    auto_delete: binding.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                binding.arguments.clone().unwrap_or_default(),
            )
            .await
            .map_err(provisioning)?;

        channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(provisioning)?;

        // Manual ack only: auto-ack would drop at-least-once delivery on a
        // handler crash.
        let consumer = channel
            .basic_consume(
                &binding.queue,
                &format!("consumer-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(provisioning)?;

        debug!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            event_type = route.event_type,
            "provisioned consume route"
        );

        self.channels.lock().await.push(channel);
        Ok(consumer)
    }

    fn spawn_route_loop(&self, route: ConsumeRoute, mut consumer: Consumer) {
        let resolver = self.resolver.clone();
        let settings = self.settings.clone();
        let hook = self.hook.clone();
        let shutdown = self.shutdown.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            info!(queue = %route.binding.queue, "listening for deliveries");
            loop {
                let delivery = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(e)) => {
                            error!(queue = %route.binding.queue, "error receiving delivery: {e}");
                            continue;
                        }
                        None => break,
                    },
                };

                // Each delivery is handled as its own task so a slow handler
                // never stalls receipt of the next; prefetch bounds how many
                // run at once.
                let route = route.clone();
                let resolver = resolver.clone();
                let settings = settings.clone();
                let hook = hook.clone();
                let shutdown = shutdown.clone();
                tracker.spawn(async move {
                    handle_delivery(&route, delivery, resolver.as_ref(), &settings, &hook, &shutdown)
                        .await;
                });
            }
            debug!(queue = %route.binding.queue, "route loop stopped");
        });
    }

    /// Stops accepting deliveries, drains in-flight pipelines up to the
    /// configured window, then closes each route channel independently so
    /// one close failure never blocks the others.
    pub async fn shutdown(&self) {
        info!("consumer engine shutting down");
        self.shutdown.cancel();
        self.tracker.close();

        if timeout(self.settings.drain_timeout(), self.tracker.wait())
            .await
            .is_err()
        {
            warn!("drain window elapsed with deliveries still in flight; their acks are abandoned");
        }

        for channel in self.channels.lock().await.drain(..) {
            if let Err(e) = channel.close(200, "consumer engine stopped").await {
                warn!("failed to close consumer channel: {e}");
            }
        }
    }
}

/// Runs the dispatch pipeline and settles the delivery with exactly one
/// terminal ack or nack, each targeting this delivery's tag alone.
async fn handle_delivery(
    route: &ConsumeRoute,
    delivery: Delivery,
    resolver: &dyn HandlerResolver,
    settings: &ConsumerSettings,
    hook: &Arc<dyn FailureHook>,
    shutdown: &CancellationToken,
) {
    let outcome = dispatch(route, &delivery.data, resolver, settings, shutdown).await;

    match outcome {
        Outcome::Ack => {
            if let Err(e) = delivery.ack(BasicAckOptions { multiple: false }).await {
                error!(
                    queue = %route.binding.queue,
                    delivery_tag = delivery.delivery_tag,
                    "failed to acknowledge delivery: {e}"
                );
            }
        }
        Outcome::RejectNoRequeue(kind) => {
            hook.on_failure(&ConsumeFailure {
                kind,
                queue: route.binding.queue.clone(),
                event_type: route.event_type,
                delivery_tag: delivery.delivery_tag,
            });
            if let Err(e) = delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
            {
                error!(
                    queue = %route.binding.queue,
                    delivery_tag = delivery.delivery_tag,
                    "failed to reject delivery: {e}"
                );
            }
        }
    }
}

/// The per-message pipeline: decode, resolve, invoke, decide.
///
/// Decode runs before handler resolution, so a malformed payload never
/// reaches a handler. A handler fault retries in place up to the configured
/// budget; decode failures and missing handlers never retry, and rejection
/// never requeues so a poison message cannot loop forever.
async fn dispatch(
    route: &ConsumeRoute,
    payload: &[u8],
    resolver: &dyn HandlerResolver,
    settings: &ConsumerSettings,
    shutdown: &CancellationToken,
) -> Outcome {
    let mut event = match route.decode(payload) {
        Ok(event) => event,
        Err(e) => return Outcome::RejectNoRequeue(FailureKind::Decode(e.to_string())),
    };

    // Resolved fresh per delivery; scoped registrations get a new handler
    // instance here.
    let handler = match resolver.resolve(route.key) {
        Some(handler) => handler,
        None => return Outcome::RejectNoRequeue(FailureKind::HandlerMissing),
    };

    let mut attempt = 0u32;
    loop {
        match handler.call(event, shutdown.clone()).await {
            Ok(()) => return Outcome::Ack,
            Err(e) => {
                if attempt >= settings.max_retries || shutdown.is_cancelled() {
                    return Outcome::RejectNoRequeue(FailureKind::Handler(format!("{e:#}")));
                }
                attempt += 1;
                warn!(
                    event_type = route.event_type,
                    attempt,
                    max_retries = settings.max_retries,
                    "handler fault, retrying: {e:#}"
                );
                sleep(settings.retry_delay()).await;
                // The handler consumed the event; re-decode for the retry.
                // The payload already decoded once, so this cannot take the
                // decode-failure path.
                event = match route.decode(payload) {
                    Ok(event) => event,
                    Err(e) => return Outcome::RejectNoRequeue(FailureKind::Decode(e.to_string())),
                };
            }
        }
    }
}
