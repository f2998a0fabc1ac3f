use std::time::Duration;

use lapin::Error as LapinError;
use thiserror::Error;

/// Failures establishing or reusing the shared broker connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to RabbitMQ: {0}")]
    Transport(#[from] LapinError),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures surfaced to callers of [`EventPublisher::publish`](crate::EventPublisher::publish).
///
/// `RouteNotFound` is a configuration error: it is raised before any network
/// activity and retrying without registering the route cannot succeed.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no publish route registered for event type `{0}`; map it on PublisherRoutingBuilder before publishing")]
    RouteNotFound(&'static str),

    #[error("failed to serialize event payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("failed to publish message: {0}")]
    Transport(#[from] LapinError),
}

/// Failures provisioning consume routes. Per-delivery failures never surface
/// here; the dispatch pipeline resolves them locally with an ack or nack.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("failed to provision queue `{queue}`: {source}")]
    Provisioning {
        queue: String,
        #[source]
        source: LapinError,
    },
}
