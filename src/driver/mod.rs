//! Backend drivers
//!
//! A driver owns the broker connection and knows how to carry an `Envelope`
//! over it (the MQTT driver opens one session per subscribed filter). Three backends are available, picked once at startup
//! from the scheme of the broker URL:
//!
//! | scheme                | driver                                  |
//! |-----------------------|-----------------------------------------|
//! | `mem`, `memory`       | in-process subject broker (`memory`)    |
//! | `amqp`, `amqps`       | AMQP 0-9-1 topic exchange (`amqp`)      |
//! | `mqtt`, `tcp`         | MQTT 3.1.1 (`mqtt`)                     |
//!
//! Drivers never retry a failed connect; that policy belongs to the process
//! supervisor.

pub mod amqp;
pub mod memory;
pub mod mqtt;

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::message::Envelope;
use crate::utils::error::DriverError;

pub use amqp::AmqpDriver;
pub use memory::{MemoryBroker, MemoryDriver};
pub use mqtt::MqttDriver;

/// Driver-local identifier of one backend subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Callback invoked with the raw bytes of every inbound message.
pub type RawHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[async_trait]
pub trait Driver: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Serialize `msg` and send it on wire topic `topic`.
    async fn publish(&self, topic: &str, msg: &Envelope) -> Result<(), DriverError>;

    /// Subscribe to `topic`. With `queue` set, the backend delivers each
    /// message to only one subscriber sharing that group.
    async fn subscribe(
        &self,
        topic: &str,
        queue: Option<&str>,
        handler: RawHandler,
    ) -> Result<SubscriptionHandle, DriverError>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), DriverError>;

    /// Release the connection. Calling it twice is a no-op.
    async fn close(&self);
}

/// Connect the driver selected by `url`'s scheme.
pub async fn connect(url: &str) -> Result<Arc<dyn Driver>, DriverError> {
    let (scheme, _) = url
        .split_once("://")
        .ok_or_else(|| DriverError::InvalidUrl(url.to_string()))?;

    match scheme.to_ascii_lowercase().as_str() {
        "mem" | "memory" => Ok(Arc::new(MemoryBroker::new().connect())),
        "amqp" | "amqps" => Ok(Arc::new(AmqpDriver::connect(url).await?)),
        "mqtt" | "tcp" => Ok(Arc::new(MqttDriver::connect(url).await?)),
        other => Err(DriverError::UnsupportedScheme(other.to_string())),
    }
}
