//! AMQP driver
//!
//! Messages are published to the durable topic exchange `EXCHANGE` with the
//! topic name as routing key. Subscribing binds a queue to that exchange:
//! - without a queue group the queue is server-named, exclusive and
//!   auto-deleted, so every subscriber gets its own copy
//! - with a queue group the queue is named `<group>.<routing key>` and shared
//!   by every member, so the broker hands each message to one consumer
//!
//! Subject wildcards are rewritten to routing-key wildcards (`>` becomes `#`).
//! Each consumer is drained by its own task. Unsubscribing cancels the
//! consumer and waits for that task to see the end of the stream; closing
//! does the same after shutting the connection down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::message::Envelope;
use crate::broker::subject;
use crate::driver::{Driver, RawHandler, SubscriptionHandle};
use crate::utils::error::DriverError;

pub const EXCHANGE: &str = "messages";

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue name and declare options for a subscription on `routing_key`. An
/// empty name asks the broker to pick one.
pub(super) fn queue_spec(
    routing_key: &str,
    queue: Option<&str>,
) -> (String, QueueDeclareOptions) {
    match queue {
        Some(group) => (
            format!("{group}.{routing_key}"),
            QueueDeclareOptions {
                auto_delete: true,
                ..Default::default()
            },
        ),
        None => (
            String::new(),
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            },
        ),
    }
}

/// Wait for a consumer task to drain, aborting it only past the deadline.
async fn join_consumer(consumer: Consumer) {
    let Consumer { tag, mut task } = consumer;
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
        warn!(consumer = %tag, "AMQP consumer did not stop in time, aborting");
        task.abort();
    }
}

struct Consumer {
    tag: String,
    task: JoinHandle<()>,
}

pub struct AmqpDriver {
    conn: Connection,
    channel: Channel,
    consumers: Mutex<HashMap<u64, Consumer>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for AmqpDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpDriver")
            .field("consumers", &self.consumers.lock().len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl AmqpDriver {
    /// Dial `url` and declare the exchange.
    pub async fn connect(url: &str) -> Result<Self, DriverError> {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| DriverError::Connect(e.to_string()))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| DriverError::Connect(e.to_string()))?;

        channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DriverError::Connect(e.to_string()))?;

        info!(exchange = EXCHANGE, "connected to AMQP broker");
        Ok(Self {
            conn,
            channel,
            consumers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Driver for AmqpDriver {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn publish(&self, topic: &str, msg: &Envelope) -> Result<(), DriverError> {
        self.ensure_open()?;
        let err = |reason: String| DriverError::Publish {
            topic: topic.to_string(),
            reason,
        };

        let payload = msg.to_bytes();
        let routing_key = subject::to_amqp_routing_key(topic);
        let publish = self.channel.basic_publish(
            EXCHANGE,
            &routing_key,
            BasicPublishOptions::default(),
            &payload,
            BasicProperties::default(),
        );

        tokio::time::timeout(WRITE_TIMEOUT, publish)
            .await
            .map_err(|_| err("write timed out".to_string()))?
            .map_err(|e| err(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        queue: Option<&str>,
        handler: RawHandler,
    ) -> Result<SubscriptionHandle, DriverError> {
        self.ensure_open()?;
        let err = |e: lapin::Error| DriverError::Subscribe {
            topic: topic.to_string(),
            reason: e.to_string(),
        };

        let routing_key = subject::to_amqp_routing_key(topic);
        let (queue_name, options) = queue_spec(&routing_key, queue);

        let declared = self
            .channel
            .queue_declare(&queue_name, options, FieldTable::default())
            .await
            .map_err(err)?;
        let queue_name = declared.name().as_str().to_string();

        self.channel
            .queue_bind(
                &queue_name,
                EXCHANGE,
                &routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(err)?;

        let tag = format!("chanbus-{}", uuid::Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                &queue_name,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(err)?;

        let consumer_tag = tag.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => handler(&delivery.data[..]),
                    Err(e) => {
                        warn!(consumer = %consumer_tag, error = %e, "AMQP consumer failed");
                        break;
                    }
                }
            }
            debug!(consumer = %consumer_tag, "AMQP consumer finished");
        });

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.consumers.lock().insert(id, Consumer { tag, task });
        debug!(queue = %queue_name, routing_key = %routing_key, "AMQP subscribe");
        Ok(SubscriptionHandle(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), DriverError> {
        let consumer = self
            .consumers
            .lock()
            .remove(&handle.0)
            .ok_or(DriverError::UnknownSubscription(handle.0))?;

        let cancelled = self
            .channel
            .basic_cancel(&consumer.tag, BasicCancelOptions::default())
            .await;
        join_consumer(consumer).await;
        cancelled.map_err(|e| DriverError::Unsubscribe(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let consumers: Vec<Consumer> = self.consumers.lock().drain().map(|(_, c)| c).collect();
        // closing the connection ends every consumer stream
        if let Err(e) = self.conn.close(200, "closing").await {
            warn!(error = %e, "failed to close AMQP connection");
        }
        for consumer in consumers {
            join_consumer(consumer).await;
        }
        info!("AMQP connection closed");
    }
}
