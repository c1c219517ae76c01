//! PubSub facade
//!
//! `PubSub` is the publish/subscribe contract every adapter talks to. It wraps
//! exactly one backend `Driver` and owns the subscription registry.
//!
//! Concurrency and usage notes:
//! - The facade is `Send + Sync`; share it behind an `Arc`.
//! - The registry lock is never held across a driver call. `subscribe`
//!   reserves the `(client, topic)` slot first, calls the backend, then
//!   attaches the returned handle.
//! - Every backend subscription is wrapped in a decode-and-dispatch closure.
//!   A message that fails to decode, or a handler that returns an error, is
//!   logged and dropped; the subscription keeps running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::broker::message::Envelope;
use crate::broker::registry::Registry;
use crate::broker::subject;
use crate::driver::{Driver, RawHandler};
use crate::utils::error::{HandlerError, PubSubError};

/// Consumer side of a subscription.
pub trait MessageHandler: Send + Sync {
    /// Handle one decoded message.
    fn handle(&self, msg: Envelope) -> Result<(), HandlerError>;

    /// Invoked once when the subscription is torn down.
    fn cancel(&self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Publish/subscribe facade over one backend driver.
///
/// Tracks which client is subscribed to which topic name so that duplicate
/// subscriptions are refused and every backend subscription can be released
/// on `unsubscribe` or `close`.
pub struct PubSub {
    driver: Arc<dyn Driver>,
    queue: Option<String>,
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("driver", &self.driver.name())
            .field("queue", &self.queue)
            .finish()
    }
}

impl PubSub {
    /// Facade with default fan-out: every subscriber sees every message.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self::with_queue(driver, None)
    }

    /// Facade whose subscriptions all join queue group `queue`, so the
    /// backend hands each message to only one member of the group.
    pub fn with_queue(driver: Arc<dyn Driver>, queue: Option<String>) -> Self {
        let queue = queue.filter(|q| !q.is_empty());
        Self {
            driver,
            queue,
            registry: Mutex::new(Registry::new()),
        }
    }

    /// Publish `msg` on channel `topic`.
    ///
    /// The wire topic is `channels.<topic>[.<subtopic>]`, taking the subtopic
    /// from the envelope. Both `topic` and the envelope's own channel must be
    /// set; either one empty is `EmptyTopic`. Backend failures come back as
    /// `PubSubError::Driver`.
    pub async fn publish(&self, topic: &str, msg: &Envelope) -> Result<(), PubSubError> {
        if topic.is_empty() || msg.channel.is_empty() {
            return Err(PubSubError::EmptyTopic);
        }

        let subject = subject::topic_name(topic, &msg.subtopic);
        self.driver.publish(&subject, msg).await?;
        debug!(subject = %subject, bytes = msg.payload.len(), "published");
        Ok(())
    }

    /// Subscribe client `id` to topic name (or pattern) `topic`.
    ///
    /// `handler` receives every decoded message until the client unsubscribes
    /// or the facade closes. A client holds at most one subscription per
    /// topic; a second attempt is `AlreadySubscribed`. When the backend
    /// refuses, the reservation is released and the driver error returned.
    pub async fn subscribe(
        &self,
        id: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), PubSubError> {
        if topic.is_empty() {
            return Err(PubSubError::EmptyTopic);
        }
        if id.is_empty() {
            return Err(PubSubError::EmptyId);
        }

        let active = Arc::new(AtomicBool::new(true));
        let ticket = self
            .registry
            .lock()
            .reserve(topic, id, handler.clone(), active.clone())
            .ok_or(PubSubError::AlreadySubscribed)?;

        let raw = dispatcher(id, topic, handler, active.clone());
        let handle = match self
            .driver
            .subscribe(topic, self.queue.as_deref(), raw)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.lock().discard(topic, id, ticket);
                return Err(e.into());
            }
        };

        let attached = self.registry.lock().attach(topic, id, ticket, handle);
        if !attached {
            // unsubscribed while the backend call was in flight
            active.store(false, Ordering::SeqCst);
            self.driver.unsubscribe(handle).await?;
            return Ok(());
        }

        info!(client = %id, topic = %topic, queue = ?self.queue, "subscribed");
        Ok(())
    }

    /// Remove client `id`'s subscription on `topic`.
    ///
    /// Stops dispatch at once, releases the backend subscription and then
    /// calls the handler's `cancel`. Unknown pairs are `NotSubscribed`.
    pub async fn unsubscribe(&self, id: &str, topic: &str) -> Result<(), PubSubError> {
        if topic.is_empty() {
            return Err(PubSubError::EmptyTopic);
        }
        if id.is_empty() {
            return Err(PubSubError::EmptyId);
        }

        let sub = self
            .registry
            .lock()
            .remove(topic, id)
            .ok_or(PubSubError::NotSubscribed)?;
        sub.active.store(false, Ordering::SeqCst);

        let unsubscribed = match sub.handle {
            Some(handle) => self.driver.unsubscribe(handle).await,
            // backend call still in flight; `subscribe` releases the handle
            None => Ok(()),
        };
        let cancelled = sub.handler.cancel();

        unsubscribed?;
        cancelled?;
        info!(client = %id, topic = %topic, "unsubscribed");
        Ok(())
    }

    /// Whether client `id` currently holds a subscription on `topic`.
    pub fn is_subscribed(&self, id: &str, topic: &str) -> bool {
        self.registry.lock().contains(topic, id)
    }

    /// Number of subscriptions across every client and topic.
    pub fn subscription_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Cancel every subscription and release the driver connection.
    ///
    /// Handlers are cancelled before the driver closes, and no message is
    /// dispatched to them afterwards. Calling it again is harmless.
    pub async fn close(&self) {
        let subs = self.registry.lock().drain();
        for sub in &subs {
            sub.active.store(false, Ordering::SeqCst);
            if let Err(e) = sub.handler.cancel() {
                warn!(error = %e, "handler cancel failed during close");
            }
        }
        self.driver.close().await;
        info!(driver = self.driver.name(), cancelled = subs.len(), "pubsub closed");
    }
}

/// Wrap `handler` in the raw callback handed to the driver.
fn dispatcher(
    id: &str,
    topic: &str,
    handler: Arc<dyn MessageHandler>,
    active: Arc<AtomicBool>,
) -> RawHandler {
    let id = id.to_string();
    let topic = topic.to_string();

    Arc::new(move |data: &[u8]| {
        if !active.load(Ordering::SeqCst) {
            return;
        }
        let msg = match Envelope::from_bytes(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(client = %id, topic = %topic, error = %e, "failed to decode message");
                return;
            }
        };
        if let Err(e) = handler.handle(msg) {
            warn!(client = %id, topic = %topic, error = %e, "handler failed");
        }
    })
}
