//! Topic subscriptions
//!
//! A `Topic` holds the live subscriptions registered on one topic name, keyed
//! by client ID. At most one entry exists per client.
//!
//! Concurrency note: callers must synchronize access to `Topic` (the registry
//! lives behind the facade lock).

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::broker::engine::MessageHandler;
use crate::driver::SubscriptionHandle;

pub type SubscriberId = String;

/// One registered subscription.
///
/// `handle` stays `None` while the backend subscribe call is in flight.
/// `ticket` tells a reservation apart from a later one for the same client.
pub struct Subscription {
    pub ticket: u64,
    pub handle: Option<SubscriptionHandle>,
    pub handler: Arc<dyn MessageHandler>,
    pub active: Arc<AtomicBool>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("ticket", &self.ticket)
            .field("handle", &self.handle)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashMap<SubscriberId, Subscription>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashMap::new(),
        }
    }

    /// Add a subscription. Returns `false` if the client already has one.
    pub fn subscribe(&mut self, id: SubscriberId, subscription: Subscription) -> bool {
        match self.subscribers.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(subscription);
                true
            }
        }
    }

    /// Remove and return the client's subscription.
    pub fn unsubscribe(&mut self, id: &str) -> Option<Subscription> {
        self.subscribers.remove(id)
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
