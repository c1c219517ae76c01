//! Subscription registry
//!
//! Two-level map `topic name -> client ID -> Subscription`. Every lookup is a
//! pair of hash probes, and removing one client never touches its siblings.
//! A topic disappears from the map as soon as its last client leaves.
//!
//! Subscribing is split in two steps so the facade can drop its lock while the
//! backend call runs: `reserve` claims the `(client, topic)` slot, then
//! `attach` stores the backend handle (or `discard` releases the slot when the
//! backend refused).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::broker::engine::MessageHandler;
use crate::broker::topic::{Subscription, Topic};
use crate::driver::SubscriptionHandle;

/// Subscriptions of every client, grouped by topic name.
#[derive(Debug, Default)]
pub struct Registry {
    topics: HashMap<String, Topic>,
    next_ticket: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the `(id, topic)` slot. Returns the reservation ticket, or `None`
    /// if the client is already subscribed.
    pub fn reserve(
        &mut self,
        topic: &str,
        id: &str,
        handler: Arc<dyn MessageHandler>,
        active: Arc<AtomicBool>,
    ) -> Option<u64> {
        let ticket = self.next_ticket;
        let subscription = Subscription {
            ticket,
            handle: None,
            handler,
            active,
        };

        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic));

        if entry.subscribe(id.to_string(), subscription) {
            self.next_ticket += 1;
            Some(ticket)
        } else {
            None
        }
    }

    /// Store the backend handle for a reservation. Returns `false` when the
    /// reservation is gone (the client unsubscribed while the backend call
    /// was in flight); the caller then owns the handle and must release it.
    pub fn attach(
        &mut self,
        topic: &str,
        id: &str,
        ticket: u64,
        handle: SubscriptionHandle,
    ) -> bool {
        match self
            .topics
            .get_mut(topic)
            .and_then(|t| t.subscribers.get_mut(id))
        {
            Some(sub) if sub.ticket == ticket => {
                sub.handle = Some(handle);
                true
            }
            _ => false,
        }
    }

    /// Drop a reservation whose backend subscribe failed.
    pub fn discard(&mut self, topic: &str, id: &str, ticket: u64) {
        let owned = self
            .topics
            .get(topic)
            .and_then(|t| t.subscribers.get(id))
            .is_some_and(|sub| sub.ticket == ticket);
        if owned {
            self.remove(topic, id);
        }
    }

    /// Remove the client's subscription, pruning the topic if it empties.
    ///
    /// Returns the removed entry so the caller can release its backend handle
    /// and cancel its handler outside the lock.
    pub fn remove(&mut self, topic: &str, id: &str) -> Option<Subscription> {
        let entry = self.topics.get_mut(topic)?;
        let removed = entry.unsubscribe(id);
        if entry.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Whether client `id` holds a subscription (or reservation) on `topic`.
    pub fn contains(&self, topic: &str, id: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|t| t.subscribers.contains_key(id))
    }

    /// Whether any client is subscribed to `topic`.
    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Number of live subscriptions across all topics.
    pub fn len(&self) -> usize {
        self.topics.values().map(|t| t.subscribers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Take every subscription out of the registry.
    ///
    /// Used on shutdown; the registry is empty afterwards.
    pub fn drain(&mut self) -> Vec<Subscription> {
        self.topics
            .drain()
            .flat_map(|(_, topic)| topic.subscribers.into_values())
            .collect()
    }
}
