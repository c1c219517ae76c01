//! In-process subject broker
//!
//! `MemoryBroker` routes raw bytes between any number of `MemoryDriver`
//! connections in the same process, with subject-broker semantics:
//! - patterns use `*` (one token) and `>` (one or more trailing tokens)
//! - plain subscribers each receive every matching message
//! - subscribers sharing a queue group on the same pattern receive each
//!   message round-robin, one copy per group
//!
//! Every subscription gets its own unbounded channel drained by a dedicated
//! task, so a slow handler never stalls the publisher or other subscribers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::broker::message::Envelope;
use crate::broker::subject;
use crate::driver::{Driver, RawHandler, SubscriptionHandle};
use crate::utils::error::DriverError;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<RouteTable>>,
    connections: Arc<AtomicU64>,
}

#[derive(Default)]
struct RouteTable {
    next_id: u64,
    routes: HashMap<u64, Route>,
    // round-robin position per (queue group, pattern)
    cursors: HashMap<(String, String), usize>,
}

struct Route {
    conn: u64,
    pattern: String,
    queue: Option<String>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("routes", &self.state.lock().routes.len())
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this broker.
    pub fn connect(&self) -> MemoryDriver {
        MemoryDriver {
            broker: self.clone(),
            conn: self.connections.fetch_add(1, Ordering::SeqCst),
            closed: AtomicBool::new(false),
            owned: Mutex::new(HashSet::new()),
        }
    }

    /// Deliver `data` to every route matching `subject`. Returns the number
    /// of subscriptions the message was handed to.
    pub fn route(&self, subject: &str, data: &[u8]) -> usize {
        let mut table = self.state.lock();

        let mut fanout: Vec<u64> = Vec::new();
        let mut groups: BTreeMap<(String, String), Vec<u64>> = BTreeMap::new();
        for (id, route) in &table.routes {
            if !subject::matches(&route.pattern, subject) {
                continue;
            }
            match &route.queue {
                None => fanout.push(*id),
                Some(queue) => groups
                    .entry((queue.clone(), route.pattern.clone()))
                    .or_default()
                    .push(*id),
            }
        }

        for (key, mut members) in groups {
            members.sort_unstable();
            let cursor = table.cursors.entry(key).or_insert(0);
            fanout.push(members[*cursor % members.len()]);
            *cursor = cursor.wrapping_add(1);
        }

        let mut delivered = 0;
        for id in fanout {
            if let Some(route) = table.routes.get(&id) {
                if route.tx.send(data.to_vec()).is_ok() {
                    delivered += 1;
                }
            }
        }
        trace!(subject = %subject, delivered, "routed");
        delivered
    }

    fn add_route(&self, route: Route) -> u64 {
        let mut table = self.state.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.routes.insert(id, route);
        id
    }

    fn remove_route(&self, conn: u64, id: u64) -> bool {
        let mut table = self.state.lock();
        match table.routes.get(&id) {
            Some(route) if route.conn == conn => {
                table.routes.remove(&id);
                true
            }
            _ => false,
        }
    }
}

/// One connection to a `MemoryBroker`.
pub struct MemoryDriver {
    broker: MemoryBroker,
    conn: u64,
    closed: AtomicBool,
    owned: Mutex<HashSet<u64>>,
}

impl std::fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDriver")
            .field("conn", &self.conn)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryDriver {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
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
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, topic: &str, msg: &Envelope) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.broker.route(topic, &msg.to_bytes());
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        queue: Option<&str>,
        handler: RawHandler,
    ) -> Result<SubscriptionHandle, DriverError> {
        self.ensure_open()?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let id = self.broker.add_route(Route {
            conn: self.conn,
            pattern: topic.to_string(),
            queue: queue.map(str::to_string),
            tx,
        });
        self.owned.lock().insert(id);

        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                handler(&data[..]);
            }
            trace!(subscription = id, "dispatch task finished");
        });

        debug!(conn = self.conn, subscription = id, topic = %topic, "memory subscribe");
        Ok(SubscriptionHandle(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), DriverError> {
        if !self.owned.lock().remove(&handle.0) {
            return Err(DriverError::UnknownSubscription(handle.0));
        }
        // dropping the route's sender ends the dispatch task
        self.broker.remove_route(self.conn, handle.0);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let owned: Vec<u64> = self.owned.lock().drain().collect();
        for id in owned {
            self.broker.remove_route(self.conn, id);
        }
        debug!(conn = self.conn, "memory connection closed");
    }
}
