//! MQTT driver
//!
//! Topic names map onto MQTT topics by swapping `.` for `/`, with `*` and `>`
//! rewritten to `+` and `#`. Queue groups use shared subscriptions
//! (`$share/<group>/<filter>`), which the broker load-balances.
//!
//! MQTT 3.1.1 publishes do not say which subscription they were sent for, so
//! every distinct broker filter gets its own session. Each inbound copy on a
//! session belongs to exactly that filter: a plain filter hands it to every
//! local handler, a shared filter to one member in turn. One more session
//! carries outbound publishes.
//!
//! Sessions are shut down by queueing a DISCONNECT and letting the event loop
//! write it before the task ends.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::broker::message::Envelope;
use crate::broker::subject;
use crate::driver::{Driver, RawHandler, SubscriptionHandle};
use crate::utils::error::DriverError;

const DEFAULT_PORT: u16 = 1883;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;
const QOS: QoS = QoS::AtLeastOnce;

pub(super) const SHARED_PREFIX: &str = "$share/";

/// Wire filter for `topic`, shared when `queue` names a group.
pub(super) fn wire_filter(topic: &str, queue: Option<&str>) -> String {
    let base = subject::to_mqtt_filter(topic);
    match queue {
        Some(group) => format!("{SHARED_PREFIX}{group}/{base}"),
        None => base,
    }
}

/// Local handlers behind one broker subscription.
pub(super) struct Routes {
    shared: bool,
    handlers: BTreeMap<u64, RawHandler>,
    cursor: usize,
}

impl Routes {
    pub(super) fn new(shared: bool) -> Self {
        Self {
            shared,
            handlers: BTreeMap::new(),
            cursor: 0,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Handlers owed one inbound copy: all of them for a plain filter, the
    /// next member in turn for a shared one.
    fn targets(&mut self) -> Vec<RawHandler> {
        if !self.shared {
            return self.handlers.values().cloned().collect();
        }
        if self.handlers.is_empty() {
            return Vec::new();
        }
        let pick = self.cursor % self.handlers.len();
        self.cursor = self.cursor.wrapping_add(1);
        self.handlers.values().nth(pick).cloned().into_iter().collect()
    }
}

/// Hand one inbound copy to its handlers. Returns how many were called.
pub(super) fn dispatch(routes: &Mutex<Routes>, payload: &[u8]) -> usize {
    let targets = routes.lock().targets();
    for handler in &targets {
        handler(payload);
    }
    targets.len()
}

/// Subscription ids grouped by the broker filter they ride on.
#[derive(Default)]
pub(super) struct Registry {
    next_id: u64,
    lanes: HashMap<String, Arc<Mutex<Routes>>>,
    owners: HashMap<u64, String>,
}

impl Registry {
    /// Register `handler` on `filter`. Returns the subscription id, the
    /// filter's routes and whether the filter is new to this connection.
    pub(super) fn add(
        &mut self,
        filter: &str,
        handler: RawHandler,
    ) -> (u64, Arc<Mutex<Routes>>, bool) {
        let id = self.next_id;
        self.next_id += 1;

        let mut first = false;
        let routes = self
            .lanes
            .entry(filter.to_string())
            .or_insert_with(|| {
                first = true;
                Arc::new(Mutex::new(Routes::new(filter.starts_with(SHARED_PREFIX))))
            })
            .clone();
        routes.lock().handlers.insert(id, handler);
        self.owners.insert(id, filter.to_string());
        (id, routes, first)
    }

    /// Drop subscription `id`. Returns `None` if it does not exist,
    /// otherwise `Some(filter)` when it was the filter's last user and the
    /// broker subscription must go too.
    pub(super) fn release(&mut self, id: u64) -> Option<Option<String>> {
        let filter = self.owners.remove(&id)?;
        let remaining = match self.lanes.get(&filter) {
            Some(routes) => {
                let mut routes = routes.lock();
                routes.handlers.remove(&id);
                routes.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.lanes.remove(&filter);
            Some(Some(filter))
        } else {
            Some(None)
        }
    }

    pub(super) fn len(&self) -> usize {
        self.owners.len()
    }
}

/// Build client options from a `mqtt://[user:pass@]host[:port]` URL.
pub fn options_from_url(url: &str) -> Result<MqttOptions, DriverError> {
    let parsed = Url::parse(url).map_err(|_| DriverError::InvalidUrl(url.to_string()))?;
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| DriverError::InvalidUrl(url.to_string()))?;
    let port = parsed.port().unwrap_or(DEFAULT_PORT);

    let client_id = format!("chanbus-{}", uuid::Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(KEEP_ALIVE);
    if !parsed.username().is_empty() {
        options.set_credentials(parsed.username(), parsed.password().unwrap_or_default());
    }
    Ok(options)
}

/// One MQTT connection and the task polling its event loop.
struct Session {
    client: AsyncClient,
    closing: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    async fn open(url: &str, routes: Arc<Mutex<Routes>>) -> Result<Self, DriverError> {
        let options = options_from_url(url)?;
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        tokio::time::timeout(CONNECT_TIMEOUT, await_connack(&mut event_loop))
            .await
            .map_err(|_| DriverError::Connect("timed out waiting for CONNACK".to_string()))??;

        let closing = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_event_loop(event_loop, routes, closing.clone()));
        Ok(Self {
            client,
            closing,
            task: Mutex::new(Some(task)),
        })
    }

    /// Queue a DISCONNECT and wait for the event loop to write it and stop.
    async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "MQTT event loop already gone");
        }
        let Some(mut task) = self.task.lock().take() else {
            return;
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
            warn!("MQTT session did not disconnect in time, aborting");
            task.abort();
        }
    }
}

async fn await_connack(event_loop: &mut EventLoop) -> Result<(), DriverError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => continue,
            Err(e) => return Err(DriverError::Connect(e.to_string())),
        }
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    routes: Arc<Mutex<Routes>>,
    closing: Arc<AtomicBool>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                dispatch(&routes, &publish.payload[..]);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                // the next poll reconnects
                warn!(error = %e, "MQTT connection error");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!("MQTT event loop finished");
}

#[derive(Default)]
struct State {
    registry: Registry,
    sessions: HashMap<String, Session>,
}

pub struct MqttDriver {
    url: String,
    publisher: Session,
    state: tokio::sync::Mutex<State>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MqttDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscriptions = self.state.try_lock().map(|s| s.registry.len()).ok();
        f.debug_struct("MqttDriver")
            .field("subscriptions", &subscriptions)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MqttDriver {
    /// Dial `url` and wait for the broker's CONNACK.
    pub async fn connect(url: &str) -> Result<Self, DriverError> {
        let publisher = Session::open(url, Arc::new(Mutex::new(Routes::new(false)))).await?;
        info!("connected to MQTT broker");
        Ok(Self {
            url: url.to_string(),
            publisher,
            state: tokio::sync::Mutex::new(State::default()),
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

    async fn open_filter(
        &self,
        filter: &str,
        routes: Arc<Mutex<Routes>>,
    ) -> Result<Session, String> {
        let session = Session::open(&self.url, routes)
            .await
            .map_err(|e| e.to_string())?;
        if let Err(e) = session.client.subscribe(filter, QOS).await {
            session.shutdown().await;
            return Err(e.to_string());
        }
        Ok(session)
    }
}

#[async_trait]
impl Driver for MqttDriver {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn publish(&self, topic: &str, msg: &Envelope) -> Result<(), DriverError> {
        self.ensure_open()?;
        let err = |reason: String| DriverError::Publish {
            topic: topic.to_string(),
            reason,
        };

        let publish =
            self.publisher
                .client
                .publish(subject::to_mqtt_filter(topic), QOS, false, msg.to_bytes());
        tokio::time::timeout(WRITE_TIMEOUT, publish)
            .await
            .map_err(|_| err("write timed out".to_string()))?
            .map_err(|e| err(e.to_string()))
    }

    async fn subscribe(
        &self,
        topic: &str,
        queue: Option<&str>,
        handler: RawHandler,
    ) -> Result<SubscriptionHandle, DriverError> {
        self.ensure_open()?;
        let filter = wire_filter(topic, queue);

        let mut state = self.state.lock().await;
        let (id, routes, first) = state.registry.add(&filter, handler);
        if first {
            match self.open_filter(&filter, routes).await {
                Ok(session) => {
                    state.sessions.insert(filter.clone(), session);
                }
                Err(reason) => {
                    state.registry.release(id);
                    return Err(DriverError::Subscribe {
                        topic: topic.to_string(),
                        reason,
                    });
                }
            }
        }

        debug!(filter = %filter, subscription = id, "MQTT subscribe");
        Ok(SubscriptionHandle(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), DriverError> {
        let session = {
            let mut state = self.state.lock().await;
            let released = state
                .registry
                .release(handle.0)
                .ok_or(DriverError::UnknownSubscription(handle.0))?;
            match released {
                Some(filter) => state.sessions.remove(&filter).map(|s| (filter, s)),
                None => None,
            }
        };

        if let Some((filter, session)) = session {
            let result = session.client.unsubscribe(filter).await;
            session.shutdown().await;
            result.map_err(|e| DriverError::Unsubscribe(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions = {
            let mut state = self.state.lock().await;
            state.registry = Registry::default();
            std::mem::take(&mut state.sessions)
        };
        for session in sessions.values() {
            session.shutdown().await;
        }
        self.publisher.shutdown().await;
        info!("MQTT connection closed");
    }
}
