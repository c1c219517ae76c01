//! CoAP request handling
//!
//! Routes:
//! - `POST /channels/{id}/messages[/<subtopic>...]?auth=<credential>` publishes
//!   the payload
//! - `GET` on the same path with Observe 0 or 1 registers or cancels an
//!   observation
//!
//! Extra path segments after `messages` form the dot-joined subtopic.
//! Wildcard segments are allowed when observing and rejected when publishing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::auth::Authorizer;
use crate::broker::engine::PubSub;
use crate::broker::message::Envelope;
use crate::broker::subject;
use crate::coap::message::{MessageType, Packet, code};
use crate::coap::observe::{
    AckKind, AckRegistry, DeliveryContext, MessageIds, ObserveSequence, Observation,
    ObserverHandler, RetryPolicy, Transport, deliver,
};
use crate::config::CoapSettings;
use crate::utils::error::PubSubError;

pub const PROTOCOL: &str = "coap";

const OBSERVE_REGISTER: u32 = 0;
const OBSERVE_DEREGISTER: u32 = 1;

/// Parsed `/channels/{id}/messages[/...]` route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub channel: String,
    pub subtopic: String,
}

impl Route {
    /// Parse the Uri-Path segments. `None` when the path is not a channel route.
    ///
    /// The channel must be a single literal token: a `.` would move the
    /// message into another channel's subtopic and `*` or `>` would address
    /// many channels at once.
    pub fn parse(segments: &[String]) -> Option<Self> {
        match segments {
            [prefix, channel, messages, rest @ ..]
                if prefix == subject::CHANNELS_PREFIX && messages == "messages" =>
            {
                if channel.is_empty()
                    || channel.contains(['.', '*', '>'])
                    || rest.iter().any(|s| s.is_empty())
                {
                    return None;
                }
                Some(Self {
                    channel: channel.clone(),
                    subtopic: rest.join("."),
                })
            }
            _ => None,
        }
    }

    pub fn topic(&self) -> String {
        subject::topic_name(&self.channel, &self.subtopic)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterSettings {
    pub keep_alive: Duration,
    pub retry: RetryPolicy,
}

impl From<&CoapSettings> for AdapterSettings {
    fn from(s: &CoapSettings) -> Self {
        Self {
            keep_alive: Duration::from_secs(s.keep_alive_secs),
            retry: RetryPolicy {
                max_attempts: s.max_retransmit,
                base_delay: Duration::from_millis(s.ack_timeout_ms),
            },
        }
    }
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self::from(&CoapSettings::default())
    }
}

pub struct CoapAdapter {
    pubsub: Arc<PubSub>,
    auth: Arc<dyn Authorizer>,
    ctx: DeliveryContext,
}

impl std::fmt::Debug for CoapAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoapAdapter")
            .field("pubsub", &self.pubsub)
            .field("keep_alive", &self.ctx.keep_alive)
            .field("retry", &self.ctx.retry)
            .finish()
    }
}

impl CoapAdapter {
    pub fn new(
        pubsub: Arc<PubSub>,
        auth: Arc<dyn Authorizer>,
        transport: Arc<dyn Transport>,
        settings: AdapterSettings,
    ) -> Self {
        let ctx = DeliveryContext {
            pubsub: pubsub.clone(),
            transport,
            acks: Arc::new(AckRegistry::new()),
            ids: Arc::new(MessageIds::new()),
            retry: settings.retry,
            keep_alive: settings.keep_alive,
        };
        Self { pubsub, auth, ctx }
    }

    /// Handle one decoded datagram from `peer`, sending any reply through
    /// the transport.
    pub async fn receive(&self, peer: SocketAddr, packet: Packet) {
        if let Some(reply) = self.handle(peer, packet).await {
            if let Err(e) = self.ctx.transport.send(peer, &reply).await {
                warn!(peer = %peer, error = %e, "failed to send reply");
            }
        }
    }

    /// Compute the reply to `packet`, if one is due.
    pub async fn handle(&self, peer: SocketAddr, packet: Packet) -> Option<Packet> {
        match packet.kind {
            MessageType::Acknowledgement => {
                self.ctx.acks.resolve(peer, packet.message_id, AckKind::Ack);
                None
            }
            MessageType::Reset => {
                self.ctx.acks.resolve(peer, packet.message_id, AckKind::Reset);
                None
            }
            MessageType::Confirmable if packet.is_empty() => {
                // CoAP ping
                Some(Packet::reset(packet.message_id))
            }
            MessageType::Confirmable | MessageType::NonConfirmable if packet.is_request() => {
                self.handle_request(peer, &packet).await
            }
            _ => {
                debug!(peer = %peer, code = %code::display(packet.code), "ignored message");
                None
            }
        }
    }

    async fn handle_request(&self, peer: SocketAddr, req: &Packet) -> Option<Packet> {
        let Some(route) = Route::parse(&req.uri_path()) else {
            return self.reply(req, code::NOT_FOUND);
        };

        match req.code {
            code::POST => self.publish(req, &route).await,
            code::GET => self.observe(peer, req, &route).await,
            _ => self.reply(req, code::METHOD_NOT_ALLOWED),
        }
    }

    async fn publish(&self, req: &Packet, route: &Route) -> Option<Packet> {
        if subject::is_wildcard(&route.subtopic) {
            return self.reply(req, code::BAD_REQUEST);
        }
        if req.kind == MessageType::Confirmable && req.payload.is_empty() {
            return self.reply(req, code::BAD_REQUEST);
        }

        let credential = req.query_param("auth").unwrap_or_default();
        let publisher = match self.auth.can_access(&credential, &route.channel).await {
            Ok(publisher) => publisher,
            Err(e) => {
                debug!(channel = %route.channel, error = %e, "publish denied");
                return self.reply(req, code::UNAUTHORIZED);
            }
        };

        let msg = Envelope::new(route.channel.clone(), req.payload.clone())
            .with_subtopic(route.subtopic.clone())
            .with_publisher(publisher)
            .with_protocol(PROTOCOL);
        if let Err(e) = self.pubsub.publish(&route.channel, &msg).await {
            warn!(channel = %route.channel, error = %e, "publish failed");
            return self.reply(req, code::INTERNAL_SERVER_ERROR);
        }

        match req.kind {
            MessageType::Confirmable => self.reply(req, code::CONTENT),
            _ => None,
        }
    }

    async fn observe(&self, peer: SocketAddr, req: &Packet, route: &Route) -> Option<Packet> {
        let observe = match req.observe() {
            Some(v @ (OBSERVE_REGISTER | OBSERVE_DEREGISTER)) => v,
            _ => return self.reply(req, code::BAD_REQUEST),
        };

        let credential = req.query_param("auth").unwrap_or_default();
        let publisher = match self.auth.can_access(&credential, &route.channel).await {
            Ok(publisher) => publisher,
            Err(e) => {
                debug!(channel = %route.channel, error = %e, "observe denied");
                return self.reply(req, code::UNAUTHORIZED);
            }
        };

        let id = observer_id(&publisher, &req.token);
        let topic = route.topic();

        if observe == OBSERVE_DEREGISTER {
            return match self.pubsub.unsubscribe(&id, &topic).await {
                Ok(()) | Err(PubSubError::NotSubscribed) => {
                    info!(observer = %id, topic = %topic, "observation cancelled");
                    self.reply(req, code::CONTENT)
                }
                Err(e) => {
                    warn!(observer = %id, error = %e, "failed to cancel observation");
                    self.reply(req, code::INTERNAL_SERVER_ERROR)
                }
            };
        }

        let mut sequence = ObserveSequence::new();
        let (handler, rx) = ObserverHandler::channel();
        match self.pubsub.subscribe(&id, &topic, handler).await {
            Ok(()) => {
                let observation = Observation {
                    id: id.clone(),
                    topic: topic.clone(),
                    peer,
                    token: req.token.clone(),
                };
                let first = sequence.next();
                tokio::spawn(deliver(self.ctx.clone(), observation, rx, sequence));
                info!(observer = %id, topic = %topic, peer = %peer, "observation registered");
                self.observe_reply(req, first)
            }
            // the delivery task from the first registration keeps running
            Err(PubSubError::AlreadySubscribed) => self.observe_reply(req, sequence.next()),
            Err(e) => {
                warn!(observer = %id, error = %e, "failed to register observation");
                self.reply(req, code::INTERNAL_SERVER_ERROR)
            }
        }
    }

    fn observe_reply(&self, req: &Packet, sequence: u32) -> Option<Packet> {
        let mut reply = self.reply(req, code::CONTENT)?;
        reply.set_observe(sequence);
        Some(reply)
    }

    /// Piggy-backed ACK for CON requests, a fresh NON for NON requests.
    fn reply(&self, req: &Packet, response_code: u8) -> Option<Packet> {
        let reply = match req.kind {
            MessageType::Confirmable => Packet::ack_for(req, response_code),
            _ => Packet::new(MessageType::NonConfirmable, response_code, self.ctx.ids.next())
                .with_token(&req.token),
        };
        Some(reply)
    }

    pub fn pending_acks(&self) -> usize {
        self.ctx.acks.len()
    }
}

/// Subscriber ID of the observation `(publisher, token)`.
pub fn observer_id(publisher: &str, token: &[u8]) -> String {
    let hex: String = token.iter().map(|b| format!("{b:02x}")).collect();
    format!("{publisher}-{hex}")
}
