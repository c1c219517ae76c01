//! Observe relationships (RFC 7641)
//!
//! Every registered observation owns one delivery task, the only writer to
//! its peer. The task waits on the subscription channel and the keep-alive
//! timer at once:
//! - a message from the channel goes out as a NON notification
//! - a keep-alive interval without traffic sends a CON notification that must
//!   be acknowledged, retransmitted with exponential backoff
//! - the channel closing means the subscription was cancelled elsewhere
//!
//! An unanswered keep-alive or a reset from the peer ends the observation and
//! removes its subscription.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::engine::{MessageHandler, PubSub};
use crate::broker::message::Envelope;
use crate::coap::message::{MessageType, Packet, code};
use crate::utils::error::{HandlerError, PubSubError};

/// 24-bit Observe option range.
const SEQUENCE_MASK: u64 = 0xFF_FFFF;

/// Sends datagrams to peers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, peer: SocketAddr, packet: &Packet) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveState {
    Idle,
    AwaitingAck,
    Delivered,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveEvent {
    NonConfirmableSent,
    ConfirmableSent,
    AckReceived,
    AckTimedOut,
    RetriesExhausted,
    ResetReceived,
    Cancel,
}

impl ObserveState {
    /// Transition table. Events that do not apply leave the state unchanged.
    pub fn on(self, event: ObserveEvent) -> Self {
        use ObserveEvent as E;
        use ObserveState as S;

        match (self, event) {
            (S::Expired | S::Cancelled, _) => self,
            (_, E::Cancel) | (_, E::ResetReceived) => S::Cancelled,

            (S::Idle | S::Delivered, E::NonConfirmableSent) => S::Delivered,
            (S::Idle | S::Delivered, E::ConfirmableSent) => S::AwaitingAck,

            (S::AwaitingAck, E::ConfirmableSent) => S::AwaitingAck,
            (S::AwaitingAck, E::AckTimedOut) => S::AwaitingAck,
            (S::AwaitingAck, E::AckReceived) => S::Delivered,
            (S::AwaitingAck, E::RetriesExhausted) => S::Expired,

            _ => self,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Cancelled)
    }
}

/// Confirmable retransmission schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Time to wait for an acknowledgment after transmission `attempt`
    /// (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Observe option values for one observation: milliseconds since
/// registration, bumped so consecutive values always increase.
#[derive(Debug)]
pub struct ObserveSequence {
    started: Instant,
    last: Option<u64>,
}

impl ObserveSequence {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last: None,
        }
    }

    pub fn next(&mut self) -> u32 {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let value = match self.last {
            Some(last) => elapsed.max(last + 1),
            None => elapsed,
        };
        self.last = Some(value);
        (value & SEQUENCE_MASK) as u32
    }
}

impl Default for ObserveSequence {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Reset,
}

/// Outstanding confirmable messages, keyed by peer and message ID.
#[derive(Debug, Default)]
pub struct AckRegistry {
    pending: Mutex<HashMap<(SocketAddr, u16), oneshot::Sender<AckKind>>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: SocketAddr, message_id: u16) -> oneshot::Receiver<AckKind> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert((peer, message_id), tx);
        rx
    }

    /// Complete a pending exchange. Returns `false` for unknown IDs.
    pub fn resolve(&self, peer: SocketAddr, message_id: u16, kind: AckKind) -> bool {
        match self.pending.lock().remove(&(peer, message_id)) {
            Some(tx) => tx.send(kind).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, peer: SocketAddr, message_id: u16) {
        self.pending.lock().remove(&(peer, message_id));
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Message IDs for server-originated messages.
#[derive(Debug)]
pub struct MessageIds(AtomicU16);

impl MessageIds {
    pub fn new() -> Self {
        let seed = uuid::Uuid::new_v4().as_bytes()[..2].try_into().map(u16::from_be_bytes);
        Self(AtomicU16::new(seed.unwrap_or_default()))
    }

    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MessageIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridges facade dispatch into the observation's delivery task.
#[derive(Debug)]
pub struct ObserverHandler {
    tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
}

impl ObserverHandler {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
        });
        (handler, rx)
    }
}

impl MessageHandler for ObserverHandler {
    fn handle(&self, msg: Envelope) -> Result<(), HandlerError> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| HandlerError::Closed),
            None => Err(HandlerError::Closed),
        }
    }

    fn cancel(&self) -> Result<(), HandlerError> {
        // dropping the sender wakes the delivery task with `None`
        self.tx.lock().take();
        Ok(())
    }
}

/// One registered observation.
#[derive(Debug, Clone)]
pub struct Observation {
    pub id: String,
    pub topic: String,
    pub peer: SocketAddr,
    pub token: Vec<u8>,
}

/// Shared collaborators of every delivery task.
#[derive(Clone)]
pub struct DeliveryContext {
    pub pubsub: Arc<PubSub>,
    pub transport: Arc<dyn Transport>,
    pub acks: Arc<AckRegistry>,
    pub ids: Arc<MessageIds>,
    pub retry: RetryPolicy,
    pub keep_alive: Duration,
}

/// Drive `observation` until it is cancelled or the peer goes away.
pub async fn deliver(
    ctx: DeliveryContext,
    observation: Observation,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut sequence: ObserveSequence,
) -> ObserveState {
    let mut state = ObserveState::Idle;
    let mut peer_gone = false;

    while !state.is_terminal() {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => {
                    let packet = notification(&ctx, &observation, &mut sequence, MessageType::NonConfirmable, msg.payload);
                    if let Err(e) = ctx.transport.send(observation.peer, &packet).await {
                        warn!(observer = %observation.id, error = %e, "failed to send notification");
                    }
                    state = state.on(ObserveEvent::NonConfirmableSent);
                }
                None => state = state.on(ObserveEvent::Cancel),
            },
            _ = tokio::time::sleep(ctx.keep_alive) => {
                state = keep_alive(&ctx, &observation, &mut sequence, state).await;
                peer_gone = state.is_terminal();
            }
        }
    }

    if peer_gone {
        info!(observer = %observation.id, state = ?state, "peer gone, removing observation");
        match ctx.pubsub.unsubscribe(&observation.id, &observation.topic).await {
            Ok(()) | Err(PubSubError::NotSubscribed) => {}
            Err(e) => warn!(observer = %observation.id, error = %e, "failed to remove observation"),
        }
    }
    debug!(observer = %observation.id, state = ?state, "delivery task finished");
    state
}

async fn keep_alive(
    ctx: &DeliveryContext,
    observation: &Observation,
    sequence: &mut ObserveSequence,
    mut state: ObserveState,
) -> ObserveState {
    let packet = notification(ctx, observation, sequence, MessageType::Confirmable, Vec::new());
    let mut ack = ctx.acks.register(observation.peer, packet.message_id);

    for attempt in 0..ctx.retry.max_attempts {
        if let Err(e) = ctx.transport.send(observation.peer, &packet).await {
            warn!(observer = %observation.id, error = %e, "failed to send keep-alive");
        }
        state = state.on(ObserveEvent::ConfirmableSent);

        match tokio::time::timeout(ctx.retry.delay(attempt), &mut ack).await {
            Ok(Ok(AckKind::Ack)) => return state.on(ObserveEvent::AckReceived),
            Ok(Ok(AckKind::Reset)) => return state.on(ObserveEvent::ResetReceived),
            Ok(Err(_)) | Err(_) => state = state.on(ObserveEvent::AckTimedOut),
        }
        debug!(observer = %observation.id, attempt, "keep-alive unacknowledged");
    }

    ctx.acks.forget(observation.peer, packet.message_id);
    state.on(ObserveEvent::RetriesExhausted)
}

fn notification(
    ctx: &DeliveryContext,
    observation: &Observation,
    sequence: &mut ObserveSequence,
    kind: MessageType,
    payload: Vec<u8>,
) -> Packet {
    let mut packet = Packet::new(kind, code::CONTENT, ctx.ids.next())
        .with_token(&observation.token)
        .with_payload(payload);
    packet.set_observe(sequence.next());
    packet
}
