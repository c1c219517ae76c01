use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::auth::Authorizer;
use crate::broker::engine::PubSub;
use crate::coap::adapter::{AdapterSettings, CoapAdapter};
use crate::coap::message::{MessageType, Packet};
use crate::coap::observe::Transport;

/// Largest UDP datagram accepted.
const MAX_DATAGRAM: usize = 64 * 1024;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, peer: SocketAddr, packet: &Packet) -> std::io::Result<()> {
        let bytes = packet
            .encode()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        self.socket.send_to(&bytes, peer).await?;
        Ok(())
    }
}

pub struct CoapServer {
    socket: Arc<UdpSocket>,
    adapter: Arc<CoapAdapter>,
}

impl CoapServer {
    pub async fn bind(
        addr: &str,
        pubsub: Arc<PubSub>,
        auth: Arc<dyn Authorizer>,
        settings: AdapterSettings,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let transport = Arc::new(UdpTransport::new(socket.clone()));
        let adapter = Arc::new(CoapAdapter::new(pubsub, auth, transport, settings));
        Ok(Self { socket, adapter })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive datagrams until the socket fails. Requests are handled on
    /// their own task so a slow authorizer or backend never blocks the socket.
    pub async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    error!(error = %e, "CoAP socket failed");
                    return;
                }
            };

            let packet = match Packet::decode(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "dropping malformed datagram");
                    continue;
                }
            };

            match packet.kind {
                // resolves a pending exchange; cheap enough inline
                MessageType::Acknowledgement | MessageType::Reset => {
                    self.adapter.receive(peer, packet).await;
                }
                _ => {
                    let adapter = self.adapter.clone();
                    tokio::spawn(async move { adapter.receive(peer, packet).await });
                }
            }
            debug!(peer = %peer, bytes = len, "datagram handled");
        }
    }
}

/// Bind `addr` and serve CoAP until the socket fails.
pub async fn start_coap_server(
    addr: &str,
    pubsub: Arc<PubSub>,
    auth: Arc<dyn Authorizer>,
    settings: AdapterSettings,
) -> std::io::Result<()> {
    let server = CoapServer::bind(addr, pubsub, auth, settings).await?;
    info!("CoAP server listening on udp://{}", server.local_addr()?);
    server.run().await;
    Ok(())
}
