//! # Satellite facade
//!
//! A [`Satellite`] is one node of the overlay: the QUIC transport node,
//! the peer registry, the event table and the stream engine wired
//! together. It exposes the three interaction patterns:
//!
//! - `message` — fire-and-forget unicast
//! - `broadcast` / `broadcast_async` — network-wide fan-out
//! - `request` / `seek` — multi-response streams to one peer or to
//!   whoever can answer
//!
//! ## Construction order
//!
//! The inbound processor is built first and its dispatcher sits parked on
//! the attach gate. The satellite then registers the internal events
//! (admission ping, address announce, routing exchange), attaches itself
//! — releasing the gate — and only then starts accepting connections.
//! Nothing can race past an event that is not yet registered.
//!
//! ## Admission
//!
//! A crashed remote often leaves a lingering socket on this side, so a
//! newcomer whose id is already registered is not refused outright: the
//! incumbent is probed with an internal ping first, and only a live
//! incumbent wins the tie.

use std::collections::HashSet;
use std::future::Future;
use std::net::{SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SatelliteConfig;
use crate::crypto::extract_verified_identity;
use crate::events::{EventHandler, EventTable, HandlerFuture};
use crate::identity::{Identity, Keypair};
use crate::inbound::{Inbound, InboundProcessor};
use crate::packet::{Packet, PacketKind};
use crate::peers::PeerRegistry;
use crate::streams::{ResponseStream, StreamEngine, StreamEnd, StreamEvent, StreamMode};
use crate::transport::{Node, Peer, CLOSE_BANNED, CLOSE_DUPLICATE, CLOSE_REPLACED, CLOSE_SHUTDOWN};

/// Liveness probe used to break admission ties.
pub const INTERNAL_PING: &str = "__INTERNAL_PING";
/// Listen-address announcement sent right after admission.
const INTERNAL_ANNOUNCE: &str = "__INTERNAL_ANNOUNCE";
/// Routing exchange: reply with the advertised addresses of known peers.
const INTERNAL_FIND_NODE: &str = "__INTERNAL_FIND_NODE";

#[derive(Serialize, Deserialize)]
struct Announce {
    addr: String,
}

pub struct Satellite {
    config: SatelliteConfig,
    keypair: Keypair,
    node: Node,
    peers: PeerRegistry,
    events: EventTable,
    streams: StreamEngine,
    processor: InboundProcessor,
    /// Addresses we already tried during routing refresh.
    dialed: Mutex<HashSet<String>>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Satellite {
    /// Build the network node: bind the transport, wire the components,
    /// release the dispatcher and start listening.
    pub async fn build(config: SatelliteConfig, keypair: Keypair) -> Result<Arc<Self>> {
        info!("initializing satellite");

        let node = Node::bind(&config.listen_addr(), &keypair)?;
        let processor = InboundProcessor::new();
        let events = EventTable::new();
        let streams = StreamEngine::new(config.response_stream_buffer);

        let enable_upnp = config.enable_upnp;
        let port = config.port;

        let satellite = Arc::new(Self {
            config,
            keypair,
            node,
            peers: PeerRegistry::new(),
            events,
            streams,
            processor,
            dialed: Mutex::new(HashSet::new()),
            accept_task: std::sync::Mutex::new(None),
        });

        satellite.install_internal_events().await;
        satellite
            .processor
            .attach(satellite.events.clone(), satellite.streams.clone());

        if enable_upnp {
            spawn_upnp_mapping(port);
        }

        let accept = {
            let satellite = satellite.clone();
            tokio::spawn(async move {
                while let Some(incoming) = satellite.node.endpoint().accept().await {
                    let satellite = satellite.clone();
                    tokio::spawn(async move {
                        if let Err(e) = satellite.handle_incoming(incoming).await {
                            debug!(error = %e, "incoming connection rejected");
                        }
                    });
                }
            })
        };
        *satellite.accept_task.lock().expect("accept task lock poisoned") = Some(accept);

        info!(
            addr = %satellite.node.local_addr(),
            id = %satellite.identity(),
            "listening for remote satellites"
        );

        Ok(satellite)
    }

    /// Hex-encoded public key of this node.
    pub fn identity(&self) -> String {
        self.keypair.identity().to_hex()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.node.local_addr()
    }

    pub fn config(&self) -> &SatelliteConfig {
        &self.config
    }

    /// The stream engine, exposed so callers can observe in-flight state.
    pub fn streams(&self) -> &StreamEngine {
        &self.streams
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Register a handler for `(kind, namespace)`. At most one handler per
    /// pair; registering again replaces the previous one.
    pub async fn event<F, Fut>(&self, kind: PacketKind, namespace: &str, handler: F)
    where
        F: Fn(Inbound) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventHandler =
            Arc::new(move |inbound| -> HandlerFuture { Box::pin(handler(inbound)) });
        self.events.on(kind, namespace, handler).await;
    }

    pub async fn remove_event(&self, kind: PacketKind, namespace: &str) {
        self.events.off(kind, namespace).await;
    }

    // ========================================================================
    // Peers
    // ========================================================================

    pub async fn peer(&self, id: &str) -> Option<Peer> {
        self.peers.get(id).await
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.peers.ids().await
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.len().await
    }

    /// Insert a peer under an id directly, bypassing admission.
    pub async fn set_peer(&self, id: String, peer: Peer) {
        self.peers.set(id, peer).await;
    }

    pub async fn ban_peer(&self, peer: &Peer) {
        self.peers.ban(peer.id()).await;
    }

    pub async fn unban_peer(&self, peer: &Peer) {
        self.peers.unban(&peer.id()).await;
    }

    pub async fn is_banned(&self, peer: &Peer) -> bool {
        self.peers.is_banned(&peer.id()).await
    }

    /// Establish an outgoing connection and run admission on it.
    ///
    /// Boxed rather than a plain `async fn`: `dial` reaches `admit`, whose
    /// own admission path spawns `refresh_routing`, which calls back into
    /// `dial` — an explicit, boxed return type breaks that cycle so the
    /// compiler isn't asked to resolve an infinitely recursive opaque type.
    pub fn dial<'a>(
        self: &'a Arc<Self>,
        addr: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Peer>> + Send + 'a>> {
        Box::pin(async move {
            let connection = self.node.connect(addr).await?;
            let identity = extract_verified_identity(&connection)
                .context("could not verify peer identity from certificate")?;
            self.admit(identity, connection).await
        })
    }

    /// Close all connections and stop accepting new ones.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.accept_task.lock().expect("accept task lock poisoned").take() {
            handle.abort();
        }
        for (_, peer) in self.peers.snapshot().await {
            peer.disconnect(CLOSE_SHUTDOWN, b"node shutting down");
        }
        self.node.close();
        info!("satellite shut down");
    }

    // ========================================================================
    // Outgoing patterns (request / seek / broadcast / message)
    // ========================================================================

    /// Fire-and-forget unicast.
    pub async fn message<P: Serialize>(&self, peer: &Peer, namespace: &str, payload: P) -> Result<()> {
        let payload = serde_json::to_value(payload).context("failed to encode payload")?;
        peer.send(&Packet::new(PacketKind::Message, namespace, payload))
            .await
    }

    /// Multi-response request to one peer. Responses arrive on the
    /// returned stream in the order the remote sent them; the stream
    /// closes once the remote's announced count has been received, on
    /// `NotImplemented`, on transport failure, or after
    /// `response_stream_lifetime`.
    pub async fn request<P: Serialize>(
        &self,
        peer: &Peer,
        namespace: &str,
        payload: P,
    ) -> Result<ResponseStream> {
        let payload = serde_json::to_value(payload).context("failed to encode payload")?;
        self.request_with(peer, PacketKind::Request, namespace, payload)
            .await
    }

    async fn request_with(
        &self,
        peer: &Peer,
        kind: PacketKind,
        namespace: &str,
        payload: serde_json::Value,
    ) -> Result<ResponseStream> {
        let packet = Packet::new(kind, namespace, payload);
        let tag = packet.return_tag().to_string();

        // The stream must be registered before the packet leaves, or a
        // fast responder could beat us to the pending map.
        let stream = self
            .streams
            .open(tag.clone(), StreamMode::Request, self.config.response_stream_lifetime)
            .await;

        if let Err(e) = peer.send(&packet).await {
            debug!(tag = %tag, "ending request stream by send error");
            self.streams.publish(&tag, StreamEvent::Fail).await;
            return Err(e.context("failed to send request"));
        }

        debug!(tag = %tag, namespace, "request sent");
        Ok(stream)
    }

    /// Broadcast-scoped request: collects responses from any peer that
    /// implements the namespace. The stream never self-closes on counts —
    /// responders end independently — so it runs until
    /// `seek_stream_lifetime` or a broadcast failure.
    pub async fn seek<P: Serialize>(&self, namespace: &str, payload: P) -> Result<ResponseStream> {
        let payload = serde_json::to_value(payload).context("failed to encode payload")?;
        let packet = Packet::new(PacketKind::Seek, namespace, payload);
        let tag = packet.return_tag().to_string();

        let stream = self
            .streams
            .open(tag.clone(), StreamMode::Seek, self.config.seek_stream_lifetime)
            .await;

        debug!(tag = %tag, namespace, "seeking");
        let failures = self.broadcast_packet(&packet).await;
        if !failures.is_empty() {
            debug!(tag = %tag, "ending seek stream by broadcast failure");
            self.streams.publish(&tag, StreamEvent::Fail).await;
            let (peer, error) = &failures[0];
            anyhow::bail!(
                "failed to send seek broadcast ({} peers failed, first: {}: {})",
                failures.len(),
                &peer[..peer.len().min(16)],
                error
            );
        }

        Ok(stream)
    }

    /// Send to every registered peer, returning one entry per failed
    /// send. An empty list means full fan-out.
    pub async fn broadcast<P: Serialize>(
        &self,
        namespace: &str,
        payload: P,
    ) -> Result<Vec<(String, anyhow::Error)>> {
        let payload = serde_json::to_value(payload).context("failed to encode payload")?;
        let packet = Packet::new(PacketKind::Broadcast, namespace, payload);
        debug!(tag = %packet.return_tag(), namespace, "broadcasting");
        Ok(self.broadcast_packet(&packet).await)
    }

    /// Fire-and-forget broadcast: every send runs on its own task and
    /// failures are only logged.
    pub async fn broadcast_async<P: Serialize>(&self, namespace: &str, payload: P) -> Result<()> {
        let payload = serde_json::to_value(payload).context("failed to encode payload")?;
        let packet = Packet::new(PacketKind::Broadcast, namespace, payload);
        for (id, peer) in self.peers.snapshot().await {
            let packet = packet.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.send(&packet).await {
                    debug!(peer = %&id[..16], error = %e, "async broadcast send failed");
                }
            });
        }
        Ok(())
    }

    async fn broadcast_packet(&self, packet: &Packet) -> Vec<(String, anyhow::Error)> {
        let mut failures = Vec::new();
        for (id, peer) in self.peers.snapshot().await {
            if let Err(e) = peer.send(packet).await {
                debug!(peer = %&id[..16], error = %e, "broadcast send failed");
                failures.push((id, e));
            }
        }
        failures
    }

    // ========================================================================
    // Admission
    // ========================================================================

    async fn handle_incoming(self: &Arc<Self>, incoming: quinn::Incoming) -> Result<()> {
        let connection = incoming.await.context("failed to accept connection")?;
        let remote = connection.remote_address();
        let Some(identity) = extract_verified_identity(&connection) else {
            warn!(remote = %remote, "rejecting connection: could not verify peer identity");
            anyhow::bail!("could not verify peer identity from certificate");
        };
        self.admit(identity, connection).await?;
        Ok(())
    }

    async fn admit(self: &Arc<Self>, identity: Identity, connection: quinn::Connection) -> Result<Peer> {
        let id = identity.to_hex();

        if self.peers.is_banned(&id).await {
            connection.close(CLOSE_BANNED.into(), b"banned");
            anyhow::bail!("peer {} is banned", &id[..16]);
        }

        if let Some(incumbent) = self.peers.get(&id).await {
            match self.internal_ping(&incumbent).await {
                StreamEnd::Ok => {
                    warn!(peer = %&id[..16], "peer already connected, rejecting newcomer");
                    connection.close(CLOSE_DUPLICATE.into(), b"peer already connected");
                    anyhow::bail!("peer already connected: {}", &id[..16]);
                }
                probe => {
                    debug!(peer = %&id[..16], probe = ?probe, "incumbent is dead, replacing");
                    incumbent.disconnect(CLOSE_REPLACED, b"stale connection replaced");
                }
            }
        }

        let peer = Peer::setup(identity, connection).await?;
        self.peers.set(id.clone(), peer.clone()).await;
        self.processor
            .spawn_receive_pump(peer.clone(), self.peers.clone());
        info!(peer = %&id[..16], addr = %peer.remote_addr(), "peer connected");

        // Tell the peer where we listen, then learn its view of the mesh.
        let announce = Packet::new(
            PacketKind::Internal,
            INTERNAL_ANNOUNCE,
            serde_json::to_value(Announce {
                addr: self.config.listen_addr(),
            })
            .unwrap_or(serde_json::Value::Null),
        );
        if let Err(e) = peer.send(&announce).await {
            debug!(peer = %&id[..16], error = %e, "failed to send announce");
        }

        let satellite = self.clone();
        let refresh_peer = peer.clone();
        tokio::spawn(async move {
            satellite.refresh_routing(refresh_peer).await;
        });

        Ok(peer)
    }

    /// Probe a peer through the full request path. Anything but `Ok`
    /// means the peer cannot currently answer.
    async fn internal_ping(&self, peer: &Peer) -> StreamEnd {
        match self
            .request_with(peer, PacketKind::Internal, INTERNAL_PING, serde_json::Value::Null)
            .await
        {
            Ok(mut stream) => stream.done().await,
            Err(_) => StreamEnd::Error,
        }
    }

    /// Ask a freshly admitted peer for the addresses it knows and dial the
    /// ones we have not seen. Transitively fills the mesh.
    async fn refresh_routing(self: Arc<Self>, peer: Peer) {
        let mut stream = match self
            .request_with(
                &peer,
                PacketKind::Internal,
                INTERNAL_FIND_NODE,
                serde_json::Value::Null,
            )
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "routing refresh request failed");
                return;
            }
        };

        let mut discovered: Vec<String> = Vec::new();
        while let Some(inbound) = stream.recv().await {
            match inbound.payload::<Vec<String>>() {
                Ok(addrs) => discovered.extend(addrs),
                Err(e) => debug!(error = %e, "unusable routing exchange payload"),
            }
        }

        // Skip ourselves and everyone already connected; the dialed set
        // keeps later refreshes from retrying dead addresses forever.
        let mut known: HashSet<String> = self
            .peers
            .snapshot()
            .await
            .into_iter()
            .filter_map(|(_, peer)| peer.advertised())
            .collect();
        known.insert(self.config.listen_addr());

        let mut dialed_now = 0usize;
        for addr in discovered {
            if known.contains(&addr) {
                continue;
            }
            {
                let mut dialed = self.dialed.lock().await;
                if !dialed.insert(addr.clone()) {
                    continue;
                }
            }
            match self.dial(&addr).await {
                Ok(_) => dialed_now += 1,
                Err(e) => debug!(addr = %addr, error = %e, "discovered peer unreachable"),
            }
        }

        if dialed_now > 0 {
            info!(new_peers = dialed_now, "routing refresh connected new peers");
        }
    }

    async fn install_internal_events(self: &Arc<Self>) {
        // Liveness probe for admission ties: answer immediately.
        self.event(PacketKind::Internal, INTERNAL_PING, |inbound| async move {
            if let Err(e) = inbound.reply(0).await {
                debug!(error = %e, "failed to answer ping");
                return;
            }
            if let Err(e) = inbound.end_reply().await {
                debug!(error = %e, "failed to end ping reply");
            }
        })
        .await;

        // Record the listen address a peer announces for itself.
        self.event(PacketKind::Internal, INTERNAL_ANNOUNCE, |inbound| async move {
            match inbound.payload::<Announce>() {
                Ok(announce) => {
                    debug!(peer = %&inbound.peer_id()[..16], addr = %announce.addr, "peer announced address");
                    inbound.peer().set_advertised(announce.addr);
                }
                Err(e) => debug!(error = %e, "malformed announce payload"),
            }
        })
        .await;

        // Routing exchange: hand out the advertised addresses of everyone
        // we know, except the asker itself.
        let weak = Arc::downgrade(self);
        self.event(PacketKind::Internal, INTERNAL_FIND_NODE, move |inbound| {
            let weak = weak.clone();
            async move {
                let Some(satellite) = weak.upgrade() else {
                    return;
                };
                let asker = inbound.peer_id();
                let addrs: Vec<String> = satellite
                    .peers
                    .snapshot()
                    .await
                    .into_iter()
                    .filter(|(id, _)| *id != asker)
                    .filter_map(|(_, peer)| peer.advertised())
                    .collect();

                if let Err(e) = inbound.reply(addrs).await {
                    debug!(error = %e, "failed to answer routing exchange");
                    return;
                }
                if let Err(e) = inbound.end_reply().await {
                    debug!(error = %e, "failed to end routing exchange");
                }
            }
        })
        .await;
    }
}

/// Best-effort UPnP UDP port mapping; failures are logged, never fatal.
fn spawn_upnp_mapping(port: u16) {
    tokio::task::spawn_blocking(move || {
        let gateway = match igd::search_gateway(Default::default()) {
            Ok(gateway) => gateway,
            Err(e) => {
                warn!(error = %e, "UPnP gateway discovery failed");
                return;
            }
        };

        // Learn which local interface routes toward the gateway; that is
        // the address the mapping must point at.
        let local_ip = std::net::UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| {
                socket.connect(gateway.addr)?;
                socket.local_addr()
            })
            .map(|addr| addr.ip());

        let local_ip = match local_ip {
            Ok(std::net::IpAddr::V4(ip)) => ip,
            _ => {
                warn!("could not determine local IPv4 address for UPnP mapping");
                return;
            }
        };

        match gateway.add_port(
            igd::PortMappingProtocol::UDP,
            port,
            SocketAddrV4::new(local_ip, port),
            0,
            "satellite overlay",
        ) {
            Ok(()) => info!(port, "UPnP port mapping established"),
            Err(e) => warn!(error = %e, "UPnP port mapping failed"),
        }
    });
}


