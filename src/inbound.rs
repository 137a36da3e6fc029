//! # Inbound processing
//!
//! Two kinds of long-lived tasks move packets from the wire to handlers:
//!
//! - **Receive pumps**, one per connected peer: drain the peer's frame
//!   stream until the connection drops or the kill signal fires, wrapping
//!   each packet in an [`Inbound`] and pushing it onto the shared bounded
//!   `inbounds` channel.
//! - **The dispatcher**, exactly one per node: consumes `inbounds` in
//!   order. Stream correlation kinds are routed inline to the stream
//!   engine (their ordering and counters are confined to single tasks);
//!   everything else goes through the event table, each handler on a
//!   fresh task.
//!
//! The dispatcher is gated on a one-shot attach signal: the processor is
//! constructed before the satellite, and consumption only starts once the
//! satellite has injected its event table and stream engine. Internal
//! events registered during build can therefore never be missed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::events::{signature, EventTable};
use crate::packet::{Packet, PacketKind};
use crate::peers::PeerRegistry;
use crate::streams::{StreamEngine, StreamEvent};
use crate::transport::{read_frame, Peer};

/// Capacity of the shared inbound channel feeding the dispatcher.
const INBOUND_CHANNEL_SIZE: usize = 1000;

/// In-process envelope around one received packet.
pub struct Inbound {
    peer: Peer,
    packet: Packet,
    total_replies: AtomicU32,
}

impl Inbound {
    pub(crate) fn new(peer: Peer, packet: Packet) -> Self {
        Self {
            peer,
            packet,
            total_replies: AtomicU32::new(0),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Hex id of the originating peer.
    pub fn peer_id(&self) -> String {
        self.peer.id()
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Decode the payload into a concrete type in one step.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.packet.payload.clone())
            .context("failed to decode inbound payload")
    }

    /// Stream one response back to the requester. The reply is addressed
    /// to the request packet's return-tag, which is what the remote
    /// stream engine is keyed on.
    pub async fn reply<P: Serialize>(&self, value: P) -> Result<()> {
        let tag = self.packet.return_tag().to_string();
        let payload = serde_json::to_value(value).context("failed to encode reply payload")?;
        self.peer
            .send(&Packet::new(PacketKind::Response, tag, payload))
            .await
            .context("failed to send response")?;
        self.total_replies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Terminate the response stream, reporting how many replies were sent
    /// so the requester can tell when it has drained them all.
    pub async fn end_reply(&self) -> Result<()> {
        let tag = self.packet.return_tag().to_string();
        let count = self.total_replies.load(Ordering::SeqCst);
        self.peer
            .send(&Packet::new(
                PacketKind::ResponseEnd,
                tag,
                serde_json::json!(count),
            ))
            .await
            .context("failed to end response stream")
    }

    /// Tell the requester nobody here implements its namespace, so its
    /// stream can terminate deterministically instead of timing out.
    pub(crate) async fn fail_not_implemented(&self) -> Result<()> {
        let tag = self.packet.return_tag().to_string();
        self.peer
            .send(&Packet::new(
                PacketKind::NotImplemented,
                tag,
                serde_json::Value::Null,
            ))
            .await
            .context("failed to send not-implemented")
    }
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("kind", &self.packet.kind)
            .field("namespace", &self.packet.namespace)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// What the dispatcher needs from the satellite, injected via the attach
/// gate once construction finishes.
struct DispatchContext {
    events: EventTable,
    streams: StreamEngine,
}

/// Owns the shared inbound channel and the dispatcher task.
pub struct InboundProcessor {
    inbounds: mpsc::Sender<Inbound>,
    attach: Mutex<Option<oneshot::Sender<DispatchContext>>>,
}

impl InboundProcessor {
    pub fn new() -> Self {
        let (inbounds_tx, inbounds_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let (attach_tx, attach_rx) = oneshot::channel();

        tokio::spawn(dispatch_loop(attach_rx, inbounds_rx));

        Self {
            inbounds: inbounds_tx,
            attach: Mutex::new(Some(attach_tx)),
        }
    }

    /// Release the dispatcher gate. Called exactly once by the satellite
    /// after its tables exist; a second attach is ignored.
    pub fn attach(&self, events: EventTable, streams: StreamEngine) {
        let sender = self.attach.lock().expect("attach lock poisoned").take();
        match sender {
            Some(tx) => {
                let _ = tx.send(DispatchContext { events, streams });
            }
            None => warn!("satellite already attached to inbound processor"),
        }
    }

    /// Spawn the receive pump for a freshly admitted peer. The pump exits
    /// on connection loss or the peer's kill signal and then removes the
    /// registry entry, provided the entry still holds this connection.
    pub(crate) fn spawn_receive_pump(&self, peer: Peer, registry: PeerRegistry) {
        let inbounds = self.inbounds.clone();
        tokio::spawn(receive_pump(peer, inbounds, registry));
    }
}

impl Default for InboundProcessor {
    fn default() -> Self {
        Self::new()
    }
}

async fn receive_pump(peer: Peer, inbounds: mpsc::Sender<Inbound>, registry: PeerRegistry) {
    let id = peer.id();
    let connection_id = peer.connection_id();
    let kill = peer.kill_signal();

    let mut recv = tokio::select! {
        () = kill.notified() => {
            registry.remove_if_connection(&id, connection_id).await;
            return;
        }
        accepted = peer.connection().accept_uni() => match accepted {
            Ok(stream) => stream,
            Err(e) => {
                debug!(peer = %&id[..16], error = %e, "peer never opened a frame stream");
                registry.remove_if_connection(&id, connection_id).await;
                return;
            }
        }
    };

    debug!(peer = %&id[..16], "receive pump started");

    loop {
        tokio::select! {
            () = kill.notified() => break,
            frame = read_frame(&mut recv) => match frame {
                Ok(Some(body)) => match Packet::decode(&body) {
                    Ok(packet) => {
                        debug!(peer = %&id[..16], kind = %packet.kind, "received inbound");
                        if inbounds.send(Inbound::new(peer.clone(), packet)).await.is_err() {
                            break;
                        }
                    }
                    // Malformed packets are logged and dropped; the peer
                    // stays connected.
                    Err(e) => warn!(peer = %&id[..16], error = %e, "dropping malformed packet"),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %&id[..16], error = %e, "receive pump ending");
                    break;
                }
            }
        }
    }

    registry.remove_if_connection(&id, connection_id).await;
    debug!(peer = %&id[..16], "receive pump terminated");
}

async fn dispatch_loop(gate: oneshot::Receiver<DispatchContext>, mut inbounds: mpsc::Receiver<Inbound>) {
    // Consume nothing until the satellite exists; internal events (the
    // admission ping in particular) must be registered first.
    let Ok(ctx) = gate.await else {
        return;
    };
    info!("event dispatcher started");

    while let Some(inbound) = inbounds.recv().await {
        let kind = inbound.packet().kind;
        match kind {
            // Stream correlation packets are routed inline: the pending
            // map lookup and the owner's counters stay on single tasks,
            // and delivery order equals wire order.
            PacketKind::Response => {
                let tag = inbound.packet().namespace.clone();
                if !ctx.streams.publish(&tag, StreamEvent::Response(inbound)).await {
                    debug!(tag = %tag, "response for closed or unknown stream dropped");
                }
            }
            PacketKind::ResponseEnd => {
                let tag = inbound.packet().namespace.clone();
                match inbound.packet().payload.as_i64() {
                    Some(count) => {
                        if !ctx.streams.publish(&tag, StreamEvent::End(count)).await {
                            debug!(tag = %tag, "end for closed or unknown stream dropped");
                        }
                    }
                    None => warn!(tag = %tag, "response end without a numeric count dropped"),
                }
            }
            PacketKind::NotImplemented => {
                let tag = inbound.packet().namespace.clone();
                if !ctx.streams.publish(&tag, StreamEvent::NotImplemented).await {
                    debug!(tag = %tag, "not-implemented for closed or unknown stream dropped");
                }
            }

            // Everything else goes through the event table. A seek is a
            // broadcast-scoped request: it is served by the handler
            // registered under the Request kind.
            _ => {
                let lookup_kind = match kind {
                    PacketKind::Seek => PacketKind::Request,
                    other => other,
                };
                let sig = signature(lookup_kind, &inbound.packet().namespace);
                match ctx.events.lookup(&sig).await {
                    Some(handler) => {
                        debug!(signature = %sig, "dispatching event");
                        tokio::spawn(handler(inbound));
                    }
                    None => {
                        // Answer NotImplemented carrying the original
                        // return-tag: a waiting stream on the other side
                        // terminates without a timeout, and where no
                        // stream waits the sender's dispatcher drops the
                        // reply. Correlation kinds never reach this
                        // lookup, so the reply cannot cascade.
                        warn!(signature = %sig, "no handler registered, replying not-implemented");
                        tokio::spawn(async move {
                            if let Err(e) = inbound.fail_not_implemented().await {
                                debug!(error = %e, "failed to reply not-implemented");
                            }
                        });
                    }
                }
            }
        }
    }

    info!("event dispatcher stopped");
}
