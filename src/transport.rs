//! # QUIC transport
//!
//! One [`Node`] owns the QUIC endpoint. Every peer relationship is one
//! QUIC connection carrying exactly one ordered unidirectional stream per
//! direction: each side opens its send stream during setup and accepts the
//! remote's. Packets travel as 4-byte big-endian length prefixes followed
//! by the JSON body, so a peer's packets arrive in the order they were
//! written — the ordering the response-stream engine builds on.
//!
//! Authentication happens inside the QUIC handshake (see [`crate::crypto`]);
//! by the time a [`Peer`] exists its identity is already verified.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream};
use tokio::sync::{Mutex, Notify, OnceCell};

use crate::crypto::{
    create_client_config, create_server_config, generate_identity_cert, DIAL_SERVER_NAME,
};
use crate::identity::{Identity, Keypair};
use crate::packet::{Packet, MAX_PACKET_SIZE};

/// Application close code: the node is shutting down.
pub const CLOSE_SHUTDOWN: u32 = 0;
/// Application close code: a live peer with the same identity already exists.
pub const CLOSE_DUPLICATE: u32 = 1;
/// Application close code: the peer id is banned.
pub const CLOSE_BANNED: u32 = 2;
/// Application close code: a newer connection for this identity replaced us.
pub const CLOSE_REPLACED: u32 = 3;

pub struct Node {
    endpoint: Endpoint,
    client_config: ClientConfig,
    local_addr: SocketAddr,
}

impl Node {
    /// Bind the endpoint with mutual-TLS configs derived from the keypair.
    pub fn bind(addr: &str, keypair: &Keypair) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid listen address")?;

        let (server_certs, server_key) = generate_identity_cert(keypair)?;
        let (client_certs, client_key) = generate_identity_cert(keypair)?;

        let server_config = create_server_config(server_certs, server_key)?;
        let client_config = create_client_config(client_certs, client_key)?;

        let endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("failed to bind endpoint on {}", addr))?;
        let local_addr = endpoint.local_addr()?;

        Ok(Self {
            endpoint,
            client_config,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Establish an outgoing connection. The remote identity is learned
    /// from its certificate after the handshake, not pinned up front.
    pub async fn connect(&self, addr: &str) -> Result<Connection> {
        let addr: SocketAddr = addr.parse().context("invalid dial address")?;
        let connection = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, DIAL_SERVER_NAME)
            .with_context(|| format!("failed to initiate connection to {}", addr))?
            .await
            .with_context(|| format!("failed to establish connection to {}", addr))?;
        Ok(connection)
    }

    pub fn close(&self) {
        self.endpoint
            .close(CLOSE_SHUTDOWN.into(), b"node shutting down");
    }
}

/// An authenticated remote endpoint.
///
/// Cheap to clone; all clones share the connection, the write stream and
/// the kill signal.
#[derive(Clone)]
pub struct Peer {
    identity: Identity,
    connection: Connection,
    writer: Arc<Mutex<SendStream>>,
    advertised: Arc<OnceCell<String>>,
    kill: Arc<Notify>,
}

impl Peer {
    /// Wrap an established connection, opening our side's frame stream.
    pub(crate) async fn setup(identity: Identity, connection: Connection) -> Result<Self> {
        let writer = connection
            .open_uni()
            .await
            .context("failed to open frame stream")?;
        Ok(Self {
            identity,
            connection,
            writer: Arc::new(Mutex::new(writer)),
            advertised: Arc::new(OnceCell::new()),
            kill: Arc::new(Notify::new()),
        })
    }

    /// Hex-encoded public key; the peer id used in the registry.
    pub fn id(&self) -> String {
        self.identity.to_hex()
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Send one packet. Blocks on the transport; errors surface here
    /// synchronously so callers can fail their streams.
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        let body = packet.encode()?;
        let len = body.len() as u32;

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&len.to_be_bytes())
            .await
            .context("failed to write frame header")?;
        writer
            .write_all(&body)
            .await
            .context("failed to write frame body")?;
        Ok(())
    }

    /// The listen address the remote announced, once known.
    pub fn advertised(&self) -> Option<String> {
        self.advertised.get().cloned()
    }

    pub(crate) fn set_advertised(&self, addr: String) {
        let _ = self.advertised.set(addr);
    }

    /// Close the connection and fire the receive pump's kill signal.
    pub fn disconnect(&self, code: u32, reason: &[u8]) {
        self.connection.close(code.into(), reason);
        self.kill.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    pub(crate) fn kill_signal(&self) -> Arc<Notify> {
        self.kill.clone()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Identifies the underlying connection; used so a replacement peer is
    /// never evicted by the stale entry's cleanup.
    pub(crate) fn connection_id(&self) -> usize {
        self.connection.stable_id()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &hex::encode(&self.identity.as_bytes()[..8]))
            .field("addr", &self.connection.remote_address())
            .finish()
    }
}

/// Read one length-prefixed frame. `Ok(None)` means the stream finished
/// cleanly; errors cover truncation, oversize and connection loss.
pub(crate) async fn read_frame(recv: &mut RecvStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame header"),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PACKET_SIZE {
        anyhow::bail!("frame too large: {} bytes (max {})", len, MAX_PACKET_SIZE);
    }

    let mut body = vec![0u8; len];
    recv.read_exact(&mut body)
        .await
        .context("failed to read frame body")?;
    Ok(Some(body))
}
