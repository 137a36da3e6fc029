//! # Satellite - Peer-to-Peer Overlay Runtime
//!
//! Satellite lets nodes exchange typed, namespaced messages over an
//! authenticated, encrypted QUIC mesh. Three interaction patterns are
//! supported:
//!
//! - **Message**: fire-and-forget unicast
//! - **Broadcast**: network-wide fan-out (sync or async)
//! - **Request / Seek**: multi-response streams, to one peer or to any
//!   peer that can answer
//!
//! Inbound packets are demultiplexed by a local event registry keyed on
//! `(packet kind, namespace)`; replies are correlated back to their
//! request through a content-derived return-tag.
//!
//! ## Quick Start
//!
//! ```ignore
//! let sat = Satellite::build(SatelliteConfig::default(), Keypair::generate()).await?;
//!
//! sat.event(PacketKind::Request, "greet", |inbound| async move {
//!     let _ = inbound.reply("hello").await;
//!     let _ = inbound.end_reply().await;
//! }).await;
//!
//! let peer = sat.dial("127.0.0.1:3000").await?;
//! let mut stream = sat.request(&peer, "greet", serde_json::json!(null)).await?;
//! while let Some(reply) = stream.recv().await {
//!     println!("{}", reply.payload::<String>()?);
//! }
//! assert_eq!(stream.done().await, StreamEnd::Ok);
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `satellite` | Facade combining all components |
//! | `config` | Node settings and stream defaults |
//! | `identity` | Ed25519 keypairs, hex peer ids, key files |
//! | `crypto` | Certificate generation and identity-pinned TLS |
//! | `transport` | QUIC node, per-peer ordered frame channels |
//! | `packet` | Wire codec and return-tag derivation |
//! | `peers` | Peer registry with ban list |
//! | `events` | `(kind, namespace)` → handler table |
//! | `streams` | Multi-response stream engine |
//! | `inbound` | Receive pumps and the event dispatcher |
//!
//! ## Concurrency Model
//!
//! Components communicate over bounded channels: one receive pump per
//! peer, one dispatcher per node, one owner task per in-flight response
//! stream, one transient task per handler invocation. All mutable stream
//! state is confined to its owner task, which is what makes the close
//! sequence single-shot by construction.

mod config;
mod crypto;
mod events;
mod identity;
mod inbound;
mod packet;
mod peers;
mod satellite;
mod streams;
mod transport;

pub use config::{DaemonConfig, SatelliteConfig};
pub use identity::{Identity, Keypair};
pub use inbound::Inbound;
pub use packet::{Packet, PacketKind};
pub use satellite::{Satellite, INTERNAL_PING};
pub use streams::{ResponseStream, StreamEnd, StreamEngine};
pub use transport::Peer;
