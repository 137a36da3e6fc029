//! # Wire packets
//!
//! The overlay exchanges exactly one wire unit: a [`Packet`], serialized
//! as length-prefixed JSON with single-letter field names:
//!
//! ```json
//! { "p": 3, "ns": "get_rating", "c": { ... }, "ts": 1700000000 }
//! ```
//!
//! Replies are correlated through the packet's *return-tag*: the base64
//! encoding of the SHA-256 of the serialized packet. The tag is never
//! carried on the wire; both ends derive it independently from the bytes
//! they wrote or read, so a responder can address replies to
//! `Response/<tag>` and the requester's stream engine will pick them up.
//!
//! The tag is memoized on the in-process object and the timestamp is
//! stamped when the packet is first materialized, which keeps the tag
//! stable for the packet's whole lifetime.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::error;

/// Upper bound on a serialized packet body. Oversized frames are rejected
/// before allocation to keep a hostile peer from exhausting memory.
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// The eight packet kinds, bit-compatible with the wire integers 0..=7.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PacketKind {
    Internal,
    Message,
    Broadcast,
    Request,
    Response,
    ResponseEnd,
    Seek,
    NotImplemented,
}

impl TryFrom<u8> for PacketKind {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => PacketKind::Internal,
            1 => PacketKind::Message,
            2 => PacketKind::Broadcast,
            3 => PacketKind::Request,
            4 => PacketKind::Response,
            5 => PacketKind::ResponseEnd,
            6 => PacketKind::Seek,
            7 => PacketKind::NotImplemented,
            other => anyhow::bail!("unknown packet kind {}", other),
        })
    }
}

impl From<PacketKind> for u8 {
    fn from(kind: PacketKind) -> u8 {
        kind as u8
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketKind::Internal => "Internal",
            PacketKind::Message => "Message",
            PacketKind::Broadcast => "Broadcast",
            PacketKind::Request => "Request",
            PacketKind::Response => "Response",
            PacketKind::ResponseEnd => "ResponseEnd",
            PacketKind::Seek => "Seek",
            PacketKind::NotImplemented => "NotImplemented",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "p")]
    pub kind: PacketKind,
    #[serde(rename = "ns")]
    pub namespace: String,
    #[serde(rename = "c")]
    pub payload: serde_json::Value,
    #[serde(rename = "ts")]
    pub timestamp: i64,

    #[serde(skip)]
    tag: OnceLock<String>,
}

impl Packet {
    /// Build an outbound packet. The timestamp is stamped here so the
    /// return-tag derived from it never changes afterwards.
    pub fn new(kind: PacketKind, namespace: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            payload,
            timestamp: unix_now(),
            tag: OnceLock::new(),
        }
    }

    /// Serialize the packet body (without the length prefix) and memoize
    /// the return-tag from the produced bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self).context("failed to encode packet")?;
        self.tag.get_or_init(|| tag_of(&body));
        Ok(body)
    }

    /// Parse a packet body received from the wire. The return-tag is
    /// seeded from the exact bytes read, so it matches the sender's.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() > MAX_PACKET_SIZE {
            anyhow::bail!(
                "packet too large: {} bytes (max {})",
                body.len(),
                MAX_PACKET_SIZE
            );
        }
        let packet: Packet = serde_json::from_slice(body).context("failed to decode packet")?;
        packet.tag.get_or_init(|| tag_of(body));
        Ok(packet)
    }

    /// Correlation id for replies to this packet.
    pub fn return_tag(&self) -> &str {
        self.tag.get_or_init(|| match serde_json::to_vec(self) {
            Ok(body) => tag_of(&body),
            Err(e) => {
                error!(error = %e, "failed to serialize packet for return tag");
                String::new()
            }
        })
    }
}

impl Clone for Packet {
    fn clone(&self) -> Self {
        let tag = OnceLock::new();
        if let Some(existing) = self.tag.get() {
            let _ = tag.set(existing.clone());
        }
        Self {
            kind: self.kind,
            namespace: self.namespace.clone(),
            payload: self.payload.clone(),
            timestamp: self.timestamp,
            tag,
        }
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.namespace == other.namespace
            && self.payload == other.payload
            && self.timestamp == other.timestamp
    }
}

fn tag_of(body: &[u8]) -> String {
    BASE64.encode(Sha256::digest(body))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_integers_are_bit_compatible() {
        let kinds = [
            (0u8, PacketKind::Internal),
            (1, PacketKind::Message),
            (2, PacketKind::Broadcast),
            (3, PacketKind::Request),
            (4, PacketKind::Response),
            (5, PacketKind::ResponseEnd),
            (6, PacketKind::Seek),
            (7, PacketKind::NotImplemented),
        ];
        for (value, kind) in kinds {
            assert_eq!(PacketKind::try_from(value).unwrap(), kind);
            assert_eq!(u8::from(kind), value);
        }
        assert!(PacketKind::try_from(8).is_err());
    }

    #[test]
    fn wire_field_names_are_single_letter() {
        let packet = Packet::new(PacketKind::Request, "get", json!({"id": 1}));
        let body = packet.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["p"], json!(3));
        assert_eq!(value["ns"], json!("get"));
        assert_eq!(value["c"], json!({"id": 1}));
        assert!(value["ts"].as_i64().unwrap() > 0);
        // The tag is derived, never serialized.
        assert!(value.get("tag").is_none());
    }

    #[test]
    fn encode_decode_round_trips_bytes() {
        let packet = Packet::new(
            PacketKind::Broadcast,
            "new_rating",
            json!({"src": "a", "dst": "b", "rating": 5}),
        );
        let body = packet.encode().unwrap();
        let decoded = Packet::decode(&body).unwrap();
        assert_eq!(decoded, packet);

        // Re-encoding the decoded packet reproduces the exact bytes, which
        // is what keeps the tag stable across a hop.
        assert_eq!(decoded.encode().unwrap(), body);
    }

    #[test]
    fn return_tag_is_stable_and_shared_across_a_hop() {
        let packet = Packet::new(PacketKind::Request, "get", json!([1, 2, 3]));
        let first = packet.return_tag().to_string();
        assert_eq!(packet.return_tag(), first);

        let body = packet.encode().unwrap();
        assert_eq!(packet.return_tag(), first);

        let decoded = Packet::decode(&body).unwrap();
        assert_eq!(decoded.return_tag(), first);
    }

    #[test]
    fn distinct_payloads_produce_distinct_tags() {
        let a = Packet::new(PacketKind::Response, "tag", json!("x"));
        let b = Packet::new(PacketKind::Response, "tag", json!("y"));
        assert_ne!(a.return_tag(), b.return_tag());
    }

    #[test]
    fn clone_preserves_memoized_tag() {
        let packet = Packet::new(PacketKind::Seek, "find", json!(null));
        let tag = packet.return_tag().to_string();
        let cloned = packet.clone();
        assert_eq!(cloned.return_tag(), tag);
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        assert!(Packet::decode(b"{").is_err());
        assert!(Packet::decode(b"").is_err());
        assert!(Packet::decode(br#"{"p": 99, "ns": "x", "c": null, "ts": 1}"#).is_err());
    }

    #[test]
    fn oversized_bodies_are_rejected() {
        let body = vec![b'x'; MAX_PACKET_SIZE + 1];
        assert!(Packet::decode(&body).is_err());
    }
}
