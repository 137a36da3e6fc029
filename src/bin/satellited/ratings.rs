//! Rating demo: the sample application shipped with the daemon.
//!
//! Ratings arrive as network broadcasts and are persisted in a sled tree;
//! any peer can later stream back every rating touching an identity with
//! a `Request/get_rating`.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use satellite::{PacketKind, Satellite};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rating {
    #[serde(rename = "src")]
    pub source: String,
    #[serde(rename = "dst")]
    pub destination: String,
    #[serde(rename = "sig", default)]
    pub signature: Vec<u8>,
    #[serde(rename = "rating")]
    pub content: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RatingRequest {
    #[serde(rename = "ident")]
    pub identity: String,
}

const RATINGS_TREE: &str = "ratings";

/// Storage key: source prefix and destination suffix, so lookups by
/// identity can match either end with a prefix/suffix scan.
fn make_id(source: &str, seq: u64, destination: &str) -> Vec<u8> {
    format!("{}{}{}", source, seq, destination).into_bytes()
}

pub async fn bootstrap_events(sat: &Arc<Satellite>, db: sled::Db) -> Result<()> {
    let ratings = db
        .open_tree(RATINGS_TREE)
        .context("failed to open ratings tree")?;

    sat.event(PacketKind::Message, "hello", |inbound| async move {
        info!(peer = %inbound.peer_id(), "said hello");
    })
    .await;

    let ingest_tree = ratings.clone();
    let ingest_db = db.clone();
    sat.event(PacketKind::Broadcast, "new_rating", move |inbound| {
        let tree = ingest_tree.clone();
        let db = ingest_db.clone();
        async move {
            let rating: Rating = match inbound.payload() {
                Ok(rating) => rating,
                Err(e) => {
                    error!(peer = %inbound.peer_id(), error = %e, "unusable rating broadcast");
                    return;
                }
            };
            debug!(peer = %inbound.peer_id(), ?rating, "received rating broadcast");

            let result = db.generate_id().map_err(anyhow::Error::from).and_then(|seq| {
                let bytes = serde_json::to_vec(&rating)?;
                tree.insert(make_id(&rating.source, seq, &rating.destination), bytes)?;
                Ok(())
            });
            if let Err(e) = result {
                error!(error = %e, "failed to ingest rating");
            }
        }
    })
    .await;

    let lookup_tree = ratings.clone();
    sat.event(PacketKind::Request, "get_rating", move |inbound| {
        let tree = lookup_tree.clone();
        async move {
            let request: RatingRequest = match inbound.payload() {
                Ok(request) => request,
                Err(e) => {
                    error!(error = %e, "unusable rating request");
                    let _ = inbound.end_reply().await;
                    return;
                }
            };

            let ident = request.identity.as_bytes();
            for entry in tree.iter() {
                let (key, value) = match entry {
                    Ok(kv) => kv,
                    Err(e) => {
                        error!(error = %e, "rating scan failed");
                        break;
                    }
                };
                if !key.starts_with(ident) && !key.ends_with(ident) {
                    continue;
                }
                match serde_json::from_slice::<Rating>(&value) {
                    Ok(rating) => {
                        if let Err(e) = inbound.reply(rating).await {
                            error!(error = %e, "failed to stream rating");
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "stored rating is corrupt, skipping"),
                }
            }

            if let Err(e) = inbound.end_reply().await {
                error!(error = %e, "failed to end rating stream");
            }
        }
    })
    .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_id_puts_identities_at_the_ends() {
        let id = make_id("alice", 7, "bob");
        assert!(id.starts_with(b"alice"));
        assert!(id.ends_with(b"bob"));
    }

    #[test]
    fn rating_wire_names() {
        let rating = Rating {
            source: "a".into(),
            destination: "b".into(),
            signature: vec![1, 2],
            content: serde_json::json!(5),
        };
        let value = serde_json::to_value(&rating).unwrap();
        assert!(value.get("src").is_some());
        assert!(value.get("dst").is_some());
        assert!(value.get("sig").is_some());
        assert!(value.get("rating").is_some());
    }
}
