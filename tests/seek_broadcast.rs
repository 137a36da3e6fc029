//! Integration tests for seek (broadcast-scoped requests), broadcast
//! fan-out and response deduplication.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use satellite::{Keypair, Packet, PacketKind, Satellite, SatelliteConfig, StreamEnd};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(34400);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn spawn_node() -> Arc<Satellite> {
    spawn_node_with(SatelliteConfig::default).await
}

async fn spawn_node_with(make: impl FnOnce() -> SatelliteConfig) -> Arc<Satellite> {
    let config = SatelliteConfig {
        host: "127.0.0.1".into(),
        port: next_port(),
        ..make()
    };
    Satellite::build(config, Keypair::generate())
        .await
        .expect("satellite build failed")
}

/// Register a one-reply responder for `Request/find` answering `label`.
async fn answer_find(sat: &Arc<Satellite>, label: &'static str) {
    sat.event(PacketKind::Request, "find", move |inbound| async move {
        inbound.reply(label).await.expect("reply");
        inbound.end_reply().await.expect("end reply");
    })
    .await;
}

#[tokio::test]
async fn seek_collects_answers_from_every_peer() {
    let a = spawn_node().await;
    let c = spawn_node().await;
    let d = spawn_node().await;
    answer_find(&a, "A").await;
    answer_find(&c, "C").await;
    answer_find(&d, "D").await;

    let seeker = spawn_node_with(|| SatelliteConfig {
        seek_stream_lifetime: Duration::from_secs(1),
        ..Default::default()
    })
    .await;

    for target in [&a, &c, &d] {
        seeker
            .dial(&target.local_addr().to_string())
            .await
            .expect("dial failed");
    }

    let mut stream = seeker.seek("find", json!(null)).await.expect("seek failed");

    let mut got = HashSet::new();
    while let Some(inbound) = timeout(TEST_TIMEOUT, stream.recv()).await.expect("recv timed out") {
        got.insert(inbound.payload::<String>().expect("string payload"));
    }

    let expected: HashSet<String> = ["A", "C", "D"].iter().map(|s| s.to_string()).collect();
    assert_eq!(got, expected, "seek must collect one answer per peer");

    // Seek never self-closes on counts; it runs out its lifetime.
    assert_eq!(stream.done().await, StreamEnd::Timeout);
}

#[tokio::test]
async fn seek_survives_peers_without_the_namespace() {
    let knows = spawn_node().await;
    let ignorant = spawn_node().await;
    answer_find(&knows, "K").await;
    // `ignorant` registers nothing: it answers NotImplemented, which must
    // not end the seek while another peer still replies.

    let seeker = spawn_node_with(|| SatelliteConfig {
        seek_stream_lifetime: Duration::from_secs(1),
        ..Default::default()
    })
    .await;

    seeker
        .dial(&knows.local_addr().to_string())
        .await
        .expect("dial failed");
    seeker
        .dial(&ignorant.local_addr().to_string())
        .await
        .expect("dial failed");

    let mut stream = seeker.seek("find", json!(null)).await.expect("seek failed");

    let mut got = Vec::new();
    while let Some(inbound) = timeout(TEST_TIMEOUT, stream.recv()).await.expect("recv timed out") {
        got.push(inbound.payload::<String>().unwrap());
    }
    assert_eq!(got, vec!["K"]);
    assert_eq!(stream.done().await, StreamEnd::Timeout);
}

#[tokio::test]
async fn duplicate_responses_are_collapsed() {
    let responder = spawn_node().await;
    let requester = spawn_node_with(|| SatelliteConfig {
        response_stream_lifetime: Duration::from_secs(5),
        ..Default::default()
    })
    .await;

    // Send the same response frame twice (identical bytes, identical
    // per-packet tag) plus one distinct reply. The stream must observe
    // two items, and the end count of two must close it cleanly.
    responder
        .event(PacketKind::Request, "dup", |inbound| async move {
            let tag = inbound.packet().return_tag().to_string();
            let peer = inbound.peer().clone();

            let duplicated = Packet::new(PacketKind::Response, tag.clone(), json!("echo"));
            peer.send(&duplicated).await.expect("send");
            peer.send(&duplicated).await.expect("send duplicate");

            let distinct = Packet::new(PacketKind::Response, tag.clone(), json!("other"));
            peer.send(&distinct).await.expect("send distinct");

            peer.send(&Packet::new(PacketKind::ResponseEnd, tag, json!(2)))
                .await
                .expect("send end");
        })
        .await;

    let peer = requester
        .dial(&responder.local_addr().to_string())
        .await
        .expect("dial failed");

    let mut stream = requester
        .request(&peer, "dup", json!(null))
        .await
        .expect("request failed");

    let mut got = Vec::new();
    while let Some(inbound) = timeout(TEST_TIMEOUT, stream.recv()).await.expect("recv timed out") {
        got.push(inbound.payload::<String>().unwrap());
    }

    assert_eq!(got, vec!["echo", "other"], "duplicate must not be observed");
    assert_eq!(stream.done().await, StreamEnd::Ok);
}

#[tokio::test]
async fn broadcast_reports_exactly_the_failing_peers() {
    let origin = spawn_node().await;
    let healthy = spawn_node().await;
    let doomed = spawn_node().await;

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel::<String>(4);
    healthy
        .event(PacketKind::Broadcast, "news", move |inbound| {
            let seen_tx = seen_tx.clone();
            async move {
                let text: String = inbound.payload().expect("string payload");
                let _ = seen_tx.send(text).await;
            }
        })
        .await;

    origin
        .dial(&healthy.local_addr().to_string())
        .await
        .expect("dial healthy failed");
    let doomed_peer = origin
        .dial(&doomed.local_addr().to_string())
        .await
        .expect("dial doomed failed");
    let doomed_id = doomed_peer.id();

    // Kill the third node and wait for origin's pump to clean it out,
    // then re-insert the dead handle: a lingering entry whose transport
    // is gone, exactly what a crashed remote leaves behind.
    doomed.shutdown().await;
    timeout(TEST_TIMEOUT, async {
        while origin.peer(&doomed_id).await.is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("doomed peer never cleaned up");
    origin.set_peer(doomed_id.clone(), doomed_peer).await;

    let failures = origin
        .broadcast("news", "flash")
        .await
        .expect("broadcast failed");

    assert_eq!(failures.len(), 1, "exactly one peer must fail");
    assert_eq!(failures[0].0, doomed_id);

    let text = timeout(TEST_TIMEOUT, seen_rx.recv())
        .await
        .expect("healthy peer never saw the broadcast")
        .expect("channel closed");
    assert_eq!(text, "flash");
}

#[tokio::test]
async fn async_broadcast_is_fire_and_forget() {
    let origin = spawn_node().await;
    let receiver = spawn_node().await;

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel::<String>(4);
    receiver
        .event(PacketKind::Broadcast, "ping", move |inbound| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(inbound.payload().unwrap_or_default()).await;
            }
        })
        .await;

    origin
        .dial(&receiver.local_addr().to_string())
        .await
        .expect("dial failed");

    origin
        .broadcast_async("ping", "pong")
        .await
        .expect("broadcast_async failed");

    let text = timeout(TEST_TIMEOUT, seen_rx.recv())
        .await
        .expect("async broadcast never arrived")
        .expect("channel closed");
    assert_eq!(text, "pong");
}
